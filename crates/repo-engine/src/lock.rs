//! Filesystem-based shared/exclusive lock manager.
//!
//! Lock files live at the repository root (`lock.exclusive`, `lock.<id>`)
//! and carry their holder's host/process/thread identity so a stale lock
//! can, in principle, be diagnosed by an operator even though this engine
//! does not itself attempt to break stale locks.

use std::fmt;
use std::process;

use crate::error::{Error, Result};
use crate::repo::Repo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Identity recorded in a lock file: hostname, process id, "thread" id
/// (a per-process-lifetime random token, since OS thread ids aren't
/// durable/meaningful once printed to a file other processes read).
#[derive(Debug, Clone)]
pub struct HolderId {
    pub host: String,
    pub pid: u32,
    pub token: u64,
}

impl HolderId {
    pub fn current() -> Self {
        Self {
            host: hostname(),
            pid: process::id(),
            token: rand::random(),
        }
    }

    fn id_string(&self) -> String {
        format!("{}-{}-{:x}", self.host, self.pid, self.token)
    }

    fn serialize(&self) -> Vec<u8> {
        format!("host={}\npid={}\ntoken={:x}\n", self.host, self.pid, self.token).into_bytes()
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} (pid {})", self.token, self.host, self.pid)
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// An acquired lock; dropping it does *not* release it (the repository
/// owns lock lifetime for as long as it is open, per the data model's
/// lifecycle rule) — callers release explicitly via [`RepoLock::release`].
pub struct RepoLock {
    mode: LockMode,
    holder: HolderId,
    file_name: String,
}

impl RepoLock {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn holder(&self) -> &HolderId {
        &self.holder
    }

    pub fn release<R: Repo>(&self, repo: &R) -> Result<()> {
        repo.remove_root_file(&self.file_name)
    }
}

/// Acquire a lock of `mode` on `repo`. Shared locks may coexist with other
/// shared locks; an exclusive lock may not coexist with any other lock.
pub fn acquire<R: Repo>(repo: &R, mode: LockMode) -> Result<RepoLock> {
    let holder = HolderId::current();
    match mode {
        LockMode::Exclusive => {
            if !repo.list_root_files("lock.")?.is_empty() {
                return Err(Error::LockFailed {
                    reason: "another holder already has a lock on this repository".into(),
                });
            }
            let ok = repo.create_root_file_exclusive("lock.exclusive", &holder.serialize())?;
            if !ok {
                return Err(Error::LockFailed { reason: "exclusive lock already held".into() });
            }
            Ok(RepoLock { mode, holder, file_name: "lock.exclusive".to_string() })
        }
        LockMode::Shared => {
            if repo.read_root_file("lock.exclusive")?.is_some() {
                return Err(Error::LockFailed { reason: "repository is exclusively locked".into() });
            }
            let file_name = format!("lock.{}", holder.id_string());
            let ok = repo.create_root_file_exclusive(&file_name, &holder.serialize())?;
            if !ok {
                return Err(Error::LockFailed { reason: "duplicate lock holder id".into() });
            }
            Ok(RepoLock { mode, holder, file_name })
        }
    }
}

/// Upgrade a shared lock to exclusive. Fails, without downgrading state, if
/// any other holder (shared or exclusive) currently exists.
pub fn upgrade<R: Repo>(repo: &R, lock: RepoLock) -> Result<RepoLock> {
    if lock.mode == LockMode::Exclusive {
        return Ok(lock);
    }
    let others: Vec<_> = repo
        .list_root_files("lock.")?
        .into_iter()
        .filter(|f| f != &lock.file_name)
        .collect();
    if !others.is_empty() {
        return Err(Error::LockFailed {
            reason: format!("cannot upgrade: {} other lock holder(s) present", others.len()),
        });
    }
    let ok = repo.create_root_file_exclusive("lock.exclusive", &lock.holder.serialize())?;
    if !ok {
        return Err(Error::LockFailed { reason: "exclusive lock already held".into() });
    }
    repo.remove_root_file(&lock.file_name)?;
    Ok(RepoLock { mode: LockMode::Exclusive, holder: lock.holder, file_name: "lock.exclusive".to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::mem::Memory;

    #[test]
    fn exclusive_excludes_shared() {
        let repo = Memory::new();
        let lock = acquire(&repo, LockMode::Exclusive).unwrap();
        assert!(acquire(&repo, LockMode::Shared).is_err());
        lock.release(&repo).unwrap();
        assert!(acquire(&repo, LockMode::Shared).is_ok());
    }

    #[test]
    fn shared_allows_multiple_shared() {
        let repo = Memory::new();
        let _a = acquire(&repo, LockMode::Shared).unwrap();
        let b = acquire(&repo, LockMode::Shared).unwrap();
        assert!(acquire(&repo, LockMode::Exclusive).is_err());
        b.release(&repo).unwrap();
    }

    #[test]
    fn upgrade_fails_with_other_holders() {
        let repo = Memory::new();
        let a = acquire(&repo, LockMode::Shared).unwrap();
        let _b = acquire(&repo, LockMode::Shared).unwrap();
        assert!(upgrade(&repo, a).is_err());
    }

    #[test]
    fn upgrade_succeeds_when_sole_holder() {
        let repo = Memory::new();
        let a = acquire(&repo, LockMode::Shared).unwrap();
        let upgraded = upgrade(&repo, a).unwrap();
        assert_eq!(upgraded.mode(), LockMode::Exclusive);
    }
}
