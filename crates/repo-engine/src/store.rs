//! Capability-set trait for polymorphic store backends (§9 design notes).
//!
//! A caller that wants to pick between this crate's local segment-log
//! engine and some remote proxy implementation at runtime can program
//! against `dyn Store` instead of a concrete `Repository<R>`. Segment ids
//! and byte offsets never cross this boundary: every method here trades
//! only in keys, payloads, and the opaque [`ScanState`] cursor.
//!
//! `open`/`create` are deliberately not part of the trait: they return a
//! concrete, sized backend rather than `Self`, so they stay as ordinary
//! constructors on each backend rather than object-safe trait methods.

use crate::check::CheckReport;
use crate::error::Result;
use crate::key::Key;
use crate::repo::Repo;
use crate::txn::{Repository, ScanState, ScannedObject};

/// Object-safe view over a repository, local or remote.
pub trait Store {
    fn put(&mut self, key: Key, payload: &[u8]) -> Result<()>;
    fn delete(&mut self, key: Key) -> Result<()>;
    fn get(&self, key: &Key) -> Result<Vec<u8>>;
    fn list(&self, limit: usize, marker: Option<&Key>) -> Vec<Key>;
    fn scan(&self, limit: usize, state: ScanState) -> Result<(Vec<ScannedObject>, ScanState)>;
    fn commit(&mut self, threshold: Option<f64>) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
    fn check(&mut self, repair: bool) -> Result<CheckReport>;
    fn close(self: Box<Self>) -> Result<()>;
}

impl<R: Repo> Store for Repository<R> {
    fn put(&mut self, key: Key, payload: &[u8]) -> Result<()> {
        Repository::put(self, key, payload)
    }

    fn delete(&mut self, key: Key) -> Result<()> {
        Repository::delete(self, key)
    }

    fn get(&self, key: &Key) -> Result<Vec<u8>> {
        Repository::get(self, key)
    }

    fn list(&self, limit: usize, marker: Option<&Key>) -> Vec<Key> {
        Repository::list(self, limit, marker)
    }

    fn scan(&self, limit: usize, state: ScanState) -> Result<(Vec<ScannedObject>, ScanState)> {
        Repository::scan(self, limit, state)
    }

    fn commit(&mut self, threshold: Option<f64>) -> Result<()> {
        Repository::commit(self, threshold)
    }

    fn rollback(&mut self) -> Result<()> {
        Repository::rollback(self)
    }

    fn check(&mut self, repair: bool) -> Result<CheckReport> {
        Repository::check(self, repair)
    }

    fn close(self: Box<Self>) -> Result<()> {
        Repository::close(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::mem::Memory;
    use crate::txn::CreateOptions;

    fn key(i: u32) -> Key {
        let mut buf = [0u8; crate::key::KEY_SIZE];
        buf[..4].copy_from_slice(&i.to_be_bytes());
        Key::from_bytes(buf)
    }

    #[test]
    fn repository_is_usable_through_the_capability_trait() {
        let repo = Memory::new();
        Repository::create(repo.clone(), CreateOptions::default()).unwrap();
        let r = Repository::open(repo, true).unwrap();
        let mut store: Box<dyn Store> = Box::new(r);

        store.put(key(0), b"a").unwrap();
        store.commit(None).unwrap();
        assert_eq!(store.get(&key(0)).unwrap(), b"a");
        assert_eq!(store.list(0, None), vec![key(0)]);

        let report = store.check(false).unwrap();
        assert!(report.is_clean());

        store.close().unwrap();
    }
}
