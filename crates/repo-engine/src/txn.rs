//! The transaction manager: the only component callers see directly.
//!
//! Ties together segment I/O, the index, the hints (compact table + shadow
//! index), and the lock manager into the put/delete/commit/rollback state
//! machine and open-time recovery described in the component design (§4.5).

use std::collections::BTreeSet;

use log::{debug, info, warn};

use crate::config::{RepoConfig, README_TEXT};
use crate::error::{Error, Result};
use crate::frame::Entry;
use crate::hints::{Hints, DEFAULT_COMPACTION_THRESHOLD};
use crate::index::Index;
use crate::key::{Key, KEY_SIZE};
use crate::lock::{self, LockMode, RepoLock};
use crate::repo::Repo;
use crate::segment::{EntryKind, Location, SegmentIo};

/// Options honored by [`Repository::create`]; everything else in
/// [`RepoConfig`] has a sensible default.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub segments_per_dir: u64,
    pub max_segment_size: u64,
    pub append_only: bool,
    pub additional_free_space: u64,
    pub storage_quota: Option<u64>,
    pub max_data_size: u64,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            segments_per_dir: crate::config::DEFAULT_SEGMENTS_PER_DIR,
            max_segment_size: crate::config::DEFAULT_MAX_SEGMENT_SIZE,
            append_only: false,
            additional_free_space: crate::config::DEFAULT_ADDITIONAL_FREE_SPACE,
            storage_quota: None,
            max_data_size: crate::config::DEFAULT_MAX_DATA_SIZE,
        }
    }
}

/// A resumable cursor for [`Repository::scan`]. Opaque to callers beyond
/// round-tripping it back into the next call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanState(Option<Key>);

/// One object returned by [`Repository::scan`].
#[derive(Debug, Clone)]
pub struct ScannedObject {
    pub key: Key,
    pub payload: Vec<u8>,
}

/// The open repository: index, hints, and lock held in memory, backed by a
/// [`Repo`].
pub struct Repository<R: Repo> {
    repo: R,
    io: SegmentIo<R>,
    config: RepoConfig,
    lock: Option<RepoLock>,
    index: Index,
    hints: Hints,
    /// Snapshot of `index`/`hints` as of the last successful commit, used
    /// to restore state on `rollback`.
    committed_index: Index,
    committed_hints: Hints,
    /// Transaction id of the most recently committed segment; names
    /// `index.<tid>` / `hints.<tid>`. Zero for a freshly created, never
    /// committed repository.
    tid: u64,
    /// The segment currently being appended to, if any. `None` whenever
    /// the repository is clean: a segment is only created on first append
    /// after open or commit (§3 lifecycles).
    write_segment: Option<u64>,
    /// All segment ids allocated as write segments since the last commit,
    /// in creation order; discarded wholesale on rollback.
    segments_since_commit: Vec<u64>,
    next_segment_id: u64,
    dirty: bool,
    /// Running total of bytes occupied by segment files, maintained
    /// incrementally so quota checks don't re-stat every segment on every
    /// put (§10.3 / Open Question on storage quota accounting).
    total_bytes: u64,
}

impl<R: Repo> Repository<R> {
    /// Initialize an empty repository on disk. Does not open it; callers
    /// must follow up with [`Repository::open`].
    pub fn create(repo: R, opts: CreateOptions) -> Result<()> {
        if repo.exists() {
            return Err(Error::AlreadyExists { path: "repository".to_string() });
        }
        repo.create_root()?;
        repo.set_segments_per_dir(opts.segments_per_dir);

        let mut id = [0u8; 32];
        for b in id.iter_mut() {
            *b = rand::random();
        }
        let config = RepoConfig {
            version: crate::config::CONFIG_VERSION,
            id,
            segments_per_dir: opts.segments_per_dir,
            max_segment_size: opts.max_segment_size,
            append_only: opts.append_only,
            additional_free_space: opts.additional_free_space,
            storage_quota: opts.storage_quota,
            max_data_size: opts.max_data_size,
        };
        repo.write_root_file_atomic("config", config.serialize().as_bytes())?;
        repo.write_root_file_atomic("README", README_TEXT.as_bytes())?;
        repo.write_root_file_atomic("nonce", b"0000000000000000")?;
        info!("created repository, id={}", hex::encode(id));
        Ok(())
    }

    /// Open an existing repository, acquiring a lock and either loading a
    /// persisted index or replaying the log to rebuild one (§4.5).
    pub fn open(repo: R, exclusive: bool) -> Result<Self> {
        if !repo.exists() {
            return Err(Error::DoesNotExist { path: "repository".to_string() });
        }
        let readme = repo.read_root_file("README")?;
        if readme.as_deref() != Some(README_TEXT.as_bytes()) {
            return Err(Error::InvalidRepository {
                path: "repository".to_string(),
                reason: "missing or altered README".to_string(),
            });
        }
        let config_bytes = repo
            .read_root_file("config")?
            .ok_or_else(|| Error::InvalidRepositoryConfig { reason: "missing config file".to_string() })?;
        let config = RepoConfig::parse(&String::from_utf8_lossy(&config_bytes))?;
        repo.set_segments_per_dir(config.segments_per_dir);

        let mode = if exclusive { LockMode::Exclusive } else { LockMode::Shared };
        let mut lock = lock::acquire(&repo, mode)?;

        let io = SegmentIo::new(repo.clone());
        let (last_commit, removed) = Self::find_last_commit(&io)?;
        for seg in removed {
            warn!("discarding torn/uncommitted trailing segment {seg} found at open");
            io.delete_segment(seg)?;
        }

        let (tid, index, hints) = match last_commit {
            None => {
                // Never committed: nothing to replay, no lock upgrade needed.
                (0, Index::new(), Hints::default())
            }
            Some(tid) if Index::read_snapshot(&repo, config.id, tid).is_ok() => {
                let index = Index::read_snapshot(&repo, config.id, tid)?;
                let hints = match Hints::read_snapshot(&repo, tid)? {
                    Some(h) => h,
                    None => Hints::rebuild(&repo, &index)?,
                };
                (tid, index, hints)
            }
            Some(tid) => {
                if lock.mode() != LockMode::Exclusive {
                    lock = lock::upgrade(&repo, lock)?;
                }
                debug!("replaying log to rebuild index (tid={tid})");
                let index = Self::replay(&io, tid)?;
                let hints = Hints::rebuild(&repo, &index)?;
                (tid, index, hints)
            }
        };

        let next_segment_id = io.list_segments()?.last().map(|&s| s + 1).unwrap_or(0);
        let total_bytes = repo.total_segment_bytes()?;

        let mut this = Self {
            repo,
            io,
            config,
            lock: Some(lock),
            committed_index: index.clone(),
            committed_hints: hints.clone(),
            index,
            hints,
            tid,
            write_segment: None,
            segments_since_commit: Vec::new(),
            next_segment_id,
            dirty: false,
            total_bytes,
        };
        this.cleanup_superseded_snapshots()?;
        Ok(this)
    }

    /// Walk backwards from the highest segment id on disk to find the
    /// highest one that is fully, validly committed. Returns `None` if no
    /// segment on disk is committed (including an empty repository), plus
    /// the ids of any higher, uncommitted segments to discard.
    pub(crate) fn find_last_commit(io: &SegmentIo<R>) -> Result<(Option<u64>, Vec<u64>)> {
        let segments = io.list_segments()?;
        let mut discard = Vec::new();
        for &seg in segments.iter().rev() {
            if io.is_committed(seg)? {
                return Ok((Some(seg), discard));
            }
            discard.push(seg);
        }
        Ok((None, discard))
    }

    /// Rebuild the index by replaying every segment with id `<= tid` in
    /// ascending order. A segment need not itself end in COMMIT to
    /// contribute entries: only the final segment of a transaction is
    /// sealed with COMMIT, but earlier ones reached via mid-transaction
    /// rotation are just as durable once that seal is written (§4.1).
    pub(crate) fn replay(io: &SegmentIo<R>, tid: u64) -> Result<Index> {
        let mut index = Index::new();
        for seg in io.list_segments()? {
            if seg > tid {
                continue;
            }
            let scan = match io.iter_entries(seg) {
                Ok(scan) => scan,
                Err(e) => {
                    warn!("segment {seg}: unreadable during replay ({e}), treating as empty");
                    continue;
                }
            };
            for e in &scan.entries {
                match e.kind {
                    EntryKind::Put => {
                        let key = e.key.expect("PUT always has a key");
                        index.put(key, Location { segment: seg, offset: e.offset });
                    }
                    EntryKind::Delete => {
                        let key = e.key.expect("DELETE always has a key");
                        index.delete(&key);
                    }
                    EntryKind::Commit => {}
                }
            }
        }
        Ok(index)
    }

    pub(crate) fn cleanup_superseded_snapshots(&self) -> Result<()> {
        let keep_index = format!("index.{}", self.tid);
        let keep_sig = format!("index.{}.signature", self.tid);
        for name in self.repo.list_root_files("index.")? {
            if name != keep_index && name != keep_sig {
                self.repo.remove_root_file(&name)?;
            }
        }
        let keep_hints = format!("hints.{}", self.tid);
        for name in self.repo.list_root_files("hints.")? {
            if name != keep_hints {
                self.repo.remove_root_file(&name)?;
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn require_exclusive_lock(&self) -> Result<()> {
        match &self.lock {
            Some(l) if l.mode() == LockMode::Exclusive => Ok(()),
            Some(_) => Err(Error::LockFailed { reason: "mutation requires an exclusive lock".to_string() }),
            None => Err(Error::invariant("repository is closed")),
        }
    }

    fn ensure_write_segment(&mut self) -> Result<u64> {
        if let Some(seg) = self.write_segment {
            if self.io.segment_size(seg)? < self.config.max_segment_size {
                return Ok(seg);
            }
            debug!("segment {seg} reached soft size target, rotating");
        }
        let new_id = self.next_segment_id;
        self.next_segment_id += 1;
        self.write_segment = Some(new_id);
        self.segments_since_commit.push(new_id);
        Ok(new_id)
    }

    fn entry_framed_size(&self, loc: Location) -> Result<u64> {
        Ok(self.io.read_at(loc.segment, loc.offset)?.framed_size())
    }

    /// Append-a-PUT. Rejects oversized payloads and quota overruns without
    /// writing anything.
    pub fn put(&mut self, key: Key, payload: &[u8]) -> Result<()> {
        self.require_exclusive_lock()?;
        if payload.len() as u64 > self.config.max_data_size {
            return Err(Error::integrity(format!(
                "payload of {} bytes exceeds max_data_size {}",
                payload.len(),
                self.config.max_data_size
            )));
        }
        if let Some(quota) = self.config.storage_quota {
            let projected = self.total_bytes + payload.len() as u64 + KEY_SIZE as u64 + 9;
            if projected > quota {
                return Err(Error::StorageQuotaExceeded {
                    used: self.total_bytes,
                    requested: payload.len() as u64,
                    quota,
                });
            }
        }

        let segment = self.ensure_write_segment()?;
        let (loc, size) = self.io.write_put(segment, key, payload)?;
        self.mark_dirty();
        self.total_bytes += size;

        if let Some(prev) = self.index.put(key, loc) {
            let prev_size = self.entry_framed_size(prev)?;
            self.hints.compact.add(prev.segment, prev_size);
            self.hints.shadow.add(key, prev.segment);
        }
        Ok(())
    }

    /// Append a DELETE. The key must currently be live.
    pub fn delete(&mut self, key: Key) -> Result<()> {
        self.require_exclusive_lock()?;
        let prev = self.index.get(&key).ok_or(Error::ObjectNotFound { key })?;

        let segment = self.ensure_write_segment()?;
        let (loc, size) = self.io.write_delete(segment, key)?;
        self.mark_dirty();
        self.total_bytes += size;
        self.index.delete(&key);

        let prev_size = self.entry_framed_size(prev)?;
        self.hints.compact.add(prev.segment, prev_size);
        // Self-accounting: the DELETE itself becomes obsolete once its
        // shadowing obligation is discharged (§4.3).
        self.hints.compact.add(loc.segment, size);
        self.hints.shadow.add(key, prev.segment);
        Ok(())
    }

    pub fn get(&self, key: &Key) -> Result<Vec<u8>> {
        let loc = self.index.get(key).ok_or(Error::ObjectNotFound { key: *key })?;
        match self.io.read_at(loc.segment, loc.offset)? {
            Entry::Put { payload, .. } => Ok(payload),
            _ => Err(Error::invariant("index points at a non-PUT entry")),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Keys in stable ascending order, optionally resuming strictly after
    /// `marker`.
    pub fn list(&self, limit: usize, marker: Option<&Key>) -> Vec<Key> {
        self.index.list(limit, marker)
    }

    /// Like [`Repository::list`] but also fetches each object's payload,
    /// returning a cursor to resume from.
    pub fn scan(&self, limit: usize, state: ScanState) -> Result<(Vec<ScannedObject>, ScanState)> {
        let keys = self.index.list(limit, state.0.as_ref());
        let mut out = Vec::with_capacity(keys.len());
        for key in &keys {
            out.push(ScannedObject { key: *key, payload: self.get(key)? });
        }
        let next = keys.last().copied().map(ScanState).unwrap_or(state);
        Ok((out, next))
    }

    /// Discard all in-memory and on-disk changes since the last commit.
    pub fn rollback(&mut self) -> Result<()> {
        for seg in self.segments_since_commit.drain(..) {
            self.io.delete_segment(seg)?;
        }
        self.write_segment = None;
        self.index = self.committed_index.clone();
        self.hints = self.committed_hints.clone();
        self.total_bytes = self.repo.total_segment_bytes()?;
        self.dirty = false;
        Ok(())
    }

    fn eligible_segments(&self, threshold: f64) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        for seg in self.repo.list_segments()? {
            if Some(seg) == self.write_segment {
                continue;
            }
            if !self.io.is_committed(seg)? {
                continue;
            }
            let size = self.io.segment_size(seg)?;
            if self.hints.compact.is_eligible(seg, size, threshold) {
                out.push(seg);
            }
        }
        Ok(out)
    }

    /// Conservative upper bound on bytes needed to carry out a commit:
    /// compaction scratch space plus the worst-case size of the index and
    /// hints snapshots, plus the configured cushion (§4.1.1 / SPEC_FULL
    /// 4.1.1). Always an overestimate; never corrupts anything, only
    /// aborts commits that might in fact have fit.
    fn preflight_estimate(&self, eligible: &[u64]) -> Result<u64> {
        let mut scratch = 0u64;
        for &seg in eligible {
            scratch += self.io.segment_size(seg)?;
        }
        let index_estimate = self.index.len() as u64 * (KEY_SIZE as u64 + 8 + 8);
        let hints_estimate =
            self.hints.compact.len() as u64 * 16 + self.hints.shadow.total_refs() as u64 * (KEY_SIZE as u64 + 8);
        Ok(scratch + index_estimate + hints_estimate + self.config.additional_free_space)
    }

    /// Compact one eligible, already-committed segment: copy its live
    /// entries forward into a fresh segment (sealed with its own COMMIT),
    /// update bookkeeping, and unlink the original. Returns the new
    /// segment's id if one was created (the segment had live entries) or
    /// `None` if the whole segment was dead and simply removed.
    fn compact_segment(&mut self, seg: u64) -> Result<Option<u64>> {
        if !self.repo.segment_exists(seg) {
            return Ok(None);
        }
        let scan = self.io.iter_entries(seg)?;

        #[derive(Clone, Copy)]
        enum Survivor {
            Put { key: Key, offset: u64 },
            Delete { key: Key },
        }

        let mut survivors = Vec::new();
        for e in &scan.entries {
            match e.kind {
                EntryKind::Put => {
                    let key = e.key.expect("PUT always has a key");
                    let is_live =
                        matches!(self.index.get(&key), Some(loc) if loc.segment == seg && loc.offset == e.offset);
                    if is_live {
                        survivors.push(Survivor::Put { key, offset: e.offset });
                    }
                }
                EntryKind::Delete => {
                    let key = e.key.expect("DELETE always has a key");
                    let still_live = self.index.get(&key).is_some();
                    let dischargeable = self.hints.shadow.delete_dischargeable(&self.repo, &key, seg)?;
                    if !still_live && !dischargeable {
                        survivors.push(Survivor::Delete { key });
                    }
                }
                EntryKind::Commit => {}
            }
        }

        let old_size = self.repo.segment_len(seg)?;

        if survivors.is_empty() {
            self.repo.remove_segment(seg)?;
            self.total_bytes = self.total_bytes.saturating_sub(old_size);
            self.hints.compact.remove(seg);
            self.hints.shadow.remove_segment(seg);
            debug!("compaction: segment {seg} had no live entries, removed");
            return Ok(None);
        }

        let new_seg = self.next_segment_id;
        self.next_segment_id += 1;
        let mut new_size = 0u64;
        for s in &survivors {
            match *s {
                Survivor::Put { key, offset } => {
                    let payload = match self.io.read_at(seg, offset)? {
                        Entry::Put { payload, .. } => payload,
                        _ => return Err(Error::invariant("expected PUT entry during compaction")),
                    };
                    let (loc, size) = self.io.write_put(new_seg, key, &payload)?;
                    new_size += size;
                    self.index.put(key, loc);
                }
                Survivor::Delete { key } => {
                    let (_loc, size) = self.io.write_delete(new_seg, key)?;
                    new_size += size;
                    self.hints.compact.add(new_seg, size);
                }
            }
        }
        let commit_size = self.io.write_commit(new_seg, new_seg)?;
        new_size += commit_size;
        self.repo.fsync_segment_dir(new_seg)?;

        self.repo.remove_segment(seg)?;
        self.total_bytes = self.total_bytes.saturating_sub(old_size) + new_size;
        self.hints.compact.remove(seg);
        self.hints.shadow.remove_segment(seg);

        debug!("compaction: segment {seg} -> {new_seg} ({} survivors)", survivors.len());
        Ok(Some(new_seg))
    }

    /// The commit protocol (§4.5): flush+seal the write segment, free-
    /// space preflight, compaction, then a fresh index/hints snapshot, and
    /// finally deletion of superseded snapshot files.
    pub fn commit(&mut self, threshold: Option<f64>) -> Result<()> {
        self.require_exclusive_lock()?;
        let threshold = threshold.unwrap_or(DEFAULT_COMPACTION_THRESHOLD);

        let mut new_tid = self.tid;
        if let Some(seg) = self.write_segment {
            // Step 1: flush and fsync the current write segment.
            self.io.flush_and_sync(seg)?;
            // Step 2: the durability point. A crash before this completes
            // must look like a rollback to the previous commit.
            self.io.write_commit(seg, seg)?;
            self.repo.fsync_segment_dir(seg)?;
            new_tid = seg;
            self.write_segment = None;
            self.segments_since_commit.clear();
        }

        // Step 3: free-space preflight. Unconditional: append-only repos
        // still need to abort cleanly rather than run out of space mid
        // index/hints write in step 5.
        let eligible = if self.config.append_only { Vec::new() } else { self.eligible_segments(threshold)? };
        let needed = self.preflight_estimate(&eligible)?;
        let available = self.repo.available_space()?;
        if needed > available {
            self.tid = new_tid;
            self.dirty = false;
            self.committed_index = self.index.clone();
            self.committed_hints = self.hints.clone();
            return Err(Error::InsufficientFreeSpace { needed, available });
        }

        // Step 4: compact eligible segments. Append-only mode disables
        // compaction entirely, so `eligible` is always empty there.
        for seg in eligible {
            if let Some(created) = self.compact_segment(seg)? {
                new_tid = new_tid.max(created);
            }
        }

        self.tid = new_tid;
        self.dirty = false;
        self.committed_index = self.index.clone();
        self.committed_hints = self.hints.clone();

        // Step 5: write a fresh hints.<tid> and index.<tid>.
        self.hints.write_snapshot(&self.repo, self.tid)?;
        self.index.write_snapshot(&self.repo, self.config.id, self.tid)?;

        // Step 6: delete superseded index.*/hints.* files.
        self.cleanup_superseded_snapshots()?;

        info!("committed transaction {}", self.tid);
        Ok(())
    }

    /// `check(repair, ..)` requires a clean state: a checker walking
    /// uncommitted, in-flight mutations would be checking a state that
    /// does not durably exist yet.
    pub fn check(&mut self, repair: bool) -> Result<crate::check::CheckReport> {
        if self.dirty {
            return Err(Error::invariant("cannot check with uncommitted changes; commit or rollback first"));
        }
        if repair {
            self.require_exclusive_lock()?;
        }
        let report = crate::check::run(self, repair)?;
        if repair {
            self.committed_index = self.index.clone();
            self.committed_hints = self.hints.clone();
        }
        Ok(report)
    }

    pub(crate) fn repo(&self) -> &R {
        &self.repo
    }

    pub(crate) fn io(&self) -> &SegmentIo<R> {
        &self.io
    }

    pub(crate) fn index(&self) -> &Index {
        &self.index
    }

    pub(crate) fn index_mut(&mut self) -> &mut Index {
        &mut self.index
    }

    pub(crate) fn hints(&self) -> &Hints {
        &self.hints
    }

    pub(crate) fn hints_mut(&mut self) -> &mut Hints {
        &mut self.hints
    }

    pub(crate) fn tid(&self) -> u64 {
        self.tid
    }

    pub(crate) fn set_tid(&mut self, tid: u64) {
        self.tid = tid;
    }

    /// Persist a caller-owned opaque blob outside the content-addressed
    /// object space (e.g. a wrapped master key for the out-of-scope crypto
    /// layer). Not reachable via `get`/`list`/`scan`.
    pub fn save_key(&self, blob: &[u8]) -> Result<()> {
        self.repo.write_root_file_atomic("keyfile", blob)
    }

    pub fn load_key(&self) -> Result<Option<Vec<u8>>> {
        self.repo.read_root_file("keyfile")
    }

    /// Bump the ASCII-hex nonce counter used by the (out-of-scope) crypto
    /// layer. Independent of the commit fsync fence (see Open Questions,
    /// §9 / SPEC_FULL §9): an unrelated counter should not make every put
    /// latency-sensitive to a file this engine does not interpret.
    pub fn bump_nonce(&self) -> Result<u64> {
        self.require_exclusive_lock()?;
        let current = self
            .repo
            .read_root_file("nonce")?
            .map(|b| String::from_utf8_lossy(&b).trim().to_string())
            .unwrap_or_else(|| "0".to_string());
        let value = u64::from_str_radix(&current, 16).unwrap_or(0);
        let next = value.wrapping_add(1);
        self.repo.write_root_file_atomic("nonce", format!("{next:016x}").as_bytes())?;
        Ok(next)
    }

    /// Unlink all segments and metadata. Forbidden for append-only
    /// repositories (Open Question resolution, SPEC_FULL §9): an
    /// append-only repository is a write-once archival target that must
    /// not be unlinkable by the same code path that manages it day to day.
    pub fn destroy(mut self) -> Result<()> {
        if self.config.append_only {
            return Err(Error::invariant("destroy() is forbidden on an append-only repository"));
        }
        self.require_exclusive_lock()?;
        self.repo.remove_all()?;
        if let Some(lock) = self.lock.take() {
            lock.release(&self.repo)?;
        }
        Ok(())
    }

    /// Close the repository. An uncommitted transaction is implicitly
    /// rolled back.
    pub fn close(mut self) -> Result<()> {
        if self.dirty {
            self.rollback()?;
        }
        if let Some(lock) = self.lock.take() {
            lock.release(&self.repo)?;
        }
        Ok(())
    }
}

/// All segment ids known to the repository, whether or not currently
/// eligible for compaction; exposed for the checker.
pub(crate) fn all_segments<R: Repo>(repo: &R) -> Result<BTreeSet<u64>> {
    Ok(repo.list_segments()?.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::mem::Memory;

    fn key(i: u32) -> Key {
        let mut buf = [0u8; KEY_SIZE];
        buf[..4].copy_from_slice(&i.to_be_bytes());
        Key::from_bytes(buf)
    }

    fn open_fresh() -> Repository<Memory> {
        let repo = Memory::new();
        Repository::create(repo.clone(), CreateOptions::default()).unwrap();
        Repository::open(repo, true).unwrap()
    }

    #[test]
    fn s1_basic_put_get() {
        let mut r = open_fresh();
        r.put(key(0), b"foo").unwrap();
        r.put(key(1), b"bar").unwrap();
        r.commit(None).unwrap();
        assert_eq!(r.get(&key(0)).unwrap(), b"foo");
        assert_eq!(r.get(&key(1)).unwrap(), b"bar");
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn s2_supersede_and_replay() {
        let repo = Memory::new();
        Repository::create(repo.clone(), CreateOptions::default()).unwrap();
        {
            let mut r = Repository::open(repo.clone(), true).unwrap();
            r.put(key(0), b"foo").unwrap();
            r.commit(None).unwrap();
            r.put(key(0), b"bar").unwrap();
            r.commit(None).unwrap();
            assert_eq!(r.get(&key(0)).unwrap(), b"bar");
            r.close().unwrap();
        }
        for name in repo.list_root_files("index.").unwrap() {
            repo.remove_root_file(&name).unwrap();
        }
        for name in repo.list_root_files("hints.").unwrap() {
            repo.remove_root_file(&name).unwrap();
        }
        let r = Repository::open(repo, true).unwrap();
        assert_eq!(r.get(&key(0)).unwrap(), b"bar");
    }

    #[test]
    fn s3_rollback_restores_previous_value() {
        let mut r = open_fresh();
        r.put(key(0), b"foo").unwrap();
        r.commit(None).unwrap();
        r.put(key(0), b"bar").unwrap();
        r.rollback().unwrap();
        assert_eq!(r.get(&key(0)).unwrap(), b"foo");
        assert!(!r.is_dirty());
    }

    #[test]
    fn s6_max_data_size_enforced() {
        let mut r = open_fresh();
        let max = r.config().max_data_size as usize;
        r.put(key(0), &vec![b'x'; max]).unwrap();
        let err = r.put(key(1), &vec![b'x'; max + 1]).unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
        assert!(r.get(&key(1)).is_err());
    }

    #[test]
    fn delete_of_absent_key_is_object_not_found() {
        let mut r = open_fresh();
        let err = r.delete(key(0)).unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound { .. }));
    }

    #[test]
    fn list_is_stable_and_respects_marker() {
        let mut r = open_fresh();
        for i in 0..5u32 {
            r.put(key(i), b"x").unwrap();
        }
        r.commit(None).unwrap();
        let all = r.list(0, None);
        assert_eq!(all.len(), 5);
        let after = r.list(0, Some(&all[1]));
        assert_eq!(after.len(), 3);
    }

    #[test]
    fn s4_shadow_prevents_resurrection_after_compaction() {
        let repo = Memory::new();
        Repository::create(repo.clone(), CreateOptions::default()).unwrap();
        {
            let mut r = Repository::open(repo.clone(), true).unwrap();
            r.put(key(1), b"1").unwrap();
            r.commit(None).unwrap();

            r.delete(key(1)).unwrap();
            r.put(key(2), b"2").unwrap();
            // Threshold 1.1 never triggers compaction here: both segments
            // stay intact, matching the "not compacted yet" step of S4.
            r.commit(Some(1.1)).unwrap();

            r.delete(key(2)).unwrap();
            // Now force compaction of the DELETE(1)'s segment.
            r.commit(Some(0.0)).unwrap();
            r.close().unwrap();
        }
        for name in repo.list_root_files("index.").unwrap() {
            repo.remove_root_file(&name).unwrap();
        }
        let r = Repository::open(repo, true).unwrap();
        assert!(r.get(&key(1)).is_err());
    }

    #[test]
    fn compaction_is_idempotent_on_retrievable_keys() {
        let mut r = open_fresh();
        r.put(key(0), b"a").unwrap();
        r.put(key(1), b"b").unwrap();
        r.commit(None).unwrap();
        r.put(key(0), b"a2").unwrap();
        r.commit(Some(0.0)).unwrap();
        r.commit(Some(0.0)).unwrap();
        assert_eq!(r.get(&key(0)).unwrap(), b"a2");
        assert_eq!(r.get(&key(1)).unwrap(), b"b");
    }

    #[test]
    fn insufficient_free_space_aborts_cleanly() {
        let repo = Memory::new();
        Repository::create(repo.clone(), CreateOptions::default()).unwrap();
        let mut r = Repository::open(repo.clone(), true).unwrap();
        r.put(key(0), b"foo").unwrap();
        repo.set_available_space(0);
        let err = r.commit(None).unwrap_err();
        assert!(matches!(err, Error::InsufficientFreeSpace { .. }));
        // The durability point already reached (the COMMIT append) stands.
        assert_eq!(r.get(&key(0)).unwrap(), b"foo");
        assert!(!r.is_dirty());
    }

    #[test]
    fn check_rejects_dirty_state() {
        let mut r = open_fresh();
        r.put(key(0), b"foo").unwrap();
        assert!(r.check(false).is_err());
    }
}
