//! Offline verification and repair (§4.6), driven by the same primitives
//! as normal operation: segment iteration, the index, and the hints.

use log::{info, warn};

use crate::error::Result;
use crate::hints::Hints;
use crate::index::Index;
use crate::key::Key;
use crate::repo::Repo;
use crate::segment::{EntryKind, Location};
use crate::txn::Repository;

/// One inconsistency found (and, in repair mode, fixed) by a check pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    /// A PUT or DELETE entry in a historical (already-superseded) segment
    /// failed its framing/CRC check; everything in that segment from
    /// `valid_bytes` onward is unreadable and was dropped.
    CorruptEntry { segment: u64, valid_bytes: u64 },
    /// The file for a segment id that should exist (id `<=` the
    /// repository's transaction id) is gone.
    MissingSegment { segment: u64 },
    /// The segment carrying the final COMMIT of the current transaction is
    /// itself corrupt. If an earlier valid commit exists, the repository
    /// is rolled back to it; otherwise the segment is cauterized in place
    /// (its corrupt tail dropped, then resealed with a fresh COMMIT).
    CorruptTrailingCommit { segment: u64, valid_bytes: u64, rolled_back_to: u64 },
    /// A key the live index pointed at no longer resolves to a valid PUT
    /// once the log is re-derived from scratch.
    IndexEntryInvalid { key: Key },
    /// A key the fresh re-derivation considers live was missing from the
    /// in-memory index.
    IndexEntryMissing { key: Key },
}

/// Outcome of a [`Repository::check`] pass.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub problems: Vec<Problem>,
    pub repaired: bool,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Re-derive the index by walking every segment with id `<= tid`, exactly
/// like replay, but collecting [`Problem`]s for anything that doesn't look
/// right instead of silently tolerating it.
fn scan_ground_truth<R: Repo>(txn: &Repository<R>, tid: u64) -> Result<(Index, Vec<Problem>)> {
    let io = txn.io();
    let mut index = Index::new();
    let mut problems = Vec::new();

    for seg in io.list_segments()? {
        if seg > tid {
            continue;
        }
        if !txn.repo().segment_exists(seg) {
            problems.push(Problem::MissingSegment { segment: seg });
            continue;
        }
        match io.iter_entries(seg) {
            Ok(scan) => {
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
                if scan.torn {
                    if seg == tid {
                        problems.push(Problem::CorruptTrailingCommit {
                            segment: seg,
                            valid_bytes: scan.valid_bytes,
                            rolled_back_to: tid,
                        });
                    } else {
                        problems.push(Problem::CorruptEntry { segment: seg, valid_bytes: scan.valid_bytes });
                    }
                }
            }
            Err(e) => {
                warn!("segment {seg}: unreadable during check ({e}), treating as missing");
                problems.push(Problem::MissingSegment { segment: seg });
            }
        }
    }
    Ok((index, problems))
}

/// Run a check pass: verify-only if `repair` is false, otherwise fix what
/// can safely be fixed and persist the result. Idempotent: running check
/// twice yields the same report, and check-then-repair-then-check reports
/// no problems (§4.6).
pub fn run<R: Repo>(txn: &mut Repository<R>, repair: bool) -> Result<CheckReport> {
    let original_tid = txn.tid();
    let (mut ground_truth, mut problems) = scan_ground_truth(txn, original_tid)?;
    let mut tid = original_tid;

    // A torn entry in the segment that is supposed to carry the final
    // COMMIT of the current transaction means that transaction's durability
    // point never actually landed: roll back to the highest earlier segment
    // that is validly committed, if one exists.
    let trailing = problems.iter().find_map(|p| match p {
        Problem::CorruptTrailingCommit { segment, valid_bytes, .. } => Some((*segment, *valid_bytes)),
        _ => None,
    });
    if let Some((segment, valid_bytes)) = trailing {
        let io = txn.io();
        let mut fallback = None;
        for seg in io.list_segments()? {
            if seg < segment && io.is_committed(seg).unwrap_or(false) {
                fallback = Some(fallback.map_or(seg, |t: u64| t.max(seg)));
            }
        }
        match fallback {
            Some(new_tid) => {
                info!("check: rolling back corrupt trailing segment {segment} to transaction {new_tid}");
                let (gt, mut inner) = scan_ground_truth(txn, new_tid)?;
                ground_truth = gt;
                tid = new_tid;
                inner.retain(|p| !matches!(p, Problem::CorruptTrailingCommit { .. }));
                inner.push(Problem::CorruptTrailingCommit { segment, valid_bytes, rolled_back_to: new_tid });
                problems = inner;
            }
            None => {
                info!("check: corrupt trailing segment {segment} has no earlier commit to fall back to, keeping its valid prefix");
            }
        }
    }

    // Cross-check the live index against the freshly re-derived one.
    for key in txn.index().iter_keys() {
        if ground_truth.get(key).is_none() {
            problems.push(Problem::IndexEntryInvalid { key: *key });
        }
    }
    for key in ground_truth.iter_keys() {
        if txn.index().get(key).is_none() {
            problems.push(Problem::IndexEntryMissing { key: *key });
        }
    }

    let changed = tid != original_tid || !problems.is_empty();
    if repair && changed {
        for p in &problems {
            match p {
                Problem::CorruptEntry { segment, valid_bytes } => {
                    txn.io().truncate(*segment, *valid_bytes)?;
                }
                Problem::CorruptTrailingCommit { segment, valid_bytes, rolled_back_to } => {
                    if *segment > tid {
                        txn.io().delete_segment(*segment)?;
                    } else {
                        // No earlier commit to fall back to: drop the corrupt
                        // tail and reseal so this segment is self-consistent
                        // again under the same transaction id.
                        debug_assert_eq!(*rolled_back_to, tid);
                        txn.io().truncate(*segment, *valid_bytes)?;
                        txn.io().write_commit(*segment, *segment)?;
                        txn.repo().fsync_segment_dir(*segment)?;
                    }
                }
                Problem::MissingSegment { .. } | Problem::IndexEntryInvalid { .. } | Problem::IndexEntryMissing { .. } => {}
            }
        }

        let rebuilt_hints = Hints::rebuild(txn.repo(), &ground_truth)?;
        txn.set_tid(tid);
        *txn.index_mut() = ground_truth;
        *txn.hints_mut() = rebuilt_hints;

        txn.index().write_snapshot(txn.repo(), txn.config().id, tid)?;
        txn.hints().write_snapshot(txn.repo(), tid)?;
        txn.cleanup_superseded_snapshots()?;
        info!("check: repaired {} problem(s), now at transaction {tid}", problems.len());
    }

    Ok(CheckReport { problems, repaired: repair })
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
    fn clean_repository_reports_nothing() {
        let repo = Memory::new();
        Repository::create(repo.clone(), CreateOptions::default()).unwrap();
        let mut r = Repository::open(repo, true).unwrap();
        r.put(key(0), b"a").unwrap();
        r.commit(None).unwrap();
        let report = r.check(false).unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn corrupt_tail_of_sole_segment_is_cauterized_in_place() {
        let repo = Memory::new();
        Repository::create(repo.clone(), CreateOptions::default()).unwrap();
        let mut r = Repository::open(repo.clone(), true).unwrap();
        r.put(key(0), b"a").unwrap();
        r.put(key(1), b"b").unwrap();
        r.commit(None).unwrap();

        // Corrupt well into the file so the tail (the second PUT and the
        // COMMIT) becomes unreadable but the first PUT survives.
        let len = repo.segment_len(0).unwrap() as usize;
        repo.corrupt_byte(0, len - 4);

        let report = r.check(false).unwrap();
        assert!(!report.is_clean());

        let report = r.check(true).unwrap();
        assert!(report.repaired);
        assert_eq!(r.get(&key(0)).unwrap(), b"a");

        let report = r.check(false).unwrap();
        assert!(report.is_clean(), "check-after-repair should be clean: {:?}", report.problems);
    }

    #[test]
    fn corrupt_trailing_commit_rolls_back_to_earlier_commit() {
        let repo = Memory::new();
        Repository::create(repo.clone(), CreateOptions::default()).unwrap();
        let mut r = Repository::open(repo.clone(), true).unwrap();
        r.put(key(0), b"a").unwrap();
        r.commit(None).unwrap();
        r.put(key(1), b"b").unwrap();
        r.commit(None).unwrap();

        let last_seg = r.tid();
        let len = repo.segment_len(last_seg).unwrap() as usize;
        repo.corrupt_byte(last_seg, len - 4);

        let report = r.check(true).unwrap();
        assert!(!report.problems.is_empty());
        assert_eq!(r.get(&key(0)).unwrap(), b"a");
        assert!(r.get(&key(1)).is_err());

        let report = r.check(false).unwrap();
        assert!(report.is_clean(), "check-after-repair should be clean: {:?}", report.problems);
    }

    #[test]
    fn missing_segment_removes_its_keys() {
        let repo = Memory::new();
        Repository::create(repo.clone(), CreateOptions::default()).unwrap();
        let mut r = Repository::open(repo.clone(), true).unwrap();
        r.put(key(0), b"a").unwrap();
        r.commit(None).unwrap();
        r.put(key(1), b"b").unwrap();
        r.commit(None).unwrap();

        repo.truncate_segment_bytes(0, 0);
        let _ = r.check(true).unwrap();
        assert!(r.get(&key(0)).is_err());
    }
}
