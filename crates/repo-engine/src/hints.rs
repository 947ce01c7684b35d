//! Compact table (per-segment obsolete-byte accounting) and shadow index
//! (key -> segments holding superseded/deleted copies), persisted together
//! in one `hints.<tid>` snapshot.

use std::collections::BTreeMap;
use std::convert::TryInto;

use crc32c::crc32c;

use crate::error::{Error, Result};
use crate::key::{Key, KEY_SIZE};
use crate::repo::Repo;

const HINTS_MAGIC: [u8; 8] = *b"rbkhnt01";

/// Default threshold for compaction eligibility: `compact[s] /
/// segment_size(s) >= threshold`.
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.1;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompactTable {
    obsolete_bytes: BTreeMap<u64, u64>,
}

impl CompactTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, segment: u64, bytes: u64) {
        *self.obsolete_bytes.entry(segment).or_insert(0) += bytes;
    }

    pub fn get(&self, segment: u64) -> u64 {
        self.obsolete_bytes.get(&segment).copied().unwrap_or(0)
    }

    pub fn remove(&mut self, segment: u64) {
        self.obsolete_bytes.remove(&segment);
    }

    pub fn is_eligible(&self, segment: u64, segment_size: u64, threshold: f64) -> bool {
        if segment_size == 0 {
            return false;
        }
        (self.get(segment) as f64 / segment_size as f64) >= threshold
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.obsolete_bytes.iter().map(|(&s, &b)| (s, b))
    }

    pub fn len(&self) -> usize {
        self.obsolete_bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.obsolete_bytes.is_empty()
    }
}

/// key -> ordered list of segment ids holding a superseded-or-deleted copy.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShadowIndex {
    entries: BTreeMap<Key, Vec<u64>>,
}

impl ShadowIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: Key, segment: u64) {
        let list = self.entries.entry(key).or_default();
        if !list.contains(&segment) {
            list.push(segment);
            list.sort_unstable();
        }
    }

    pub fn get(&self, key: &Key) -> &[u64] {
        self.entries.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Number of keys with an outstanding shadow entry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of (key, segment) references across all keys, used by
    /// the free-space preflight estimate.
    pub fn total_refs(&self) -> usize {
        self.entries.values().map(|v| v.len()).sum()
    }

    /// Drop `segment` from every key's shadow list (called once the
    /// segment has actually been removed from disk by compaction).
    pub fn remove_segment(&mut self, segment: u64) {
        self.entries.retain(|_, list| {
            list.retain(|&s| s != segment);
            !list.is_empty()
        });
    }

    /// True iff a DELETE(k) in `segment` is safe to drop: every shadow
    /// entry for k older than `segment` is gone (the segment no longer
    /// exists on disk).
    pub fn delete_dischargeable<R: Repo>(&self, repo: &R, key: &Key, segment: u64) -> Result<bool> {
        for &s in self.get(key) {
            if s < segment && repo.segment_exists(s) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn prune_missing<R: Repo>(&mut self, repo: &R) -> Result<()> {
        let mut to_remove = Vec::new();
        for (key, list) in self.entries.iter_mut() {
            list.retain(|&s| repo.segment_exists(s));
            if list.is_empty() {
                to_remove.push(*key);
            }
        }
        for k in to_remove {
            self.entries.remove(&k);
        }
        Ok(())
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(self.entries.len() as u64).to_le_bytes());
        for (k, list) in &self.entries {
            body.extend_from_slice(k.as_ref());
            body.extend_from_slice(&(list.len() as u32).to_le_bytes());
            for &s in list {
                body.extend_from_slice(&s.to_le_bytes());
            }
        }
        body
    }

    fn decode_body(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let count = read_u64(buf, pos)?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let key = read_key(buf, pos)?;
            let list_len = read_u32(buf, pos)? as usize;
            let mut list = Vec::with_capacity(list_len);
            for _ in 0..list_len {
                list.push(read_u64(buf, pos)?);
            }
            entries.insert(key, list);
        }
        Ok(Self { entries })
    }
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64> {
    if *pos + 8 > buf.len() {
        return Err(Error::integrity("truncated hints file (u64)"));
    }
    let v = u64::from_le_bytes(buf[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    Ok(v)
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    if *pos + 4 > buf.len() {
        return Err(Error::integrity("truncated hints file (u32)"));
    }
    let v = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    Ok(v)
}

fn read_key(buf: &[u8], pos: &mut usize) -> Result<Key> {
    if *pos + KEY_SIZE > buf.len() {
        return Err(Error::integrity("truncated hints file (key)"));
    }
    let key = Key::from_slice(&buf[*pos..*pos + KEY_SIZE]).unwrap();
    *pos += KEY_SIZE;
    Ok(key)
}

/// The pair of tables written together at commit time as `hints.<tid>`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Hints {
    pub compact: CompactTable,
    pub shadow: ShadowIndex,
}

impl Hints {
    pub fn write_snapshot<R: Repo>(&self, repo: &R, tid: u64) -> Result<()> {
        let mut body = Vec::new();
        body.extend_from_slice(&(self.compact.obsolete_bytes.len() as u64).to_le_bytes());
        for (s, b) in self.compact.iter() {
            body.extend_from_slice(&s.to_le_bytes());
            body.extend_from_slice(&b.to_le_bytes());
        }
        body.extend_from_slice(&self.shadow.encode_body());

        let crc = crc32c(&body);
        let mut file = Vec::with_capacity(HINTS_MAGIC.len() + 4 + body.len());
        file.extend_from_slice(&HINTS_MAGIC);
        file.extend_from_slice(&crc.to_le_bytes());
        file.extend_from_slice(&body);

        repo.write_root_file_atomic(&format!("hints.{tid}"), &file)
    }

    /// Load `hints.<tid>`. A missing file or a CRC mismatch is treated as
    /// "no hints" by the caller, which should fall back to [`rebuild`].
    pub fn read_snapshot<R: Repo>(repo: &R, tid: u64) -> Result<Option<Self>> {
        let file = match repo.read_root_file(&format!("hints.{tid}"))? {
            Some(f) => f,
            None => return Ok(None),
        };
        if file.len() < HINTS_MAGIC.len() + 4 || file[..HINTS_MAGIC.len()] != HINTS_MAGIC {
            return Ok(None);
        }
        let expected_crc = u32::from_le_bytes(
            file[HINTS_MAGIC.len()..HINTS_MAGIC.len() + 4].try_into().unwrap(),
        );
        let body = &file[HINTS_MAGIC.len() + 4..];
        if crc32c(body) != expected_crc {
            return Ok(None);
        }

        let mut pos = 0usize;
        let compact_count = read_u64(body, &mut pos)?;
        let mut compact = CompactTable::new();
        for _ in 0..compact_count {
            let s = read_u64(body, &mut pos)?;
            let b = read_u64(body, &mut pos)?;
            compact.add(s, b);
        }
        let shadow = ShadowIndex::decode_body(body, &mut pos)?;
        Ok(Some(Self { compact, shadow }))
    }

    /// Rebuild both tables from scratch by a single fresh pass over every
    /// segment, using `index` as the ground truth for which (segment,
    /// offset) is the live copy of each key. This is cheaper than a full
    /// log replay (the index itself is trusted) and is what the engine
    /// falls back to when `hints.<tid>` is missing or corrupt (§4.3).
    pub fn rebuild<R: Repo>(repo: &R, index: &crate::index::Index) -> Result<Self> {
        let io = crate::segment::SegmentIo::new(repo.clone());
        let mut hints = Hints::default();
        for segment in io.list_segments()? {
            if !io.is_committed(segment)? {
                continue;
            }
            let scan = io.iter_entries(segment)?;
            let mut any_live = false;
            let mut commit_size = 0u64;
            for e in &scan.entries {
                use crate::segment::EntryKind;
                match e.kind {
                    EntryKind::Put | EntryKind::Delete => {
                        let key = e.key.expect("PUT/DELETE always has a key");
                        let is_live = matches!(
                            index.get(&key),
                            Some(loc) if loc.segment == segment && loc.offset == e.offset
                        );
                        if is_live {
                            any_live = true;
                        } else {
                            hints.compact.add(segment, e.size);
                            hints.shadow.add(key, segment);
                        }
                    }
                    EntryKind::Commit => commit_size = e.size,
                }
            }
            // A segment with no live entries is entirely reclaimable; its
            // magic-header bytes and its COMMIT entry (never otherwise
            // counted above) must count toward its obsolete-byte total too,
            // or its ratio can sit just under the compaction threshold.
            if !any_live {
                hints.compact.add(segment, crate::frame::MAGIC.len() as u64 + commit_size);
            }
        }
        Ok(hints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::mem::Memory;

    fn key(b: u8) -> Key {
        Key::from_bytes([b; KEY_SIZE])
    }

    #[test]
    fn compact_table_eligibility() {
        let mut t = CompactTable::new();
        t.add(1, 50);
        assert!(t.is_eligible(1, 100, 0.1));
        assert!(!t.is_eligible(1, 1000, 0.1));
    }

    #[test]
    fn shadow_index_round_trips_through_hints_snapshot() {
        let repo = Memory::new();
        let mut hints = Hints::default();
        hints.compact.add(3, 128);
        hints.shadow.add(key(1), 0);
        hints.shadow.add(key(1), 2);
        hints.write_snapshot(&repo, 9).unwrap();

        let loaded = Hints::read_snapshot(&repo, 9).unwrap().unwrap();
        assert_eq!(loaded.compact.get(3), 128);
        assert_eq!(loaded.shadow.get(&key(1)), &[0, 2]);
    }

    #[test]
    fn missing_hints_file_is_none() {
        let repo = Memory::new();
        assert!(Hints::read_snapshot(&repo, 1).unwrap().is_none());
    }

    #[test]
    fn delete_dischargeable_when_no_older_segment_survives() {
        let repo = Memory::new();
        let mut shadow = ShadowIndex::new();
        shadow.add(key(1), 0);
        // segment 0 was removed from disk already.
        assert!(shadow.delete_dischargeable(&repo, &key(1), 5).unwrap());
    }
}
