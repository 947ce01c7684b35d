//! Persistent in-memory key -> (segment, offset) mapping with atomic
//! on-disk snapshots.

use std::collections::BTreeMap;
use std::convert::TryInto;

use crc32c::crc32c;
use itertools::Either;
use log::warn;

use crate::error::{Error, Result};
use crate::key::{Key, KEY_SIZE};
use crate::repo::Repo;
use crate::segment::Location;

const INDEX_MAGIC: [u8; 8] = *b"rbkidx01";
const SIGNATURE_MAGIC: [u8; 8] = *b"rbksig01";
/// `key(32) + segment(8) + offset(8)`.
const ENTRY_LEN: usize = KEY_SIZE + 8 + 8;

#[derive(Debug, Default, Clone)]
pub struct Index {
    map: BTreeMap<Key, Location>,
}

impl Index {
    pub fn new() -> Self {
        Self { map: BTreeMap::new() }
    }

    pub fn get(&self, k: &Key) -> Option<Location> {
        self.map.get(k).copied()
    }

    pub fn put(&mut self, k: Key, loc: Location) -> Option<Location> {
        self.map.insert(k, loc)
    }

    pub fn delete(&mut self, k: &Key) -> Option<Location> {
        self.map.remove(k)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter_keys(&self) -> impl Iterator<Item = &Key> {
        self.map.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Location)> {
        self.map.iter()
    }

    /// Keys in stable ascending order, after `marker` (exclusive) if given,
    /// limited to `limit` entries (0 = unlimited).
    pub fn list(&self, limit: usize, marker: Option<&Key>) -> Vec<Key> {
        let iter = self.map.keys().copied();
        let iter = match marker {
            Some(m) => Either::Left(iter.filter(move |k| k > m)),
            None => Either::Right(iter),
        };
        if limit == 0 {
            iter.collect()
        } else {
            iter.take(limit).collect()
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.map.len() * ENTRY_LEN);
        for (k, loc) in &self.map {
            body.extend_from_slice(k.as_ref());
            body.extend_from_slice(&loc.segment.to_le_bytes());
            body.extend_from_slice(&loc.offset.to_le_bytes());
        }
        body
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        if body.len() % ENTRY_LEN != 0 {
            return Err(Error::integrity("index body length not a multiple of entry size"));
        }
        let mut map = BTreeMap::new();
        for chunk in body.chunks_exact(ENTRY_LEN) {
            let key = Key::from_slice(&chunk[..KEY_SIZE]).unwrap();
            let segment = u64::from_le_bytes(chunk[KEY_SIZE..KEY_SIZE + 8].try_into().unwrap());
            let offset = u64::from_le_bytes(chunk[KEY_SIZE + 8..].try_into().unwrap());
            map.insert(key, Location { segment, offset });
        }
        Ok(Self { map })
    }

    /// Atomically persist this index as `index.<tid>` plus its
    /// `index.<tid>.signature`: the signature is written first (referencing
    /// the content's CRC and the repository id), then the index content
    /// itself, each via `write_root_file_atomic`'s own temp+fsync+rename.
    /// This ordering means a crash can only ever leave behind a signature
    /// with no matching index (detected and ignored at the next open) or a
    /// fully valid pair, never an index with no signature.
    pub fn write_snapshot<R: Repo>(&self, repo: &R, repo_id: [u8; 32], tid: u64) -> Result<()> {
        let body = self.encode_body();
        let crc = crc32c(&body);

        let mut file = Vec::with_capacity(INDEX_MAGIC.len() + body.len());
        file.extend_from_slice(&INDEX_MAGIC);
        file.extend_from_slice(&body);

        let mut sig = Vec::new();
        sig.extend_from_slice(&SIGNATURE_MAGIC);
        sig.extend_from_slice(&repo_id);
        sig.extend_from_slice(&tid.to_le_bytes());
        sig.extend_from_slice(&crc.to_le_bytes());
        repo.write_root_file_atomic(&format!("index.{tid}.signature"), &sig)?;

        repo.write_root_file_atomic(&format!("index.{tid}"), &file)?;
        Ok(())
    }

    /// Load and verify `index.<tid>` against its signature file and the
    /// expected repository id. A mismatched or unreadable signature, or a
    /// missing index, is a recoverable error that should force a replay.
    pub fn read_snapshot<R: Repo>(repo: &R, expected_repo_id: [u8; 32], tid: u64) -> Result<Self> {
        let sig = repo
            .read_root_file(&format!("index.{tid}.signature"))?
            .ok_or_else(|| Error::integrity(format!("missing signature for index.{tid}")))?;
        if sig.len() != SIGNATURE_MAGIC.len() + 32 + 8 + 4 {
            return Err(Error::integrity("malformed index signature file"));
        }
        if sig[..SIGNATURE_MAGIC.len()] != SIGNATURE_MAGIC {
            return Err(Error::integrity("bad signature magic"));
        }
        let rest = &sig[SIGNATURE_MAGIC.len()..];
        let sig_repo_id: [u8; 32] = rest[..32].try_into().unwrap();
        let sig_tid = u64::from_le_bytes(rest[32..40].try_into().unwrap());
        let sig_crc = u32::from_le_bytes(rest[40..44].try_into().unwrap());

        if sig_repo_id != expected_repo_id {
            return Err(Error::integrity("index signature repository id mismatch"));
        }
        if sig_tid != tid {
            return Err(Error::integrity("index signature tid mismatch"));
        }

        let file = repo
            .read_root_file(&format!("index.{tid}"))?
            .ok_or_else(|| Error::integrity(format!("missing index.{tid}")))?;
        if file.len() < INDEX_MAGIC.len() || file[..INDEX_MAGIC.len()] != INDEX_MAGIC {
            return Err(Error::integrity("bad index magic"));
        }
        let body = &file[INDEX_MAGIC.len()..];
        let actual_crc = crc32c(body);
        if actual_crc != sig_crc {
            warn!("index.{tid}: crc mismatch against signature, forcing replay");
            return Err(Error::integrity("index body does not match signature crc"));
        }

        Self::decode_body(body)
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
    fn snapshot_round_trips() {
        let repo = Memory::new();
        let mut idx = Index::new();
        idx.put(key(1), Location { segment: 0, offset: 8 });
        idx.put(key(2), Location { segment: 1, offset: 16 });
        idx.write_snapshot(&repo, [9; 32], 5).unwrap();

        let loaded = Index::read_snapshot(&repo, [9; 32], 5).unwrap();
        assert_eq!(loaded.get(&key(1)), Some(Location { segment: 0, offset: 8 }));
        assert_eq!(loaded.get(&key(2)), Some(Location { segment: 1, offset: 16 }));
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn wrong_repo_id_is_rejected() {
        let repo = Memory::new();
        let idx = Index::new();
        idx.write_snapshot(&repo, [1; 32], 1).unwrap();
        assert!(Index::read_snapshot(&repo, [2; 32], 1).is_err());
    }

    #[test]
    fn list_respects_marker_and_limit() {
        let mut idx = Index::new();
        for i in 0..5u8 {
            idx.put(key(i), Location { segment: 0, offset: i as u64 });
        }
        let all = idx.list(0, None);
        assert_eq!(all.len(), 5);
        let after = idx.list(0, Some(&all[1]));
        assert_eq!(after.len(), 3);
        let limited = idx.list(2, None);
        assert_eq!(limited.len(), 2);
    }
}
