use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

use super::{Repo, SegmentWriter};

/// In-memory backend used by unit tests to exercise the segment/index/
/// transaction layers without touching the filesystem.
#[derive(Clone)]
pub struct Memory {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    created: bool,
    root_files: BTreeMap<String, Vec<u8>>,
    segments: BTreeMap<u64, Vec<u8>>,
    segments_per_dir: u64,
    /// Budget simulating `available_space`; defaults to "plenty".
    available_space: u64,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                created: false,
                root_files: BTreeMap::new(),
                segments: BTreeMap::new(),
                segments_per_dir: crate::config::DEFAULT_SEGMENTS_PER_DIR,
                available_space: u64::MAX / 2,
            })),
        }
    }

    /// Clamp the simulated free space, for free-space-preflight tests.
    pub fn set_available_space(&self, bytes: u64) {
        self.inner.lock().unwrap().available_space = bytes;
    }

    /// Truncate a segment's bytes in place, simulating a torn write.
    pub fn truncate_segment_bytes(&self, segment_id: u64, len: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(buf) = inner.segments.get_mut(&segment_id) {
            buf.truncate(len);
        }
    }

    /// Flip a single bit in a segment file, simulating bitrot.
    pub fn corrupt_byte(&self, segment_id: u64, offset: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(buf) = inner.segments.get_mut(&segment_id) {
            if let Some(b) = buf.get_mut(offset) {
                *b ^= 0xff;
            }
        }
    }
}

pub struct MemSegmentWriter {
    inner: Arc<Mutex<Inner>>,
    segment_id: u64,
}

impl Write for MemSegmentWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.segments.entry(self.segment_id).or_default().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SegmentWriter for MemSegmentWriter {
    fn len(&self) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.segments.get(&self.segment_id).map(|v| v.len() as u64).unwrap_or(0))
    }

    fn sync_all(&mut self) -> Result<()> {
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(buf) = inner.segments.get_mut(&self.segment_id) {
            buf.truncate(len as usize);
        }
        Ok(())
    }
}

impl Repo for Memory {
    type SegmentWriter = MemSegmentWriter;
    type SegmentReader = io::Cursor<Vec<u8>>;

    fn exists(&self) -> bool {
        self.inner.lock().unwrap().root_files.contains_key("config")
    }

    fn create_root(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.created {
            return Err(Error::PathAlreadyExists { path: "memory://repo".into() });
        }
        inner.created = true;
        inner
            .root_files
            .insert("README".to_string(), crate::config::README_TEXT.as_bytes().to_vec());
        Ok(())
    }

    fn read_root_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().unwrap().root_files.get(name).cloned())
    }

    fn write_root_file_atomic(&self, name: &str, data: &[u8]) -> Result<()> {
        self.inner.lock().unwrap().root_files.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn remove_root_file(&self, name: &str) -> Result<()> {
        self.inner.lock().unwrap().root_files.remove(name);
        Ok(())
    }

    fn list_root_files(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .root_files
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn create_root_file_exclusive(&self, name: &str, data: &[u8]) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.root_files.contains_key(name) {
            return Ok(false);
        }
        inner.root_files.insert(name.to_string(), data.to_vec());
        Ok(true)
    }

    fn fsync_root_dir(&self) -> Result<()> {
        Ok(())
    }

    fn remove_all(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.created = false;
        inner.root_files.clear();
        inner.segments.clear();
        Ok(())
    }

    fn total_segment_bytes(&self) -> Result<u64> {
        Ok(self.inner.lock().unwrap().segments.values().map(|v| v.len() as u64).sum())
    }

    fn available_space(&self) -> Result<u64> {
        Ok(self.inner.lock().unwrap().available_space)
    }

    fn segments_per_dir(&self) -> u64 {
        self.inner.lock().unwrap().segments_per_dir
    }

    fn set_segments_per_dir(&self, n: u64) {
        self.inner.lock().unwrap().segments_per_dir = n;
    }

    fn open_segment_writer(&self, segment_id: u64) -> Result<Self::SegmentWriter> {
        self.inner.lock().unwrap().segments.entry(segment_id).or_default();
        Ok(MemSegmentWriter { inner: self.inner.clone(), segment_id })
    }

    fn open_segment_reader(&self, segment_id: u64) -> Result<Self::SegmentReader> {
        let inner = self.inner.lock().unwrap();
        let data = inner.segments.get(&segment_id).cloned().ok_or_else(|| {
            Error::ParentPathDoesNotExist { path: format!("memory segment {segment_id}") }
        })?;
        Ok(io::Cursor::new(data))
    }

    fn segment_len(&self, segment_id: u64) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .segments
            .get(&segment_id)
            .map(|v| v.len() as u64)
            .ok_or_else(|| Error::ParentPathDoesNotExist { path: format!("memory segment {segment_id}") })
    }

    fn segment_exists(&self, segment_id: u64) -> bool {
        self.inner.lock().unwrap().segments.contains_key(&segment_id)
    }

    fn remove_segment(&self, segment_id: u64) -> Result<()> {
        self.inner.lock().unwrap().segments.remove(&segment_id);
        Ok(())
    }

    fn list_segments(&self) -> Result<Vec<u64>> {
        Ok(self.inner.lock().unwrap().segments.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_writer_accumulates_bytes() {
        let repo = Memory::new();
        {
            let mut w = repo.open_segment_writer(1).unwrap();
            w.write_all(b"hello").unwrap();
            w.write_all(b"world").unwrap();
        }
        assert_eq!(repo.segment_len(1).unwrap(), 10);
        let mut r = repo.open_segment_reader(1).unwrap();
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"helloworld");
    }

    #[test]
    fn exclusive_create_only_succeeds_once() {
        let repo = Memory::new();
        assert!(repo.create_root_file_exclusive("lock.exclusive", b"a").unwrap());
        assert!(!repo.create_root_file_exclusive("lock.exclusive", b"b").unwrap());
    }
}
