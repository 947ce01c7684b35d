//! Storage backend abstraction.
//!
//! Everything above this module talks to a repository through the [`Repo`]
//! trait rather than the filesystem directly, so the transaction manager,
//! segment I/O, and recovery logic can all be exercised against a fast
//! in-memory backend ([`mem::Memory`]) in unit tests while production code
//! uses [`fs::Fs`].

pub mod fs;
pub mod mem;

use std::io::{Read, Write};

use crate::error::Result;

/// A segment writer: append-only, but readable back so `write_commit` can
/// be followed by a read-back sanity check if a caller wants one.
pub trait SegmentWriter: Write {
    /// Number of bytes written so far (including any content that existed
    /// before this writer was opened, if resuming).
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn sync_all(&mut self) -> Result<()>;

    /// Truncate the underlying file to `len` bytes and fsync it. Used by
    /// rollback to discard uncommitted trailing entries.
    fn truncate(&mut self, len: u64) -> Result<()>;
}

pub trait SegmentReader: Read {}
impl<T: Read> SegmentReader for T {}

/// Abstracts over the on-disk repository directory so the engine can run
/// against a real filesystem or an in-memory double.
pub trait Repo: Clone + Send + Sync + 'static {
    type SegmentWriter: SegmentWriter;
    type SegmentReader: SegmentReader;

    /// True if a repository already exists at this location (root dir with
    /// at least a `config` file present).
    fn exists(&self) -> bool;

    /// Create the root directory and any fixed files (`README`). Fails if
    /// the directory is non-empty already.
    fn create_root(&self) -> Result<()>;

    fn read_root_file(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Atomically write a root-level file: write-to-temp + fsync + rename +
    /// directory fsync.
    fn write_root_file_atomic(&self, name: &str, data: &[u8]) -> Result<()>;

    fn remove_root_file(&self, name: &str) -> Result<()>;

    /// Create a root-level file only if it does not already exist, returning
    /// `false` without writing anything if it does. Used by the lock
    /// manager for exclusive-create semantics.
    fn create_root_file_exclusive(&self, name: &str, data: &[u8]) -> Result<bool>;

    /// List root-level file names with the given prefix (e.g. `"index."`).
    fn list_root_files(&self, prefix: &str) -> Result<Vec<String>>;

    fn fsync_root_dir(&self) -> Result<()>;

    /// Remove the whole repository directory tree. Used by `destroy()`.
    fn remove_all(&self) -> Result<()>;

    /// Bytes currently occupied by all segment files, for free-space and
    /// quota accounting.
    fn total_segment_bytes(&self) -> Result<u64>;

    /// Bytes of free space available on the filesystem backing the repo.
    fn available_space(&self) -> Result<u64>;

    fn segments_per_dir(&self) -> u64;
    fn set_segments_per_dir(&self, n: u64);

    /// Open (creating if necessary) a writer positioned at the end of
    /// `segment_id`'s file, creating parent shard directories as needed.
    fn open_segment_writer(&self, segment_id: u64) -> Result<Self::SegmentWriter>;

    fn open_segment_reader(&self, segment_id: u64) -> Result<Self::SegmentReader>;

    fn segment_len(&self, segment_id: u64) -> Result<u64>;

    fn segment_exists(&self, segment_id: u64) -> bool;

    /// Unlink a segment file, fsyncing its parent shard directory
    /// afterwards.
    fn remove_segment(&self, segment_id: u64) -> Result<()>;

    /// Fsync the directory holding `segment_id`'s file (step 2 of the
    /// commit protocol: fsync the segment file, then its parent directory).
    fn fsync_segment_dir(&self, segment_id: u64) -> Result<()>;

    /// All segment ids discovered on disk, in ascending order.
    fn list_segments(&self) -> Result<Vec<u64>>;
}
