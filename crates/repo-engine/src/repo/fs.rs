use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::config::Layout;
use crate::error::{Error, Result};

use super::{Repo, SegmentWriter};

/// Real-filesystem backend.
#[derive(Clone)]
pub struct Fs {
    inner: Arc<FsInner>,
}

struct FsInner {
    layout: Layout,
    segments_per_dir: AtomicU64,
}

impl Fs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(FsInner {
                layout: Layout::new(root),
                segments_per_dir: AtomicU64::new(crate::config::DEFAULT_SEGMENTS_PER_DIR),
            }),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    fn fsync_dir(path: &std::path::Path) -> Result<()> {
        let dir = File::open(path)?;
        dir.sync_all()?;
        Ok(())
    }

    fn io_err_to_repo_err(path: &std::path::Path, e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::PermissionDenied => Error::PathPermissionDenied { path: path.display().to_string() },
            io::ErrorKind::NotFound => Error::ParentPathDoesNotExist { path: path.display().to_string() },
            _ => Error::Io(e),
        }
    }
}

pub struct FsSegmentWriter {
    file: File,
    path: PathBuf,
}

impl Write for FsSegmentWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl SegmentWriter for FsSegmentWriter {
    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn sync_all(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.file.sync_all()?;
        let _ = &self.path;
        Ok(())
    }
}

impl Repo for Fs {
    type SegmentWriter = FsSegmentWriter;
    type SegmentReader = File;

    fn exists(&self) -> bool {
        self.inner.layout.config().is_file()
    }

    fn create_root(&self) -> Result<()> {
        let root = self.inner.layout.root();
        if root.exists() && fs::read_dir(root)?.next().is_some() {
            return Err(Error::PathAlreadyExists { path: root.display().to_string() });
        }
        fs::create_dir_all(root).map_err(|e| Fs::io_err_to_repo_err(root, e))?;
        fs::create_dir_all(self.inner.layout.data_dir())?;
        fs::write(self.inner.layout.readme(), crate::config::README_TEXT)?;
        Fs::fsync_dir(root)?;
        Ok(())
    }

    fn read_root_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.inner.layout.root().join(name)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_root_file_atomic(&self, name: &str, data: &[u8]) -> Result<()> {
        let root = self.inner.layout.root();
        let mut tmp = NamedTempFile::new_in(root)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(root.join(name)).map_err(|e| e.error)?;
        Fs::fsync_dir(root)?;
        Ok(())
    }

    fn remove_root_file(&self, name: &str) -> Result<()> {
        let path = self.inner.layout.root().join(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_root_files(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.inner.layout.root())? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }

    fn fsync_root_dir(&self) -> Result<()> {
        Fs::fsync_dir(self.inner.layout.root())
    }

    fn remove_all(&self) -> Result<()> {
        let root = self.inner.layout.root();
        if root.exists() {
            fs::remove_dir_all(root)?;
        }
        Ok(())
    }

    fn total_segment_bytes(&self) -> Result<u64> {
        let mut total = 0u64;
        for id in self.list_segments()? {
            total += self.segment_len(id)?;
        }
        Ok(total)
    }

    fn available_space(&self) -> Result<u64> {
        fs2::available_space(self.inner.layout.root()).map_err(Error::from)
    }

    fn segments_per_dir(&self) -> u64 {
        self.inner.segments_per_dir.load(Ordering::Relaxed)
    }

    fn set_segments_per_dir(&self, n: u64) {
        self.inner.segments_per_dir.store(n, Ordering::Relaxed);
    }

    fn open_segment_writer(&self, segment_id: u64) -> Result<Self::SegmentWriter> {
        let shard = self.inner.layout.segment_shard_dir(segment_id, self.segments_per_dir());
        fs::create_dir_all(&shard)?;
        let path = self.inner.layout.segment_path(segment_id, self.segments_per_dir());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .map_err(|e| Fs::io_err_to_repo_err(&path, e))?;
        Ok(FsSegmentWriter { file, path })
    }

    fn open_segment_reader(&self, segment_id: u64) -> Result<Self::SegmentReader> {
        let path = self.inner.layout.segment_path(segment_id, self.segments_per_dir());
        File::open(&path).map_err(|e| Fs::io_err_to_repo_err(&path, e))
    }

    fn segment_len(&self, segment_id: u64) -> Result<u64> {
        let path = self.inner.layout.segment_path(segment_id, self.segments_per_dir());
        Ok(fs::metadata(path)?.len())
    }

    fn segment_exists(&self, segment_id: u64) -> bool {
        self.inner.layout.segment_path(segment_id, self.segments_per_dir()).is_file()
    }

    fn remove_segment(&self, segment_id: u64) -> Result<()> {
        let shard = self.inner.layout.segment_shard_dir(segment_id, self.segments_per_dir());
        let path = shard.join(segment_id.to_string());
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if shard.is_dir() {
            Fs::fsync_dir(&shard)?;
        }
        Ok(())
    }

    fn list_segments(&self) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        let data_dir = self.inner.layout.data_dir();
        if !data_dir.is_dir() {
            return Ok(out);
        }
        for shard_entry in fs::read_dir(&data_dir)? {
            let shard_entry = shard_entry?;
            if !shard_entry.file_type()?.is_dir() {
                continue;
            }
            for seg_entry in fs::read_dir(shard_entry.path())? {
                let seg_entry = seg_entry?;
                if let Some(name) = seg_entry.file_name().to_str() {
                    if let Ok(id) = name.parse::<u64>() {
                        out.push(id);
                    }
                }
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    fn fsync_segment_dir(&self, segment_id: u64) -> Result<()> {
        let shard = self.inner.layout.segment_shard_dir(segment_id, self.segments_per_dir());
        Fs::fsync_dir(&shard)
    }

    fn create_root_file_exclusive(&self, name: &str, data: &[u8]) -> Result<bool> {
        let path = self.inner.layout.root().join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(data)?;
                file.sync_all()?;
                Fs::fsync_dir(self.inner.layout.root())?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
