//! Repository configuration and directory layout.
//!
//! Nothing in here does I/O beyond the `config`/`README` parsing helpers;
//! path arithmetic is pure so every other component asks [`Layout`] for a
//! path rather than formatting one itself.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Fixed text identifying a directory as belonging to this engine.
pub const README_TEXT: &str =
    "This is a repository for a content-addressed, deduplicating backup tool.\n\
     Do not delete/modify files in this directory unless you know what you are doing.\n";

pub const CONFIG_VERSION: u32 = 1;

pub const DEFAULT_SEGMENTS_PER_DIR: u64 = 1000;
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_ADDITIONAL_FREE_SPACE: u64 = 0;
pub const DEFAULT_MAX_DATA_SIZE: u64 = 20 * 1024 * 1024;
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.1;

/// Parsed `config` file content plus the knobs that never change after
/// `create()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoConfig {
    pub version: u32,
    pub id: [u8; 32],
    pub segments_per_dir: u64,
    pub max_segment_size: u64,
    pub append_only: bool,
    pub additional_free_space: u64,
    pub storage_quota: Option<u64>,
    pub max_data_size: u64,
}

impl RepoConfig {
    pub fn new(id: [u8; 32]) -> Self {
        Self {
            version: CONFIG_VERSION,
            id,
            segments_per_dir: DEFAULT_SEGMENTS_PER_DIR,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            append_only: false,
            additional_free_space: DEFAULT_ADDITIONAL_FREE_SPACE,
            storage_quota: None,
            max_data_size: DEFAULT_MAX_DATA_SIZE,
        }
    }

    /// Serialize as the `key=value` text format stored at `<repo>/config`.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("version={}\n", self.version));
        out.push_str(&format!("id={}\n", hex::encode(self.id)));
        out.push_str(&format!("segments_per_dir={}\n", self.segments_per_dir));
        out.push_str(&format!("max_segment_size={}\n", self.max_segment_size));
        out.push_str(&format!("append_only={}\n", self.append_only));
        out.push_str(&format!("additional_free_space={}\n", self.additional_free_space));
        if let Some(q) = self.storage_quota {
            out.push_str(&format!("storage_quota={q}\n"));
        }
        out.push_str(&format!("max_data_size={}\n", self.max_data_size));
        out
    }

    /// Parse the `key=value` text format. Unknown keys are ignored for
    /// forward compatibility; a missing required key or unparseable value
    /// is `Error::InvalidRepositoryConfig`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut kv = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (k, v) = line.split_once('=').ok_or_else(|| Error::InvalidRepositoryConfig {
                reason: format!("malformed config line: {line:?}"),
            })?;
            kv.insert(k.trim().to_string(), v.trim().to_string());
        }

        let get = |key: &str| -> Result<String> {
            kv.get(key).cloned().ok_or_else(|| Error::InvalidRepositoryConfig {
                reason: format!("missing required config key: {key}"),
            })
        };
        let parse_u64 = |key: &str, s: &str| -> Result<u64> {
            s.parse().map_err(|_| Error::InvalidRepositoryConfig {
                reason: format!("invalid value for {key}: {s:?}"),
            })
        };

        let version: u32 = get("version")?.parse().map_err(|_| Error::InvalidRepositoryConfig {
            reason: "invalid version".into(),
        })?;
        if version != CONFIG_VERSION {
            return Err(Error::InvalidRepositoryConfig {
                reason: format!("unsupported repository config version {version}"),
            });
        }

        let id_hex = get("id")?;
        let id_bytes = hex::decode(&id_hex).map_err(|_| Error::InvalidRepositoryConfig {
            reason: format!("invalid id hex: {id_hex:?}"),
        })?;
        let id: [u8; 32] = id_bytes.as_slice().try_into().map_err(|_| Error::InvalidRepositoryConfig {
            reason: "repository id must be 32 bytes".into(),
        })?;

        let segments_per_dir = parse_u64("segments_per_dir", &get("segments_per_dir")?)?;
        let max_segment_size = parse_u64("max_segment_size", &get("max_segment_size")?)?;
        let append_only: bool = get("append_only")?.parse().map_err(|_| Error::InvalidRepositoryConfig {
            reason: "invalid append_only".into(),
        })?;
        let additional_free_space =
            parse_u64("additional_free_space", &get("additional_free_space")?)?;
        let storage_quota = match kv.get("storage_quota") {
            Some(s) => Some(parse_u64("storage_quota", s)?),
            None => None,
        };
        let max_data_size = match kv.get("max_data_size") {
            Some(s) => parse_u64("max_data_size", s)?,
            None => DEFAULT_MAX_DATA_SIZE,
        };

        Ok(Self {
            version,
            id,
            segments_per_dir,
            max_segment_size,
            append_only,
            additional_free_space,
            storage_quota,
            max_data_size,
        })
    }
}

/// Pure path arithmetic for a repository rooted at `root`. Holds no file
/// descriptors and performs no I/O.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn readme(&self) -> PathBuf {
        self.root.join("README")
    }

    pub fn nonce(&self) -> PathBuf {
        self.root.join("nonce")
    }

    pub fn keyfile(&self) -> PathBuf {
        self.root.join("keyfile")
    }

    pub fn lock_exclusive(&self) -> PathBuf {
        self.root.join("lock.exclusive")
    }

    pub fn lock_shared(&self, holder_id: &str) -> PathBuf {
        self.root.join(format!("lock.{holder_id}"))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn segment_shard_dir(&self, segment_id: u64, segments_per_dir: u64) -> PathBuf {
        let n = segment_id / segments_per_dir.max(1);
        self.data_dir().join(n.to_string())
    }

    pub fn segment_path(&self, segment_id: u64, segments_per_dir: u64) -> PathBuf {
        self.segment_shard_dir(segment_id, segments_per_dir).join(segment_id.to_string())
    }

    pub fn index(&self, tid: u64) -> PathBuf {
        self.root.join(format!("index.{tid}"))
    }

    pub fn index_signature(&self, tid: u64) -> PathBuf {
        self.root.join(format!("index.{tid}.signature"))
    }

    pub fn hints(&self, tid: u64) -> PathBuf {
        self.root.join(format!("hints.{tid}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips() {
        let cfg = RepoConfig::new([9; 32]);
        let parsed = RepoConfig::parse(&cfg.serialize()).unwrap();
        assert_eq!(cfg, parsed);
    }

    #[test]
    fn rejects_missing_key() {
        let err = RepoConfig::parse("version=1\n").unwrap_err();
        assert!(matches!(err, Error::InvalidRepositoryConfig { .. }));
    }

    #[test]
    fn rejects_bad_version() {
        let mut cfg = RepoConfig::new([1; 32]).serialize();
        cfg = cfg.replace("version=1", "version=99");
        assert!(RepoConfig::parse(&cfg).is_err());
    }

    #[test]
    fn shards_by_segments_per_dir() {
        let layout = Layout::new("/tmp/repo");
        assert_eq!(layout.segment_shard_dir(0, 1000), PathBuf::from("/tmp/repo/data/0"));
        assert_eq!(layout.segment_shard_dir(1000, 1000), PathBuf::from("/tmp/repo/data/1"));
        assert_eq!(layout.segment_shard_dir(1999, 1000), PathBuf::from("/tmp/repo/data/1"));
    }
}
