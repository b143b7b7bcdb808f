//! Listener checkpoints
//!
//! The checkpoint records the last commit sequence number whose batch the
//! engine has fully applied. The listener resumes after it.
//!
//! File format (`FileCheckpoint`):
//! - JSON object: `seq`, `updated_at` (RFC3339), `format_version`, `checksum`
//! - `checksum` is the CRC32 of `"<format_version>:<seq>"`
//! - Written to a temporary sibling, fsynced, renamed over the target,
//!   then the parent directory is fsynced
//!
//! A file that fails to parse or verify is an error, never silently reset.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::errors::{FeedError, FeedResult};
use crate::store::CommitSeq;

const FORMAT_VERSION: u8 = 1;

/// Durable storage for the listener's resume point
pub trait CheckpointStore: Send + Sync {
    /// Last persisted sequence number, if any
    fn load(&self) -> FeedResult<Option<CommitSeq>>;

    /// Persist `seq`
    fn store(&self, seq: CommitSeq) -> FeedResult<()>;
}

/// In-memory checkpoint; clones share the same value
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpoint {
    seq: Arc<Mutex<Option<CommitSeq>>>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(seq: CommitSeq) -> Self {
        Self {
            seq: Arc::new(Mutex::new(Some(seq))),
        }
    }

    pub fn get(&self) -> Option<CommitSeq> {
        *self.seq.lock()
    }
}

impl CheckpointStore for MemoryCheckpoint {
    fn load(&self) -> FeedResult<Option<CommitSeq>> {
        Ok(self.get())
    }

    fn store(&self, seq: CommitSeq) -> FeedResult<()> {
        *self.seq.lock() = Some(seq);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct CheckpointRecord {
    seq: CommitSeq,
    updated_at: String,
    format_version: u8,
    checksum: u32,
}

impl CheckpointRecord {
    fn new(seq: CommitSeq) -> Self {
        Self {
            seq,
            updated_at: chrono::Utc::now().to_rfc3339(),
            format_version: FORMAT_VERSION,
            checksum: checksum(FORMAT_VERSION, seq),
        }
    }

    fn verify(&self) -> Result<(), String> {
        if self.format_version != FORMAT_VERSION {
            return Err(format!("unsupported format version {}", self.format_version));
        }
        let expected = checksum(self.format_version, self.seq);
        if self.checksum != expected {
            return Err(format!(
                "checksum mismatch: stored {:08x}, computed {:08x}",
                self.checksum, expected
            ));
        }
        Ok(())
    }
}

fn checksum(format_version: u8, seq: CommitSeq) -> u32 {
    crc32fast::hash(format!("{}:{}", format_version, seq.value()).as_bytes())
}

/// Checkpoint persisted as a small JSON file
#[derive(Debug, Clone)]
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CheckpointStore for FileCheckpoint {
    fn load(&self) -> FeedResult<Option<CommitSeq>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FeedError::checkpoint(&self.path, format!("read failed: {}", e))),
        };

        let record: CheckpointRecord = serde_json::from_str(&text)
            .map_err(|e| FeedError::corrupted(&self.path, format!("invalid JSON: {}", e)))?;
        record
            .verify()
            .map_err(|reason| FeedError::corrupted(&self.path, reason))?;
        Ok(Some(record.seq))
    }

    fn store(&self, seq: CommitSeq) -> FeedResult<()> {
        let json = serde_json::to_string_pretty(&CheckpointRecord::new(seq))
            .map_err(|e| FeedError::checkpoint(&self.path, format!("serialize failed: {}", e)))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    FeedError::checkpoint(&self.path, format!("create directory failed: {}", e))
                })?;
            }
        }

        let temp = self.temp_path();
        {
            let mut file = File::create(&temp)
                .map_err(|e| FeedError::checkpoint(&self.path, format!("create failed: {}", e)))?;
            file.write_all(json.as_bytes())
                .map_err(|e| FeedError::checkpoint(&self.path, format!("write failed: {}", e)))?;
            // fsync is mandatory
            file.sync_all()
                .map_err(|e| FeedError::checkpoint(&self.path, format!("fsync failed: {}", e)))?;
        }

        fs::rename(&temp, &self.path)
            .map_err(|e| FeedError::checkpoint(&self.path, format!("rename failed: {}", e)))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let dir = OpenOptions::new().read(true).open(parent).map_err(|e| {
                FeedError::checkpoint(&self.path, format!("open directory failed: {}", e))
            })?;
            dir.sync_all().map_err(|e| {
                FeedError::checkpoint(&self.path, format!("directory fsync failed: {}", e))
            })?;
        }

        Ok(())
    }
}
