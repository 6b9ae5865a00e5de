//! Checkpoint of the last block whose logs were fully published.
//!
//! Only the publisher writes the checkpoint, and only after every chunk up to
//! the new head was delivered. A restart therefore resumes at the first block
//! not yet seen by subscribers.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("failed to read checkpoint '{path}': {reason}")]
    Read { path: String, reason: String },

    #[error("failed to write checkpoint '{path}': {reason}")]
    Write { path: String, reason: String },

    #[error("failed to parse checkpoint: {0}")]
    Parse(String),
}

pub trait ProgressStore: Send + Sync {
    fn last_block(&self) -> Result<u64, ProgressError>;

    fn set_last_block(&self, block: u64) -> Result<(), ProgressError>;
}

#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    last_block: AtomicU64,
}

impl InMemoryProgressStore {
    pub fn new(start_block: u64) -> Self {
        Self {
            last_block: AtomicU64::new(start_block),
        }
    }
}

impl ProgressStore for InMemoryProgressStore {
    fn last_block(&self) -> Result<u64, ProgressError> {
        Ok(self.last_block.load(Ordering::SeqCst))
    }

    fn set_last_block(&self, block: u64) -> Result<(), ProgressError> {
        self.last_block.store(block, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Checkpoint {
    last_block: u64,
    updated_at: DateTime<Utc>,
}

/// JSON-file checkpoint, written with temp-file-then-rename.
#[derive(Debug)]
pub struct FileProgressStore {
    path: PathBuf,
    cached: Mutex<Option<u64>>,
}

impl FileProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn path_str(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    fn load(&self) -> Result<u64, ProgressError> {
        if !self.path.exists() {
            return Ok(0);
        }

        let contents = fs::read_to_string(&self.path).map_err(|e| ProgressError::Read {
            path: self.path_str(),
            reason: e.to_string(),
        })?;
        let checkpoint: Checkpoint =
            serde_json::from_str(&contents).map_err(|e| ProgressError::Parse(e.to_string()))?;
        Ok(checkpoint.last_block)
    }

    fn save(&self, block: u64) -> Result<(), ProgressError> {
        let write_err = |reason: String| ProgressError::Write {
            path: self.path_str(),
            reason,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| write_err(format!("failed to create parent directories: {e}")))?;
            }
        }

        let checkpoint = Checkpoint {
            last_block: block,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&checkpoint).map_err(|e| write_err(e.to_string()))?;

        let temp_path = PathBuf::from(format!("{}.tmp", self.path_str()));
        let mut file = fs::File::create(&temp_path).map_err(|e| write_err(e.to_string()))?;
        file.write_all(json.as_bytes())
            .map_err(|e| write_err(e.to_string()))?;
        file.sync_all()
            .map_err(|e| write_err(format!("failed to sync file: {e}")))?;

        fs::rename(&temp_path, &self.path).map_err(|e| write_err(e.to_string()))
    }
}

impl ProgressStore for FileProgressStore {
    fn last_block(&self) -> Result<u64, ProgressError> {
        let mut cached = self.cached.lock();
        if let Some(block) = *cached {
            return Ok(block);
        }
        let block = self.load()?;
        *cached = Some(block);
        Ok(block)
    }

    fn set_last_block(&self, block: u64) -> Result<(), ProgressError> {
        let mut cached = self.cached.lock();
        self.save(block)?;
        *cached = Some(block);
        Ok(())
    }
}
