//! Persistent settings: worker count, chunk size and default job options.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::job::JobConfig;
use crate::stream::DEFAULT_CHUNK_SIZE;

/// Settings file contents. Every field is optional in the JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Worker threads. [0 = one per CPU core]
    pub workers: usize,
    /// Bytes read per chunk.
    pub chunk_size: usize,
    /// Where outputs go when the command line names no directory.
    pub output_dir: Option<PathBuf>,
    /// Defaults for every batch; the passphrase is never read from here.
    pub job: JobConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            output_dir: None,
            job: JobConfig::default(),
        }
    }
}

impl Settings {
    /// Reads and validates a JSON settings file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or holds
    /// out-of-range values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let settings: Settings = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "chunk_size",
                reason: "must be at least 1 byte".to_string(),
            });
        }
        self.job.codec.validate()?;
        self.job.kdf.validate()
    }

    /// Effective worker count.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }
}
