//! Job definitions: the configuration record, job identity and lifecycle.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::compress::Codec;
use crate::crypto::{CipherSuite, Kdf};
use crate::error::ConfigError;
use crate::pipeline::{plan_stages, Reservations, StagePlan};

/// Index of a job within its batch, `0..N`.
pub type JobId = usize;

/// Which way a batch runs the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Optional compress stage, then encrypt.
    Encrypt,
    /// Decrypt, then optional decompress stage.
    Decrypt,
}

/// Lifecycle of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable per-batch configuration shared by every job of the batch.
///
/// The passphrase is never serialized and is redacted from `Debug` output.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    #[serde(skip)]
    pub passphrase: String,
    /// Cipher family name, e.g. `"AES"`.
    pub cipher: String,
    /// Key size in bits.
    pub key_size: u32,
    /// Mode of operation, e.g. `"GCM"`.
    pub mode: String,
    /// Run the compress stage before encrypting.
    pub compress: bool,
    pub codec: Codec,
    /// Delete intermediate files once the job has succeeded.
    pub remove_intermediate: bool,
    pub kdf: Kdf,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            passphrase: String::new(),
            cipher: "AES".to_string(),
            key_size: 256,
            mode: "GCM".to_string(),
            compress: true,
            codec: Codec::default(),
            remove_intermediate: true,
            kdf: Kdf::default(),
        }
    }
}

impl JobConfig {
    pub fn with_passphrase(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
            ..Self::default()
        }
    }

    /// Resolves the cipher triple to a concrete suite.
    pub fn cipher_suite(&self) -> Result<CipherSuite, ConfigError> {
        CipherSuite::resolve(&self.cipher, self.key_size, &self.mode)
    }

    /// Checks everything a batch needs before any job is queued.
    pub fn validate(&self) -> Result<CipherSuite, ConfigError> {
        if self.passphrase.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "passphrase",
                reason: "must not be empty".to_string(),
            });
        }
        self.codec.validate()?;
        self.kdf.validate()?;
        self.cipher_suite()
    }
}

impl fmt::Debug for JobConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobConfig")
            .field("passphrase", &"<redacted>")
            .field("cipher", &self.cipher)
            .field("key_size", &self.key_size)
            .field("mode", &self.mode)
            .field("compress", &self.compress)
            .field("codec", &self.codec)
            .field("remove_intermediate", &self.remove_intermediate)
            .field("kdf", &self.kdf)
            .finish()
    }
}

/// One file's trip through the pipeline. Owned by the task that runs it.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub direction: Direction,
    pub input: PathBuf,
    /// Final output path, reserved when the batch was built.
    pub output: PathBuf,
    pub stages: Vec<StagePlan>,
    pub config: Arc<JobConfig>,
    pub suite: CipherSuite,
}

impl Job {
    /// Plans the stages for `input` and reserves their output names.
    pub fn new(
        id: JobId,
        direction: Direction,
        input: PathBuf,
        output_dir: Option<&Path>,
        config: Arc<JobConfig>,
        suite: CipherSuite,
        reserved: &mut Reservations,
    ) -> Self {
        let stages = plan_stages(direction, &input, output_dir, &config, reserved);
        let output = stages
            .last()
            .map(|plan| plan.output.clone())
            .unwrap_or_else(|| input.clone());
        Self {
            id,
            direction,
            input,
            output,
            stages,
            config,
            suite,
        }
    }
}
