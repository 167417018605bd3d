//! Error types for every layer of the pipeline.
//!
//! Errors are job-local: a [`JobError`] describes why one file did not make it
//! through its stages and never affects sibling jobs. [`DispatchError`] is the
//! only error a batch submission itself can return.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure reported by a stage transform (codec or cipher step).
#[derive(Debug, Error)]
pub enum TransformError {
    /// Key check or authentication tag mismatch.
    #[error("authentication failed")]
    Authentication,

    /// The stream does not start with a recognised header or magic.
    #[error("unsupported format: {0}")]
    Format(String),

    /// The codec rejected the data part-way through.
    #[error("corrupted stream: {0}")]
    Corrupt(String),

    /// Passphrase key derivation failed (bad parameters).
    #[error("key derivation failed: {0}")]
    Kdf(String),

    /// The encoder itself failed (allocation, bad parameters).
    #[error("codec error: {0}")]
    Codec(String),
}

/// Why a single job did not complete.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job was stopped individually or the whole session was aborted.
    #[error("cancelled")]
    Cancelled,

    /// The input could not be opened or inspected before streaming started.
    #[error("can't read '{}': {source}", path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The destination (staging file or final path) could not be created or committed.
    #[error("can't write '{}': {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A read or write failed while the chunk loop was running.
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The destination accepted fewer bytes than the transform produced.
    #[error("short write on '{}': {written} of {expected} bytes", path.display())]
    ShortWrite {
        path: PathBuf,
        expected: usize,
        written: usize,
    },

    /// The codec or cipher rejected the data.
    #[error("{source} ('{}')", path.display())]
    Transform {
        path: PathBuf,
        #[source]
        source: TransformError,
    },

    /// Broken invariant inside the pipeline (e.g. a panicking stage).
    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Returns true when the job ended because of user action rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }

    /// The file the error is attributed to, if any.
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            JobError::Input { path, .. }
            | JobError::Output { path, .. }
            | JobError::Io { path, .. }
            | JobError::ShortWrite { path, .. }
            | JobError::Transform { path, .. } => Some(path),
            JobError::Cancelled | JobError::Internal(_) => None,
        }
    }

    /// Short text suitable for a per-row status in a user interface.
    pub fn user_message(&self) -> &'static str {
        match self {
            JobError::Cancelled => "Cancelled",
            JobError::Input { .. } => "Can't read file",
            JobError::Output { .. } => "Can't write output file",
            JobError::Io { .. } | JobError::ShortWrite { .. } => "I/O error while processing file",
            JobError::Transform { source, .. } => match source {
                TransformError::Authentication => "Wrong password or corrupted file",
                TransformError::Format(_) => "Unsupported or unrecognised file format",
                TransformError::Corrupt(_) => "File is corrupted",
                TransformError::Kdf(_) => "Key derivation failed",
                TransformError::Codec(_) => "Compression failed",
            },
            JobError::Internal(_) => "Unexpected error",
        }
    }
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported cipher {cipher}-{key_size} in {mode} mode")]
    UnsupportedCipher {
        cipher: String,
        key_size: u32,
        mode: String,
    },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("can't read config '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("can't parse config '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Reasons a batch submission is refused.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Another batch is being submitted or its jobs are still running.
    #[error("dispatcher is busy")]
    Busy,

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Worker threads could not be spawned.
    #[error("worker pool unavailable: {0}")]
    Pool(#[from] io::Error),
}
