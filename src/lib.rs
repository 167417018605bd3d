//! # blitzseal core library
//!
//! Parallel, cancellable batch encryption of files with optional
//! compression. Each input file becomes one job; jobs run on a fixed worker
//! pool and stream their data chunk by chunk through one or two stages
//! (compress → encrypt, or decrypt → decompress). Between chunks every job
//! honours the session's pause, per-job stop and global abort signals.
//!
//! ## Key Modules
//!
//! - [`dispatcher`]: batch submission and the pause / stop / abort controls.
//! - [`coordination`]: the shared signalling state consulted by every job.
//! - [`workers`]: the fixed-size FIFO worker pool.
//! - [`stream`]: the chunk loop with staging-file commit.
//! - [`compress`] and [`crypto`]: the zstd / xz and AES-GCM stage transforms.
//! - [`progress`]: events delivered to the front-end.
//!
//! ## Examples
//!
//! ```no_run
//! use std::path::PathBuf;
//! use blitzseal::{channel_sink, Dispatcher, Event, JobConfig};
//!
//! let (tx, rx) = crossbeam_channel::unbounded();
//! let dispatcher = Dispatcher::new(4, channel_sink(tx)).unwrap();
//! let inputs = vec![PathBuf::from("report.pdf")];
//! let jobs = dispatcher
//!     .encrypt_batch(JobConfig::with_passphrase("secret"), &inputs, None)
//!     .unwrap();
//! for event in rx.iter().filter(Event::is_terminal).take(jobs) {
//!     println!("{event:?}");
//! }
//! ```

pub mod cli;
pub mod cli_runner;
pub mod compress;
pub mod config;
pub mod coordination;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod fsx;
pub mod job;
pub mod pipeline;
pub mod progress;
pub mod stream;
pub mod workers;

pub use config::Settings;
pub use coordination::Coordination;
pub use dispatcher::Dispatcher;
pub use error::{ConfigError, DispatchError, JobError, TransformError};
pub use job::{Direction, JobConfig, JobId, JobStatus};
pub use progress::{channel_sink, Event, EventCallback, Stage};
