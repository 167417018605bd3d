//! Runs one command line batch through the [`Dispatcher`] and renders its
//! events to the terminal.

use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use tracing::debug;

use crate::cli::{self, Commands};
use crate::compress::Codec;
use crate::config::Settings;
use crate::dispatcher::Dispatcher;
use crate::fsx;
use crate::job::{Direction, JobId};
use crate::progress::{channel_sink, Event};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// What happened to the jobs of a batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    pub fn succeeded(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

/// Public entry for running CLI logic.
pub fn run_cli_app(command: Commands) -> Result<BatchSummary, Box<dyn Error>> {
    let common = command.common().clone();
    let mut settings = match &common.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    if let Some(workers) = common.workers {
        settings.workers = workers;
    }
    if let Some(dir) = &common.output {
        settings.output_dir = Some(dir.clone());
    }
    if common.keep_intermediate {
        settings.job.remove_intermediate = false;
    }

    let direction = match &command {
        Commands::Encrypt {
            no_compress,
            codec,
            level,
            key_size,
            ..
        } => {
            if *no_compress {
                settings.job.compress = false;
            }
            match (codec, level) {
                (Some(codec), level) => settings.job.codec = codec.to_codec(*level),
                (None, Some(level)) => settings.job.codec = with_level(settings.job.codec, *level),
                (None, None) => {}
            }
            if let Some(bits) = key_size {
                settings.job.key_size = *bits;
            }
            Direction::Encrypt
        }
        Commands::Decrypt { .. } => Direction::Decrypt,
    };

    let inputs = fsx::expand_inputs(&common.inputs)?;
    if inputs.is_empty() {
        return Err("no input files found".into());
    }
    if let Some(dir) = &settings.output_dir {
        std::fs::create_dir_all(dir)?;
    }

    let mut config = settings.job.clone();
    config.passphrase = cli::resolve_password(common.password.clone())?;

    let (tx, rx) = unbounded();
    let dispatcher = Dispatcher::from_settings(&settings, channel_sink(tx))?;
    debug!(workers = dispatcher.workers(), files = inputs.len(), "starting batch");

    let output_dir = settings.output_dir.as_deref();
    let total = match direction {
        Direction::Encrypt => dispatcher.encrypt_batch(config, &inputs, output_dir)?,
        Direction::Decrypt => dispatcher.decrypt_batch(config, &inputs, output_dir)?,
    };

    let mut renderer = ProgressRenderer::new(common.progress, &inputs);
    let mut summary = BatchSummary::default();
    let mut finished = 0;
    while finished < total {
        let event = rx.recv()?;
        if event.is_terminal() {
            finished += 1;
        }
        match event {
            Event::Progress { id, label, percent, .. } => renderer.progress(id, label, percent),
            Event::Completed { output, .. } => {
                summary.completed += 1;
                println!("{}", output.display());
            }
            Event::Failed { id, path, message } => {
                summary.failed += 1;
                let shown = path.or_else(|| inputs.get(id).cloned()).unwrap_or_default();
                eprintln!("Error: {}: {}", shown.display(), message);
            }
            Event::Cancelled { id } => {
                summary.cancelled += 1;
                if let Some(input) = inputs.get(id) {
                    eprintln!("Cancelled: {}", input.display());
                }
            }
            Event::Status(text) => eprintln!("{text}"),
            Event::Error { message, .. } => eprintln!("Error: {message}"),
            Event::Busy(_) => {}
        }
    }

    dispatcher.wait_idle();
    Ok(summary)
}

fn with_level(codec: Codec, level: i32) -> Codec {
    match codec {
        Codec::Zstd { .. } => Codec::Zstd { level },
        Codec::Xz { .. } => Codec::Xz {
            preset: level.clamp(0, 9) as u32,
        },
    }
}

// --- utils for CLI progress -------------------------------------------------

struct ProgressRenderer<'a> {
    enabled: bool,
    inputs: &'a [PathBuf],
    last: HashMap<JobId, Instant>,
}

impl<'a> ProgressRenderer<'a> {
    fn new(enabled: bool, inputs: &'a [PathBuf]) -> Self {
        Self {
            enabled,
            inputs,
            last: HashMap::new(),
        }
    }

    fn progress(&mut self, id: JobId, label: &str, percent: u8) {
        if !self.enabled {
            return;
        }
        // Update every 100ms per file, but always show 100% completion
        let now = Instant::now();
        let due = percent >= 100
            || self
                .last
                .get(&id)
                .map_or(true, |at| now.duration_since(*at) >= PROGRESS_INTERVAL);
        if !due {
            return;
        }
        self.last.insert(id, now);

        let name = self
            .inputs
            .get(id)
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bar_width = 20;
        let filled = percent as usize * bar_width / 100;
        eprintln!(
            "[{}{}] {:>3}% {} {}",
            "█".repeat(filled),
            "░".repeat(bar_width - filled),
            percent,
            label,
            name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_applies_to_configured_codec() {
        assert_eq!(with_level(Codec::Zstd { level: 3 }, 19), Codec::Zstd { level: 19 });
        assert_eq!(with_level(Codec::Xz { preset: 6 }, 42), Codec::Xz { preset: 9 });
    }

    #[test]
    fn summary_success() {
        let mut summary = BatchSummary {
            completed: 2,
            ..BatchSummary::default()
        };
        assert!(summary.succeeded());
        summary.cancelled = 1;
        assert!(!summary.succeeded());
    }
}
