//! Stage planning and execution for a single job.
//!
//! An encrypt job is `[Compress] → Encrypt`; a decrypt job is
//! `Decrypt → [Decompress]`. Every stage reads the previous stage's committed
//! output, so each intermediate is a real file in the output directory.
//! Output names are resolved once, when the batch is built, and never
//! collide with existing files or with names reserved by sibling jobs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::compress::{Codec, Compressor, Decompressor};
use crate::coordination::Coordination;
use crate::crypto::{Opener, Sealer};
use crate::error::JobError;
use crate::fsx;
use crate::job::{Direction, Job, JobConfig};
use crate::progress::{JobProgress, Stage};
use crate::stream::{self, StageContext, Transform};

pub const SEALED_SUFFIX: &str = ".enc";
const FALLBACK_SUFFIX: &str = ".dec";

/// One planned transform: read `input`, commit `output`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub stage: Stage,
    pub input: PathBuf,
    pub output: PathBuf,
}

/// Output names already handed out in the current batch.
#[derive(Debug, Default)]
pub struct Reservations {
    taken: HashSet<PathBuf>,
}

impl Reservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a collision-free variant of `wanted`.
    pub fn reserve(&mut self, wanted: PathBuf) -> PathBuf {
        let path = fsx::unique_path(&wanted, |p| p.exists() || self.taken.contains(p));
        self.taken.insert(path.clone());
        path
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string())
}

fn strip_suffix_ci<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    let cut = name.len().checked_sub(suffix.len())?;
    if cut == 0 || !name.is_char_boundary(cut) {
        return None;
    }
    let (head, tail) = name.split_at(cut);
    tail.eq_ignore_ascii_case(suffix).then_some(head)
}

/// Plans the stages of one job and reserves all of its output names.
pub fn plan_stages(
    direction: Direction,
    input: &Path,
    output_dir: Option<&Path>,
    config: &JobConfig,
    reserved: &mut Reservations,
) -> Vec<StagePlan> {
    let dir = match output_dir {
        Some(dir) => dir.to_path_buf(),
        None => match input.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        },
    };
    let mut stages = Vec::with_capacity(2);
    let mut current = input.to_path_buf();

    match direction {
        Direction::Encrypt => {
            if config.compress {
                let packed = reserved.reserve(
                    dir.join(format!("{}{}", file_name(input), config.codec.suffix())),
                );
                stages.push(StagePlan {
                    stage: Stage::Compress,
                    input: current,
                    output: packed.clone(),
                });
                current = packed;
            }
            let sealed = reserved.reserve(dir.join(format!("{}{SEALED_SUFFIX}", file_name(&current))));
            stages.push(StagePlan {
                stage: Stage::Encrypt,
                input: current,
                output: sealed,
            });
        }
        Direction::Decrypt => {
            let name = file_name(input);
            let opened_name = match strip_suffix_ci(&name, SEALED_SUFFIX) {
                Some(stem) => stem.to_string(),
                None => format!("{name}{FALLBACK_SUFFIX}"),
            };
            let opened = reserved.reserve(dir.join(&opened_name));
            stages.push(StagePlan {
                stage: Stage::Decrypt,
                input: current,
                output: opened.clone(),
            });

            let opened_name = file_name(&opened);
            if let Some(codec) = Codec::from_suffix(&opened_name) {
                if let Some(stem) = strip_suffix_ci(&opened_name, codec.suffix()) {
                    let unpacked = reserved.reserve(dir.join(stem));
                    stages.push(StagePlan {
                        stage: Stage::Decompress,
                        input: opened,
                        output: unpacked,
                    });
                }
            }
        }
    }
    stages
}

fn make_transform(job: &Job, plan: &StagePlan) -> Result<Box<dyn Transform>, JobError> {
    let config = &job.config;
    let built: Result<Box<dyn Transform>, _> = match plan.stage {
        Stage::Compress => Compressor::new(config.codec).map(|t| Box::new(t) as Box<dyn Transform>),
        Stage::Encrypt => Sealer::new(job.suite, &config.kdf, &config.passphrase)
            .map(|t| Box::new(t) as Box<dyn Transform>),
        Stage::Decrypt => Ok(Box::new(Opener::new(&config.passphrase))),
        Stage::Decompress => Ok(Box::new(Decompressor::new())),
    };
    built.map_err(|source| JobError::Transform {
        path: plan.input.clone(),
        source,
    })
}

/// Runs every stage of `job` and returns the final output path.
///
/// Intermediates are deleted after success when the config asks for it, and
/// always after a failure or cancellation.
pub fn run_job(
    job: &Job,
    coordination: &Coordination,
    progress: &mut JobProgress,
    chunk_size: usize,
) -> Result<PathBuf, JobError> {
    let mut committed: Vec<PathBuf> = Vec::with_capacity(job.stages.len());
    let result = run_stages(job, coordination, progress, chunk_size, &mut committed);

    match &result {
        Ok(output) => {
            if job.config.remove_intermediate {
                for path in committed.iter().filter(|p| *p != output) {
                    fsx::remove_quietly(path);
                }
            }
        }
        Err(_) => {
            for path in &committed {
                fsx::remove_quietly(path);
            }
        }
    }
    result
}

fn run_stages(
    job: &Job,
    coordination: &Coordination,
    progress: &mut JobProgress,
    chunk_size: usize,
    committed: &mut Vec<PathBuf>,
) -> Result<PathBuf, JobError> {
    let mut last = None;
    for (index, plan) in job.stages.iter().enumerate() {
        coordination.pause_wait(job.id);
        if coordination.is_cancelled(job.id) {
            return Err(JobError::Cancelled);
        }

        debug!(
            job = job.id,
            stage = %plan.stage,
            input = %plan.input.display(),
            output = %plan.output.display(),
            "stage starting"
        );
        progress.begin_stage(index);
        let mut transform = make_transform(job, plan)?;
        let mut ctx = StageContext {
            stage: plan.stage,
            coordination,
            progress: &mut *progress,
            chunk_size,
        };
        let consumed = stream::transform_file(&mut ctx, &plan.input, &plan.output, &mut transform)?;
        committed.push(plan.output.clone());
        debug!(job = job.id, stage = %plan.stage, bytes = consumed, "stage committed");
        last = Some(plan.output.clone());
    }

    let output = last.ok_or_else(|| JobError::Internal("job has no stages".to_string()))?;
    info!(job = job.id, output = %output.display(), "job completed");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn config(compress: bool) -> JobConfig {
        JobConfig {
            compress,
            ..JobConfig::with_passphrase("pw")
        }
    }

    #[test]
    fn encrypt_plan_with_compression() {
        let mut reserved = Reservations::new();
        let stages = plan_stages(
            Direction::Encrypt,
            Path::new("/data/report.txt"),
            Some(Path::new("/out")),
            &config(true),
            &mut reserved,
        );
        assert_eq!(
            stages,
            vec![
                StagePlan {
                    stage: Stage::Compress,
                    input: PathBuf::from("/data/report.txt"),
                    output: PathBuf::from("/out/report.txt.zst"),
                },
                StagePlan {
                    stage: Stage::Encrypt,
                    input: PathBuf::from("/out/report.txt.zst"),
                    output: PathBuf::from("/out/report.txt.zst.enc"),
                },
            ]
        );
    }

    #[test]
    fn encrypt_plan_without_compression_defaults_to_parent_dir() {
        let mut reserved = Reservations::new();
        let stages = plan_stages(
            Direction::Encrypt,
            Path::new("/data/report.txt"),
            None,
            &config(false),
            &mut reserved,
        );
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].output, PathBuf::from("/data/report.txt.enc"));
    }

    #[test]
    fn decrypt_plan_strips_suffixes() {
        let mut reserved = Reservations::new();
        let stages = plan_stages(
            Direction::Decrypt,
            Path::new("/in/report.txt.xz.enc"),
            Some(Path::new("/out")),
            &config(true),
            &mut reserved,
        );
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].output, PathBuf::from("/out/report.txt.xz"));
        assert_eq!(stages[1].stage, Stage::Decompress);
        assert_eq!(stages[1].output, PathBuf::from("/out/report.txt"));
    }

    #[test]
    fn decrypt_plan_without_enc_suffix_appends_dec() {
        let mut reserved = Reservations::new();
        let stages = plan_stages(
            Direction::Decrypt,
            Path::new("/in/blob"),
            Some(Path::new("/out")),
            &config(true),
            &mut reserved,
        );
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].output, PathBuf::from("/out/blob.dec"));
    }

    #[test]
    fn same_names_in_one_batch_get_copies() {
        let mut reserved = Reservations::new();
        let cfg = config(false);
        let a = plan_stages(Direction::Encrypt, Path::new("/a/x.txt"), Some(Path::new("/out")), &cfg, &mut reserved);
        let b = plan_stages(Direction::Encrypt, Path::new("/b/x.txt"), Some(Path::new("/out")), &cfg, &mut reserved);
        assert_eq!(a[0].output, PathBuf::from("/out/x.txt.enc"));
        assert_eq!(b[0].output, PathBuf::from("/out/x.txt copy.enc"));
    }

    #[test]
    fn existing_output_on_disk_is_avoided() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("x.txt"), b"original").unwrap();
        let mut reserved = Reservations::new();
        let stages = plan_stages(
            Direction::Decrypt,
            &dir.path().join("x.txt.enc"),
            None,
            &config(true),
            &mut reserved,
        );
        assert_eq!(stages[0].output, dir.path().join("x copy.txt"));
    }

    #[test]
    fn suffix_stripping_is_case_insensitive() {
        assert_eq!(strip_suffix_ci("a.ENC", ".enc"), Some("a"));
        assert_eq!(strip_suffix_ci(".enc", ".enc"), None);
        assert_eq!(strip_suffix_ci("a.txt", ".enc"), None);
    }
}
