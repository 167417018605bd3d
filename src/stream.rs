//! Chunked read → transform → write loop shared by every pipeline stage.
//!
//! A stage never writes its final path directly. Output goes to a hidden
//! staging file next to the destination, which is renamed into place only
//! after the transform has been finalized and flushed. Any failure or
//! cancellation drops the staging file, so a half-written output can never
//! appear under the final name.
//!
//! Between chunks the loop consults the [`Coordination`] state: it parks in
//! [`Coordination::pause_wait`] while the session is paused and bails out with
//! [`JobError::Cancelled`] once the job is stopped or the session aborted.

use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::{Builder, NamedTempFile};
use tracing::trace;

use crate::coordination::Coordination;
use crate::error::{JobError, TransformError};
use crate::progress::{percent_of, JobProgress, Stage};

/// Default read size per iteration. Only affects throughput, never output bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB

const WRITE_BUFFER: usize = 4 * 1024 * 1024; // 4 MiB

/// A streaming codec or cipher step.
///
/// Output is appended to `out`; an implementation may produce more or fewer
/// bytes than it was given, and may hold data back until [`Transform::finish`].
pub trait Transform: Send {
    /// Emits any leading bytes (headers) before the first chunk.
    fn begin(&mut self, _out: &mut Vec<u8>) -> Result<(), TransformError> {
        Ok(())
    }

    fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), TransformError>;

    /// Flushes everything still buffered. Called once, after the last chunk.
    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), TransformError>;
}

impl<T: Transform + ?Sized> Transform for Box<T> {
    fn begin(&mut self, out: &mut Vec<u8>) -> Result<(), TransformError> {
        (**self).begin(out)
    }

    fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), TransformError> {
        (**self).update(input, out)
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), TransformError> {
        (**self).finish(out)
    }
}

/// Everything a stage needs to know about the job it runs for.
pub struct StageContext<'a> {
    pub stage: Stage,
    pub coordination: &'a Coordination,
    pub progress: &'a mut JobProgress,
    pub chunk_size: usize,
}

/// Streams `input` through `transform` into `output`.
///
/// Returns the number of input bytes consumed.
pub fn transform_file<T>(
    ctx: &mut StageContext<'_>,
    input: &Path,
    output: &Path,
    transform: &mut T,
) -> Result<u64, JobError>
where
    T: Transform + ?Sized,
{
    transform_file_with(ctx, input, output, transform, |writer| writer)
}

/// Same as [`transform_file`], with a hook to wrap the staging writer.
pub(crate) fn transform_file_with<T, W, F>(
    ctx: &mut StageContext<'_>,
    input: &Path,
    output: &Path,
    transform: &mut T,
    wrap: F,
) -> Result<u64, JobError>
where
    T: Transform + ?Sized,
    W: Write,
    F: FnOnce(BufWriter<File>) -> W,
{
    let (mut source, total) = open_source(input)?;
    let staging = create_staging(output)?;

    let staging_file = staging.as_file().try_clone().map_err(|source| JobError::Output {
        path: output.to_path_buf(),
        source,
    })?;
    let mut dest = wrap(BufWriter::with_capacity(WRITE_BUFFER, staging_file));

    let consumed = pump(ctx, &mut source, total, &mut dest, input, output, transform)?;

    dest.flush().map_err(|source| JobError::Io {
        path: output.to_path_buf(),
        source,
    })?;
    drop(dest);

    commit(staging, output)?;
    ctx.progress.finish_stage(ctx.stage);
    Ok(consumed)
}

/// The chunk loop proper, independent of where bytes come from or go to.
pub(crate) fn pump<R, W, T>(
    ctx: &mut StageContext<'_>,
    source: &mut R,
    total: u64,
    dest: &mut W,
    source_path: &Path,
    dest_path: &Path,
    transform: &mut T,
) -> Result<u64, JobError>
where
    R: Read,
    W: Write,
    T: Transform + ?Sized,
{
    let id = ctx.progress.id();
    let mut chunk = vec![0u8; ctx.chunk_size.max(1)];
    let mut out = Vec::with_capacity(chunk.len());
    let transform_err = |source: TransformError| JobError::Transform {
        path: source_path.to_path_buf(),
        source,
    };

    transform.begin(&mut out).map_err(transform_err)?;
    write_out(dest, &mut out, dest_path)?;

    let mut consumed = 0u64;
    loop {
        ctx.coordination.pause_wait(id);
        if ctx.coordination.is_cancelled(id) {
            trace!(job = id, stage = %ctx.stage, consumed, "cancel observed at chunk boundary");
            return Err(JobError::Cancelled);
        }

        let n = fill_chunk(source, &mut chunk).map_err(|source| JobError::Io {
            path: source_path.to_path_buf(),
            source,
        })?;
        if n == 0 {
            break;
        }

        transform.update(&chunk[..n], &mut out).map_err(transform_err)?;
        write_out(dest, &mut out, dest_path)?;

        consumed += n as u64;
        ctx.progress.report(ctx.stage, percent_of(consumed, total));
    }

    transform.finish(&mut out).map_err(transform_err)?;
    write_out(dest, &mut out, dest_path)?;
    Ok(consumed)
}

fn open_source(path: &Path) -> Result<(File, u64), JobError> {
    let input_err = |source: io::Error| JobError::Input {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(input_err)?;
    let meta = file.metadata().map_err(input_err)?;
    if !meta.is_file() {
        return Err(input_err(io::Error::new(
            ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }
    Ok((file, meta.len()))
}

fn create_staging(output: &Path) -> Result<NamedTempFile, JobError> {
    let dir = match output.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());

    Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(".part")
        .tempfile_in(&dir)
        .map_err(|source| JobError::Output {
            path: output.to_path_buf(),
            source,
        })
}

fn commit(staging: NamedTempFile, output: &Path) -> Result<(), JobError> {
    let output_err = |source: io::Error| JobError::Output {
        path: output.to_path_buf(),
        source,
    };
    staging.as_file().sync_all().map_err(output_err)?;
    staging
        .persist_noclobber(output)
        .map_err(|persist| output_err(persist.error))?;
    Ok(())
}

/// Reads until `buf` is full or the source is exhausted.
fn fill_chunk<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Writes all of `out`, treating a zero-length write as a short write.
fn write_out<W: Write>(dest: &mut W, out: &mut Vec<u8>, path: &Path) -> Result<(), JobError> {
    let expected = out.len();
    let mut written = 0;
    while written < expected {
        match dest.write(&out[written..]) {
            Ok(0) => {
                return Err(JobError::ShortWrite {
                    path: path.to_path_buf(),
                    expected,
                    written,
                })
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(JobError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
    out.clear();
    Ok(())
}
