//! Batch orchestration: turns a list of files into queued jobs and exposes
//! the session controls (pause, stop, abort) to the front-end.
//!
//! One batch runs at a time. A new batch is refused while the previous one is
//! still being submitted or any of its jobs has not reached a terminal state,
//! so the coordination state is never re-armed under a running job.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::coordination::Coordination;
use crate::error::{DispatchError, JobError};
use crate::job::{Direction, Job, JobConfig, JobId, JobStatus};
use crate::pipeline::{self, Reservations};
use crate::progress::{Event, EventCallback, JobProgress};
use crate::stream::DEFAULT_CHUNK_SIZE;
use crate::workers::{panic_message, DispatchQueue};

#[derive(Default)]
struct Outstanding {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Outstanding {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, n: usize) {
        *self.lock() += n;
    }

    fn finish_one(&self) {
        let mut count = self.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

type StatusTable = Arc<Mutex<Vec<JobStatus>>>;

fn set_status(table: &StatusTable, id: JobId, status: JobStatus) {
    let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(slot) = table.get_mut(id) {
        *slot = status;
    }
}

/// Delivers exactly one terminal event per job, even when the task is
/// discarded from the queue without ever running.
struct Ticket {
    id: JobId,
    events: Arc<EventCallback>,
    statuses: StatusTable,
    outstanding: Arc<Outstanding>,
    reported: bool,
}

impl Ticket {
    fn start(&self) {
        set_status(&self.statuses, self.id, JobStatus::Running);
    }

    fn complete(mut self, event: Event) {
        let status = match event {
            Event::Completed { .. } => JobStatus::Completed,
            Event::Failed { .. } => JobStatus::Failed,
            _ => JobStatus::Cancelled,
        };
        set_status(&self.statuses, self.id, status);
        (self.events)(event);
        self.reported = true;
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if !self.reported {
            set_status(&self.statuses, self.id, JobStatus::Cancelled);
            (self.events)(Event::Cancelled { id: self.id });
        }
        self.outstanding.finish_one();
    }
}

/// Owns the worker pool and the session's coordination state.
pub struct Dispatcher {
    pool: DispatchQueue,
    state: Arc<Coordination>,
    events: Arc<EventCallback>,
    chunk_size: usize,
    outstanding: Arc<Outstanding>,
    statuses: StatusTable,
    submit: Mutex<()>,
}

impl Dispatcher {
    /// Starts `workers` worker threads (at least one).
    pub fn new(workers: usize, events: Arc<EventCallback>) -> Result<Self, DispatchError> {
        let pool = DispatchQueue::new(workers)?;
        info!(workers = pool.threads(), "dispatcher ready");
        Ok(Self {
            pool,
            state: Arc::new(Coordination::new()),
            events,
            chunk_size: DEFAULT_CHUNK_SIZE,
            outstanding: Arc::new(Outstanding::default()),
            statuses: Arc::new(Mutex::new(Vec::new())),
            submit: Mutex::new(()),
        })
    }

    pub fn from_settings(settings: &Settings, events: Arc<EventCallback>) -> Result<Self, DispatchError> {
        settings.validate()?;
        Ok(Self::new(settings.worker_count(), events)?.with_chunk_size(settings.chunk_size))
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn workers(&self) -> usize {
        self.pool.threads()
    }

    /// Queues one encrypt job per input. Returns the number of jobs queued.
    pub fn encrypt_batch(
        &self,
        config: JobConfig,
        inputs: &[PathBuf],
        output_dir: Option<&Path>,
    ) -> Result<usize, DispatchError> {
        self.submit_batch(Direction::Encrypt, config, inputs, output_dir)
    }

    /// Queues one decrypt job per input. Returns the number of jobs queued.
    pub fn decrypt_batch(
        &self,
        config: JobConfig,
        inputs: &[PathBuf],
        output_dir: Option<&Path>,
    ) -> Result<usize, DispatchError> {
        self.submit_batch(Direction::Decrypt, config, inputs, output_dir)
    }

    fn submit_batch(
        &self,
        direction: Direction,
        config: JobConfig,
        inputs: &[PathBuf],
        output_dir: Option<&Path>,
    ) -> Result<usize, DispatchError> {
        let _submitting = self.submit.lock().unwrap_or_else(PoisonError::into_inner);

        if self.state.is_busy() || self.in_flight() > 0 {
            warn!(in_flight = self.in_flight(), "batch rejected, dispatcher busy");
            (self.events)(Event::Status(
                "Busy: wait for the current batch to finish".to_string(),
            ));
            return Err(DispatchError::Busy);
        }

        let suite = match config.validate() {
            Ok(suite) => suite,
            Err(e) => {
                warn!(error = %e, "batch rejected, invalid configuration");
                (self.events)(Event::Error {
                    message: e.to_string(),
                    path: None,
                });
                return Err(e.into());
            }
        };

        self.state.busy(true);
        let count = inputs.len();
        self.state.init(count);
        *self.statuses.lock().unwrap_or_else(PoisonError::into_inner) = vec![JobStatus::Queued; count];
        (self.events)(Event::Busy(true));
        info!(?direction, jobs = count, "submitting batch");

        let config = Arc::new(config);
        let mut reserved = Reservations::new();
        self.outstanding.add(count);

        for (id, input) in inputs.iter().enumerate() {
            let job = Job::new(
                id,
                direction,
                input.clone(),
                output_dir,
                Arc::clone(&config),
                suite,
                &mut reserved,
            );
            debug!(job = id, input = %job.input.display(), output = %job.output.display(), "job queued");
            self.enqueue(job);
        }

        self.state.busy(false);
        (self.events)(Event::Busy(false));
        Ok(count)
    }

    fn enqueue(&self, job: Job) {
        let ticket = Ticket {
            id: job.id,
            events: Arc::clone(&self.events),
            statuses: Arc::clone(&self.statuses),
            outstanding: Arc::clone(&self.outstanding),
            reported: false,
        };
        let state = Arc::clone(&self.state);
        let events = Arc::clone(&self.events);
        let chunk_size = self.chunk_size;

        self.pool.enqueue(move || {
            let id = job.id;
            ticket.start();
            let mut progress = JobProgress::new(id, job.stages.len(), events);
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                pipeline::run_job(&job, &state, &mut progress, chunk_size)
            }))
            .unwrap_or_else(|payload| Err(JobError::Internal(panic_message(payload.as_ref()))));

            let event = match outcome {
                Ok(output) => Event::Completed { id, output },
                Err(e) if e.is_cancelled() => {
                    info!(job = id, input = %job.input.display(), "job cancelled");
                    Event::Cancelled { id }
                }
                Err(e) => {
                    warn!(job = id, input = %job.input.display(), error = %e, "job failed");
                    Event::Failed {
                        id,
                        path: e.path().map(Path::to_path_buf),
                        message: e.user_message().to_string(),
                    }
                }
            };
            ticket.complete(event);
        });
    }

    /// Cancels every job of the current batch at its next chunk boundary.
    pub fn abort(&self) {
        if !self.state.is_busy() && self.in_flight() == 0 {
            debug!("abort ignored, nothing running");
            return;
        }
        info!(in_flight = self.in_flight(), "aborting batch");
        self.state.abort(true);
    }

    pub fn pause(&self, flag: bool) {
        info!(paused = flag, "pause toggled");
        self.state.pause(flag);
    }

    /// Cancels a single job of the current batch.
    pub fn stop(&self, id: JobId) {
        info!(job = id, "stop requested");
        self.state.stop(id, true);
    }

    /// Lifecycle state of job `id` in the current (or last) batch.
    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
    }

    /// Snapshot of every job's state, indexed by id.
    pub fn statuses(&self) -> Vec<JobStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Jobs submitted but not yet in a terminal state.
    pub fn in_flight(&self) -> usize {
        *self.outstanding.lock()
    }

    /// Blocks until every submitted job has reported its outcome.
    pub fn wait_idle(&self) {
        let mut count = self.outstanding.lock();
        while *count > 0 {
            count = self
                .outstanding
                .idle
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`Dispatcher::wait_idle`], giving up after `timeout`. Returns true when idle.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.outstanding.lock();
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = self
                .outstanding
                .idle
                .wait_timeout(count, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        true
    }

    pub fn coordination(&self) -> &Coordination {
        &self.state
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.in_flight() > 0 {
            debug!(in_flight = self.in_flight(), "dispatcher dropped with work outstanding");
            self.state.abort(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::fs;
    use tempfile::tempdir;

    use crate::crypto::Kdf;
    use crate::progress::channel_sink;

    fn fast_config() -> JobConfig {
        JobConfig {
            kdf: Kdf::Pbkdf2Sha256 { rounds: 1000 },
            ..JobConfig::with_passphrase("pw")
        }
    }

    #[test]
    fn empty_batch_is_accepted() {
        let (tx, rx) = unbounded();
        let dispatcher = Dispatcher::new(1, channel_sink(tx)).unwrap();
        assert_eq!(dispatcher.encrypt_batch(fast_config(), &[], None).unwrap(), 0);
        assert!(dispatcher.wait_idle_timeout(Duration::from_secs(1)));
        let events: Vec<Event> = rx.try_iter().collect();
        assert_eq!(events, vec![Event::Busy(true), Event::Busy(false)]);
    }

    #[test]
    fn invalid_config_is_rejected_before_queueing() {
        let (tx, rx) = unbounded();
        let dispatcher = Dispatcher::new(1, channel_sink(tx)).unwrap();
        let mut config = fast_config();
        config.key_size = 192;
        let err = dispatcher
            .encrypt_batch(config, &[PathBuf::from("x")], None)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
        assert_eq!(dispatcher.in_flight(), 0);
        assert!(!dispatcher.coordination().is_busy());
        assert!(matches!(rx.try_recv(), Ok(Event::Error { .. })));
    }

    #[test]
    fn abort_without_batch_is_a_no_op() {
        let dispatcher = Dispatcher::new(1, Arc::new(|_: Event| {})).unwrap();
        dispatcher.abort();
        assert!(!dispatcher.coordination().is_aborted());
    }

    #[test]
    fn busy_while_jobs_in_flight() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("a.txt");
        fs::write(&input, b"hello").unwrap();

        let (tx, rx) = unbounded();
        let dispatcher = Dispatcher::new(1, channel_sink(tx)).unwrap();
        dispatcher.pause(true);
        assert_eq!(dispatcher.encrypt_batch(fast_config(), &[input.clone()], None).unwrap(), 1);

        let err = dispatcher.encrypt_batch(fast_config(), &[input], None).unwrap_err();
        assert!(matches!(err, DispatchError::Busy));
        assert!(rx.try_iter().any(|e| matches!(e, Event::Status(_))));

        dispatcher.pause(false);
        assert!(dispatcher.wait_idle_timeout(Duration::from_secs(10)));
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(dispatcher.statuses(), vec![JobStatus::Completed]);
    }

    #[test]
    fn dropping_a_paused_dispatcher_cancels_everything() {
        let dir = tempdir().unwrap();
        let inputs: Vec<PathBuf> = (0..4)
            .map(|i| {
                let path = dir.path().join(format!("f{i}"));
                fs::write(&path, vec![i as u8; 64]).unwrap();
                path
            })
            .collect();

        let (tx, rx) = unbounded();
        {
            let dispatcher = Dispatcher::new(2, channel_sink(tx)).unwrap();
            dispatcher.pause(true);
            dispatcher.encrypt_batch(fast_config(), &inputs, None).unwrap();
        }
        let cancelled = rx
            .try_iter()
            .filter(|e| matches!(e, Event::Cancelled { .. }))
            .count();
        assert_eq!(cancelled, 4);
        assert!(fs::read_dir(dir.path())
            .unwrap()
            .all(|e| !e.unwrap().file_name().to_string_lossy().ends_with(".enc")));
    }
}
