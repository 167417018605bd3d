//! Fixed-size worker pool draining one shared FIFO task queue.
//!
//! Every worker runs the same loop: wait on the queue condition variable until
//! a task arrives or shutdown is requested, pop the head, release the lock and
//! run the task. Tasks still queued when the pool is dropped are discarded, not
//! executed. Cancelling a specific job is cooperative and happens inside the
//! task body, so there is no way to pull a queued task back out.

use std::collections::VecDeque;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

/// An opaque unit of work, consumed exactly once.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Task>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<QueueState>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed pool of long-lived worker threads.
pub struct DispatchQueue {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl DispatchQueue {
    /// Spawns `threads` workers (at least one) immediately.
    pub fn new(threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let shared = Arc::new(Shared::default());
        let mut pool = Self {
            shared,
            handles: Vec::with_capacity(threads),
        };

        for worker_id in 0..threads {
            let shared = Arc::clone(&pool.shared);
            // On error `pool` is dropped here, which shuts down the workers already spawned.
            let handle = thread::Builder::new()
                .name(format!("blitzseal-worker-{worker_id}"))
                .spawn(move || run_worker_loop(worker_id, &shared))?;
            pool.handles.push(handle);
        }

        debug!(threads, "worker pool started");
        Ok(pool)
    }

    /// Number of worker threads in the pool.
    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Tasks waiting in the queue (not counting ones already running).
    pub fn pending(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Appends a task to the tail of the queue and wakes one idle worker.
    pub fn enqueue<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.shared.lock();
            queue.tasks.push_back(Box::new(task));
        }
        self.shared.available.notify_one();
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        let dropped = {
            let mut queue = self.shared.lock();
            queue.shutdown = true;
            let dropped = queue.tasks.len();
            queue.tasks.clear();
            dropped
        };
        self.shared.available.notify_all();

        if dropped > 0 {
            debug!(dropped, "discarding queued tasks at shutdown");
        }

        for handle in self.handles.drain(..) {
            if let Err(payload) = handle.join() {
                error!("worker thread panicked: {}", panic_message(payload.as_ref()));
            }
        }
    }
}

fn run_worker_loop(worker_id: usize, shared: &Shared) {
    loop {
        let task = {
            let mut queue = shared.lock();
            loop {
                if queue.shutdown {
                    return;
                }
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
            error!(
                worker_id,
                "task panicked: {}",
                panic_message(payload.as_ref())
            );
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
