//! Shared pause / abort / stop / busy signalling for one dispatch session.
//!
//! A single [`Coordination`] is shared (via `Arc`) by every job of a batch.
//! Jobs never touch the flags directly; they call [`Coordination::pause_wait`]
//! and [`Coordination::is_cancelled`] once per chunk.
//!
//! The pause flag lives inside the mutex that guards the condition variable,
//! and every transition that must release a paused worker (`pause(false)`,
//! `abort(true)`, `stop(id, true)`) takes that mutex before broadcasting, so a
//! waiter can never miss its wakeup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock};

use crate::job::JobId;

/// Process-wide (per dispatcher) coordination flags.
#[derive(Debug, Default)]
pub struct Coordination {
    aborted: AtomicBool,
    busy: AtomicBool,
    paused: Mutex<bool>,
    resume: Condvar,
    stopped: RwLock<Vec<AtomicBool>>,
}

impl Coordination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-arms the state for a batch of `max_id` jobs.
    ///
    /// Clears the abort flag and resets the stop table to `max_id` entries, all
    /// `false`. Must not run while jobs of a previous batch are still executing.
    pub fn init(&self, max_id: usize) {
        self.aborted.store(false, Ordering::SeqCst);
        let mut table = self.stopped.write().unwrap_or_else(PoisonError::into_inner);
        table.clear();
        table.resize_with(max_id, || AtomicBool::new(false));
    }

    pub fn abort(&self, flag: bool) {
        self.aborted.store(flag, Ordering::SeqCst);
        if flag {
            self.wake_all();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn pause(&self, flag: bool) {
        let mut paused = self.lock_paused();
        *paused = flag;
        if !flag {
            self.resume.notify_all();
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.lock_paused()
    }

    pub fn busy(&self, flag: bool) {
        self.busy.store(flag, Ordering::SeqCst);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Marks one job stopped (or un-stopped). Ids outside the table are ignored.
    pub fn stop(&self, id: JobId, flag: bool) {
        let written = {
            let table = self.stopped.read().unwrap_or_else(PoisonError::into_inner);
            match table.get(id) {
                Some(entry) => {
                    entry.store(flag, Ordering::SeqCst);
                    true
                }
                None => false,
            }
        };
        if written && flag {
            self.wake_all();
        }
    }

    /// Ids outside the table read as "not stopped".
    pub fn is_stopped(&self, id: JobId) -> bool {
        let table = self.stopped.read().unwrap_or_else(PoisonError::into_inner);
        table
            .get(id)
            .map(|entry| entry.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// True when job `id` must stop at its next check point.
    pub fn is_cancelled(&self, id: JobId) -> bool {
        self.is_aborted() || self.is_stopped(id)
    }

    /// Number of entries in the stop table (the size given to the last `init`).
    pub fn capacity(&self) -> usize {
        self.stopped.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Blocks the calling worker while the session is paused.
    ///
    /// Returns as soon as the pause is lifted, the session is aborted, or job
    /// `id` is stopped.
    pub fn pause_wait(&self, id: JobId) {
        let mut paused = self.lock_paused();
        while *paused && !self.is_aborted() && !self.is_stopped(id) {
            paused = self
                .resume
                .wait(paused)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn lock_paused(&self) -> MutexGuard<'_, bool> {
        self.paused.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Taking the lock orders this broadcast after any waiter's predicate check.
    fn wake_all(&self) {
        let _guard = self.lock_paused();
        self.resume.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn flags_round_trip() {
        let state = Coordination::new();
        assert!(!state.is_aborted());
        assert!(!state.is_paused());
        assert!(!state.is_busy());

        state.abort(true);
        state.pause(true);
        state.busy(true);
        assert!(state.is_aborted());
        assert!(state.is_paused());
        assert!(state.is_busy());

        state.abort(false);
        state.pause(false);
        state.busy(false);
        assert!(!state.is_aborted());
        assert!(!state.is_paused());
        assert!(!state.is_busy());
    }

    #[test]
    fn stop_table_ignores_out_of_range_ids() {
        let state = Coordination::new();
        state.init(3);
        state.stop(7, true);
        assert_eq!(state.capacity(), 3);
        assert!(!state.is_stopped(7));

        state.stop(1, true);
        assert!(state.is_stopped(1));
        assert!(!state.is_stopped(0));
        assert!(!state.is_stopped(2));
    }

    #[test]
    fn init_clears_abort_and_stops() {
        let state = Coordination::new();
        state.init(2);
        state.stop(0, true);
        state.abort(true);

        state.init(4);
        assert!(!state.is_aborted());
        assert_eq!(state.capacity(), 4);
        assert!((0..4).all(|id| !state.is_stopped(id)));
    }

    #[test]
    fn pause_wait_returns_immediately_when_not_paused() {
        let state = Coordination::new();
        state.init(1);
        state.pause_wait(0);
    }

    fn spawn_waiter(state: &Arc<Coordination>, id: JobId) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel();
        let state = Arc::clone(state);
        thread::spawn(move || {
            state.pause_wait(id);
            let _ = tx.send(());
        });
        rx
    }

    #[test]
    fn resume_wakes_every_waiter() {
        let state = Arc::new(Coordination::new());
        state.init(3);
        state.pause(true);

        let waiters: Vec<_> = (0..3).map(|id| spawn_waiter(&state, id)).collect();
        for rx in &waiters {
            assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        }

        state.pause(false);
        for rx in &waiters {
            rx.recv_timeout(Duration::from_secs(5))
                .expect("waiter should resume");
        }
    }

    #[test]
    fn abort_releases_paused_waiter() {
        let state = Arc::new(Coordination::new());
        state.init(1);
        state.pause(true);

        let rx = spawn_waiter(&state, 0);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        state.abort(true);
        rx.recv_timeout(Duration::from_secs(5))
            .expect("abort should release the waiter");
        assert!(state.is_paused());
    }

    #[test]
    fn stop_releases_only_its_own_waiter() {
        let state = Arc::new(Coordination::new());
        state.init(2);
        state.pause(true);

        let first = spawn_waiter(&state, 0);
        let second = spawn_waiter(&state, 1);
        thread::sleep(Duration::from_millis(50));

        state.stop(1, true);
        second
            .recv_timeout(Duration::from_secs(5))
            .expect("stopped job should be released");
        assert!(first.recv_timeout(Duration::from_millis(100)).is_err());

        state.pause(false);
        first
            .recv_timeout(Duration::from_secs(5))
            .expect("remaining job should resume");
    }
}
