//! Events delivered to the front-end, and per-job progress bookkeeping.
//!
//! The front-end only ever sees [`Event`] values. They are produced on worker
//! threads and handed to an [`EventCallback`], which may forward them to a
//! channel, a terminal renderer or a UI model.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::job::JobId;

/// One transform step of a job's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Compress,
    Encrypt,
    Decrypt,
    Decompress,
}

impl Stage {
    /// Label shown while the stage is running.
    pub fn running_label(self) -> &'static str {
        match self {
            Stage::Compress => "Compressing",
            Stage::Encrypt => "Encrypting",
            Stage::Decrypt => "Decrypting",
            Stage::Decompress => "Decompressing",
        }
    }

    /// Label shown once the stage reached 100%.
    pub fn done_label(self) -> &'static str {
        match self {
            Stage::Compress => "Compressed",
            Stage::Encrypt => "Encrypted",
            Stage::Decrypt => "Decrypted",
            Stage::Decompress => "Decompressed",
        }
    }

    pub fn label_for(self, percent: u8) -> &'static str {
        if percent >= 100 {
            self.done_label()
        } else {
            self.running_label()
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.running_label())
    }
}

/// Everything the pipeline reports to its front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `percent` is the job's overall progress across all of its stages;
    /// `stage_percent` is the progress of the current stage alone.
    Progress {
        id: JobId,
        stage: Stage,
        label: &'static str,
        stage_percent: u8,
        percent: u8,
    },
    Completed {
        id: JobId,
        output: PathBuf,
    },
    Failed {
        id: JobId,
        path: Option<PathBuf>,
        message: String,
    },
    Cancelled {
        id: JobId,
    },
    Status(String),
    Error {
        message: String,
        path: Option<PathBuf>,
    },
    Busy(bool),
}

impl Event {
    /// The job the event belongs to; `None` for batch-level events.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Event::Progress { id, .. }
            | Event::Completed { id, .. }
            | Event::Failed { id, .. }
            | Event::Cancelled { id } => Some(*id),
            Event::Status(_) | Event::Error { .. } | Event::Busy(_) => None,
        }
    }

    /// True for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::Completed { .. } | Event::Failed { .. } | Event::Cancelled { .. }
        )
    }
}

/// Event sink type shared by every worker.
pub type EventCallback = dyn Fn(Event) + Send + Sync;

/// Wraps a crossbeam sender as an event sink. Send errors (receiver gone) are ignored.
pub fn channel_sink(tx: crossbeam_channel::Sender<Event>) -> Arc<EventCallback> {
    Arc::new(move |event| {
        let _ = tx.send(event);
    })
}

/// Percentage of `consumed` over `total`, rounded and clamped to `0..=100`.
///
/// An empty input counts as fully processed.
pub fn percent_of(consumed: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let ratio = consumed as f64 / total as f64 * 100.0;
    ratio.round().clamp(0.0, 100.0) as u8
}

/// Per-job progress emitter.
///
/// Turns stage-local percentages into job-wide ones and drops anything that
/// would not move the bar forward, so the events of one job are strictly
/// non-decreasing and the last one of a successful job is exactly 100.
pub struct JobProgress {
    id: JobId,
    stage_count: usize,
    stage_index: usize,
    last_stage_percent: Option<u8>,
    last_overall: Option<u8>,
    sink: Arc<EventCallback>,
}

impl JobProgress {
    pub fn new(id: JobId, stage_count: usize, sink: Arc<EventCallback>) -> Self {
        Self {
            id,
            stage_count: stage_count.max(1),
            stage_index: 0,
            last_stage_percent: None,
            last_overall: None,
            sink,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Moves to the next stage; its percentages restart from zero.
    pub fn begin_stage(&mut self, index: usize) {
        self.stage_index = index.min(self.stage_count - 1);
        self.last_stage_percent = None;
    }

    /// Reports `stage_percent` for the current stage if it advanced.
    pub fn report(&mut self, stage: Stage, stage_percent: u8) {
        let stage_percent = stage_percent.min(100);
        if self
            .last_stage_percent
            .is_some_and(|last| stage_percent <= last)
        {
            return;
        }
        self.last_stage_percent = Some(stage_percent);

        let overall =
            ((self.stage_index * 100 + stage_percent as usize) / self.stage_count).min(100) as u8;
        let overall = match self.last_overall {
            Some(last) if overall < last => last,
            _ => overall,
        };
        self.last_overall = Some(overall);

        (self.sink)(Event::Progress {
            id: self.id,
            stage,
            label: stage.label_for(stage_percent),
            stage_percent,
            percent: overall,
        });
    }

    /// Ensures the current stage ends on exactly 100.
    pub fn finish_stage(&mut self, stage: Stage) {
        if self.last_stage_percent != Some(100) {
            self.report(stage, 100);
        }
    }

    pub fn emit(&self, event: Event) {
        (self.sink)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting_sink() -> (Arc<EventCallback>, Arc<Mutex<Vec<Event>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let sink: Arc<EventCallback> = Arc::new(move |event| {
            sink_events.lock().unwrap().push(event);
        });
        (sink, events)
    }

    fn overall(events: &[Event]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|event| match event {
                Event::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn percent_is_clamped_and_rounded() {
        assert_eq!(percent_of(0, 0), 100);
        assert_eq!(percent_of(0, 10), 0);
        assert_eq!(percent_of(1, 3), 33);
        assert_eq!(percent_of(2, 3), 67);
        assert_eq!(percent_of(15, 10), 100);
    }

    #[test]
    fn labels_switch_at_completion() {
        assert_eq!(Stage::Compress.label_for(99), "Compressing");
        assert_eq!(Stage::Compress.label_for(100), "Compressed");
        assert_eq!(Stage::Decrypt.label_for(100), "Decrypted");
    }

    #[test]
    fn two_stage_progress_is_monotonic_and_ends_at_100() {
        let (sink, events) = collecting_sink();
        let mut progress = JobProgress::new(3, 2, sink);

        progress.begin_stage(0);
        for p in [0, 40, 40, 100] {
            progress.report(Stage::Compress, p);
        }
        progress.finish_stage(Stage::Compress);
        progress.begin_stage(1);
        for p in [0, 50, 20, 100] {
            progress.report(Stage::Encrypt, p);
        }
        progress.finish_stage(Stage::Encrypt);

        let events = events.lock().unwrap();
        let percents = overall(&events);
        assert_eq!(percents, vec![0, 20, 50, 50, 75, 100]);
        assert!(events.iter().all(|e| e.job_id() == Some(3)));
        match events.last() {
            Some(Event::Progress { label, .. }) => assert_eq!(*label, "Encrypted"),
            other => panic!("unexpected last event {other:?}"),
        }
    }

    #[test]
    fn finish_stage_fills_in_missing_100() {
        let (sink, events) = collecting_sink();
        let mut progress = JobProgress::new(0, 1, sink);
        progress.finish_stage(Stage::Decompress);
        assert_eq!(overall(&events.lock().unwrap()), vec![100]);
    }
}
