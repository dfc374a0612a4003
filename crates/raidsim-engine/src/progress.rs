//! Streaming progress for asynchronous runs.
//!
//! Updates travel over a bounded crossbeam channel. Intermediate updates are
//! sent with `try_send` and dropped when the consumer falls behind, so a slow
//! reader never stalls the workers. The terminal update is sent with a
//! blocking `send`, exactly once per run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::aggregate::DistributionMetric;
use crate::harness::SimReport;
use crate::HarnessError;

/// Snapshot of a run in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMetrics {
    pub request_id: String,
    /// Trials finished, failed ones included.
    pub completed: u64,
    pub total: u64,
    pub failed: u64,
    /// Mean raid dps over the successful trials so far.
    pub mean_dps: f64,
    pub elapsed_secs: f64,
}

impl ProgressMetrics {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

/// One message on a run's update channel.
#[derive(Debug)]
pub enum ProgressUpdate {
    Progress(ProgressMetrics),
    /// The run ended; no further messages follow.
    Final(Box<SimReport>),
    /// The run could not produce a report; no further messages follow.
    Failed(HarnessError),
}

impl ProgressUpdate {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressUpdate::Progress(_))
    }
}

/// Producer half of an update channel.
#[derive(Debug)]
pub(crate) struct ProgressSink {
    tx: Sender<ProgressUpdate>,
    dropped: AtomicU64,
}

pub(crate) fn channel(capacity: usize) -> (ProgressSink, Receiver<ProgressUpdate>) {
    let (tx, rx) = bounded(capacity.max(1));
    (
        ProgressSink {
            tx,
            dropped: AtomicU64::new(0),
        },
        rx,
    )
}

impl ProgressSink {
    /// Offer an intermediate update without blocking.
    pub(crate) fn progress(&self, metrics: ProgressMetrics) {
        match self.tx.try_send(ProgressUpdate::Progress(metrics)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "progress consumer is behind, update dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("progress receiver gone");
            }
        }
    }

    /// Deliver the terminal update, waiting for room if needed.
    pub(crate) fn finish(&self, update: ProgressUpdate) {
        if self.tx.send(update).is_err() {
            debug!("progress receiver gone before final update");
        }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct Tally {
    completed: u64,
    failed: u64,
    dps: DistributionMetric,
}

/// Counts finished trials across every worker of one run and emits an update
/// every `interval` trials.
#[derive(Debug)]
pub(crate) struct ProgressTracker<'a> {
    request_id: String,
    total: u64,
    interval: u64,
    started: Instant,
    sink: Option<&'a ProgressSink>,
    tally: Mutex<Tally>,
}

impl<'a> ProgressTracker<'a> {
    pub(crate) fn new(
        request_id: &str,
        total: u64,
        interval: u64,
        sink: Option<&'a ProgressSink>,
    ) -> Self {
        Self {
            request_id: request_id.to_owned(),
            total,
            interval,
            started: Instant::now(),
            sink,
            tally: Mutex::new(Tally::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tally> {
        self.tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count one trial; `raid_dps` is `None` for a failed trial.
    pub(crate) fn record(&self, raid_dps: Option<f64>) {
        let update = {
            let mut tally = self.lock();
            tally.completed += 1;
            match raid_dps {
                Some(dps) => tally.dps.push(dps),
                None => tally.failed += 1,
            }
            let due = self.interval > 0 && tally.completed % self.interval == 0;
            (due && self.sink.is_some()).then(|| self.metrics(&tally))
        };
        if let (Some(metrics), Some(sink)) = (update, self.sink) {
            sink.progress(metrics);
        }
    }

    fn metrics(&self, tally: &Tally) -> ProgressMetrics {
        ProgressMetrics {
            request_id: self.request_id.clone(),
            completed: tally.completed,
            total: self.total,
            failed: tally.failed,
            mean_dps: tally.dps.mean(),
            elapsed_secs: self.started.elapsed().as_secs_f64(),
        }
    }

    pub(crate) fn snapshot(&self) -> ProgressMetrics {
        let tally = self.lock();
        self.metrics(&tally)
    }
}
