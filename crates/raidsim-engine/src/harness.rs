//! Concurrent Monte-Carlo harness.
//!
//! A run validates its request, registers the request id for aborts, then
//! spreads the iterations over a rayon pool. Each pool task owns a private
//! [`TrialRunner`] and a contiguous range of iterations; the per-task
//! aggregates are merged in task order once the pool drains.
//!
//! A request can also be split into sub-batches that run side by side, each
//! with its own pool. Trial `i` is seeded from `(random_seed, i)` no matter
//! which sub-batch runs it, so a split run reports the same aggregate as an
//! unsplit one.

use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::Receiver;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use raidsim_core::registry::ContentRegistry;

use crate::abort::{AbortRegistry, AbortSignal};
use crate::aggregate::{raid_dps, Aggregate};
use crate::config::SimRequest;
use crate::progress::{self, ProgressSink, ProgressTracker, ProgressUpdate};
use crate::setup::build_encounter;
use crate::trial::{TrialFailure, TrialOutcome, TrialRunner};
use crate::HarnessError;

/// Failures kept verbatim in a report; the rest are only counted.
pub const MAX_REPORTED_FAILURES: usize = 32;

/// Pool tasks per worker thread.
const TASKS_PER_THREAD: usize = 4;

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Every requested trial completed.
    Success,
    /// Every requested trial ran, some of them failed.
    Partial { failed: u64 },
    /// The run was cancelled before it finished.
    Aborted,
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimReport {
    pub request_id: String,
    pub status: RunStatus,
    pub iterations_requested: u64,
    pub aggregate: Aggregate,
    /// The first failures in iteration order, at most
    /// [`MAX_REPORTED_FAILURES`].
    pub failures: Vec<TrialFailure>,
    pub wall_time_secs: f64,
}

impl SimReport {
    /// Trials that ran, failed ones included.
    pub fn iterations_completed(&self) -> u64 {
        self.aggregate.iterations + self.aggregate.failed
    }
}

/// Result of one pool task or one sub-batch.
#[derive(Debug, Default)]
struct BatchOutcome {
    aggregate: Aggregate,
    failures: Vec<TrialFailure>,
    aborted: bool,
}

impl BatchOutcome {
    fn merge(&mut self, other: BatchOutcome) {
        self.aggregate.merge(&other.aggregate);
        self.failures.extend(other.failures);
        self.failures.sort_by_key(|f| f.iteration);
        self.failures.truncate(MAX_REPORTED_FAILURES);
        self.aborted |= other.aborted;
    }
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// An asynchronous run in flight.
#[derive(Debug)]
pub struct RunHandle {
    request_id: String,
    updates: Receiver<ProgressUpdate>,
    aborts: AbortRegistry,
    join: JoinHandle<()>,
}

impl RunHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Progress updates followed by exactly one terminal update.
    pub fn updates(&self) -> &Receiver<ProgressUpdate> {
        &self.updates
    }

    /// Ask the run to stop after the trials in progress.
    pub fn abort(&self) -> bool {
        self.aborts.abort(&self.request_id)
    }

    /// Block until the run ends, discarding intermediate progress.
    pub fn wait(self) -> Result<SimReport, HarnessError> {
        let mut terminal = None;
        for update in self.updates.iter() {
            match update {
                ProgressUpdate::Progress(_) => {}
                ProgressUpdate::Final(report) => {
                    terminal = Some(Ok(*report));
                    break;
                }
                ProgressUpdate::Failed(err) => {
                    terminal = Some(Err(err));
                    break;
                }
            }
        }
        if self.join.join().is_err() {
            return Err(HarnessError::WorkerPanicked(format!(
                "run thread for '{}' panicked",
                self.request_id
            )));
        }
        terminal.unwrap_or_else(|| {
            Err(HarnessError::WorkerPanicked(format!(
                "run '{}' ended without a final report",
                self.request_id
            )))
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Runs requests against one content registry.
#[derive(Debug, Clone)]
pub struct Harness {
    registry: Arc<ContentRegistry>,
    aborts: AbortRegistry,
}

impl Harness {
    pub fn new(registry: ContentRegistry) -> Self {
        Self::with_registry(Arc::new(registry))
    }

    pub fn with_registry(registry: Arc<ContentRegistry>) -> Self {
        Self {
            registry,
            aborts: AbortRegistry::new(),
        }
    }

    pub fn registry(&self) -> &ContentRegistry {
        &self.registry
    }

    pub fn aborts(&self) -> &AbortRegistry {
        &self.aborts
    }

    /// Cancel a running request by id. Returns whether the id was running.
    pub fn abort(&self, request_id: &str) -> bool {
        self.aborts.abort(request_id)
    }

    /// Run trial `iteration` of `request` on the calling thread.
    pub fn run_one_trial(
        &self,
        request: &SimRequest,
        iteration: u64,
    ) -> Result<TrialOutcome, HarnessError> {
        request.validate()?;
        let mut runner = TrialRunner::new(&self.registry, request)?;
        Ok(runner.run_trial(iteration))
    }

    /// Run every iteration and block until done.
    pub fn run_sync(&self, request: &SimRequest) -> Result<SimReport, HarnessError> {
        self.run_concurrent(request, 1)
    }

    /// Run `request` as `splits` sub-batches side by side and block until
    /// done.
    pub fn run_concurrent(
        &self,
        request: &SimRequest,
        splits: usize,
    ) -> Result<SimReport, HarnessError> {
        let signal = self.prepare(request)?;
        let report = execute(&self.registry, request, splits, &signal, None);
        self.aborts.unregister(&request.request_id);
        report
    }

    /// Start a run on a background thread and stream its progress.
    pub fn run_async(&self, request: SimRequest) -> Result<RunHandle, HarnessError> {
        self.run_concurrent_async(request, 1)
    }

    /// Like [`run_async`](Self::run_async) with the request split into
    /// `splits` sub-batches.
    pub fn run_concurrent_async(
        &self,
        request: SimRequest,
        splits: usize,
    ) -> Result<RunHandle, HarnessError> {
        let signal = self.prepare(&request)?;
        let (sink, updates) = progress::channel(request.options.progress_buffer);
        let registry = Arc::clone(&self.registry);
        let aborts = self.aborts.clone();
        let request_id = request.request_id.clone();

        let spawned = thread::Builder::new()
            .name(format!("raidsim-run-{request_id}"))
            .spawn(move || {
                let result = execute(&registry, &request, splits, &signal, Some(&sink));
                aborts.unregister(&request.request_id);
                if sink.dropped() > 0 {
                    warn!(
                        request_id = %request.request_id,
                        dropped = sink.dropped(),
                        "progress updates dropped"
                    );
                }
                sink.finish(match result {
                    Ok(report) => ProgressUpdate::Final(Box::new(report)),
                    Err(err) => ProgressUpdate::Failed(err),
                });
            });
        let join = match spawned {
            Ok(join) => join,
            Err(err) => {
                self.aborts.unregister(&request_id);
                return Err(HarnessError::WorkerPool(err.to_string()));
            }
        };
        Ok(RunHandle {
            request_id,
            updates,
            aborts: self.aborts.clone(),
            join,
        })
    }

    /// Divide `request` into at most `splits` sub-requests covering the same
    /// iterations. Earlier parts take the remainder.
    pub fn split_request(request: &SimRequest, splits: usize) -> Vec<SimRequest> {
        let total = request.options.iterations;
        let parts = (splits.max(1) as u64).min(total.max(1));
        let base = total / parts;
        let remainder = total % parts;
        let mut next = request.options.first_iteration;
        (0..parts)
            .map(|k| {
                let count = base + u64::from(k < remainder);
                let mut part = request.clone();
                part.request_id = format!("{}#{k}", request.request_id);
                part.options.iterations = count;
                part.options.first_iteration = next;
                next += count;
                part
            })
            .collect()
    }

    /// Validate, check the build, and claim the request id.
    fn prepare(&self, request: &SimRequest) -> Result<AbortSignal, HarnessError> {
        request.validate()?;
        build_encounter(&self.registry, request)?;
        self.aborts.register(&request.request_id)
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

fn execute(
    registry: &ContentRegistry,
    request: &SimRequest,
    splits: usize,
    signal: &AbortSignal,
    sink: Option<&ProgressSink>,
) -> Result<SimReport, HarnessError> {
    let started = Instant::now();
    let opts = &request.options;
    let parts = Harness::split_request(request, splits);
    let threads = (opts.worker_threads() / parts.len()).max(1);
    let tracker = ProgressTracker::new(
        &request.request_id,
        opts.iterations,
        opts.progress_interval,
        sink,
    );
    info!(
        request_id = %request.request_id,
        iterations = opts.iterations,
        splits = parts.len(),
        threads,
        "run started"
    );

    let outcome = if parts.len() == 1 {
        run_batch(registry, &parts[0], threads, signal, &tracker)?
    } else {
        let results: Vec<Result<BatchOutcome, HarnessError>> = thread::scope(|scope| {
            let handles: Vec<_> = parts
                .iter()
                .map(|part| {
                    let tracker = &tracker;
                    scope.spawn(move || run_batch(registry, part, threads, signal, tracker))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(HarnessError::WorkerPanicked("sub-batch thread panicked".to_owned()))
                    })
                })
                .collect()
        });
        let mut merged = BatchOutcome::default();
        for result in results {
            merged.merge(result?);
        }
        merged
    };

    let status = run_status(&outcome, signal);
    if status == RunStatus::Aborted {
        let seen = tracker.snapshot();
        warn!(
            request_id = %request.request_id,
            completed = seen.completed,
            total = seen.total,
            "run aborted"
        );
    }
    let report = SimReport {
        request_id: request.request_id.clone(),
        status,
        iterations_requested: opts.iterations,
        aggregate: outcome.aggregate,
        failures: outcome.failures,
        wall_time_secs: started.elapsed().as_secs_f64(),
    };
    info!(
        request_id = %report.request_id,
        status = ?report.status,
        completed = report.iterations_completed(),
        mean_dps = report.aggregate.raid_dps.mean(),
        wall_secs = report.wall_time_secs,
        "run finished"
    );
    Ok(report)
}

/// Status of a finished run. The signal is read again here so an abort
/// that lands after the workers last polled it still counts.
fn run_status(outcome: &BatchOutcome, signal: &AbortSignal) -> RunStatus {
    if outcome.aborted || signal.is_aborted() {
        RunStatus::Aborted
    } else if outcome.aggregate.failed > 0 {
        RunStatus::Partial {
            failed: outcome.aggregate.failed,
        }
    } else {
        RunStatus::Success
    }
}

/// Run one (sub-)request on its own rayon pool.
fn run_batch(
    registry: &ContentRegistry,
    request: &SimRequest,
    threads: usize,
    signal: &AbortSignal,
    tracker: &ProgressTracker<'_>,
) -> Result<BatchOutcome, HarnessError> {
    let opts = &request.options;
    let start = opts.first_iteration;
    let end = start + opts.iterations;
    let tasks = (threads * TASKS_PER_THREAD).min(opts.iterations as usize).max(1);
    let ranges = chunk_ranges(start..end, tasks);

    let pool = ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("raidsim-worker-{i}"))
        .build()
        .map_err(|e| HarnessError::WorkerPool(e.to_string()))?;

    let results: Vec<Result<BatchOutcome, HarnessError>> = pool.install(|| {
        ranges
            .into_par_iter()
            .map(|range| {
                panic::catch_unwind(AssertUnwindSafe(|| {
                    run_range(registry, request, range.clone(), signal, tracker)
                }))
                .unwrap_or_else(|_| {
                    signal.trigger();
                    Err(HarnessError::WorkerPanicked(format!(
                        "worker for iterations {range:?} panicked"
                    )))
                })
            })
            .collect()
    });

    let mut outcome = BatchOutcome::default();
    for result in results {
        outcome.merge(result?);
    }
    Ok(outcome)
}

fn run_range(
    registry: &ContentRegistry,
    request: &SimRequest,
    range: Range<u64>,
    signal: &AbortSignal,
    tracker: &ProgressTracker<'_>,
) -> Result<BatchOutcome, HarnessError> {
    let mut runner = TrialRunner::new(registry, request)?;
    let mut outcome = BatchOutcome::default();
    for iteration in range {
        if signal.is_aborted() {
            outcome.aborted = true;
            break;
        }
        match runner.run_trial(iteration) {
            Ok(result) => {
                outcome.aggregate.record(&result);
                tracker.record(Some(raid_dps(&result)));
            }
            Err(failure) => {
                error!(
                    iteration = failure.iteration,
                    seed = failure.seed,
                    panicked = failure.panicked,
                    error = %failure.message,
                    "trial failed"
                );
                outcome.aggregate.record_failure();
                if outcome.failures.len() < MAX_REPORTED_FAILURES {
                    outcome.failures.push(failure);
                }
                tracker.record(None);
            }
        }
    }
    Ok(outcome)
}

/// Split `range` into `parts` contiguous pieces, earlier pieces taking the
/// remainder.
fn chunk_ranges(range: Range<u64>, parts: usize) -> Vec<Range<u64>> {
    let len = range.end - range.start;
    let parts = (parts as u64).clamp(1, len.max(1));
    let base = len / parts;
    let remainder = len % parts;
    let mut next = range.start;
    (0..parts)
        .map(|k| {
            let size = base + u64::from(k < remainder);
            let piece = next..next + size;
            next += size;
            piece
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncounterConfig, PlayerConfig, SimOptions, TargetConfig};
    use raidsim_core::prelude::*;

    fn registry() -> ContentRegistry {
        let mut registry = ContentRegistry::new(RegistrationMode::FirstWins);
        registry.register_ability(ContentId::spell(1), |_, _| {
            SpellConfig::new(ContentId::spell(1), "Arcane Missile")
                .with_school(SpellSchool::Arcane)
                .with_effect(|sim, spell, target| {
                    let base = sim.roll_range(90.0, 110.0);
                    sim.calc_and_deal_damage(spell, target, base, OutcomeKind::MagicHitAndCrit)?;
                    Ok(())
                })
        });
        registry
    }

    fn request(id: &str, iterations: u64) -> SimRequest {
        SimRequest::new(id)
            .with_player(
                PlayerConfig::new("Mage")
                    .with_stat(Stat::SpellCrit, 10.0)
                    .with_rotation(vec![ContentId::spell(1)]),
            )
            .with_encounter(EncounterConfig::new(20.0).with_target(TargetConfig::new("Boss")))
            .with_options(
                SimOptions::default()
                    .with_iterations(iterations)
                    .with_seed(99)
                    .with_concurrency(2),
            )
    }

    // -- 1. Splitting -------------------------------------------------------

    #[test]
    fn split_covers_every_iteration_once() {
        let mut req = request("split", 10);
        req.options.first_iteration = 5;
        let parts = Harness::split_request(&req, 3);
        let spans: Vec<_> = parts
            .iter()
            .map(|p| (p.options.first_iteration, p.options.iterations))
            .collect();
        assert_eq!(spans, vec![(5, 4), (9, 3), (12, 3)]);
        assert_eq!(parts[1].request_id, "split#1");
        assert_eq!(Harness::split_request(&req, 50).len(), 10);
    }

    #[test]
    fn chunk_ranges_are_contiguous() {
        assert_eq!(chunk_ranges(0..7, 3), vec![0..3, 3..5, 5..7]);
        assert_eq!(chunk_ranges(4..6, 8), vec![4..5, 5..6]);
    }

    // -- 2. Runs ------------------------------------------------------------

    #[test]
    fn sync_run_succeeds_and_frees_id() {
        let harness = Harness::new(registry());
        let report = harness.run_sync(&request("sync", 16)).unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.aggregate.iterations, 16);
        assert!(report.aggregate.raid_dps.mean() > 0.0);
        assert!(!harness.aborts().is_running("sync"));
        assert!(harness.run_sync(&request("sync", 4)).is_ok());
    }

    #[test]
    fn one_trial_matches_batch_member() {
        let harness = Harness::new(registry());
        let req = request("one", 1);
        let single = harness.run_one_trial(&req, 0).unwrap().unwrap();
        let report = harness.run_sync(&req).unwrap();
        let mage = &report.aggregate.units["Mage"];
        assert_eq!(mage.damage.sum, single.unit("Mage").unwrap().damage_done);
    }

    #[test]
    fn setup_errors_surface_before_running() {
        let harness = Harness::new(registry());
        let mut req = request("bad", 4);
        req.players[0].rotation.push(ContentId::spell(77));
        assert!(matches!(harness.run_sync(&req), Err(HarnessError::Setup(_))));
        assert!(!harness.aborts().is_running("bad"));
    }

    #[test]
    fn async_run_delivers_one_final_update() {
        let harness = Harness::new(registry());
        let mut req = request("async", 20);
        req.options.progress_interval = 5;
        req.options.progress_buffer = 64;
        let handle = harness.run_async(req).unwrap();
        let updates: Vec<_> = handle.updates().iter().collect();
        let terminal: Vec<_> = updates.iter().filter(|u| u.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert!(matches!(updates.last(), Some(ProgressUpdate::Final(r)) if r.aggregate.iterations == 20));
    }

    #[test]
    fn late_abort_overrides_a_clean_outcome() {
        let signal = AbortSignal::detached();
        let mut outcome = BatchOutcome::default();
        assert_eq!(run_status(&outcome, &signal), RunStatus::Success);
        outcome.aggregate.record_failure();
        assert_eq!(run_status(&outcome, &signal), RunStatus::Partial { failed: 1 });

        signal.trigger();
        assert_eq!(run_status(&outcome, &signal), RunStatus::Aborted);
        assert_eq!(
            run_status(&BatchOutcome::default(), &signal),
            RunStatus::Aborted
        );
    }

    #[test]
    fn duplicate_ids_are_rejected_while_running() {
        let harness = Harness::new(registry());
        let _signal = harness.aborts().register("busy").unwrap();
        assert!(matches!(
            harness.run_sync(&request("busy", 2)),
            Err(HarnessError::DuplicateRequest(_))
        ));
    }
}
