//! Raidsim engine -- trial runner and concurrent Monte-Carlo harness.
//!
//! This crate builds on [`raidsim_core`] to run many independent trials of one
//! encounter and merge their metrics. A [`SimRequest`](config::SimRequest)
//! describes the players, the targets, and the run options; a
//! [`ContentRegistry`](raidsim_core::registry::ContentRegistry) supplies the
//! abilities and effects the players reference by id.
//!
//! Each worker owns a private [`TrialRunner`](trial::TrialRunner) built once
//! and reset between trials. Trial `i` is always seeded from
//! `(random_seed, i)`, so results do not depend on how iterations are split
//! across workers or sub-batches. Abort requests are checked between trials.
//!
//! # Quick Start
//!
//! ```
//! use raidsim_engine::prelude::*;
//!
//! let mut registry = ContentRegistry::new(RegistrationMode::FirstWins);
//! registry.register_ability(ContentId::spell(1), |_, _| {
//!     SpellConfig::new(ContentId::spell(1), "Shadow Bolt")
//!         .with_school(SpellSchool::Shadow)
//!         .with_effect(|sim, spell, target| {
//!             sim.calc_and_deal_damage(spell, target, 100.0, OutcomeKind::AlwaysHit)?;
//!             Ok(())
//!         })
//! });
//!
//! let request = SimRequest::new("quick-start")
//!     .with_player(
//!         PlayerConfig::new("Warlock")
//!             .with_ability(ContentId::spell(1))
//!             .with_rotation(vec![ContentId::spell(1)]),
//!     )
//!     .with_encounter(EncounterConfig::new(30.0).with_target(TargetConfig::new("Boss")))
//!     .with_options(SimOptions::default().with_iterations(8).with_concurrency(2));
//!
//! let harness = Harness::new(registry);
//! let report = harness.run_sync(&request).unwrap();
//! assert_eq!(report.status, RunStatus::Success);
//! assert_eq!(report.aggregate.iterations, 8);
//! ```

#![deny(unsafe_code)]

pub mod abort;
pub mod aggregate;
pub mod config;
pub mod harness;
pub mod progress;
pub mod rotation;
pub mod setup;
pub mod trial;

/// Re-export the core crate for convenience.
pub use raidsim_core;

use raidsim_core::SetupError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Submission-level failures. Individual trial failures are not errors at
/// this level: they are counted in the report.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The build or encounter failed validation.
    #[error("setup failed: {0}")]
    Setup(#[from] SetupError),

    /// The run options are unusable.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// A request with this id is already running.
    #[error("request '{0}' is already running")]
    DuplicateRequest(String),

    /// The worker pool could not be started.
    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),

    /// A worker thread died outside of trial code.
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for harness users.
pub mod prelude {
    pub use raidsim_core::prelude::*;

    pub use crate::abort::{AbortRegistry, AbortSignal};
    pub use crate::aggregate::{Aggregate, AuraAggregate, DistributionMetric, UnitAggregate};
    pub use crate::config::{
        EncounterConfig, PetConfig, PlayerConfig, SimOptions, SimRequest, TargetConfig,
        WeaponConfig,
    };
    pub use crate::harness::{Harness, RunHandle, RunStatus, SimReport};
    pub use crate::progress::{ProgressMetrics, ProgressUpdate};
    pub use crate::rotation::{PriorityRotation, RotationDecision, RotationDriver};
    pub use crate::setup::{build_encounter, Encounter};
    pub use crate::trial::{trial_seed, TrialFailure, TrialOutcome, TrialPhase, TrialRunner};
    pub use crate::HarnessError;
}
