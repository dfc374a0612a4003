//! Raidsim core -- the discrete-event combat engine for a single trial.
//!
//! This crate owns everything that happens *inside* one simulated encounter:
//! the clock and event queue, per-unit timers and cooldowns, stat sheets with
//! token-based modifiers, auras with ordered lifecycle/combat hooks, spells
//! with periodic (dot/hot) effects, auto-attack swing timers, resources, and
//! the per-trial metrics that are handed to the harness when the trial ends.
//!
//! All of it is driven by one [`Simulation`](sim::Simulation) value that is
//! built once, then reset and replayed for every trial. A trial never touches
//! another thread: determinism follows from the `(time, sequence)` total order
//! of the event queue, the registration order of aura hooks, and a single
//! seeded PRNG stream.
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//! use raidsim_core::prelude::*;
//!
//! let mut sim = Simulation::new();
//! let boss = sim.add_unit(UnitSpec::target("Boss", 63)).unwrap();
//! let mage = sim.add_unit(UnitSpec::player("Mage", 60)).unwrap();
//! sim.set_current_target(mage, boss).unwrap();
//!
//! let fireball = sim
//!     .register_spell(
//!         mage,
//!         SpellConfig::new(ContentId::spell(133), "Fireball")
//!             .with_school(SpellSchool::Fire)
//!             .with_effect(|sim, spell, target| {
//!                 sim.calc_and_deal_damage(spell, target, 500.0, OutcomeKind::AlwaysHit)?;
//!                 Ok(())
//!             }),
//!     )
//!     .unwrap();
//!
//! sim.reset(7).unwrap();
//! assert!(sim.cast(fireball, boss).unwrap());
//! sim.run_until(Duration::from_secs(10)).unwrap();
//! sim.finish_trial(Duration::from_secs(10)).unwrap();
//!
//! let result = sim.trial_result(0);
//! assert_eq!(result.unit("Mage").unwrap().damage_done, 500.0);
//! ```

#![deny(unsafe_code)]

pub mod attack_table;
pub mod aura;
pub mod auto_attack;
pub mod clock;
pub mod dot;
pub mod log;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod resource;
pub mod sim;
pub mod spell;
pub mod stats;
pub mod timer;
pub mod unit;

use std::time::Duration;

use crate::aura::AuraHandle;
use crate::spell::{ContentId, SpellHandle};
use crate::stats::Stat;
use crate::unit::{ResourceKind, UnitId};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Engine or content invariant violations raised while a trial is running.
///
/// Every variant is fatal to the trial that raised it and to nothing else:
/// the harness records the failure and keeps sibling trials going.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// An action was scheduled strictly before the current simulation time.
    #[error("action scheduled at {at:?} is before current time {now:?}")]
    ScheduledInPast { at: Duration, now: Duration },

    /// An expiration fired for an aura that was not active.
    #[error("aura '{label}' expired while already inactive")]
    DoubleExpire { label: String },

    /// A resource deduction found less than validation promised.
    #[error("unit {unit} cannot pay {amount} {kind:?} (has {available})")]
    InsufficientResource {
        unit: UnitId,
        kind: ResourceKind,
        amount: f64,
        available: f64,
    },

    /// A unit handle does not refer to a unit of this simulation.
    #[error("unknown unit {0}")]
    UnknownUnit(UnitId),

    /// A spell handle does not refer to a spell of this simulation.
    #[error("unknown spell {0:?}")]
    UnknownSpell(SpellHandle),

    /// An aura handle does not refer to an aura of this simulation.
    #[error("unknown aura {0:?}")]
    UnknownAura(AuraHandle),

    /// The unit has no resource pool of the requested kind.
    #[error("unit {unit} has no {kind:?} pool")]
    NoResourcePool { unit: UnitId, kind: ResourceKind },

    /// A rotation driver kept answering without letting time advance.
    #[error("rotation for unit {unit} made no progress at {at:?}")]
    RotationStalled { unit: UnitId, at: Duration },

    /// A content hook or effect callback reported its own failure.
    #[error("content hook failed: {0}")]
    HookFailed(String),

    /// End-of-trial state check failed in validation mode.
    #[error("trial left inconsistent state: {0}")]
    LeakedState(String),
}

/// Convenience alias used throughout the engine.
pub type SimResult<T> = Result<T, SimError>;

/// Validation failures detected while building a simulation, before any
/// trial runs.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// A build referenced an ability or effect id nobody registered.
    #[error("unknown content id {0}")]
    UnknownContent(ContentId),

    /// Two units share a name.
    #[error("duplicate unit name '{0}'")]
    DuplicateUnit(String),

    /// Stat dependencies must flow from earlier to later stats.
    #[error("stat {target:?} cannot derive from {source_stat:?}")]
    InvalidStatDependency { source_stat: Stat, target: Stat },

    /// A weapon definition is unusable.
    #[error("invalid weapon on unit '{unit}': {reason}")]
    InvalidWeapon { unit: String, reason: String },

    /// The encounter description is unusable.
    #[error("invalid encounter: {0}")]
    InvalidEncounter(String),

    /// A setup callback failed while registering content.
    #[error("setup callback failed: {0}")]
    Sim(#[from] SimError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for content and harness code.
pub mod prelude {
    pub use crate::attack_table::{AttackTable, HitOutcome};
    pub use crate::aura::{
        AuraCallback, AuraDefinition, AuraDuration, AuraEvent, AuraHandle, AuraHook, HookTrigger,
        RefreshPolicy,
    };
    pub use crate::auto_attack::{Weapon, WeaponSlot};
    pub use crate::dot::{DotConfig, DotHandle, DotRefresh, PeriodicKind, TickPolicy};
    pub use crate::log::{CombatLog, LogEntry, LogKind};
    pub use crate::metrics::{AuraMetrics, SpellMetrics, TrialResult, UnitMetrics};
    pub use crate::queue::{ActionId, EventQueue};
    pub use crate::registry::{ContentRegistry, RegistrationMode};
    pub use crate::sim::Simulation;
    pub use crate::spell::{
        CastConfig, ContentId, CostModel, DefenseType, OutcomeKind, SharedCooldown, SpellConfig,
        SpellFlags, SpellHandle, SpellResult, SpellSchool,
    };
    pub use crate::stats::{Modifier, ModifierKind, ModifierToken, Stat, StatBlock, StatDependency};
    pub use crate::timer::{Cooldown, TimerId};
    pub use crate::unit::{ResourceKind, ResourceSpec, UnitId, UnitKind, UnitSpec};
    pub use crate::{SetupError, SimError, SimResult};
}
