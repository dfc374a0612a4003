//! The per-worker trial state machine.
//!
//! ```text
//! Uninitialized -> Reset -> Running -> Completed
//!                                   \-> Aborted
//! ```
//!
//! A [`TrialRunner`] builds its encounter once and resets it before every
//! trial. Errors and panics inside a trial become a [`TrialFailure`] and
//! leave the runner usable for the next iteration.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use raidsim_core::clock::seconds;
use raidsim_core::metrics::TrialResult;
use raidsim_core::registry::ContentRegistry;
use raidsim_core::sim::Simulation;
use raidsim_core::unit::UnitId;
use raidsim_core::{SetupError, SimError, SimResult};

use crate::config::SimRequest;
use crate::rotation::{RotationDecision, RotationDriver};
use crate::setup::{build_encounter, Encounter};

/// Delay before asking an idle driver again.
pub const IDLE_POLL: Duration = Duration::from_millis(100);

/// Decisions one wake may make without time moving forward.
pub const MAX_DECISIONS_PER_WAKE: usize = 64;

/// Where a runner is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialPhase {
    Uninitialized,
    Reset,
    Running,
    Completed,
    Aborted,
}

/// A trial that ended in an engine or content error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("trial {iteration} (seed {seed:#x}) failed: {message}")]
pub struct TrialFailure {
    pub iteration: u64,
    pub seed: u64,
    pub message: String,
    /// The failure was a panic rather than a returned error.
    pub panicked: bool,
}

pub type TrialOutcome = Result<TrialResult, TrialFailure>;

/// Seed of trial `iteration` under base seed `base`. Independent of how
/// iterations are distributed across workers.
pub fn trial_seed(base: u64, iteration: u64) -> u64 {
    // splitmix64 finalizer over the stream position.
    let mut z = base.wrapping_add(iteration.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Runs trials of one encounter, one at a time.
#[derive(Debug)]
pub struct TrialRunner {
    encounter: Encounter,
    phase: TrialPhase,
    iteration: u64,
    seed: u64,
    end: Duration,
}

impl TrialRunner {
    pub fn new(registry: &ContentRegistry, request: &SimRequest) -> Result<Self, SetupError> {
        Ok(Self::from_encounter(build_encounter(registry, request)?))
    }

    pub fn from_encounter(encounter: Encounter) -> Self {
        Self {
            encounter,
            phase: TrialPhase::Uninitialized,
            iteration: 0,
            seed: 0,
            end: Duration::ZERO,
        }
    }

    pub fn phase(&self) -> TrialPhase {
        self.phase
    }

    pub fn simulation(&self) -> &Simulation {
        &self.encounter.sim
    }

    /// Iteration of the last reset.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Length of the current trial.
    pub fn end(&self) -> Duration {
        self.end
    }

    /// Restore trial-start state for `iteration`. The trial's length is the
    /// first random draw after the reset hooks.
    pub fn reset(&mut self, iteration: u64) -> SimResult<()> {
        let seed = trial_seed(self.encounter.base_seed, iteration);
        let Encounter {
            sim,
            drivers,
            duration,
            duration_variation,
            ..
        } = &mut self.encounter;
        sim.reset(seed)?;
        let base = duration.as_secs_f64();
        let spread = duration_variation.as_secs_f64();
        let end = seconds(sim.roll_range((base - spread).max(0.0), base + spread));
        for (unit, driver) in drivers.iter_mut() {
            driver.on_trial_start(sim, *unit, end);
            sim.request_wake(*unit, Duration::ZERO)?;
        }
        self.iteration = iteration;
        self.seed = seed;
        self.end = end;
        self.phase = TrialPhase::Reset;
        trace!(iteration, seed, end = ?end, "trial reset");
        Ok(())
    }

    /// Reset and run trial `iteration` to completion.
    pub fn run_trial(&mut self, iteration: u64) -> TrialOutcome {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_inner(iteration)));
        let seed = trial_seed(self.encounter.base_seed, iteration);
        let failure = |message: String, panicked: bool| TrialFailure {
            iteration,
            seed,
            message,
            panicked,
        };
        match outcome {
            Ok(Ok(result)) => {
                self.phase = TrialPhase::Completed;
                Ok(result)
            }
            Ok(Err(err)) => {
                self.phase = TrialPhase::Aborted;
                Err(failure(err.to_string(), false))
            }
            Err(payload) => {
                self.phase = TrialPhase::Aborted;
                Err(failure(panic_message(payload.as_ref()), true))
            }
        }
    }

    fn run_inner(&mut self, iteration: u64) -> SimResult<TrialResult> {
        self.reset(iteration)?;
        self.phase = TrialPhase::Running;
        let end = self.end;
        let Encounter {
            sim,
            drivers,
            validate,
            ..
        } = &mut self.encounter;
        sim.run_until_with(end, |sim, unit| {
            match drivers.iter_mut().find(|(u, _)| *u == unit) {
                Some((_, driver)) => drive(sim, driver.as_mut(), unit),
                None => Ok(()),
            }
        })?;
        sim.finish_trial(end)?;
        let result = sim.trial_result(iteration);
        if *validate {
            check_bookkeeping(sim, &result)?;
        }
        debug!(
            iteration,
            seed = self.seed,
            duration = result.duration_secs,
            events = result.events_processed,
            "trial completed"
        );
        Ok(result)
    }
}

/// Ask `driver` for decisions until one of them schedules the next wake.
fn drive(sim: &mut Simulation, driver: &mut dyn RotationDriver, unit: UnitId) -> SimResult<()> {
    for _ in 0..MAX_DECISIONS_PER_WAKE {
        let now = sim.current_time();
        match driver.next_action(sim, unit) {
            RotationDecision::Cast { spell, target } => {
                if !sim.cast(spell, target)? {
                    return sim.request_wake(unit, now + IDLE_POLL);
                }
                let next = sim.next_action_time(unit)?;
                if next > now {
                    return sim.request_wake(unit, next);
                }
            }
            RotationDecision::WaitUntil(at) if at > now => return sim.request_wake(unit, at),
            RotationDecision::WaitUntil(_) => {}
            RotationDecision::Idle => return sim.request_wake(unit, now + IDLE_POLL),
        }
    }
    Err(SimError::RotationStalled {
        unit,
        at: sim.current_time(),
    })
}

/// Every gained aura expired and every stat modifier was reverted.
fn check_bookkeeping(sim: &Simulation, result: &TrialResult) -> SimResult<()> {
    if let Some(aura) = result.auras.iter().find(|a| a.gains != a.expirations) {
        return Err(SimError::LeakedState(format!(
            "aura '{}' on {} gained {} times but expired {} times",
            aura.label, aura.unit, aura.gains, aura.expirations
        )));
    }
    for unit in sim.unit_ids() {
        let count = sim.modifier_count(unit);
        if count > 0 {
            return Err(SimError::LeakedState(format!(
                "unit {unit} still carries {count} stat modifiers"
            )));
        }
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic with non-string payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncounterConfig, PlayerConfig, TargetConfig};
    use raidsim_core::prelude::*;

    fn registry() -> ContentRegistry {
        let mut registry = ContentRegistry::new(RegistrationMode::FirstWins);
        registry.register_ability(ContentId::spell(1), |_, _| {
            SpellConfig::new(ContentId::spell(1), "Shadow Bolt")
                .with_school(SpellSchool::Shadow)
                .with_cast_time(Duration::from_millis(2500))
                .with_effect(|sim, spell, target| {
                    sim.calc_and_deal_damage(spell, target, 100.0, OutcomeKind::AlwaysHit)?;
                    Ok(())
                })
        });
        registry.register_ability(ContentId::spell(2), |_, _| {
            SpellConfig::new(ContentId::spell(2), "Broken")
                .with_effect(|_, _, _| Err(SimError::HookFailed("broken effect".to_owned())))
        });
        registry.register_ability(ContentId::spell(3), |_, _| {
            SpellConfig::new(ContentId::spell(3), "Panic").with_effect(|_, _, _| panic!("boom"))
        });
        // Buffs its caster and never takes the buff back.
        registry.register_ability(ContentId::spell(4), |_, _| {
            SpellConfig::new(ContentId::spell(4), "Leaky Ward").with_effect(|sim, spell, _| {
                let caster = sim.spell_caster(spell)?;
                sim.add_modifier(caster, Modifier::add(Stat::SpellPower, 10.0))?;
                Ok(())
            })
        });
        registry
    }

    fn request(rotation: ContentId, secs: f64) -> SimRequest {
        SimRequest::new("trial")
            .with_player(PlayerConfig::new("Warlock").with_rotation(vec![rotation]))
            .with_encounter(EncounterConfig::new(secs).with_target(TargetConfig::new("Boss")))
    }

    // -- 1. Lifecycle -------------------------------------------------------

    #[test]
    fn phases_follow_lifecycle() {
        let mut runner = TrialRunner::new(&registry(), &request(ContentId::spell(1), 10.0)).unwrap();
        assert_eq!(runner.phase(), TrialPhase::Uninitialized);
        runner.reset(0).unwrap();
        assert_eq!(runner.phase(), TrialPhase::Reset);
        let result = runner.run_trial(0).unwrap();
        assert_eq!(runner.phase(), TrialPhase::Completed);
        // Casts land at 2.5, 5, 7.5 and 10 s. The cast started at 10 s
        // never completes.
        let warlock = result.unit("Warlock").unwrap();
        assert_eq!(warlock.spell(ContentId::spell(1)).unwrap().casts, 5);
        assert_eq!(warlock.damage_done, 400.0);
        assert_eq!(result.duration_secs, 10.0);
    }

    #[test]
    fn runner_is_reusable_and_deterministic() {
        let mut runner = TrialRunner::new(&registry(), &request(ContentId::spell(1), 30.0)).unwrap();
        let a = runner.run_trial(3).unwrap();
        let _ = runner.run_trial(4).unwrap();
        let b = runner.run_trial(3).unwrap();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        assert_eq!(a.seed, trial_seed(0, 3));
    }

    // -- 2. Failures --------------------------------------------------------

    #[test]
    fn content_error_aborts_only_that_trial() {
        let mut runner = TrialRunner::new(&registry(), &request(ContentId::spell(2), 5.0)).unwrap();
        let failure = runner.run_trial(0).unwrap_err();
        assert_eq!(runner.phase(), TrialPhase::Aborted);
        assert!(!failure.panicked);
        assert!(failure.message.contains("broken effect"));
        // The runner recovers for the next iteration.
        runner.reset(1).unwrap();
        assert_eq!(runner.phase(), TrialPhase::Reset);
    }

    #[test]
    fn panics_become_failures() {
        let mut runner = TrialRunner::new(&registry(), &request(ContentId::spell(3), 5.0)).unwrap();
        let failure = runner.run_trial(0).unwrap_err();
        assert!(failure.panicked);
        assert!(failure.message.contains("boom"));
    }

    #[test]
    fn duration_variation_is_seeded() {
        let mut req = request(ContentId::spell(1), 60.0);
        req.encounter.duration_variation_secs = 10.0;
        let mut runner = TrialRunner::new(&registry(), &req).unwrap();
        let mut lengths = Vec::new();
        for i in 0..8 {
            runner.reset(i).unwrap();
            let end = runner.end().as_secs_f64();
            assert!((50.0..=70.0).contains(&end));
            lengths.push(end);
        }
        runner.reset(2).unwrap();
        assert_eq!(runner.end().as_secs_f64(), lengths[2]);
        assert!(lengths.iter().any(|&l| l != lengths[0]));
    }

    #[test]
    fn seeds_differ_per_iteration_and_base() {
        assert_ne!(trial_seed(0, 0), trial_seed(0, 1));
        assert_ne!(trial_seed(0, 1), trial_seed(1, 1));
        assert_eq!(trial_seed(42, 7), trial_seed(42, 7));
    }

    #[test]
    fn validation_mode_flags_leaked_modifiers() {
        let mut req = request(ContentId::spell(4), 5.0);
        let mut lenient = TrialRunner::new(&registry(), &req).unwrap();
        assert!(lenient.run_trial(0).is_ok());

        req.options.validation_mode = true;
        let mut strict = TrialRunner::new(&registry(), &req).unwrap();
        let failure = strict.run_trial(0).unwrap_err();
        assert!(failure.message.contains("stat modifiers"));

        let mut clean = request(ContentId::spell(1), 5.0);
        clean.options.validation_mode = true;
        let mut runner = TrialRunner::new(&registry(), &clean).unwrap();
        assert!(runner.run_trial(0).is_ok());
    }

    // -- 3. Driving ---------------------------------------------------------

    struct Stuck;

    impl RotationDriver for Stuck {
        fn next_action(&mut self, sim: &Simulation, _unit: UnitId) -> RotationDecision {
            RotationDecision::WaitUntil(sim.current_time())
        }
    }

    #[test]
    fn driver_that_never_advances_is_stalled() {
        let mut enc = build_encounter(&registry(), &request(ContentId::spell(1), 5.0)).unwrap();
        let unit = enc.drivers[0].0;
        enc.drivers[0].1 = Box::new(Stuck);
        let mut runner = TrialRunner::from_encounter(enc);
        let failure = runner.run_trial(0).unwrap_err();
        assert!(failure.message.contains("made no progress"));
        assert!(failure.message.contains(&unit.to_string()));
    }
}
