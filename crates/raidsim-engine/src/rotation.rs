//! Pull-based rotation contract.
//!
//! The trial runner asks a unit's [`RotationDriver`] what to do whenever the
//! unit's rotation wake fires. The driver only reads the simulation; the
//! runner performs the cast and schedules the next wake.

use std::time::Duration;

use raidsim_core::sim::Simulation;
use raidsim_core::spell::SpellHandle;
use raidsim_core::unit::UnitId;

/// A driver's answer to "what next".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationDecision {
    /// Attempt this spell now.
    Cast { spell: SpellHandle, target: UnitId },
    /// Ask again at this absolute time.
    WaitUntil(Duration),
    /// Nothing to do; the runner polls again later.
    Idle,
}

/// Decides a unit's next action.
pub trait RotationDriver: Send {
    /// Called once per trial after reset, before the first decision.
    fn on_trial_start(&mut self, _sim: &Simulation, _unit: UnitId, _duration: Duration) {}

    fn next_action(&mut self, sim: &Simulation, unit: UnitId) -> RotationDecision;
}

/// Casts the first ready spell of a priority list.
///
/// Once the execute phase begins the execute list is tried first. The phase
/// starts when the current target's health fraction drops to the threshold,
/// or, against an unkillable target, when that fraction of the fight remains.
#[derive(Debug, Clone, Default)]
pub struct PriorityRotation {
    priorities: Vec<SpellHandle>,
    execute: Vec<SpellHandle>,
    execute_threshold: Option<f64>,
    duration: Duration,
}

impl PriorityRotation {
    pub fn new(priorities: Vec<SpellHandle>) -> Self {
        Self {
            priorities,
            ..Self::default()
        }
    }

    pub fn with_execute(mut self, execute: Vec<SpellHandle>, threshold: f64) -> Self {
        self.execute = execute;
        self.execute_threshold = Some(threshold);
        self
    }

    pub fn in_execute_phase(&self, sim: &Simulation, target: UnitId) -> bool {
        let Some(threshold) = self.execute_threshold else {
            return false;
        };
        match (sim.health(target), sim.max_health(target)) {
            (Some(health), Some(max)) if max > 0.0 => health / max <= threshold,
            _ => {
                let remaining = self.duration.saturating_sub(sim.current_time());
                !self.duration.is_zero()
                    && remaining.as_secs_f64() <= self.duration.as_secs_f64() * threshold
            }
        }
    }

    fn target_for(sim: &Simulation, unit: UnitId) -> Option<UnitId> {
        match sim.current_target(unit) {
            Some(t) if sim.is_alive(t) => Some(t),
            _ => sim.next_target(unit),
        }
    }
}

impl RotationDriver for PriorityRotation {
    fn on_trial_start(&mut self, _sim: &Simulation, _unit: UnitId, duration: Duration) {
        self.duration = duration;
    }

    fn next_action(&mut self, sim: &Simulation, unit: UnitId) -> RotationDecision {
        let now = sim.current_time();
        if sim.is_casting(unit) {
            return match sim.next_action_time(unit) {
                Ok(at) if at > now => RotationDecision::WaitUntil(at),
                _ => RotationDecision::Idle,
            };
        }
        let Some(target) = Self::target_for(sim, unit) else {
            return RotationDecision::Idle;
        };

        let execute: &[SpellHandle] = if self.in_execute_phase(sim, target) {
            &self.execute
        } else {
            &[]
        };
        let candidates = execute.iter().chain(self.priorities.iter()).copied();
        let mut earliest: Option<Duration> = None;
        for spell in candidates {
            if sim.can_cast(spell, target) {
                return RotationDecision::Cast { spell, target };
            }
            if let Ok(ready) = sim.spell_ready_at(spell) {
                if ready > now {
                    earliest = Some(earliest.map_or(ready, |e| e.min(ready)));
                }
            }
        }
        match earliest {
            Some(at) => RotationDecision::WaitUntil(at),
            None => RotationDecision::Idle,
        }
    }
}
