//! The [`Simulation`] context: one encounter's worth of units, auras, spells,
//! timers, and the event queue that drives them.
//!
//! A simulation is built once (units, spells, auras, hooks) and then replayed
//! any number of times. [`Simulation::reset`] restores trial-start state in
//! place without reallocating anything registered during setup; the arenas are
//! indexed by stable handles, so handles stay valid across trials.
//!
//! # Event loop
//!
//! [`Simulation::run_until`] pops due actions in `(time, sequence)` order,
//! advances the clock to each one, and dispatches it. Cancelled actions are
//! skipped by the queue. Scheduling an action before the current time is an
//! engine invariant violation and fails the trial.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use raidsim_core::prelude::*;
//!
//! let mut sim = Simulation::new();
//! let unit = sim.add_unit(UnitSpec::player("Rogue", 60)).unwrap();
//! sim.reset(42).unwrap();
//! sim.schedule_after(Duration::from_secs(2), move |sim| {
//!     sim.add_modifier(unit, Modifier::add(Stat::AttackPower, 100.0))?;
//!     Ok(())
//! })
//! .unwrap();
//! sim.run_until(Duration::from_secs(5)).unwrap();
//! assert_eq!(sim.stat(unit, Stat::AttackPower), 100.0);
//! assert_eq!(sim.current_time(), Duration::from_secs(5));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use tracing::{debug, trace};

use crate::attack_table::{AttackTable, Combatant};
use crate::auto_attack::WeaponSlot;
use crate::aura::{AuraEvent, AuraHandle, AuraSlot, HookTrigger};
use crate::clock::Clock;
use crate::dot::{DotHandle, DotSlot};
use crate::log::{CombatLog, LogKind};
use crate::metrics::{AuraMetrics, TrialResult};
use crate::queue::{ActionId, EventQueue};
use crate::spell::{SpellHandle, SpellSlot};
use crate::stats::{Modifier, ModifierToken, Stat, StatDependency};
use crate::timer::{Timer, TimerId};
use crate::unit::{Unit, UnitId, UnitKind, UnitSpec};
use crate::{SetupError, SimError, SimResult};

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// A one-shot callback scheduled by content.
pub(crate) type DelayedFn = Box<dyn FnOnce(&mut Simulation) -> SimResult<()> + Send>;

/// Payload of a queued event.
pub(crate) enum Action {
    AuraExpire { aura: AuraHandle, activation: u32 },
    DotTick { dot: DotHandle, generation: u32 },
    Swing { unit: UnitId, slot: WeaponSlot },
    CastComplete { spell: SpellHandle, target: UnitId },
    ResourceTick { unit: UnitId },
    /// Ask the unit's rotation what to do next.
    RotationWake { unit: UnitId },
    Delayed(DelayedFn),
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::AuraExpire { .. } => "aura_expire",
            Action::DotTick { .. } => "dot_tick",
            Action::Swing { .. } => "swing",
            Action::CastComplete { .. } => "cast_complete",
            Action::ResourceTick { .. } => "resource_tick",
            Action::RotationWake { .. } => "rotation_wake",
            Action::Delayed(_) => "delayed",
        }
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// All state of one encounter.
pub struct Simulation {
    pub(crate) clock: Clock,
    pub(crate) queue: EventQueue<Action>,
    pub(crate) rng: Pcg64Mcg,
    pub(crate) seed: u64,
    pub(crate) units: Vec<Unit>,
    pub(crate) auras: Vec<AuraSlot>,
    pub(crate) spells: Vec<SpellSlot>,
    pub(crate) dots: Vec<DotSlot>,
    pub(crate) dot_index: HashMap<(SpellHandle, UnitId), DotHandle>,
    pub(crate) timers: Vec<Timer>,
    /// Row-major `attacker * n + defender`.
    tables: Vec<AttackTable>,
    log: Option<CombatLog>,
    events_processed: u64,
    finished: bool,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("now", &self.clock.now())
            .field("seed", &self.seed)
            .field("units", &self.units.len())
            .field("auras", &self.auras.len())
            .field("spells", &self.spells.len())
            .field("pending", &self.queue.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Simulation {
    pub fn new() -> Self {
        Self {
            clock: Clock::new(),
            queue: EventQueue::new(),
            rng: Pcg64Mcg::seed_from_u64(0),
            seed: 0,
            units: Vec::new(),
            auras: Vec::new(),
            spells: Vec::new(),
            dots: Vec::new(),
            dot_index: HashMap::new(),
            timers: Vec::new(),
            tables: Vec::new(),
            log: None,
            events_processed: 0,
            finished: false,
        }
    }

    // -- Units -------------------------------------------------------------

    /// Add a unit. Names are unique; a pet's owner must already exist and be
    /// a player.
    pub fn add_unit(&mut self, spec: UnitSpec) -> Result<UnitId, SetupError> {
        if self.units.iter().any(|u| u.name == spec.name) {
            return Err(SetupError::DuplicateUnit(spec.name));
        }
        for weapon in [spec.main_hand, spec.off_hand, spec.ranged].into_iter().flatten() {
            weapon.validate(&spec.name)?;
        }
        if spec.off_hand.is_some() && spec.main_hand.is_none() {
            return Err(SetupError::InvalidWeapon {
                unit: spec.name,
                reason: "off-hand weapon without a main hand".to_owned(),
            });
        }
        let owner_name = match spec.kind {
            UnitKind::Pet { owner } => match self.units.get(owner.index()) {
                Some(o) if matches!(o.kind, UnitKind::Player) => Some(o.name.clone()),
                _ => {
                    return Err(SetupError::InvalidEncounter(format!(
                        "pet '{}' has no player owner {owner}",
                        spec.name
                    )))
                }
            },
            _ => None,
        };

        let id = UnitId(self.units.len() as u32);
        let gcd = self.new_timer();
        let mut unit = Unit::new(id, spec, gcd);
        unit.metrics.owner = owner_name;
        debug!(unit = %id, name = %unit.name, kind = ?unit.kind, "unit added");
        self.units.push(unit);
        self.rebuild_tables();
        Ok(id)
    }

    pub(crate) fn unit(&self, unit: UnitId) -> SimResult<&Unit> {
        self.units
            .get(unit.index())
            .ok_or(SimError::UnknownUnit(unit))
    }

    pub(crate) fn unit_mut(&mut self, unit: UnitId) -> SimResult<&mut Unit> {
        self.units
            .get_mut(unit.index())
            .ok_or(SimError::UnknownUnit(unit))
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Handles of every unit, in registration order.
    pub fn unit_ids(&self) -> impl Iterator<Item = UnitId> + '_ {
        self.units.iter().map(|u| u.id)
    }

    pub fn unit_by_name(&self, name: &str) -> Option<UnitId> {
        self.units.iter().find(|u| u.name == name).map(|u| u.id)
    }

    pub fn unit_name(&self, unit: UnitId) -> Option<&str> {
        self.units.get(unit.index()).map(|u| u.name.as_str())
    }

    pub fn unit_kind(&self, unit: UnitId) -> Option<UnitKind> {
        self.units.get(unit.index()).map(|u| u.kind)
    }

    pub fn unit_level(&self, unit: UnitId) -> Option<u32> {
        self.units.get(unit.index()).map(|u| u.level)
    }

    /// `false` for dead or unknown units.
    pub fn is_alive(&self, unit: UnitId) -> bool {
        self.units.get(unit.index()).is_some_and(Unit::is_alive)
    }

    /// Remaining health, `None` for unkillable units.
    pub fn health(&self, unit: UnitId) -> Option<f64> {
        let u = self.units.get(unit.index())?;
        u.max_health.map(|_| u.health)
    }

    pub fn max_health(&self, unit: UnitId) -> Option<f64> {
        self.units.get(unit.index()).and_then(|u| u.max_health)
    }

    /// Stat modifiers currently applied to `unit`.
    pub fn modifier_count(&self, unit: UnitId) -> usize {
        self.units
            .get(unit.index())
            .map_or(0, |u| u.stats.modifier_count())
    }

    /// Hostile units, in registration order.
    pub fn targets(&self) -> Vec<UnitId> {
        self.units
            .iter()
            .filter(|u| u.is_target())
            .map(|u| u.id)
            .collect()
    }

    pub fn current_target(&self, unit: UnitId) -> Option<UnitId> {
        self.units.get(unit.index()).and_then(|u| u.current_target)
    }

    /// Point `unit` at `target`. The choice also becomes the target `unit`
    /// starts every later trial on.
    pub fn set_current_target(&mut self, unit: UnitId, target: UnitId) -> SimResult<()> {
        self.unit(target)?;
        let u = self.unit_mut(unit)?;
        u.current_target = Some(target);
        u.start_target = Some(target);
        Ok(())
    }

    /// Move `unit` to its next live target for the rest of this trial.
    /// Returns the new target, `None` once every target is dead.
    pub fn retarget(&mut self, unit: UnitId) -> SimResult<Option<UnitId>> {
        let next = self.next_target(unit);
        let u = self.unit_mut(unit)?;
        if next.is_some() {
            u.current_target = next;
        }
        Ok(next)
    }

    /// The live target after `unit`'s current one in roster order, wrapping
    /// around. Falls back to the first live target.
    pub fn next_target(&self, unit: UnitId) -> Option<UnitId> {
        let live: Vec<UnitId> = self
            .units
            .iter()
            .filter(|u| u.is_target() && u.is_alive())
            .map(|u| u.id)
            .collect();
        match self.current_target(unit) {
            Some(current) => live
                .iter()
                .copied()
                .find(|&t| t > current)
                .or_else(|| live.first().copied()),
            None => live.first().copied(),
        }
    }

    // -- Stats -------------------------------------------------------------

    /// Effective value of `stat`; zero for unknown units.
    pub fn stat(&self, unit: UnitId, stat: Stat) -> f64 {
        self.units.get(unit.index()).map_or(0.0, |u| u.stats.get(stat))
    }

    pub fn add_modifier(&mut self, unit: UnitId, modifier: Modifier) -> SimResult<ModifierToken> {
        let token = self.unit_mut(unit)?.stats.apply(modifier);
        self.on_stats_changed(unit)?;
        Ok(token)
    }

    /// Revert a modifier by token. Unknown tokens are ignored.
    pub fn remove_modifier(&mut self, unit: UnitId, token: ModifierToken) -> SimResult<()> {
        if self.unit_mut(unit)?.stats.revert(token).is_some() {
            self.on_stats_changed(unit)?;
        }
        Ok(())
    }

    pub(crate) fn apply_modifiers(
        &mut self,
        unit: UnitId,
        modifiers: &[Modifier],
    ) -> SimResult<Vec<ModifierToken>> {
        if modifiers.is_empty() {
            return Ok(Vec::new());
        }
        let sheet = &mut self.unit_mut(unit)?.stats;
        let tokens = modifiers.iter().map(|&m| sheet.apply(m)).collect();
        self.on_stats_changed(unit)?;
        Ok(tokens)
    }

    pub(crate) fn remove_modifiers(&mut self, unit: UnitId, tokens: &[ModifierToken]) -> SimResult<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        let sheet = &mut self.unit_mut(unit)?.stats;
        for &token in tokens {
            sheet.revert(token);
        }
        self.on_stats_changed(unit)
    }

    /// Declare a derived stat on `unit`, e.g. attack power from strength.
    pub fn add_stat_dependency(&mut self, unit: UnitId, dep: StatDependency) -> Result<(), SetupError> {
        self.unit_mut(unit)?.stats.add_dependency(dep)?;
        self.on_stats_changed(unit)?;
        Ok(())
    }

    /// Attack table for `attacker` hitting `defender`, as of the latest stat
    /// change.
    pub fn attack_table(&self, attacker: UnitId, defender: UnitId) -> SimResult<AttackTable> {
        self.unit(attacker)?;
        self.unit(defender)?;
        Ok(self.tables[attacker.index() * self.units.len() + defender.index()])
    }

    fn combatant(unit: &Unit) -> Combatant {
        Combatant {
            level: unit.level,
            stats: *unit.stats.effective(),
            can_block: unit.can_block,
            can_parry: unit.can_parry,
            hostile: unit.is_target(),
        }
    }

    fn rebuild_tables(&mut self) {
        let combatants: Vec<Combatant> = self.units.iter().map(Self::combatant).collect();
        self.tables = combatants
            .iter()
            .flat_map(|a| combatants.iter().map(move |d| AttackTable::compute(a, d)))
            .collect();
    }

    /// Recompute every table involving `unit` and rescale its swing timers.
    fn on_stats_changed(&mut self, unit: UnitId) -> SimResult<()> {
        let n = self.units.len();
        let changed = Self::combatant(self.unit(unit)?);
        let i = unit.index();
        for other in 0..n {
            let theirs = Self::combatant(&self.units[other]);
            let (as_attacker, as_defender) = if other == i {
                (AttackTable::compute(&changed, &changed), None)
            } else {
                (
                    AttackTable::compute(&changed, &theirs),
                    Some(AttackTable::compute(&theirs, &changed)),
                )
            };
            self.tables[i * n + other] = as_attacker;
            if let Some(table) = as_defender {
                self.tables[other * n + i] = table;
            }
        }
        self.rescale_swings(unit)
    }

    // -- Timers ------------------------------------------------------------

    pub fn new_timer(&mut self) -> TimerId {
        let id = TimerId(self.timers.len() as u32);
        self.timers.push(Timer::default());
        id
    }

    pub fn timer_ready_at(&self, timer: TimerId) -> Duration {
        self.timers
            .get(timer.index())
            .map_or(Duration::ZERO, Timer::ready_at)
    }

    pub fn set_timer(&mut self, timer: TimerId, ready_at: Duration) {
        if let Some(t) = self.timers.get_mut(timer.index()) {
            t.set(ready_at);
        }
    }

    pub fn is_cooldown_ready(&self, timer: TimerId) -> bool {
        self.timers
            .get(timer.index())
            .map_or(true, |t| t.is_ready(self.clock.now()))
    }

    pub fn gcd_timer(&self, unit: UnitId) -> SimResult<TimerId> {
        Ok(self.unit(unit)?.gcd)
    }

    // -- Scheduling --------------------------------------------------------

    #[inline]
    pub fn current_time(&self) -> Duration {
        self.clock.now()
    }

    pub(crate) fn schedule_action(&mut self, at: Duration, action: Action) -> SimResult<ActionId> {
        let now = self.clock.now();
        if at < now {
            return Err(SimError::ScheduledInPast { at, now });
        }
        Ok(self.queue.schedule(at, action))
    }

    /// Run `f` at `at`.
    pub fn schedule_at<F>(&mut self, at: Duration, f: F) -> SimResult<ActionId>
    where
        F: FnOnce(&mut Simulation) -> SimResult<()> + Send + 'static,
    {
        self.schedule_action(at, Action::Delayed(Box::new(f)))
    }

    /// Run `f` after `delay`.
    pub fn schedule_after<F>(&mut self, delay: Duration, f: F) -> SimResult<ActionId>
    where
        F: FnOnce(&mut Simulation) -> SimResult<()> + Send + 'static,
    {
        let at = self.clock.now() + delay;
        self.schedule_at(at, f)
    }

    /// Cancel a pending action. Returns whether it was still pending.
    pub fn cancel_action(&mut self, id: ActionId) -> bool {
        self.queue.cancel(id)
    }

    /// Ask for `unit`'s rotation to be consulted at `at` (or now, if `at` has
    /// passed). Replaces any earlier request.
    pub fn request_wake(&mut self, unit: UnitId, at: Duration) -> SimResult<()> {
        let at = at.max(self.clock.now());
        if let Some(old) = self.unit_mut(unit)?.pending_wake.take() {
            self.queue.cancel(old);
        }
        let id = self.schedule_action(at, Action::RotationWake { unit })?;
        self.unit_mut(unit)?.pending_wake = Some(id);
        Ok(())
    }

    /// Whether `unit` has a rotation wake queued.
    pub fn has_pending_wake(&self, unit: UnitId) -> bool {
        self.units
            .get(unit.index())
            .and_then(|u| u.pending_wake)
            .is_some_and(|id| self.queue.is_pending(id))
    }

    /// Number of actions still queued, cancelled ones included.
    pub fn pending_actions(&self) -> usize {
        self.queue.len()
    }

    // -- Random numbers ----------------------------------------------------

    /// Uniform draw in `[0, 1)`.
    pub fn random_float(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Uniform draw in `[lo, hi)`; `lo` when the range is empty. Always
    /// consumes one draw.
    pub fn roll_range(&mut self, lo: f64, hi: f64) -> f64 {
        let r = self.random_float();
        if hi <= lo {
            lo
        } else {
            lo + (hi - lo) * r
        }
    }

    /// `true` with probability `chance`.
    pub fn proc(&mut self, chance: f64) -> bool {
        self.random_float() < chance
    }

    #[cfg(test)]
    pub(crate) fn rng_clone(&self) -> Pcg64Mcg {
        self.rng.clone()
    }

    // -- Trial lifecycle ---------------------------------------------------

    /// Restore trial-start state and seed the random stream. Runs every
    /// aura's `Reset` hooks in registration order, then starts auto-attacks
    /// and resource regeneration.
    pub fn reset(&mut self, seed: u64) -> SimResult<()> {
        self.clock.reset();
        self.queue.clear();
        self.rng = Pcg64Mcg::seed_from_u64(seed);
        self.seed = seed;
        self.events_processed = 0;
        self.finished = false;
        if let Some(log) = self.log.as_mut() {
            log.clear();
        }

        for timer in &mut self.timers {
            timer.reset();
        }
        for slot in &mut self.auras {
            slot.state.reset();
        }
        for slot in &mut self.spells {
            slot.reset();
        }
        for slot in &mut self.dots {
            slot.reset();
        }
        let owners: Vec<Option<String>> = self
            .units
            .iter()
            .map(|u| u.owner().and_then(|o| self.units.get(o.index())).map(|o| o.name.clone()))
            .collect();
        for (unit, owner) in self.units.iter_mut().zip(owners) {
            unit.reset(owner);
        }
        self.rebuild_tables();

        for i in 0..self.auras.len() {
            if self.auras[i].def.has_hook(HookTrigger::Reset) {
                self.dispatch_aura_event(AuraHandle(i as u32), &AuraEvent::Reset)?;
            }
        }
        for i in 0..self.units.len() {
            let unit = UnitId(i as u32);
            self.start_auto_attacks(unit)?;
            self.start_resource_ticks(unit)?;
        }
        debug!(seed, units = self.units.len(), "trial reset");
        Ok(())
    }

    /// Process every action due at or before `end`, then advance the clock to
    /// `end`. Stops early once every target is dead.
    pub fn run_until(&mut self, end: Duration) -> SimResult<()> {
        self.run_until_with(end, |_, _| Ok(()))
    }

    /// Like [`run_until`](Self::run_until), calling `on_wake` for every
    /// rotation wake that fires for a living unit.
    pub fn run_until_with<F>(&mut self, end: Duration, mut on_wake: F) -> SimResult<()>
    where
        F: FnMut(&mut Simulation, UnitId) -> SimResult<()>,
    {
        while !self.finished {
            let Some(scheduled) = self.queue.pop_due(end) else {
                break;
            };
            self.clock.advance_to(scheduled.at)?;
            self.events_processed += 1;
            trace!(
                at = ?scheduled.at,
                seq = scheduled.seq,
                kind = scheduled.action.name(),
                "event"
            );
            self.dispatch(scheduled.action, &mut on_wake)?;
        }
        if !self.finished && end > self.clock.now() {
            self.clock.advance_to(end)?;
        }
        Ok(())
    }

    fn dispatch<F>(&mut self, action: Action, on_wake: &mut F) -> SimResult<()>
    where
        F: FnMut(&mut Simulation, UnitId) -> SimResult<()>,
    {
        match action {
            Action::AuraExpire { aura, activation } => self.expire_aura(aura, activation),
            Action::DotTick { dot, generation } => self.tick_dot(dot, generation),
            Action::Swing { unit, slot } => self.swing(unit, slot),
            Action::CastComplete { spell, target } => self.complete_cast(spell, target),
            Action::ResourceTick { unit } => self.resource_tick(unit),
            Action::RotationWake { unit } => {
                self.unit_mut(unit)?.pending_wake = None;
                if self.is_alive(unit) {
                    on_wake(self, unit)
                } else {
                    Ok(())
                }
            }
            Action::Delayed(f) => f(self),
        }
    }

    /// End the trial at `end`: advance the clock (unless the fight already
    /// ended), then deactivate every active aura so expire hooks run and
    /// modifiers are reverted.
    pub fn finish_trial(&mut self, end: Duration) -> SimResult<()> {
        if !self.finished && end > self.clock.now() {
            self.clock.advance_to(end)?;
        }
        self.expire_all_auras()?;
        self.finished = true;
        debug!(
            seed = self.seed,
            at = ?self.clock.now(),
            events = self.events_processed,
            "trial finished"
        );
        Ok(())
    }

    /// Whether the trial has ended, by death of every target or
    /// [`finish_trial`](Self::finish_trial).
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// Bookkeeping once `unit`'s health reached zero.
    pub(crate) fn on_unit_died(&mut self, unit: UnitId) {
        let now = self.clock.now();
        if let Some(u) = self.units.get_mut(unit.index()) {
            u.metrics.died_at_secs = Some(now.as_secs_f64());
            debug!(unit = %unit, name = %u.name, at = ?now, "unit died");
        }
        self.log_event(LogKind::Death { unit });
        let any_target = self.units.iter().any(Unit::is_target);
        if any_target && self.units.iter().filter(|u| u.is_target()).all(|u| !u.is_alive()) {
            self.finished = true;
            return;
        }

        let next = self
            .units
            .iter()
            .filter(|u| u.is_target() && u.is_alive())
            .map(|u| u.id)
            .find(|&t| t > unit)
            .or_else(|| {
                self.units
                    .iter()
                    .find(|u| u.is_target() && u.is_alive())
                    .map(|u| u.id)
            });
        for attacker in self.units.iter_mut() {
            if !attacker.is_target() && attacker.current_target == Some(unit) {
                attacker.current_target = next;
            }
        }
    }

    // -- Log and results ---------------------------------------------------

    /// Record entries for every subsequent trial.
    pub fn enable_log(&mut self) {
        if self.log.is_none() {
            self.log = Some(CombatLog::new());
        }
    }

    pub fn log(&self) -> Option<&CombatLog> {
        self.log.as_ref()
    }

    pub(crate) fn log_event(&mut self, kind: LogKind) {
        let now = self.clock.now();
        if let Some(log) = self.log.as_mut() {
            log.push(now, kind);
        }
    }

    /// Snapshot this trial's metrics.
    pub fn trial_result(&self, iteration: u64) -> TrialResult {
        let now = self.clock.now();
        let units = self.units.iter().map(|u| u.metrics.clone()).collect();
        let auras = self
            .auras
            .iter()
            .filter(|slot| slot.state.gains > 0)
            .map(|slot| {
                let mut uptime = slot.state.uptime;
                if slot.state.active {
                    uptime += now.saturating_sub(slot.state.started_at);
                }
                AuraMetrics {
                    unit: self
                        .units
                        .get(slot.unit.index())
                        .map(|u| u.name.clone())
                        .unwrap_or_default(),
                    label: slot.def.label.clone(),
                    gains: slot.state.gains,
                    expirations: slot.state.expirations,
                    refreshes: slot.state.refreshes,
                    uptime_secs: uptime.as_secs_f64(),
                }
            })
            .collect();
        TrialResult {
            iteration,
            seed: self.seed,
            duration_secs: now.as_secs_f64(),
            events_processed: self.events_processed,
            units,
            auras,
        }
    }
}
