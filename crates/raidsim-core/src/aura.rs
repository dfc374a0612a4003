//! Auras: named, timed, optionally stacking states attached to a unit.
//!
//! An aura is registered once per unit (get-or-register by label) and then
//! activated and deactivated any number of times across trials. Its
//! [`AuraDefinition`] is shared and immutable during a trial; its runtime
//! state lives in the simulation's aura arena and is reset between trials.
//!
//! # Lifecycle
//!
//! ```text
//! inactive --activate--> active --deactivate / expire / stacks->0--> inactive
//!                          |  ^
//!                          +--+ refresh (policy), set_stacks
//! ```
//!
//! Activation applies the aura's stat modifiers, schedules its expiration,
//! and runs `Gain` hooks. Deactivation marks the aura inactive first, then
//! cancels the pending expiration, reverts the modifiers, and runs `Expire`
//! hooks, so a hook that re-enters `deactivate_aura` is a no-op and the expire
//! hooks run exactly once per activation.
//!
//! Hooks run in the order they were attached. Combat-event hooks (hits dealt
//! or taken, cast completions, periodic ticks) only run on auras that are
//! active at the moment the hook would be called.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::dot::DotHandle;
use crate::log::LogKind;
use crate::queue::ActionId;
use crate::sim::{Action, Simulation};
use crate::spell::{ContentId, SpellHandle, SpellResult};
use crate::stats::{Modifier, ModifierToken};
use crate::unit::UnitId;
use crate::{SimError, SimResult};

// ---------------------------------------------------------------------------
// Handles and policies
// ---------------------------------------------------------------------------

/// Index of an aura in its simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AuraHandle(pub(crate) u32);

impl AuraHandle {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// How long an activation lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuraDuration {
    Finite(Duration),
    /// Lasts until deactivated or the trial ends.
    Permanent,
}

/// What re-activating an already active aura does to its expiration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPolicy {
    /// Expire one full duration from now.
    #[default]
    Replace,
    /// Add one full duration to the remaining time.
    Extend,
    /// Leave the expiration alone.
    KeepExisting,
}

/// Which event a hook listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookTrigger {
    Gain,
    Expire,
    StacksChanged,
    /// Encounter start, before any action runs.
    Reset,
    /// The aura's owner landed (or failed to land) a hit.
    HitDealt,
    /// The aura's owner was hit.
    HitTaken,
    /// The aura's owner finished casting a spell.
    CastComplete,
    /// A periodic effect cast by the aura's owner ticked.
    PeriodicTick,
}

/// Payload handed to hooks.
#[derive(Debug, Clone, Copy)]
pub enum AuraEvent<'a> {
    Gain,
    Expire,
    StacksChanged { old: u32, new: u32 },
    Reset,
    HitDealt(&'a SpellResult),
    HitTaken(&'a SpellResult),
    CastComplete { spell: SpellHandle, target: UnitId },
    PeriodicTick(&'a SpellResult),
}

impl AuraEvent<'_> {
    pub fn trigger(&self) -> HookTrigger {
        match self {
            AuraEvent::Gain => HookTrigger::Gain,
            AuraEvent::Expire => HookTrigger::Expire,
            AuraEvent::StacksChanged { .. } => HookTrigger::StacksChanged,
            AuraEvent::Reset => HookTrigger::Reset,
            AuraEvent::HitDealt(_) => HookTrigger::HitDealt,
            AuraEvent::HitTaken(_) => HookTrigger::HitTaken,
            AuraEvent::CastComplete { .. } => HookTrigger::CastComplete,
            AuraEvent::PeriodicTick(_) => HookTrigger::PeriodicTick,
        }
    }

    /// Lifecycle events run regardless of whether the aura is active.
    fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            AuraEvent::Gain | AuraEvent::Expire | AuraEvent::Reset | AuraEvent::StacksChanged { .. }
        )
    }
}

/// Hook body. Receives the simulation, the aura the hook is attached to, and
/// the triggering event.
pub type AuraCallback =
    Arc<dyn Fn(&mut Simulation, AuraHandle, &AuraEvent<'_>) -> SimResult<()> + Send + Sync>;

/// A trigger plus the callback it runs.
#[derive(Clone)]
pub struct AuraHook {
    pub trigger: HookTrigger,
    pub callback: AuraCallback,
}

impl fmt::Debug for AuraHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuraHook")
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// AuraDefinition
// ---------------------------------------------------------------------------

/// Immutable description of an aura.
#[derive(Debug, Clone)]
pub struct AuraDefinition {
    /// Unique per unit.
    pub label: String,
    pub id: Option<ContentId>,
    pub duration: AuraDuration,
    /// Always at least one; an active aura has between 1 and `max_stacks`.
    pub max_stacks: u32,
    pub refresh: RefreshPolicy,
    /// Applied while active.
    pub modifiers: Vec<Modifier>,
    /// Applied once per stack while active.
    pub stack_modifiers: Vec<Modifier>,
    pub hooks: Vec<AuraHook>,
    /// Expiration is driven by a periodic effect instead of a queued action.
    pub(crate) managed_expiry: bool,
}

impl AuraDefinition {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            id: None,
            duration: AuraDuration::Permanent,
            max_stacks: 1,
            refresh: RefreshPolicy::Replace,
            modifiers: Vec::new(),
            stack_modifiers: Vec::new(),
            hooks: Vec::new(),
            managed_expiry: false,
        }
    }

    pub fn with_id(mut self, id: ContentId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = AuraDuration::Finite(duration);
        self
    }

    pub fn permanent(mut self) -> Self {
        self.duration = AuraDuration::Permanent;
        self
    }

    pub fn with_max_stacks(mut self, max_stacks: u32) -> Self {
        self.max_stacks = max_stacks.max(1);
        self
    }

    pub fn with_refresh(mut self, refresh: RefreshPolicy) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn with_modifier(mut self, modifier: Modifier) -> Self {
        self.modifiers.push(modifier);
        self
    }

    pub fn with_stack_modifier(mut self, modifier: Modifier) -> Self {
        self.stack_modifiers.push(modifier);
        self
    }

    /// Attach a hook. Hooks for the same trigger run in attachment order.
    pub fn on<F>(mut self, trigger: HookTrigger, callback: F) -> Self
    where
        F: Fn(&mut Simulation, AuraHandle, &AuraEvent<'_>) -> SimResult<()> + Send + Sync + 'static,
    {
        self.hooks.push(AuraHook {
            trigger,
            callback: Arc::new(callback),
        });
        self
    }

    pub(crate) fn has_hook(&self, trigger: HookTrigger) -> bool {
        self.hooks.iter().any(|h| h.trigger == trigger)
    }
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct AuraState {
    pub active: bool,
    pub stacks: u32,
    /// Bumped on every activation; pending expirations carry the value they
    /// were scheduled under.
    pub activation: u32,
    pub started_at: Duration,
    pub expires_at: Option<Duration>,
    pub expire_action: Option<ActionId>,
    pub tokens: Vec<ModifierToken>,
    pub stack_tokens: Vec<ModifierToken>,
    pub gains: u32,
    pub expirations: u32,
    pub refreshes: u32,
    pub uptime: Duration,
}

impl AuraState {
    pub fn reset(&mut self) {
        *self = Self {
            tokens: std::mem::take(&mut self.tokens),
            stack_tokens: std::mem::take(&mut self.stack_tokens),
            ..Self::default()
        };
        self.tokens.clear();
        self.stack_tokens.clear();
    }
}

pub(crate) struct AuraSlot {
    pub def: Arc<AuraDefinition>,
    pub unit: UnitId,
    pub state: AuraState,
    /// Set when the aura tracks a periodic effect.
    pub dot: Option<DotHandle>,
}

// ---------------------------------------------------------------------------
// Simulation: aura operations
// ---------------------------------------------------------------------------

impl Simulation {
    pub(crate) fn aura_slot(&self, aura: AuraHandle) -> SimResult<&AuraSlot> {
        self.auras
            .get(aura.index())
            .ok_or(SimError::UnknownAura(aura))
    }

    pub(crate) fn aura_slot_mut(&mut self, aura: AuraHandle) -> SimResult<&mut AuraSlot> {
        self.auras
            .get_mut(aura.index())
            .ok_or(SimError::UnknownAura(aura))
    }

    /// Return the unit's aura labelled `def.label`, registering `def` if the
    /// label is new. An existing registration always wins.
    pub fn get_or_register_aura(
        &mut self,
        unit: UnitId,
        def: AuraDefinition,
    ) -> SimResult<AuraHandle> {
        if let Some(&existing) = self.unit(unit)?.aura_labels.get(&def.label) {
            return Ok(existing);
        }
        let handle = AuraHandle(self.auras.len() as u32);
        debug!(unit = %unit, label = %def.label, "registered aura");
        let owner = self.unit_mut(unit)?;
        owner.auras.push(handle);
        owner.aura_labels.insert(def.label.clone(), handle);
        self.auras.push(AuraSlot {
            def: Arc::new(def),
            unit,
            state: AuraState::default(),
            dot: None,
        });
        Ok(handle)
    }

    /// Look up a unit's aura by label.
    pub fn aura(&self, unit: UnitId, label: &str) -> Option<AuraHandle> {
        self.units
            .get(unit.index())
            .and_then(|u| u.aura_labels.get(label).copied())
    }

    /// Attach a hook to an already registered aura. Hooks persist across
    /// trials, so this belongs in setup code.
    pub fn add_aura_hook<F>(&mut self, aura: AuraHandle, trigger: HookTrigger, callback: F) -> SimResult<()>
    where
        F: Fn(&mut Simulation, AuraHandle, &AuraEvent<'_>) -> SimResult<()> + Send + Sync + 'static,
    {
        let slot = self.aura_slot_mut(aura)?;
        Arc::make_mut(&mut slot.def).hooks.push(AuraHook {
            trigger,
            callback: Arc::new(callback),
        });
        Ok(())
    }

    pub fn aura_is_active(&self, aura: AuraHandle) -> bool {
        self.auras
            .get(aura.index())
            .is_some_and(|s| s.state.active)
    }

    pub fn aura_stacks(&self, aura: AuraHandle) -> u32 {
        self.auras.get(aura.index()).map_or(0, |s| s.state.stacks)
    }

    pub fn aura_label(&self, aura: AuraHandle) -> Option<&str> {
        self.auras.get(aura.index()).map(|s| s.def.label.as_str())
    }

    pub fn aura_owner(&self, aura: AuraHandle) -> Option<UnitId> {
        self.auras.get(aura.index()).map(|s| s.unit)
    }

    /// When the current activation ends; `None` if inactive or permanent.
    pub fn aura_expires_at(&self, aura: AuraHandle) -> Option<Duration> {
        self.auras
            .get(aura.index())
            .filter(|s| s.state.active)
            .and_then(|s| s.state.expires_at)
    }

    /// Remaining time of the current activation, zero if inactive.
    pub fn aura_remaining(&self, aura: AuraHandle) -> Duration {
        match self.auras.get(aura.index()) {
            Some(s) if s.state.active => s
                .state
                .expires_at
                .map_or(Duration::MAX, |at| at.saturating_sub(self.current_time())),
            _ => Duration::ZERO,
        }
    }

    /// Number of activations of `aura` so far this trial.
    pub fn aura_gains(&self, aura: AuraHandle) -> u32 {
        self.auras.get(aura.index()).map_or(0, |s| s.state.gains)
    }

    /// Number of deactivations of `aura` so far this trial.
    pub fn aura_expirations(&self, aura: AuraHandle) -> u32 {
        self.auras.get(aura.index()).map_or(0, |s| s.state.expirations)
    }

    /// Activate `aura`, or refresh it per its policy if already active.
    pub fn activate_aura(&mut self, aura: AuraHandle) -> SimResult<()> {
        let now = self.current_time();
        let slot = self.aura_slot_mut(aura)?;
        if slot.state.active {
            return self.refresh_active(aura);
        }

        slot.state.active = true;
        slot.state.activation = slot.state.activation.wrapping_add(1);
        slot.state.started_at = now;
        slot.state.stacks = 1;
        slot.state.gains += 1;
        let activation = slot.state.activation;
        let unit = slot.unit;
        let def = Arc::clone(&slot.def);

        let expires_at = match def.duration {
            AuraDuration::Finite(d) => Some(now + d),
            AuraDuration::Permanent => None,
        };
        self.auras[aura.index()].state.expires_at = expires_at;
        if let (Some(at), false) = (expires_at, def.managed_expiry) {
            let id = self.schedule_action(at, Action::AuraExpire { aura, activation })?;
            self.auras[aura.index()].state.expire_action = Some(id);
        }

        if !def.modifiers.is_empty() {
            let tokens = self.apply_modifiers(unit, &def.modifiers)?;
            self.auras[aura.index()].state.tokens = tokens;
        }
        if !def.stack_modifiers.is_empty() {
            let scaled: Vec<Modifier> = def.stack_modifiers.iter().map(|m| m.scaled(1)).collect();
            let tokens = self.apply_modifiers(unit, &scaled)?;
            self.auras[aura.index()].state.stack_tokens = tokens;
        }

        trace!(unit = %unit, label = %def.label, at = ?now, "aura gained");
        self.log_event(LogKind::AuraGained {
            unit,
            label: def.label.clone(),
        });
        self.dispatch_aura_event(aura, &AuraEvent::Gain)
    }

    /// Explicitly refresh `aura`: applies the refresh policy when active and
    /// activates it otherwise.
    pub fn refresh_aura(&mut self, aura: AuraHandle) -> SimResult<()> {
        self.activate_aura(aura)
    }

    fn refresh_active(&mut self, aura: AuraHandle) -> SimResult<()> {
        let now = self.current_time();
        let slot = self.aura_slot_mut(aura)?;
        slot.state.refreshes += 1;
        let AuraDuration::Finite(duration) = slot.def.duration else {
            return Ok(());
        };
        if slot.def.managed_expiry {
            return Ok(());
        }
        let new_expiry = match slot.def.refresh {
            RefreshPolicy::Replace => now + duration,
            RefreshPolicy::Extend => slot.state.expires_at.unwrap_or(now) + duration,
            RefreshPolicy::KeepExisting => return Ok(()),
        };
        let activation = slot.state.activation;
        let old = slot.state.expire_action.take();
        slot.state.expires_at = Some(new_expiry);
        if let Some(id) = old {
            self.queue.cancel(id);
        }
        let id = self.schedule_action(new_expiry, Action::AuraExpire { aura, activation })?;
        self.auras[aura.index()].state.expire_action = Some(id);
        Ok(())
    }

    /// Deactivate `aura`. Deactivating an inactive aura is a no-op.
    pub fn deactivate_aura(&mut self, aura: AuraHandle) -> SimResult<()> {
        let now = self.current_time();
        let slot = self.aura_slot_mut(aura)?;
        if !slot.state.active {
            return Ok(());
        }
        slot.state.active = false;
        slot.state.stacks = 0;
        slot.state.expires_at = None;
        slot.state.expirations += 1;
        slot.state.uptime += now.saturating_sub(slot.state.started_at);
        let expire_action = slot.state.expire_action.take();
        let mut tokens = std::mem::take(&mut slot.state.tokens);
        tokens.append(&mut slot.state.stack_tokens);
        let unit = slot.unit;
        let dot = slot.dot;
        let label = slot.def.label.clone();

        if let Some(id) = expire_action {
            self.queue.cancel(id);
        }
        if let Some(dot) = dot {
            self.stop_dot(dot);
        }
        self.remove_modifiers(unit, &tokens)?;

        trace!(unit = %unit, label = %label, at = ?now, "aura expired");
        self.log_event(LogKind::AuraExpired { unit, label });
        self.dispatch_aura_event(aura, &AuraEvent::Expire)
    }

    /// Set the stack count, clamped to `[0, max_stacks]`. Setting a positive
    /// count on an inactive aura activates it; reaching zero deactivates it.
    pub fn set_stacks(&mut self, aura: AuraHandle, stacks: u32) -> SimResult<()> {
        let slot = self.aura_slot(aura)?;
        let target = stacks.min(slot.def.max_stacks);
        if !slot.state.active {
            if target == 0 {
                return Ok(());
            }
            self.activate_aura(aura)?;
            if !self.aura_is_active(aura) {
                return Ok(());
            }
        }
        if target == 0 {
            return self.deactivate_aura(aura);
        }

        let slot = self.aura_slot_mut(aura)?;
        let old = slot.state.stacks;
        if old == target {
            return Ok(());
        }
        slot.state.stacks = target;
        let old_tokens = std::mem::take(&mut slot.state.stack_tokens);
        let unit = slot.unit;
        let def = Arc::clone(&slot.def);

        if !def.stack_modifiers.is_empty() {
            self.remove_modifiers(unit, &old_tokens)?;
            let scaled: Vec<Modifier> = def.stack_modifiers.iter().map(|m| m.scaled(target)).collect();
            let tokens = self.apply_modifiers(unit, &scaled)?;
            self.auras[aura.index()].state.stack_tokens = tokens;
        }

        trace!(unit = %unit, label = %def.label, old, new = target, "aura stacks changed");
        self.log_event(LogKind::StacksChanged {
            unit,
            label: def.label.clone(),
            stacks: target,
        });
        self.dispatch_aura_event(aura, &AuraEvent::StacksChanged { old, new: target })
    }

    pub fn add_stack(&mut self, aura: AuraHandle) -> SimResult<()> {
        let current = self.aura_stacks(aura);
        if self.aura_is_active(aura) {
            self.set_stacks(aura, current + 1)
        } else {
            self.activate_aura(aura)
        }
    }

    pub fn remove_stack(&mut self, aura: AuraHandle) -> SimResult<()> {
        let current = self.aura_stacks(aura);
        self.set_stacks(aura, current.saturating_sub(1))
    }

    /// Queued expiration fired.
    pub(crate) fn expire_aura(&mut self, aura: AuraHandle, activation: u32) -> SimResult<()> {
        let slot = self.aura_slot_mut(aura)?;
        if slot.state.activation != activation {
            return Ok(());
        }
        if !slot.state.active {
            return Err(SimError::DoubleExpire {
                label: slot.def.label.clone(),
            });
        }
        slot.state.expire_action = None;
        self.deactivate_aura(aura)
    }

    /// Run every hook of `aura` that listens to `event`, in attachment order.
    /// Combat-event hooks are skipped once the aura is no longer active.
    pub(crate) fn dispatch_aura_event(
        &mut self,
        aura: AuraHandle,
        event: &AuraEvent<'_>,
    ) -> SimResult<()> {
        let def = Arc::clone(&self.aura_slot(aura)?.def);
        let trigger = event.trigger();
        let lifecycle = event.is_lifecycle();
        for hook in def.hooks.iter().filter(|h| h.trigger == trigger) {
            if !lifecycle && !self.aura_is_active(aura) {
                break;
            }
            (hook.callback)(self, aura, event)?;
        }
        Ok(())
    }

    /// Run combat-event hooks on every aura of `unit`, in registration order.
    /// Auras registered while dispatching are not visited.
    pub(crate) fn dispatch_unit_event(
        &mut self,
        unit: UnitId,
        event: &AuraEvent<'_>,
    ) -> SimResult<()> {
        let trigger = event.trigger();
        let count = self.unit(unit)?.auras.len();
        for i in 0..count {
            let aura = self.units[unit.index()].auras[i];
            let slot = &self.auras[aura.index()];
            if !slot.state.active || !slot.def.has_hook(trigger) {
                continue;
            }
            self.dispatch_aura_event(aura, event)?;
        }
        Ok(())
    }

    /// Deactivate every active aura, in registration order.
    pub(crate) fn expire_all_auras(&mut self) -> SimResult<()> {
        for i in 0..self.auras.len() {
            let aura = AuraHandle(i as u32);
            if self.auras[i].state.active {
                self.deactivate_aura(aura)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Stat;
    use crate::unit::UnitSpec;
    use std::sync::Mutex;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn sim_with_player() -> (Simulation, UnitId) {
        let mut sim = Simulation::new();
        let player = sim.add_unit(UnitSpec::player("Warrior", 60)).unwrap();
        (sim, player)
    }

    #[test]
    fn get_or_register_is_idempotent_by_label() {
        let (mut sim, player) = sim_with_player();
        let a = sim
            .get_or_register_aura(player, AuraDefinition::new("Flurry").with_duration(secs(15)))
            .unwrap();
        let b = sim
            .get_or_register_aura(player, AuraDefinition::new("Flurry").with_duration(secs(99)))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(sim.aura(player, "Flurry"), Some(a));
    }

    #[test]
    fn expires_after_duration_and_restores_stats() {
        let (mut sim, player) = sim_with_player();
        let aura = sim
            .get_or_register_aura(
                player,
                AuraDefinition::new("Battle Shout")
                    .with_duration(secs(10))
                    .with_modifier(Modifier::add(Stat::AttackPower, 200.0)),
            )
            .unwrap();
        sim.reset(1).unwrap();
        sim.activate_aura(aura).unwrap();
        assert_eq!(sim.stat(player, Stat::AttackPower), 200.0);

        sim.run_until(secs(9)).unwrap();
        assert!(sim.aura_is_active(aura));
        sim.run_until(secs(10)).unwrap();
        assert!(!sim.aura_is_active(aura));
        assert_eq!(sim.stat(player, Stat::AttackPower), 0.0);
        assert_eq!(sim.aura_gains(aura), 1);
        assert_eq!(sim.aura_expirations(aura), 1);
    }

    #[test]
    fn refresh_policies() {
        let (mut sim, player) = sim_with_player();
        let replace = sim
            .get_or_register_aura(player, AuraDefinition::new("r").with_duration(secs(10)))
            .unwrap();
        let extend = sim
            .get_or_register_aura(
                player,
                AuraDefinition::new("e")
                    .with_duration(secs(10))
                    .with_refresh(RefreshPolicy::Extend),
            )
            .unwrap();
        let keep = sim
            .get_or_register_aura(
                player,
                AuraDefinition::new("k")
                    .with_duration(secs(10))
                    .with_refresh(RefreshPolicy::KeepExisting),
            )
            .unwrap();
        sim.reset(1).unwrap();
        for a in [replace, extend, keep] {
            sim.activate_aura(a).unwrap();
        }
        sim.run_until(secs(4)).unwrap();
        for a in [replace, extend, keep] {
            sim.activate_aura(a).unwrap();
        }
        assert_eq!(sim.aura_expires_at(replace), Some(secs(14)));
        assert_eq!(sim.aura_expires_at(extend), Some(secs(20)));
        assert_eq!(sim.aura_expires_at(keep), Some(secs(10)));

        sim.run_until(secs(30)).unwrap();
        for a in [replace, extend, keep] {
            assert_eq!(sim.aura_gains(a), 1);
            assert_eq!(sim.aura_expirations(a), 1);
        }
    }

    #[test]
    fn expire_hook_runs_once_even_when_reentered() {
        let (mut sim, player) = sim_with_player();
        let calls = Arc::new(Mutex::new(0u32));
        let seen = Arc::clone(&calls);
        let aura = sim
            .get_or_register_aura(
                player,
                AuraDefinition::new("Recklessness")
                    .with_duration(secs(5))
                    .on(HookTrigger::Expire, move |sim, aura, _| {
                        *seen.lock().unwrap() += 1;
                        // re-entrant deactivation is a no-op
                        sim.deactivate_aura(aura)
                    }),
            )
            .unwrap();
        sim.reset(1).unwrap();
        sim.activate_aura(aura).unwrap();
        sim.deactivate_aura(aura).unwrap();
        sim.deactivate_aura(aura).unwrap();
        sim.run_until(secs(10)).unwrap();
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn stacks_clamp_and_zero_deactivates() {
        let (mut sim, player) = sim_with_player();
        let aura = sim
            .get_or_register_aura(
                player,
                AuraDefinition::new("Sunder Armor")
                    .with_duration(secs(30))
                    .with_max_stacks(5)
                    .with_stack_modifier(Modifier::add(Stat::Armor, -450.0)),
            )
            .unwrap();
        sim.reset(1).unwrap();
        for _ in 0..7 {
            sim.add_stack(aura).unwrap();
        }
        assert_eq!(sim.aura_stacks(aura), 5);
        assert_eq!(sim.stat(player, Stat::Armor), -2250.0);

        sim.set_stacks(aura, 2).unwrap();
        assert_eq!(sim.stat(player, Stat::Armor), -900.0);
        sim.set_stacks(aura, 0).unwrap();
        assert!(!sim.aura_is_active(aura));
        assert_eq!(sim.stat(player, Stat::Armor), 0.0);
    }

    #[test]
    fn hooks_run_in_attachment_order() {
        let (mut sim, player) = sim_with_player();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2, o3) = (Arc::clone(&order), Arc::clone(&order), Arc::clone(&order));
        let aura = sim
            .get_or_register_aura(
                player,
                AuraDefinition::new("Enrage")
                    .on(HookTrigger::Gain, move |_, _, _| {
                        o1.lock().unwrap().push("first");
                        Ok(())
                    })
                    .on(HookTrigger::Gain, move |_, _, _| {
                        o2.lock().unwrap().push("second");
                        Ok(())
                    }),
            )
            .unwrap();
        sim.add_aura_hook(aura, HookTrigger::Gain, move |_, _, _| {
            o3.lock().unwrap().push("third");
            Ok(())
        })
        .unwrap();
        sim.reset(1).unwrap();
        sim.activate_aura(aura).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn reset_hook_activates_permanent_aura_each_trial() {
        let (mut sim, player) = sim_with_player();
        let aura = sim
            .get_or_register_aura(
                player,
                AuraDefinition::new("Defensive Stance")
                    .permanent()
                    .with_modifier(Modifier::multiply(Stat::DamageDealtMultiplier, 0.9))
                    .on(HookTrigger::Reset, |sim, aura, _| sim.activate_aura(aura)),
            )
            .unwrap();
        for seed in 0..3 {
            sim.reset(seed).unwrap();
            assert!(sim.aura_is_active(aura));
            assert!((sim.stat(player, Stat::DamageDealtMultiplier) - 0.9).abs() < 1e-12);
            sim.finish_trial(secs(60)).unwrap();
            assert!(!sim.aura_is_active(aura));
        }
    }
}
