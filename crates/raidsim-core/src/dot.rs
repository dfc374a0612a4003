//! Periodic effects (damage and healing over time).
//!
//! A dot is tracked per `(spell, target)` and owns an aura on the target
//! whose lifetime is the dot's lifetime. Unlike ordinary auras the dot aura
//! has no queued expiration: the final tick deactivates it. A dot applied at
//! `t` with `n` ticks of length `L` therefore ticks at `t + L, ..., t + nL`
//! and is inactive right after the last tick.
//!
//! Ticks either reuse values captured at application ([`TickPolicy::Snapshot`])
//! or recompute them every tick ([`TickPolicy::Dynamic`]). Target-side
//! multipliers (damage taken, armor) are always read at tick time.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::attack_table::{AttackTable, HitOutcome};
use crate::aura::{AuraDefinition, AuraHandle};
use crate::queue::ActionId;
use crate::sim::{Action, Simulation};
use crate::spell::{SpellHandle, SpellResult};
use crate::stats::Stat;
use crate::unit::UnitId;
use crate::{SimError, SimResult};

/// Which values a tick uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TickPolicy {
    /// Captured when the dot is applied or refreshed.
    #[default]
    Snapshot,
    /// Recomputed at every tick.
    Dynamic,
}

/// What re-applying an active dot does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DotRefresh {
    /// Drop the pending tick and start a fresh tick cycle now.
    #[default]
    Restart,
    /// Keep the pending tick; reset the remaining tick count.
    Rollover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeriodicKind {
    #[default]
    Damage,
    Healing,
}

/// Custom tick body, replacing the built-in damage/healing tick.
pub type DotTickFn = Arc<dyn Fn(&mut Simulation, DotHandle) -> SimResult<()> + Send + Sync>;

/// Periodic part of a spell.
#[derive(Clone)]
pub struct DotConfig {
    pub label: String,
    pub num_ticks: u32,
    pub tick_length: Duration,
    pub policy: TickPolicy,
    pub refresh: DotRefresh,
    pub kind: PeriodicKind,
    pub base_tick: f64,
    /// Bonus per point of the spell's scaling power, per tick.
    pub coefficient: f64,
    pub can_crit: bool,
    pub on_tick: Option<DotTickFn>,
}

impl fmt::Debug for DotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DotConfig")
            .field("label", &self.label)
            .field("num_ticks", &self.num_ticks)
            .field("tick_length", &self.tick_length)
            .field("policy", &self.policy)
            .field("refresh", &self.refresh)
            .field("kind", &self.kind)
            .field("base_tick", &self.base_tick)
            .finish_non_exhaustive()
    }
}

impl DotConfig {
    pub fn new(label: impl Into<String>, num_ticks: u32, tick_length: Duration) -> Self {
        Self {
            label: label.into(),
            num_ticks,
            tick_length,
            policy: TickPolicy::Snapshot,
            refresh: DotRefresh::Restart,
            kind: PeriodicKind::Damage,
            base_tick: 0.0,
            coefficient: 0.0,
            can_crit: false,
            on_tick: None,
        }
    }

    pub fn with_base_tick(mut self, amount: f64) -> Self {
        self.base_tick = amount;
        self
    }

    pub fn with_coefficient(mut self, coefficient: f64) -> Self {
        self.coefficient = coefficient;
        self
    }

    pub fn with_policy(mut self, policy: TickPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_refresh(mut self, refresh: DotRefresh) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn healing(mut self) -> Self {
        self.kind = PeriodicKind::Healing;
        self
    }

    pub fn can_crit(mut self) -> Self {
        self.can_crit = true;
        self
    }

    pub fn with_on_tick<F>(mut self, on_tick: F) -> Self
    where
        F: Fn(&mut Simulation, DotHandle) -> SimResult<()> + Send + Sync + 'static,
    {
        self.on_tick = Some(Arc::new(on_tick));
        self
    }

    /// Full duration of one application.
    pub fn duration(&self) -> Duration {
        self.tick_length * self.num_ticks
    }
}

/// Index of a dot in its simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DotHandle(pub(crate) u32);

impl DotHandle {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DotSnapshot {
    pub base_tick: f64,
    pub attacker_multiplier: f64,
    pub crit_chance: f64,
}

pub(crate) struct DotSlot {
    pub spell: SpellHandle,
    pub target: UnitId,
    pub aura: AuraHandle,
    pub remaining: u32,
    pub next_tick: Option<(ActionId, Duration)>,
    /// Bumped whenever the pending tick is replaced or dropped.
    pub generation: u32,
    pub snapshot: DotSnapshot,
}

impl DotSlot {
    pub fn reset(&mut self) {
        self.remaining = 0;
        self.next_tick = None;
        self.generation = 0;
        self.snapshot = DotSnapshot::default();
    }
}

// ---------------------------------------------------------------------------
// Simulation: dot operations
// ---------------------------------------------------------------------------

impl Simulation {
    fn dot_slot(&self, dot: DotHandle) -> SimResult<&DotSlot> {
        self.dots
            .get(dot.index())
            .ok_or_else(|| SimError::HookFailed(format!("unknown dot {dot:?}")))
    }

    fn dot_config(&self, dot: DotHandle) -> SimResult<(SpellHandle, UnitId, DotConfig)> {
        let slot = self.dot_slot(dot)?;
        let config = self
            .spell_config(slot.spell)?
            .dot
            .clone()
            .ok_or_else(|| SimError::HookFailed("spell has no periodic effect".to_owned()))?;
        Ok((slot.spell, slot.target, config))
    }

    /// The dot of `spell` on `target`, registering it on first use.
    pub fn spell_dot(&mut self, spell: SpellHandle, target: UnitId) -> SimResult<DotHandle> {
        if let Some(&dot) = self.dot_index.get(&(spell, target)) {
            return Ok(dot);
        }
        let config = self.spell_config(spell)?;
        let dot_config = config
            .dot
            .clone()
            .ok_or_else(|| SimError::HookFailed(format!("{} has no periodic effect", config.id)))?;
        let caster = self.spell_caster(spell)?;
        let label = format!(
            "{} ({}, {})",
            dot_config.label,
            self.unit(caster)?.name,
            config.id
        );

        let mut def = AuraDefinition::new(label).with_duration(dot_config.duration());
        def.managed_expiry = true;
        let aura = self.get_or_register_aura(target, def)?;

        let dot = DotHandle(self.dots.len() as u32);
        self.dots.push(DotSlot {
            spell,
            target,
            aura,
            remaining: 0,
            next_tick: None,
            generation: 0,
            snapshot: DotSnapshot::default(),
        });
        self.auras[aura.index()].dot = Some(dot);
        self.dot_index.insert((spell, target), dot);
        debug!(spell = ?spell, target = %target, "registered dot");
        Ok(dot)
    }

    pub fn dot_aura(&self, dot: DotHandle) -> SimResult<AuraHandle> {
        Ok(self.dot_slot(dot)?.aura)
    }

    pub fn dot_is_active(&self, dot: DotHandle) -> bool {
        self.dots
            .get(dot.index())
            .is_some_and(|d| self.aura_is_active(d.aura))
    }

    pub fn dot_remaining_ticks(&self, dot: DotHandle) -> u32 {
        self.dots.get(dot.index()).map_or(0, |d| d.remaining)
    }

    /// When the pending tick fires, if any.
    pub fn dot_next_tick_at(&self, dot: DotHandle) -> Option<Duration> {
        self.dots
            .get(dot.index())
            .and_then(|d| d.next_tick.map(|(_, at)| at))
    }

    /// Apply or refresh the dot.
    pub fn apply_dot(&mut self, dot: DotHandle) -> SimResult<()> {
        let now = self.current_time();
        let (_, _, config) = self.dot_config(dot)?;
        let aura = self.dot_slot(dot)?.aura;
        let was_active = self.aura_is_active(aura);
        self.take_snapshot(dot, &config)?;

        if !was_active {
            self.activate_aura(aura)?;
            if !self.aura_is_active(aura) {
                return Ok(());
            }
            self.dots[dot.index()].remaining = config.num_ticks;
            self.schedule_tick(dot, now + config.tick_length)?;
            return Ok(());
        }

        self.refresh_aura(aura)?;
        let expires_at = match config.refresh {
            DotRefresh::Restart => {
                self.cancel_tick(dot);
                self.dots[dot.index()].remaining = config.num_ticks;
                self.schedule_tick(dot, now + config.tick_length)?;
                now + config.duration()
            }
            DotRefresh::Rollover => {
                self.dots[dot.index()].remaining = config.num_ticks;
                let next = match self.dots[dot.index()].next_tick {
                    Some((_, at)) => at,
                    None => {
                        self.schedule_tick(dot, now + config.tick_length)?;
                        now + config.tick_length
                    }
                };
                next + config.tick_length * config.num_ticks.saturating_sub(1)
            }
        };
        self.auras[aura.index()].state.expires_at = Some(expires_at);
        trace!(dot = ?dot, until = ?expires_at, "dot refreshed");
        Ok(())
    }

    fn take_snapshot(&mut self, dot: DotHandle, config: &DotConfig) -> SimResult<()> {
        let (spell, target) = {
            let slot = self.dot_slot(dot)?;
            (slot.spell, slot.target)
        };
        let snapshot = DotSnapshot {
            base_tick: self.dot_base_tick(spell, config)?,
            attacker_multiplier: self.dot_attacker_multiplier(spell, target, config.kind)?,
            crit_chance: self.crit_chance(spell, target)?,
        };
        self.dots[dot.index()].snapshot = snapshot;
        Ok(())
    }

    fn dot_base_tick(&self, spell: SpellHandle, config: &DotConfig) -> SimResult<f64> {
        Ok(config.base_tick + config.coefficient * self.scaling_power(spell)?)
    }

    fn dot_attacker_multiplier(
        &self,
        spell: SpellHandle,
        target: UnitId,
        kind: PeriodicKind,
    ) -> SimResult<f64> {
        match kind {
            PeriodicKind::Damage => self.attacker_multiplier(spell, target),
            PeriodicKind::Healing => {
                let m = *self.spell_modifiers(spell)?;
                let caster = self.spell_caster(spell)?;
                Ok(m.damage_multiplier
                    * m.damage_multiplier_additive
                    * self.unit(caster)?.stats.get(Stat::HealingDealtMultiplier))
            }
        }
    }

    fn tick_values(&self, dot: DotHandle, config: &DotConfig, use_snapshot: bool) -> SimResult<DotSnapshot> {
        let slot = self.dot_slot(dot)?;
        if use_snapshot {
            return Ok(slot.snapshot);
        }
        Ok(DotSnapshot {
            base_tick: self.dot_base_tick(slot.spell, config)?,
            attacker_multiplier: self.dot_attacker_multiplier(slot.spell, slot.target, config.kind)?,
            crit_chance: self.crit_chance(slot.spell, slot.target)?,
        })
    }

    fn schedule_tick(&mut self, dot: DotHandle, at: Duration) -> SimResult<()> {
        let slot = &mut self.dots[dot.index()];
        slot.generation = slot.generation.wrapping_add(1);
        let generation = slot.generation;
        let id = self.schedule_action(at, Action::DotTick { dot, generation })?;
        self.dots[dot.index()].next_tick = Some((id, at));
        Ok(())
    }

    fn cancel_tick(&mut self, dot: DotHandle) {
        let slot = &mut self.dots[dot.index()];
        slot.generation = slot.generation.wrapping_add(1);
        if let Some((id, _)) = slot.next_tick.take() {
            self.queue.cancel(id);
        }
    }

    /// Called when the dot's aura goes away.
    pub(crate) fn stop_dot(&mut self, dot: DotHandle) {
        if dot.index() < self.dots.len() {
            self.cancel_tick(dot);
            self.dots[dot.index()].remaining = 0;
        }
    }

    pub(crate) fn tick_dot(&mut self, dot: DotHandle, generation: u32) -> SimResult<()> {
        let now = self.current_time();
        let (_, _, config) = self.dot_config(dot)?;
        let slot = &mut self.dots[dot.index()];
        if slot.generation != generation {
            return Ok(());
        }
        slot.next_tick = None;
        slot.remaining = slot.remaining.saturating_sub(1);
        let aura = slot.aura;

        match &config.on_tick {
            Some(on_tick) => on_tick(self, dot)?,
            None => self.default_tick(dot, &config)?,
        }

        let slot = &self.dots[dot.index()];
        if slot.generation != generation || !self.aura_is_active(aura) {
            return Ok(());
        }
        if slot.remaining == 0 {
            self.deactivate_aura(aura)
        } else {
            self.schedule_tick(dot, now + config.tick_length)
        }
    }

    fn default_tick(&mut self, dot: DotHandle, config: &DotConfig) -> SimResult<()> {
        let (spell, target) = {
            let slot = self.dot_slot(dot)?;
            (slot.spell, slot.target)
        };
        let values = self.tick_values(dot, config, config.policy == TickPolicy::Snapshot)?;
        let crit = config.can_crit && AttackTable::roll_crit(self.random_float(), values.crit_chance);
        let outcome = if crit { HitOutcome::Crit } else { HitOutcome::Hit };
        let crit_mult = if crit { self.crit_multiplier(spell)? } else { 1.0 };
        let id = self.spell_config(spell)?.id;
        let school = self.spell_config(spell)?.school;
        let caster = self.spell_caster(spell)?;

        match config.kind {
            PeriodicKind::Damage => {
                let amount = self.damage_before_outcome(spell, target, values.base_tick, false)?
                    * values.attacker_multiplier
                    * crit_mult;
                let result = SpellResult {
                    spell,
                    id,
                    caster,
                    target,
                    school,
                    outcome,
                    amount,
                    threat: self.threat_of(spell, amount)?,
                    periodic: true,
                    healing: false,
                };
                self.deal_damage(&result)
            }
            PeriodicKind::Healing => {
                let amount = values.base_tick * values.attacker_multiplier * crit_mult;
                let result = SpellResult {
                    spell,
                    id,
                    caster,
                    target,
                    school,
                    outcome,
                    amount,
                    threat: self.threat_of(spell, amount * 0.5)?,
                    periodic: true,
                    healing: true,
                };
                self.deal_healing(&result)
            }
        }
    }

    /// Average damage of one tick, without consuming randomness. With
    /// `use_snapshot` the values captured at application are used;
    /// otherwise current stats are read.
    pub fn expected_tick_damage(&self, dot: DotHandle, use_snapshot: bool) -> SimResult<f64> {
        let (spell, target, config) = self.dot_config(dot)?;
        let values = self.tick_values(dot, &config, use_snapshot)?;
        let crit_factor = if config.can_crit {
            1.0 + values.crit_chance * (self.crit_multiplier(spell)? - 1.0)
        } else {
            1.0
        };
        let base = match config.kind {
            PeriodicKind::Damage => {
                self.damage_before_outcome(spell, target, values.base_tick, false)?
            }
            PeriodicKind::Healing => values.base_tick,
        };
        Ok(base * values.attacker_multiplier * crit_factor)
    }
}
