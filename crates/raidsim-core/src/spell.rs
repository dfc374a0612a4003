//! Spells: castable content plus the damage and healing pipeline.
//!
//! A spell is registered once per caster from a [`SpellConfig`]. Casting goes
//! through three stages:
//!
//! 1. **Validate** (`can_cast`): caster alive and idle, global cooldown,
//!    spell and shared cooldowns, resource, and the optional extra condition.
//!    Nothing is mutated; a failed validation is not an error.
//! 2. **Commit**: pay the cost, remember the refund owed on a miss, start the
//!    global and spell cooldowns.
//! 3. **Resolve**: immediately for instant casts, otherwise when the queued
//!    cast-complete action fires. Resolution runs the spell's effect and then
//!    the caster's `CastComplete` hooks.
//!
//! Damage and healing are computed from the cached attack table of the
//! caster/target pair. Computing a result and dealing it are separate steps,
//! so effects can inspect or scale a result before it lands.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, trace};

use crate::attack_table::{AttackTable, HitOutcome};
use crate::clock::seconds;
use crate::dot::DotConfig;
use crate::log::LogKind;
use crate::queue::ActionId;
use crate::sim::{Action, Simulation};
use crate::stats::Stat;
use crate::timer::Cooldown;
use crate::unit::{ResourceKind, UnitId};
use crate::{SimError, SimResult};

/// Default global cooldown.
pub const DEFAULT_GCD: Duration = Duration::from_millis(1500);
/// Haste never pushes the global cooldown below this.
pub const MIN_GCD: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// ContentId
// ---------------------------------------------------------------------------

/// Namespace of a content identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContentKind {
    Spell,
    Item,
    Other,
}

/// Canonical identifier of an ability, effect, or aura source.
///
/// Serialized as `kind:id` or `kind:id#tag`, e.g. `spell:11366#1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId {
    pub kind: ContentKind,
    pub id: i32,
    /// Distinguishes variants of the same id (ranks, hands).
    pub tag: i32,
}

impl ContentId {
    pub const fn spell(id: i32) -> Self {
        Self {
            kind: ContentKind::Spell,
            id,
            tag: 0,
        }
    }

    pub const fn item(id: i32) -> Self {
        Self {
            kind: ContentKind::Item,
            id,
            tag: 0,
        }
    }

    pub const fn other(id: i32) -> Self {
        Self {
            kind: ContentKind::Other,
            id,
            tag: 0,
        }
    }

    pub const fn with_tag(self, tag: i32) -> Self {
        Self { tag, ..self }
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ContentKind::Spell => "spell",
            ContentKind::Item => "item",
            ContentKind::Other => "other",
        };
        if self.tag == 0 {
            write!(f, "{kind}:{}", self.id)
        } else {
            write!(f, "{kind}:{}#{}", self.id, self.tag)
        }
    }
}

/// Error parsing a [`ContentId`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid content id '{0}'")]
pub struct ParseContentIdError(String);

impl FromStr for ContentId {
    type Err = ParseContentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseContentIdError(s.to_owned());
        let (kind, rest) = s.split_once(':').ok_or_else(err)?;
        let kind = match kind {
            "spell" => ContentKind::Spell,
            "item" => ContentKind::Item,
            "other" => ContentKind::Other,
            _ => return Err(err()),
        };
        let (id, tag) = match rest.split_once('#') {
            Some((id, tag)) => (id, tag.parse().map_err(|_| err())?),
            None => (rest, 0),
        };
        Ok(Self {
            kind,
            id: id.parse().map_err(|_| err())?,
            tag,
        })
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Index of a spell in its simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpellHandle(pub(crate) u32);

impl SpellHandle {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpellSchool {
    Physical,
    Arcane,
    Fire,
    Frost,
    Holy,
    Nature,
    Shadow,
}

/// Which side of the attack table a spell rolls against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefenseType {
    None,
    Magic,
    Melee,
    Ranged,
}

/// How an outcome is rolled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// Auto-attack: one roll, can glance.
    MeleeWhite,
    /// Melee ability: one roll, no glance.
    MeleeSpecial,
    Ranged,
    /// Hit roll only.
    MagicHit,
    /// Hit roll, then crit roll.
    MagicHitAndCrit,
    /// Crit roll only.
    MagicCrit,
    /// No roll.
    AlwaysHit,
    /// Periodic tick, no roll.
    Tick,
    /// Periodic tick with a crit roll.
    TickCrit,
    /// Average outcome, no roll.
    Expected,
}

/// Resource cost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    pub resource: ResourceKind,
    pub flat: f64,
    /// Fraction of the caster's maximum pool added to `flat`.
    #[serde(default)]
    pub base_fraction: f64,
    /// Fraction of the paid cost returned when the cast misses, is dodged,
    /// or is parried.
    #[serde(default)]
    pub refund_fraction: f64,
}

impl CostModel {
    pub fn mana(flat: f64) -> Self {
        Self {
            resource: ResourceKind::Mana,
            flat,
            base_fraction: 0.0,
            refund_fraction: 0.0,
        }
    }

    pub fn mana_fraction(fraction: f64) -> Self {
        Self {
            base_fraction: fraction,
            ..Self::mana(0.0)
        }
    }

    pub fn rage(amount: f64) -> Self {
        Self {
            resource: ResourceKind::Rage,
            ..Self::mana(amount)
        }
    }

    pub fn energy(amount: f64) -> Self {
        Self {
            resource: ResourceKind::Energy,
            ..Self::mana(amount)
        }
    }

    pub fn with_refund(mut self, fraction: f64) -> Self {
        self.refund_fraction = fraction;
        self
    }
}

/// A cooldown shared by every spell in the same group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedCooldown {
    pub group: u32,
    pub duration: Duration,
}

/// Cast timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CastConfig {
    pub cast_time: Duration,
    /// Zero for spells off the global cooldown.
    pub gcd: Duration,
    pub cooldown: Option<Duration>,
    pub shared_cooldown: Option<SharedCooldown>,
    /// Cast time and GCD ignore the caster's cast speed.
    pub ignore_haste: bool,
}

impl Default for CastConfig {
    fn default() -> Self {
        Self {
            cast_time: Duration::ZERO,
            gcd: DEFAULT_GCD,
            cooldown: None,
            shared_cooldown: None,
            ignore_haste: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpellFlags {
    /// Auto-attacks stop for the duration of the cast.
    pub locks_melee: bool,
    /// Resolving the cast restarts the caster's swing timers.
    pub resets_swing: bool,
    /// Marks the built-in auto-attack spells.
    pub auto_attack: bool,
}

/// Per-trial tunables. Content mutates these through
/// [`Simulation::spell_modifiers_mut`]; they reset to the configured values
/// at the start of every trial.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpellModifiers {
    pub damage_multiplier: f64,
    /// Sum of additive percentage bonuses, starting at `1.0`.
    pub damage_multiplier_additive: f64,
    /// Extra hit chance (0.01 == 1%).
    pub bonus_hit: f64,
    /// Extra crit chance (0.01 == 1%).
    pub bonus_crit: f64,
    /// Scales the crit bonus: 1.0 doubles the extra damage of a crit.
    pub crit_damage_bonus: f64,
    pub threat_multiplier: f64,
    pub cost_multiplier: f64,
}

impl Default for SpellModifiers {
    fn default() -> Self {
        Self {
            damage_multiplier: 1.0,
            damage_multiplier_additive: 1.0,
            bonus_hit: 0.0,
            bonus_crit: 0.0,
            crit_damage_bonus: 0.0,
            threat_multiplier: 1.0,
            cost_multiplier: 1.0,
        }
    }
}

/// Spell body, run on resolution.
pub type SpellEffect = Arc<dyn Fn(&mut Simulation, SpellHandle, UnitId) -> SimResult<()> + Send + Sync>;

/// Extra validation run after all built-in checks pass.
pub type CastCondition = Arc<dyn Fn(&Simulation, SpellHandle, UnitId) -> bool + Send + Sync>;

/// Immutable description of a spell.
#[derive(Clone)]
pub struct SpellConfig {
    pub id: ContentId,
    pub name: String,
    pub school: SpellSchool,
    pub defense: DefenseType,
    pub cost: Option<CostModel>,
    pub cast: CastConfig,
    pub flags: SpellFlags,
    pub modifiers: SpellModifiers,
    /// Yards per second; `None` lands instantly.
    pub missile_speed: Option<f64>,
    /// Bonus damage per point of spell power (or attack power for physical).
    pub coefficient: f64,
    pub dot: Option<DotConfig>,
    pub condition: Option<CastCondition>,
    pub effect: Option<SpellEffect>,
}

impl fmt::Debug for SpellConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpellConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("school", &self.school)
            .field("defense", &self.defense)
            .field("cost", &self.cost)
            .field("cast", &self.cast)
            .field("dot", &self.dot)
            .finish_non_exhaustive()
    }
}

impl SpellConfig {
    pub fn new(id: ContentId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            school: SpellSchool::Physical,
            defense: DefenseType::Magic,
            cost: None,
            cast: CastConfig::default(),
            flags: SpellFlags::default(),
            modifiers: SpellModifiers::default(),
            missile_speed: None,
            coefficient: 0.0,
            dot: None,
            condition: None,
            effect: None,
        }
    }

    pub fn with_school(mut self, school: SpellSchool) -> Self {
        self.school = school;
        self
    }

    pub fn with_defense(mut self, defense: DefenseType) -> Self {
        self.defense = defense;
        self
    }

    pub fn with_cost(mut self, cost: CostModel) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_cast_time(mut self, cast_time: Duration) -> Self {
        self.cast.cast_time = cast_time;
        self
    }

    pub fn with_gcd(mut self, gcd: Duration) -> Self {
        self.cast.gcd = gcd;
        self
    }

    pub fn off_gcd(self) -> Self {
        self.with_gcd(Duration::ZERO)
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cast.cooldown = Some(cooldown);
        self
    }

    pub fn with_shared_cooldown(mut self, group: u32, duration: Duration) -> Self {
        self.cast.shared_cooldown = Some(SharedCooldown { group, duration });
        self
    }

    pub fn ignoring_haste(mut self) -> Self {
        self.cast.ignore_haste = true;
        self
    }

    pub fn with_flags(mut self, flags: SpellFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_modifiers(mut self, modifiers: SpellModifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    pub fn with_missile_speed(mut self, yards_per_second: f64) -> Self {
        self.missile_speed = Some(yards_per_second);
        self
    }

    pub fn with_coefficient(mut self, coefficient: f64) -> Self {
        self.coefficient = coefficient;
        self
    }

    pub fn with_dot(mut self, dot: DotConfig) -> Self {
        self.dot = Some(dot);
        self
    }

    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Simulation, SpellHandle, UnitId) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn with_effect<F>(mut self, effect: F) -> Self
    where
        F: Fn(&mut Simulation, SpellHandle, UnitId) -> SimResult<()> + Send + Sync + 'static,
    {
        self.effect = Some(Arc::new(effect));
        self
    }

    /// Crit damage multiplier before bonuses.
    fn base_crit_multiplier(&self) -> f64 {
        match self.defense {
            DefenseType::Melee | DefenseType::Ranged => 2.0,
            DefenseType::Magic | DefenseType::None => 1.5,
        }
    }

    fn uses_melee_crit(&self) -> bool {
        matches!(self.defense, DefenseType::Melee | DefenseType::Ranged)
    }
}

// ---------------------------------------------------------------------------
// Runtime state and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SpellState {
    pub modifiers: SpellModifiers,
    /// Owed back if the current cast misses; cleared once paid.
    pub pending_refund: f64,
    pub casts: u32,
}

pub(crate) struct SpellSlot {
    pub config: Arc<SpellConfig>,
    pub caster: UnitId,
    pub cooldown: Option<Cooldown>,
    pub shared_cooldown: Option<Cooldown>,
    pub state: SpellState,
}

impl SpellSlot {
    pub fn reset(&mut self) {
        self.state = SpellState {
            modifiers: self.config.modifiers,
            ..SpellState::default()
        };
    }
}

/// A cast with a non-zero cast time that has not resolved yet.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CastInProgress {
    pub spell: SpellHandle,
    pub ends_at: Duration,
    pub action: ActionId,
}

/// Outcome and amount of one damage or healing event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpellResult {
    pub spell: SpellHandle,
    pub id: ContentId,
    pub caster: UnitId,
    pub target: UnitId,
    pub school: SpellSchool,
    pub outcome: HitOutcome,
    pub amount: f64,
    pub threat: f64,
    pub periodic: bool,
    pub healing: bool,
}

impl SpellResult {
    #[inline]
    pub fn landed(&self) -> bool {
        self.outcome.landed()
    }
}

// ---------------------------------------------------------------------------
// Simulation: spell operations
// ---------------------------------------------------------------------------

impl Simulation {
    pub(crate) fn spell_slot(&self, spell: SpellHandle) -> SimResult<&SpellSlot> {
        self.spells
            .get(spell.index())
            .ok_or(SimError::UnknownSpell(spell))
    }

    pub(crate) fn spell_slot_mut(&mut self, spell: SpellHandle) -> SimResult<&mut SpellSlot> {
        self.spells
            .get_mut(spell.index())
            .ok_or(SimError::UnknownSpell(spell))
    }

    /// Register `config` as castable by `unit`. Registering an id the unit
    /// already knows returns the existing handle.
    pub fn register_spell(&mut self, unit: UnitId, config: SpellConfig) -> SimResult<SpellHandle> {
        if let Some(&existing) = self.unit(unit)?.spell_ids.get(&config.id) {
            return Ok(existing);
        }
        let cooldown = match config.cast.cooldown {
            Some(duration) => Some(Cooldown {
                timer: self.new_timer(),
                duration,
            }),
            None => None,
        };
        let shared_cooldown = match config.cast.shared_cooldown {
            Some(shared) => {
                let existing = self.unit(unit)?.shared_cooldowns.get(&shared.group).copied();
                let timer = match existing {
                    Some(timer) => timer,
                    None => {
                        let timer = self.new_timer();
                        self.unit_mut(unit)?
                            .shared_cooldowns
                            .insert(shared.group, timer);
                        timer
                    }
                };
                Some(Cooldown {
                    timer,
                    duration: shared.duration,
                })
            }
            None => None,
        };

        let handle = SpellHandle(self.spells.len() as u32);
        debug!(unit = %unit, spell = %config.id, name = %config.name, "registered spell");
        let owner = self.unit_mut(unit)?;
        owner.spells.push(handle);
        owner.spell_ids.insert(config.id, handle);
        let mut slot = SpellSlot {
            config: Arc::new(config),
            caster: unit,
            cooldown,
            shared_cooldown,
            state: SpellState::default(),
        };
        slot.reset();
        self.spells.push(slot);
        Ok(handle)
    }

    /// Look up a unit's spell by content id.
    pub fn spell(&self, unit: UnitId, id: ContentId) -> Option<SpellHandle> {
        self.units
            .get(unit.index())
            .and_then(|u| u.spell_ids.get(&id).copied())
    }

    pub fn spell_config(&self, spell: SpellHandle) -> SimResult<&SpellConfig> {
        Ok(&self.spell_slot(spell)?.config)
    }

    pub fn spell_caster(&self, spell: SpellHandle) -> SimResult<UnitId> {
        Ok(self.spell_slot(spell)?.caster)
    }

    pub fn spell_modifiers(&self, spell: SpellHandle) -> SimResult<&SpellModifiers> {
        Ok(&self.spell_slot(spell)?.state.modifiers)
    }

    /// Per-trial tunables of `spell`.
    pub fn spell_modifiers_mut(&mut self, spell: SpellHandle) -> SimResult<&mut SpellModifiers> {
        Ok(&mut self.spell_slot_mut(spell)?.state.modifiers)
    }

    /// Number of times `spell` was cast this trial.
    pub fn spell_casts(&self, spell: SpellHandle) -> u32 {
        self.spells.get(spell.index()).map_or(0, |s| s.state.casts)
    }

    /// Current resource cost of `spell`.
    pub fn spell_cost(&self, spell: SpellHandle) -> SimResult<f64> {
        let slot = self.spell_slot(spell)?;
        let Some(cost) = slot.config.cost else {
            return Ok(0.0);
        };
        let max = self
            .unit(slot.caster)?
            .resource
            .as_ref()
            .map_or(0.0, |p| p.max());
        Ok(((cost.flat + cost.base_fraction * max) * slot.state.modifiers.cost_multiplier).max(0.0))
    }

    /// Earliest instant `spell` could pass its timing checks.
    pub fn spell_ready_at(&self, spell: SpellHandle) -> SimResult<Duration> {
        let slot = self.spell_slot(spell)?;
        let caster = self.unit(slot.caster)?;
        let mut ready = self.current_time();
        if slot.config.cast.gcd > Duration::ZERO {
            ready = ready.max(self.timer_ready_at(caster.gcd));
        }
        if let Some(cd) = slot.cooldown {
            ready = ready.max(self.timer_ready_at(cd.timer));
        }
        if let Some(cd) = slot.shared_cooldown {
            ready = ready.max(self.timer_ready_at(cd.timer));
        }
        if let Some(cast) = caster.casting {
            ready = ready.max(cast.ends_at);
        }
        Ok(ready)
    }

    /// When `unit` is next free to act: past its global cooldown and any
    /// cast in progress.
    pub fn next_action_time(&self, unit: UnitId) -> SimResult<Duration> {
        let u = self.unit(unit)?;
        let mut ready = self.current_time().max(self.timer_ready_at(u.gcd));
        if let Some(cast) = u.casting {
            ready = ready.max(cast.ends_at);
        }
        Ok(ready)
    }

    /// Whether `unit` is in the middle of a cast.
    pub fn is_casting(&self, unit: UnitId) -> bool {
        self.units
            .get(unit.index())
            .is_some_and(|u| u.casting.is_some())
    }

    /// Validation only: would casting `spell` at `target` succeed now?
    pub fn can_cast(&self, spell: SpellHandle, target: UnitId) -> bool {
        let Ok(slot) = self.spell_slot(spell) else {
            return false;
        };
        let (Some(caster), Some(tgt)) = (
            self.units.get(slot.caster.index()),
            self.units.get(target.index()),
        ) else {
            return false;
        };
        if !caster.is_alive() || !tgt.is_alive() || caster.casting.is_some() {
            return false;
        }
        let now = self.current_time();
        if slot.config.cast.gcd > Duration::ZERO && self.timer_ready_at(caster.gcd) > now {
            return false;
        }
        if slot
            .cooldown
            .is_some_and(|cd| self.timer_ready_at(cd.timer) > now)
        {
            return false;
        }
        if slot
            .shared_cooldown
            .is_some_and(|cd| self.timer_ready_at(cd.timer) > now)
        {
            return false;
        }
        if let Some(cost) = slot.config.cost {
            let Ok(amount) = self.spell_cost(spell) else {
                return false;
            };
            if amount > 0.0 {
                match caster.resource.as_ref() {
                    Some(pool) if pool.kind() == cost.resource && pool.current() >= amount => {}
                    _ => return false,
                }
            }
        }
        if let Some(condition) = &slot.config.condition {
            if !condition(self, spell, target) {
                return false;
            }
        }
        true
    }

    /// Cast `spell` at `target`. Returns `Ok(false)` without side effects
    /// when validation fails.
    pub fn cast(&mut self, spell: SpellHandle, target: UnitId) -> SimResult<bool> {
        if !self.can_cast(spell, target) {
            trace!(spell = ?spell, target = %target, "cast rejected");
            return Ok(false);
        }
        let now = self.current_time();
        let slot = self.spell_slot(spell)?;
        let caster = slot.caster;
        let config = Arc::clone(&slot.config);
        let cooldown = slot.cooldown;
        let shared = slot.shared_cooldown;

        if let Some(cost) = config.cost {
            let amount = self.spell_cost(spell)?;
            if amount > 0.0 {
                self.spend_resource(caster, cost.resource, amount, config.id)?;
            }
            self.spells[spell.index()].state.pending_refund = amount * cost.refund_fraction;
        }
        self.spells[spell.index()].state.casts += 1;
        self.unit_mut(caster)?
            .metrics
            .spell_mut(config.id, &config.name)
            .casts += 1;

        if config.cast.gcd > Duration::ZERO {
            let gcd = self.scaled_gcd(caster, &config)?;
            let timer = self.unit(caster)?.gcd;
            self.set_timer(timer, now + gcd);
        }
        if let Some(cd) = cooldown {
            self.set_timer(cd.timer, now + cd.duration);
        }
        if let Some(cd) = shared {
            self.set_timer(cd.timer, now + cd.duration);
        }

        let cast_time = self.scaled_cast_time(caster, &config)?;
        if cast_time > Duration::ZERO {
            let ends_at = now + cast_time;
            let action = self.schedule_action(ends_at, Action::CastComplete { spell, target })?;
            self.unit_mut(caster)?.casting = Some(CastInProgress {
                spell,
                ends_at,
                action,
            });
            if config.flags.locks_melee {
                self.delay_melee_until(caster, ends_at)?;
            }
            debug!(unit = %caster, spell = %config.id, until = ?ends_at, "cast started");
            return Ok(true);
        }

        self.resolve_cast(spell, target)?;
        Ok(true)
    }

    /// Abort the cast in progress, if any. The cost stays paid.
    pub fn interrupt_cast(&mut self, unit: UnitId) -> SimResult<bool> {
        let Some(cast) = self.unit_mut(unit)?.casting.take() else {
            return Ok(false);
        };
        self.queue.cancel(cast.action);
        debug!(unit = %unit, spell = ?cast.spell, "cast interrupted");
        Ok(true)
    }

    pub(crate) fn complete_cast(&mut self, spell: SpellHandle, target: UnitId) -> SimResult<()> {
        let caster = self.spell_caster(spell)?;
        self.unit_mut(caster)?.casting = None;
        self.resolve_cast(spell, target)
    }

    fn resolve_cast(&mut self, spell: SpellHandle, target: UnitId) -> SimResult<()> {
        let slot = self.spell_slot(spell)?;
        let caster = slot.caster;
        let config = Arc::clone(&slot.config);

        trace!(unit = %caster, spell = %config.id, target = %target, "cast resolved");
        self.log_event(LogKind::Cast {
            unit: caster,
            spell: config.id,
            target,
        });
        if let Some(effect) = &config.effect {
            effect(self, spell, target)?;
        }
        if config.flags.resets_swing {
            self.reset_swing_timers(caster)?;
        }
        self.dispatch_unit_event(caster, &crate::aura::AuraEvent::CastComplete { spell, target })
    }

    fn scaled_gcd(&self, caster: UnitId, config: &SpellConfig) -> SimResult<Duration> {
        if config.cast.ignore_haste {
            return Ok(config.cast.gcd);
        }
        let speed = self.cast_speed(caster)?;
        Ok(config.cast.gcd.div_f64(speed).max(MIN_GCD.min(config.cast.gcd)))
    }

    fn scaled_cast_time(&self, caster: UnitId, config: &SpellConfig) -> SimResult<Duration> {
        if config.cast.ignore_haste || config.cast.cast_time.is_zero() {
            return Ok(config.cast.cast_time);
        }
        let speed = self.cast_speed(caster)?;
        Ok(config.cast.cast_time.div_f64(speed))
    }

    fn cast_speed(&self, unit: UnitId) -> SimResult<f64> {
        let speed = self.unit(unit)?.stats.get(Stat::CastSpeed);
        Ok(if speed > 0.0 { speed } else { 1.0 })
    }

    /// Schedule `then` for when the spell's missile reaches its target.
    /// Always deferred, even with zero travel time.
    pub fn wait_travel_time<F>(&mut self, spell: SpellHandle, then: F) -> SimResult<ActionId>
    where
        F: FnOnce(&mut Simulation) -> SimResult<()> + Send + 'static,
    {
        let slot = self.spell_slot(spell)?;
        let distance = self.unit(slot.caster)?.distance;
        let delay = match slot.config.missile_speed {
            Some(speed) if speed > 0.0 => seconds(distance / speed),
            _ => Duration::ZERO,
        };
        self.schedule_after(delay, then)
    }

    /// Return the refund owed by the current cast of `spell`, once.
    pub fn refund(&mut self, spell: SpellHandle) -> SimResult<()> {
        let slot = self.spell_slot_mut(spell)?;
        let amount = std::mem::take(&mut slot.state.pending_refund);
        if amount <= 0.0 {
            return Ok(());
        }
        let caster = slot.caster;
        let id = slot.config.id;
        let Some(kind) = slot.config.cost.map(|c| c.resource) else {
            return Ok(());
        };
        self.gain_resource(caster, kind, amount, id)?;
        self.unit_mut(caster)?.metrics.resources_refunded += amount;
        Ok(())
    }

    /// Bonus power `spell` scales with: spell power for magic, attack power
    /// for melee, ranged attack power for ranged.
    pub fn scaling_power(&self, spell: SpellHandle) -> SimResult<f64> {
        let slot = self.spell_slot(spell)?;
        let stats = &self.unit(slot.caster)?.stats;
        Ok(match slot.config.defense {
            DefenseType::Melee => stats.get(Stat::AttackPower),
            DefenseType::Ranged => stats.get(Stat::RangedAttackPower),
            DefenseType::Magic | DefenseType::None => stats.get(Stat::SpellPower),
        })
    }

    /// `base` plus the spell's coefficient share of its scaling power.
    fn scaled_base(&self, spell: SpellHandle, base: f64) -> SimResult<f64> {
        let coefficient = self.spell_slot(spell)?.config.coefficient;
        if coefficient == 0.0 {
            return Ok(base);
        }
        Ok(base + coefficient * self.scaling_power(spell)?)
    }

    /// Crit chance of `spell` against `target`, bonuses included.
    pub fn crit_chance(&self, spell: SpellHandle, target: UnitId) -> SimResult<f64> {
        let slot = self.spell_slot(spell)?;
        let table = self.attack_table(slot.caster, target)?;
        let bonus = slot.state.modifiers.bonus_crit;
        Ok(if slot.config.uses_melee_crit() {
            table.melee_crit_chance(bonus)
        } else {
            table.spell_crit_chance(bonus)
        })
    }

    /// Damage multiplier applied to a crit of `spell`.
    pub fn crit_multiplier(&self, spell: SpellHandle) -> SimResult<f64> {
        let slot = self.spell_slot(spell)?;
        let base = slot.config.base_crit_multiplier();
        Ok(1.0 + (base - 1.0) * (1.0 + slot.state.modifiers.crit_damage_bonus))
    }

    /// Roll the outcome of `spell` against `target`.
    pub(crate) fn roll_outcome(
        &mut self,
        spell: SpellHandle,
        target: UnitId,
        kind: OutcomeKind,
    ) -> SimResult<HitOutcome> {
        let slot = self.spell_slot(spell)?;
        let caster = slot.caster;
        let mods = slot.state.modifiers;
        let table = self.attack_table(caster, target)?;
        let crit_chance = self.crit_chance(spell, target)?;
        let dual_wield = self.unit(caster)?.auto.is_dual_wielding();
        let bonus_hit = mods.bonus_hit;

        Ok(match kind {
            OutcomeKind::MeleeWhite => {
                let roll = self.random_float();
                table.roll_melee(roll, true, dual_wield, bonus_hit, mods.bonus_crit)
            }
            OutcomeKind::MeleeSpecial => {
                let roll = self.random_float();
                table.roll_melee(roll, false, false, bonus_hit, mods.bonus_crit)
            }
            OutcomeKind::Ranged => {
                let roll = self.random_float();
                table.roll_ranged(roll, bonus_hit, mods.bonus_crit)
            }
            OutcomeKind::MagicHit => {
                let roll = self.random_float();
                if table.roll_spell_hit(roll, bonus_hit) {
                    HitOutcome::Hit
                } else {
                    HitOutcome::Miss
                }
            }
            OutcomeKind::MagicHitAndCrit => {
                let roll = self.random_float();
                if !table.roll_spell_hit(roll, bonus_hit) {
                    HitOutcome::Miss
                } else if AttackTable::roll_crit(self.random_float(), crit_chance) {
                    HitOutcome::Crit
                } else {
                    HitOutcome::Hit
                }
            }
            OutcomeKind::MagicCrit | OutcomeKind::TickCrit => {
                if AttackTable::roll_crit(self.random_float(), crit_chance) {
                    HitOutcome::Crit
                } else {
                    HitOutcome::Hit
                }
            }
            OutcomeKind::AlwaysHit | OutcomeKind::Tick | OutcomeKind::Expected => HitOutcome::Hit,
        })
    }

    /// Expected-value scaling of an `Expected` outcome: average over miss and
    /// crit chances without consuming randomness.
    fn expected_factor(&self, spell: SpellHandle, target: UnitId) -> SimResult<f64> {
        let slot = self.spell_slot(spell)?;
        let table = self.attack_table(slot.caster, target)?;
        let hit = match slot.config.defense {
            DefenseType::Magic => 1.0 - table.spell_miss_chance(slot.state.modifiers.bonus_hit),
            DefenseType::Melee | DefenseType::Ranged => {
                1.0 - table.melee_miss_chance(false, false, slot.state.modifiers.bonus_hit)
                    - table.dodge
            }
            DefenseType::None => 1.0,
        };
        let crit = self.crit_chance(spell, target)?;
        let crit_mult = self.crit_multiplier(spell)?;
        Ok(hit * (1.0 + crit * (crit_mult - 1.0)))
    }

    /// Everything that scales `base` except the roll: spell modifiers,
    /// attacker and target multipliers, armor for physical damage.
    pub(crate) fn damage_before_outcome(
        &self,
        spell: SpellHandle,
        target: UnitId,
        base: f64,
        include_attacker: bool,
    ) -> SimResult<f64> {
        let slot = self.spell_slot(spell)?;
        let table = self.attack_table(slot.caster, target)?;
        let mut amount = base * table.damage_taken;
        if include_attacker {
            amount *= self.attacker_multiplier(spell, target)?;
        }
        if slot.config.school == SpellSchool::Physical {
            amount *= 1.0 - table.armor_mitigation;
        }
        Ok(amount)
    }

    /// Caster-side multiplier of `spell`.
    pub(crate) fn attacker_multiplier(&self, spell: SpellHandle, target: UnitId) -> SimResult<f64> {
        let slot = self.spell_slot(spell)?;
        let table = self.attack_table(slot.caster, target)?;
        let m = slot.state.modifiers;
        Ok(m.damage_multiplier * m.damage_multiplier_additive * table.damage_dealt)
    }

    pub(crate) fn apply_outcome(
        &self,
        spell: SpellHandle,
        target: UnitId,
        amount: f64,
        outcome: HitOutcome,
    ) -> SimResult<f64> {
        let table = self.attack_table(self.spell_caster(spell)?, target)?;
        Ok(match outcome {
            HitOutcome::Miss | HitOutcome::Dodge | HitOutcome::Parry => 0.0,
            HitOutcome::Glance => amount * table.glance_multiplier,
            HitOutcome::Block => (amount - table.block_value).max(0.0),
            HitOutcome::Crit => amount * self.crit_multiplier(spell)?,
            HitOutcome::Hit => amount,
        })
    }

    pub(crate) fn threat_of(&self, spell: SpellHandle, amount: f64) -> SimResult<f64> {
        let slot = self.spell_slot(spell)?;
        let caster_threat = self.unit(slot.caster)?.stats.get(Stat::ThreatMultiplier);
        Ok(amount * slot.state.modifiers.threat_multiplier * caster_threat)
    }

    /// Roll and compute damage of `spell` against `target` without applying it.
    pub fn calc_damage(
        &mut self,
        spell: SpellHandle,
        target: UnitId,
        base: f64,
        kind: OutcomeKind,
    ) -> SimResult<SpellResult> {
        let outcome = self.roll_outcome(spell, target, kind)?;
        let base = self.scaled_base(spell, base)?;
        let mut amount = self.damage_before_outcome(spell, target, base, true)?;
        amount = if kind == OutcomeKind::Expected {
            amount * self.expected_factor(spell, target)?
        } else {
            self.apply_outcome(spell, target, amount, outcome)?
        };
        let slot = self.spell_slot(spell)?;
        Ok(SpellResult {
            spell,
            id: slot.config.id,
            caster: slot.caster,
            target,
            school: slot.config.school,
            outcome,
            amount,
            threat: self.threat_of(spell, amount)?,
            periodic: matches!(kind, OutcomeKind::Tick | OutcomeKind::TickCrit),
            healing: false,
        })
    }

    /// Apply a computed damage result: metrics, health, refunds, and the
    /// caster's and target's hooks.
    pub fn deal_damage(&mut self, result: &SpellResult) -> SimResult<()> {
        let now = self.current_time();
        let name = self.spell_slot(result.spell)?.config.name.clone();
        {
            let metrics = &mut self.unit_mut(result.caster)?.metrics;
            metrics.damage_done += result.amount;
            metrics.threat += result.threat;
            metrics.spell_mut(result.id, &name).record(result);
        }
        self.unit_mut(result.target)?.metrics.damage_taken += result.amount;

        self.log_event(LogKind::Damage {
            caster: result.caster,
            target: result.target,
            spell: result.id,
            outcome: result.outcome,
            amount: result.amount,
            periodic: result.periodic,
        });
        trace!(
            caster = %result.caster,
            target = %result.target,
            spell = %result.id,
            outcome = ?result.outcome,
            amount = result.amount,
            "damage"
        );

        if result.amount > 0.0 {
            let target = self.unit_mut(result.target)?;
            if target.is_alive() && target.max_health.is_some() {
                target.health -= result.amount;
                if target.health <= 0.0 {
                    target.health = 0.0;
                    target.died_at = Some(now);
                    self.on_unit_died(result.target);
                }
            }
        }

        if !result.periodic && !result.landed() {
            self.refund(result.spell)?;
        }

        if result.periodic {
            self.dispatch_unit_event(result.caster, &crate::aura::AuraEvent::PeriodicTick(result))?;
        } else {
            self.dispatch_unit_event(result.caster, &crate::aura::AuraEvent::HitDealt(result))?;
        }
        self.dispatch_unit_event(result.target, &crate::aura::AuraEvent::HitTaken(result))
    }

    pub fn calc_and_deal_damage(
        &mut self,
        spell: SpellHandle,
        target: UnitId,
        base: f64,
        kind: OutcomeKind,
    ) -> SimResult<SpellResult> {
        let result = self.calc_damage(spell, target, base, kind)?;
        self.deal_damage(&result)?;
        Ok(result)
    }

    /// Roll and compute healing of `spell` on `target`. Heals never miss.
    pub fn calc_healing(
        &mut self,
        spell: SpellHandle,
        target: UnitId,
        base: f64,
        kind: OutcomeKind,
    ) -> SimResult<SpellResult> {
        let slot = self.spell_slot(spell)?;
        let caster = slot.caster;
        let id = slot.config.id;
        let school = slot.config.school;
        let m = slot.state.modifiers;
        let healing_mult = self.unit(caster)?.stats.get(Stat::HealingDealtMultiplier);

        let outcome = match kind {
            OutcomeKind::MagicHitAndCrit | OutcomeKind::MagicCrit | OutcomeKind::TickCrit => {
                let chance = self.crit_chance(spell, target)?;
                if AttackTable::roll_crit(self.random_float(), chance) {
                    HitOutcome::Crit
                } else {
                    HitOutcome::Hit
                }
            }
            _ => HitOutcome::Hit,
        };
        let base = self.scaled_base(spell, base)?;
        let mut amount = base * m.damage_multiplier * m.damage_multiplier_additive * healing_mult;
        if outcome == HitOutcome::Crit {
            amount *= self.crit_multiplier(spell)?;
        }
        Ok(SpellResult {
            spell,
            id,
            caster,
            target,
            school,
            outcome,
            amount,
            threat: self.threat_of(spell, amount * 0.5)?,
            periodic: matches!(kind, OutcomeKind::Tick | OutcomeKind::TickCrit),
            healing: true,
        })
    }

    /// Apply a computed healing result.
    pub fn deal_healing(&mut self, result: &SpellResult) -> SimResult<()> {
        let name = self.spell_slot(result.spell)?.config.name.clone();
        {
            let metrics = &mut self.unit_mut(result.caster)?.metrics;
            metrics.healing_done += result.amount;
            metrics.threat += result.threat;
            metrics.spell_mut(result.id, &name).record(result);
        }
        let target = self.unit_mut(result.target)?;
        if let (true, Some(max)) = (target.is_alive(), target.max_health) {
            target.health = (target.health + result.amount).min(max);
        }
        self.log_event(LogKind::Healing {
            caster: result.caster,
            target: result.target,
            spell: result.id,
            amount: result.amount,
            periodic: result.periodic,
        });
        if result.periodic {
            self.dispatch_unit_event(result.caster, &crate::aura::AuraEvent::PeriodicTick(result))
        } else {
            self.dispatch_unit_event(result.caster, &crate::aura::AuraEvent::HitDealt(result))
        }
    }

    pub fn calc_and_deal_healing(
        &mut self,
        spell: SpellHandle,
        target: UnitId,
        base: f64,
        kind: OutcomeKind,
    ) -> SimResult<SpellResult> {
        let result = self.calc_healing(spell, target, base, kind)?;
        self.deal_healing(&result)?;
        Ok(result)
    }

    /// Hit chance of `spell` against `target` as a probability.
    pub fn hit_chance(&self, spell: SpellHandle, target: UnitId) -> SimResult<f64> {
        let slot = self.spell_slot(spell)?;
        let table = self.attack_table(slot.caster, target)?;
        let bonus = slot.state.modifiers.bonus_hit;
        Ok(match slot.config.defense {
            DefenseType::Magic => 1.0 - table.spell_miss_chance(bonus),
            DefenseType::Melee | DefenseType::Ranged => 1.0 - table.melee_miss_chance(false, false, bonus),
            DefenseType::None => 1.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{Modifier, StatBlock};
    use crate::unit::{ResourceSpec, UnitSpec};

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn mage_vs_dummy() -> (Simulation, UnitId, UnitId) {
        let mut sim = Simulation::new();
        let boss = sim
            .add_unit(UnitSpec::target("Dummy", 60).with_defenses(false, false))
            .unwrap();
        let mage = sim
            .add_unit(UnitSpec::player("Mage", 60).with_resource(ResourceSpec::mana(1000.0)))
            .unwrap();
        sim.set_current_target(mage, boss).unwrap();
        (sim, mage, boss)
    }

    #[test]
    fn content_id_text_round_trip() {
        let id = ContentId::spell(11366).with_tag(2);
        assert_eq!(id.to_string(), "spell:11366#2");
        assert_eq!("spell:11366#2".parse::<ContentId>().unwrap(), id);
        assert_eq!("item:19019".parse::<ContentId>().unwrap(), ContentId::item(19019));
        assert!("bogus".parse::<ContentId>().is_err());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"spell:11366#2\"");
    }

    #[test]
    fn failed_validation_has_no_side_effects() {
        let (mut sim, mage, boss) = mage_vs_dummy();
        let pyro = sim
            .register_spell(
                mage,
                SpellConfig::new(ContentId::spell(11366), "Pyroblast")
                    .with_cost(CostModel::mana(5000.0))
                    .with_cooldown(secs(30)),
            )
            .unwrap();
        sim.reset(1).unwrap();
        assert!(!sim.cast(pyro, boss).unwrap());
        assert_eq!(sim.resource(mage), Some(1000.0));
        assert_eq!(sim.spell_casts(pyro), 0);
        assert_eq!(sim.next_action_time(mage).unwrap(), Duration::ZERO);
    }

    #[test]
    fn cast_time_and_gcd_scale_with_cast_speed() {
        let (mut sim, mage, boss) = mage_vs_dummy();
        let frostbolt = sim
            .register_spell(
                mage,
                SpellConfig::new(ContentId::spell(116), "Frostbolt")
                    .with_school(SpellSchool::Frost)
                    .with_cast_time(Duration::from_millis(3000)),
            )
            .unwrap();
        sim.reset(1).unwrap();
        sim.add_modifier(mage, Modifier::multiply(Stat::CastSpeed, 2.0))
            .unwrap();
        assert!(sim.cast(frostbolt, boss).unwrap());
        assert!(sim.is_casting(mage));
        assert_eq!(sim.next_action_time(mage).unwrap(), Duration::from_millis(1500));
        // gcd floored at one second
        assert_eq!(
            sim.timer_ready_at(sim.gcd_timer(mage).unwrap()),
            Duration::from_secs(1)
        );
        sim.run_until(Duration::from_millis(1500)).unwrap();
        assert!(!sim.is_casting(mage));
        assert_eq!(sim.spell_casts(frostbolt), 1);
    }

    #[test]
    fn shared_cooldown_blocks_group_members() {
        let (mut sim, mage, boss) = mage_vs_dummy();
        let a = sim
            .register_spell(
                mage,
                SpellConfig::new(ContentId::item(1), "Trinket A")
                    .off_gcd()
                    .with_shared_cooldown(7, secs(20)),
            )
            .unwrap();
        let b = sim
            .register_spell(
                mage,
                SpellConfig::new(ContentId::item(2), "Trinket B")
                    .off_gcd()
                    .with_shared_cooldown(7, secs(20)),
            )
            .unwrap();
        sim.reset(1).unwrap();
        assert!(sim.cast(a, boss).unwrap());
        assert!(!sim.can_cast(b, boss));
        assert_eq!(sim.spell_ready_at(b).unwrap(), secs(20));
        sim.run_until(secs(20)).unwrap();
        assert!(sim.can_cast(b, boss));
    }

    #[test]
    fn missed_cast_refunds_once() {
        let mut sim = Simulation::new();
        let boss = sim.add_unit(UnitSpec::target("Boss", 63)).unwrap();
        let warrior = sim
            .add_unit(
                UnitSpec::player("Warrior", 60).with_resource(ResourceSpec {
                    starting: 50.0,
                    ..ResourceSpec::rage()
                }),
            )
            .unwrap();
        let strike = sim
            .register_spell(
                warrior,
                SpellConfig::new(ContentId::spell(20569), "Strike")
                    .with_defense(DefenseType::Melee)
                    .with_cost(CostModel::rage(20.0).with_refund(0.8))
                    .with_effect(|sim, spell, target| {
                        let mut result =
                            sim.calc_damage(spell, target, 100.0, OutcomeKind::MeleeSpecial)?;
                        result.outcome = HitOutcome::Dodge;
                        result.amount = 0.0;
                        sim.deal_damage(&result)?;
                        // a second miss from the same cast owes nothing more
                        sim.deal_damage(&result)
                    }),
            )
            .unwrap();
        sim.reset(3).unwrap();
        assert!(sim.cast(strike, boss).unwrap());
        assert!((sim.resource(warrior).unwrap() - 46.0).abs() < 1e-9);
    }

    #[test]
    fn physical_damage_is_mitigated_by_armor() {
        let mut sim = Simulation::new();
        let boss = sim
            .add_unit(
                UnitSpec::target("Boss", 60)
                    .with_stats(StatBlock::neutral().with(Stat::Armor, 5500.0)),
            )
            .unwrap();
        let rogue = sim.add_unit(UnitSpec::player("Rogue", 60)).unwrap();
        let spell = sim
            .register_spell(
                rogue,
                SpellConfig::new(ContentId::spell(1), "Hit").with_defense(DefenseType::Melee),
            )
            .unwrap();
        sim.reset(1).unwrap();
        let result = sim.calc_damage(spell, boss, 1000.0, OutcomeKind::AlwaysHit).unwrap();
        let mitigation = 5500.0 / (5500.0 + 400.0 + 85.0 * 60.0);
        assert!((result.amount - 1000.0 * (1.0 - mitigation)).abs() < 1e-9);
    }

    #[test]
    fn coefficient_adds_scaling_power_to_base() {
        let mut sim = Simulation::new();
        let boss = sim.add_unit(UnitSpec::target("Boss", 60)).unwrap();
        let priest = sim
            .add_unit(
                UnitSpec::player("Priest", 60)
                    .with_stats(StatBlock::neutral().with(Stat::SpellPower, 200.0)),
            )
            .unwrap();
        let flat = sim
            .register_spell(
                priest,
                SpellConfig::new(ContentId::spell(1), "Flat").with_school(SpellSchool::Shadow),
            )
            .unwrap();
        let scaled = sim
            .register_spell(
                priest,
                SpellConfig::new(ContentId::spell(2), "Scaled")
                    .with_school(SpellSchool::Shadow)
                    .with_coefficient(0.5),
            )
            .unwrap();
        sim.reset(1).unwrap();

        let a = sim.calc_damage(flat, boss, 100.0, OutcomeKind::AlwaysHit).unwrap();
        let b = sim.calc_damage(scaled, boss, 100.0, OutcomeKind::AlwaysHit).unwrap();
        assert!(a.amount > 0.0);
        // 100 + 0.5 * 200
        assert!((b.amount - 2.0 * a.amount).abs() < 1e-9);

        let heal = sim.calc_healing(scaled, priest, 100.0, OutcomeKind::AlwaysHit).unwrap();
        let plain = sim.calc_healing(flat, priest, 100.0, OutcomeKind::AlwaysHit).unwrap();
        assert!((heal.amount - 2.0 * plain.amount).abs() < 1e-9);
    }

    #[test]
    fn expected_outcome_consumes_no_randomness() {
        let (mut sim, mage, boss) = mage_vs_dummy();
        let spell = sim
            .register_spell(
                mage,
                SpellConfig::new(ContentId::spell(2), "Scorch").with_school(SpellSchool::Fire),
            )
            .unwrap();
        sim.reset(99).unwrap();
        let mut twin = sim.rng_clone();
        sim.calc_damage(spell, boss, 100.0, OutcomeKind::Expected).unwrap();
        assert_eq!(sim.random_float(), rand::Rng::gen::<f64>(&mut twin));
    }
}
