//! Auto-attack swing timers.
//!
//! Each weapon slot runs its own timer. A swing rolls the white-hit table,
//! deals damage, generates rage for rage users, and schedules the next swing
//! one weapon speed (divided by the unit's attack speed multiplier) later.
//! Attack speed changes rescale the time left on a pending swing.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::clock::seconds;
use crate::queue::ActionId;
use crate::sim::{Action, Simulation};
use crate::spell::{ContentId, DefenseType, OutcomeKind, SpellConfig, SpellFlags, SpellHandle};
use crate::stats::Stat;
use crate::unit::UnitId;
use crate::{SetupError, SimResult};

/// Off-hand swings deal this fraction of their rolled damage.
pub const OFF_HAND_MULTIPLIER: f64 = 0.5;
/// Attack power per point of weapon damage per second of swing speed.
pub const ATTACK_POWER_PER_DPS: f64 = 14.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WeaponSlot {
    MainHand,
    OffHand,
    Ranged,
}

impl WeaponSlot {
    pub const ALL: [WeaponSlot; 3] = [WeaponSlot::MainHand, WeaponSlot::OffHand, WeaponSlot::Ranged];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    fn speed_stat(self) -> Stat {
        match self {
            WeaponSlot::MainHand | WeaponSlot::OffHand => Stat::MeleeSpeed,
            WeaponSlot::Ranged => Stat::RangedSpeed,
        }
    }

    fn power_stat(self) -> Stat {
        match self {
            WeaponSlot::MainHand | WeaponSlot::OffHand => Stat::AttackPower,
            WeaponSlot::Ranged => Stat::RangedAttackPower,
        }
    }

    fn spell_name(self) -> &'static str {
        match self {
            WeaponSlot::MainHand => "Main Hand",
            WeaponSlot::OffHand => "Off Hand",
            WeaponSlot::Ranged => "Auto Shot",
        }
    }

    /// Content id of the built-in auto-attack spell for this slot.
    pub fn content_id(self) -> ContentId {
        ContentId::other(1).with_tag(self.index() as i32 + 1)
    }
}

/// Weapon damage range and base speed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weapon {
    pub min_damage: f64,
    pub max_damage: f64,
    pub swing_speed: Duration,
}

impl Weapon {
    pub fn new(min_damage: f64, max_damage: f64, swing_speed_secs: f64) -> Self {
        Self {
            min_damage,
            max_damage,
            swing_speed: seconds(swing_speed_secs),
        }
    }

    pub(crate) fn validate(&self, unit: &str) -> Result<(), SetupError> {
        let invalid = |reason: &str| SetupError::InvalidWeapon {
            unit: unit.to_owned(),
            reason: reason.to_owned(),
        };
        if self.swing_speed.is_zero() {
            return Err(invalid("swing speed must be positive"));
        }
        if !(self.min_damage >= 0.0 && self.max_damage >= self.min_damage) {
            return Err(invalid("damage range must satisfy 0 <= min <= max"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct AutoAttackState {
    weapons: [Option<Weapon>; 3],
    spells: [Option<SpellHandle>; 3],
    enabled: bool,
    next_swing: [Option<(ActionId, Duration)>; 3],
    /// Time left on each swing while paused.
    paused: [Option<Duration>; 3],
    /// Speed multiplier each pending swing was scheduled with.
    scheduled_speed: [f64; 3],
}

impl AutoAttackState {
    pub fn new(weapons: [Option<Weapon>; 3]) -> Self {
        Self {
            weapons,
            ..Self::default()
        }
    }

    pub fn is_dual_wielding(&self) -> bool {
        self.weapons[WeaponSlot::MainHand.index()].is_some()
            && self.weapons[WeaponSlot::OffHand.index()].is_some()
    }

    pub fn weapons(&self) -> impl Iterator<Item = (WeaponSlot, Weapon)> + '_ {
        WeaponSlot::ALL
            .iter()
            .filter_map(move |&s| self.weapons[s.index()].map(|w| (s, w)))
    }

    pub fn reset(&mut self) {
        self.next_swing = [None; 3];
        self.paused = [None; 3];
        self.scheduled_speed = [1.0; 3];
    }
}

// ---------------------------------------------------------------------------
// Simulation: auto-attack operations
// ---------------------------------------------------------------------------

impl Simulation {
    /// Register the unit's auto-attack spells and turn swinging on for every
    /// trial. Setup-time only.
    pub fn enable_auto_attacks(&mut self, unit: UnitId) -> SimResult<()> {
        let weapons: Vec<(WeaponSlot, Weapon)> = self.unit(unit)?.auto.weapons().collect();
        for (slot, _) in weapons {
            let defense = if slot == WeaponSlot::Ranged {
                DefenseType::Ranged
            } else {
                DefenseType::Melee
            };
            let spell = self.register_spell(
                unit,
                SpellConfig::new(slot.content_id(), slot.spell_name())
                    .with_defense(defense)
                    .off_gcd()
                    .with_flags(SpellFlags {
                        auto_attack: true,
                        ..SpellFlags::default()
                    }),
            )?;
            self.unit_mut(unit)?.auto.spells[slot.index()] = Some(spell);
        }
        self.unit_mut(unit)?.auto.enabled = true;
        Ok(())
    }

    /// Schedule the first swing of every weapon at the current time.
    pub(crate) fn start_auto_attacks(&mut self, unit: UnitId) -> SimResult<()> {
        if !self.unit(unit)?.auto.enabled {
            return Ok(());
        }
        let now = self.current_time();
        let slots: Vec<WeaponSlot> = self.unit(unit)?.auto.weapons().map(|(s, _)| s).collect();
        for slot in slots {
            self.schedule_swing(unit, slot, now)?;
        }
        Ok(())
    }

    /// When the next swing of `slot` lands, if one is pending.
    pub fn next_swing_at(&self, unit: UnitId, slot: WeaponSlot) -> Option<Duration> {
        self.units
            .get(unit.index())
            .and_then(|u| u.auto.next_swing[slot.index()].map(|(_, at)| at))
    }

    /// Current time between swings of `slot`.
    pub fn swing_interval(&self, unit: UnitId, slot: WeaponSlot) -> SimResult<Duration> {
        let u = self.unit(unit)?;
        let Some(weapon) = u.auto.weapons[slot.index()] else {
            return Ok(Duration::ZERO);
        };
        Ok(weapon.swing_speed.div_f64(speed_multiplier(u.stats.get(slot.speed_stat()))))
    }

    fn schedule_swing(&mut self, unit: UnitId, slot: WeaponSlot, at: Duration) -> SimResult<()> {
        let speed = speed_multiplier(self.unit(unit)?.stats.get(slot.speed_stat()));
        let id = self.schedule_action(at, Action::Swing { unit, slot })?;
        let auto = &mut self.unit_mut(unit)?.auto;
        auto.next_swing[slot.index()] = Some((id, at));
        auto.scheduled_speed[slot.index()] = speed;
        Ok(())
    }

    fn cancel_swing(&mut self, unit: UnitId, slot: WeaponSlot) -> SimResult<Option<Duration>> {
        let pending = self.unit_mut(unit)?.auto.next_swing[slot.index()].take();
        Ok(pending.map(|(id, at)| {
            self.queue.cancel(id);
            at
        }))
    }

    pub(crate) fn swing(&mut self, unit: UnitId, slot: WeaponSlot) -> SimResult<()> {
        let now = self.current_time();
        let u = self.unit_mut(unit)?;
        u.auto.next_swing[slot.index()] = None;
        let weapon = u.auto.weapons[slot.index()];
        let spell = u.auto.spells[slot.index()];
        let alive = u.is_alive();
        let current = u.current_target;
        let (Some(weapon), Some(spell)) = (weapon, spell) else {
            return Ok(());
        };
        if !alive {
            return Ok(());
        }
        let target = match current {
            Some(t) if self.is_alive(t) => t,
            _ => match self.retarget(unit)? {
                Some(t) => t,
                None => return Ok(()),
            },
        };

        let stats = &self.unit(unit)?.stats;
        let power = stats.get(slot.power_stat());
        let bonus = stats.get(Stat::BonusWeaponDamage);
        let rolled = self.roll_range(weapon.min_damage, weapon.max_damage);
        let mut base =
            rolled + power / ATTACK_POWER_PER_DPS * weapon.swing_speed.as_secs_f64() + bonus;
        if slot == WeaponSlot::OffHand {
            base *= OFF_HAND_MULTIPLIER;
        }
        let kind = if slot == WeaponSlot::Ranged {
            OutcomeKind::Ranged
        } else {
            OutcomeKind::MeleeWhite
        };

        let result = self.calc_damage(spell, target, base, kind)?;
        trace!(unit = %unit, slot = ?slot, outcome = ?result.outcome, amount = result.amount, "swing");
        self.deal_damage(&result)?;
        if result.landed() {
            self.rage_from_damage(unit, result.amount)?;
        }

        // hooks may have paused, delayed, or already rescheduled this slot
        let u = self.unit(unit)?;
        if u.is_alive() && u.auto.next_swing[slot.index()].is_none() && u.auto.paused[slot.index()].is_none() {
            let interval = self.swing_interval(unit, slot)?;
            self.schedule_swing(unit, slot, now + interval)?;
        }
        Ok(())
    }

    /// Push pending melee swings that would land before `until` back to
    /// `until`. Ranged swings are unaffected.
    pub fn delay_melee_until(&mut self, unit: UnitId, until: Duration) -> SimResult<()> {
        for slot in [WeaponSlot::MainHand, WeaponSlot::OffHand] {
            let pending = self.unit(unit)?.auto.next_swing[slot.index()];
            if let Some((_, at)) = pending {
                if at < until {
                    self.cancel_swing(unit, slot)?;
                    self.schedule_swing(unit, slot, until)?;
                }
            }
        }
        Ok(())
    }

    /// Stop every swing timer, remembering how much time each had left.
    pub fn pause_auto_attacks(&mut self, unit: UnitId) -> SimResult<()> {
        let now = self.current_time();
        for slot in WeaponSlot::ALL {
            if let Some(at) = self.cancel_swing(unit, slot)? {
                self.unit_mut(unit)?.auto.paused[slot.index()] = Some(at.saturating_sub(now));
            }
        }
        Ok(())
    }

    /// Restart paused swing timers with their remaining time.
    pub fn resume_auto_attacks(&mut self, unit: UnitId) -> SimResult<()> {
        let now = self.current_time();
        for slot in WeaponSlot::ALL {
            if let Some(left) = self.unit_mut(unit)?.auto.paused[slot.index()].take() {
                self.schedule_swing(unit, slot, now + left)?;
            }
        }
        Ok(())
    }

    /// Restart every running swing timer from now.
    pub fn reset_swing_timers(&mut self, unit: UnitId) -> SimResult<()> {
        let now = self.current_time();
        for slot in WeaponSlot::ALL {
            if self.cancel_swing(unit, slot)?.is_some() {
                let interval = self.swing_interval(unit, slot)?;
                self.schedule_swing(unit, slot, now + interval)?;
            }
        }
        Ok(())
    }

    /// Rescale pending swings after an attack speed change so the time left
    /// shrinks or grows in proportion.
    pub(crate) fn rescale_swings(&mut self, unit: UnitId) -> SimResult<()> {
        let now = self.current_time();
        for slot in WeaponSlot::ALL {
            let u = self.unit(unit)?;
            let Some((_, at)) = u.auto.next_swing[slot.index()] else {
                continue;
            };
            let old = u.auto.scheduled_speed[slot.index()];
            let new = speed_multiplier(u.stats.get(slot.speed_stat()));
            if old == new {
                continue;
            }
            let left = at.saturating_sub(now).mul_f64(old / new);
            self.cancel_swing(unit, slot)?;
            self.schedule_swing(unit, slot, now + left)?;
        }
        Ok(())
    }
}

fn speed_multiplier(value: f64) -> f64 {
    if value > 0.0 {
        value
    } else {
        1.0
    }
}
