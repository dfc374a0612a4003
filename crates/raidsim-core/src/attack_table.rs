//! Attacker-vs-defender outcome tables.
//!
//! An [`AttackTable`] caches every chance that depends only on the two units
//! involved: level-difference penalties, the defender's avoidance, the
//! attacker's hit and crit, armor mitigation, and the damage multipliers on
//! both sides. The simulation keeps one table per ordered unit pair and
//! recomputes the affected rows and columns whenever a stat changes, so
//! rolling an outcome is a handful of comparisons.
//!
//! Melee uses a single roll walked down the table in a fixed order:
//!
//! ```text
//! miss -> dodge -> parry -> glance -> block -> crit -> hit
//! ```
//!
//! Spells roll hit and crit independently.

use serde::{Deserialize, Serialize};

use crate::stats::{Stat, StatBlock};

/// Melee/ranged miss chance by level difference (0..=3).
pub const MELEE_MISS_BY_LEVEL_DIFF: [f64; 4] = [0.05, 0.055, 0.06, 0.08];
/// Spell miss chance by level difference (0..=3).
pub const SPELL_MISS_BY_LEVEL_DIFF: [f64; 4] = [0.04, 0.05, 0.06, 0.17];
/// Spells always have at least this chance to miss.
pub const SPELL_MISS_FLOOR: f64 = 0.01;
/// Extra white-swing miss chance while dual wielding.
pub const DUAL_WIELD_PENALTY: f64 = 0.19;
pub const BASE_DODGE: f64 = 0.05;
pub const BASE_PARRY: f64 = 0.05;
pub const BASE_BLOCK: f64 = 0.05;
/// Avoidance gained per level of difference.
pub const AVOIDANCE_PER_LEVEL: f64 = 0.005;
pub const GLANCE_PER_LEVEL: f64 = 0.10;
pub const GLANCE_MULTIPLIER: f64 = 0.75;
pub const CRIT_SUPPRESSION_PER_LEVEL: f64 = 0.01;
/// Armor can never mitigate more than this.
pub const MAX_ARMOR_MITIGATION: f64 = 0.75;

/// Converts a rating stat into a chance; one point is one percent.
#[inline]
pub fn rating_to_chance(rating: f64) -> f64 {
    rating / 100.0
}

/// Result of an attack roll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HitOutcome {
    Miss,
    Dodge,
    Parry,
    Glance,
    Block,
    Crit,
    Hit,
}

impl HitOutcome {
    /// Whether the attack connected at all.
    #[inline]
    pub fn landed(self) -> bool {
        !matches!(self, HitOutcome::Miss | HitOutcome::Dodge | HitOutcome::Parry)
    }

    #[inline]
    pub fn is_crit(self) -> bool {
        self == HitOutcome::Crit
    }
}

/// The slice of a unit an attack table is computed from.
#[derive(Debug, Clone, Copy)]
pub struct Combatant {
    pub level: u32,
    pub stats: StatBlock,
    pub can_block: bool,
    pub can_parry: bool,
    /// Hostile units take level penalties; friendly ones apply them.
    pub hostile: bool,
}

/// Cached outcome chances for one attacker/defender pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttackTable {
    pub level_diff: u32,
    pub melee_miss: f64,
    pub spell_miss: f64,
    pub dodge: f64,
    pub parry: f64,
    pub glance: f64,
    pub block: f64,
    pub glance_multiplier: f64,
    pub melee_hit: f64,
    pub spell_hit: f64,
    /// Attacker melee crit chance after suppression.
    pub melee_crit: f64,
    pub spell_crit: f64,
    /// Fraction of physical damage removed by the defender's armor.
    pub armor_mitigation: f64,
    pub block_value: f64,
    pub damage_dealt: f64,
    pub damage_taken: f64,
}

impl AttackTable {
    pub fn compute(attacker: &Combatant, defender: &Combatant) -> Self {
        let level_diff = if defender.hostile && !attacker.hostile {
            defender.level.saturating_sub(attacker.level).min(3)
        } else {
            0
        };
        let diff = level_diff as usize;
        let per_level = f64::from(level_diff);

        let a = &attacker.stats;
        let d = &defender.stats;

        let armor = d[Stat::Armor].max(0.0);
        let armor_mitigation = if armor > 0.0 {
            let k = 400.0 + 85.0 * f64::from(attacker.level);
            (armor / (armor + k)).min(MAX_ARMOR_MITIGATION)
        } else {
            0.0
        };

        Self {
            level_diff,
            melee_miss: MELEE_MISS_BY_LEVEL_DIFF[diff],
            spell_miss: SPELL_MISS_BY_LEVEL_DIFF[diff],
            dodge: BASE_DODGE + AVOIDANCE_PER_LEVEL * per_level,
            parry: if defender.can_parry {
                BASE_PARRY + AVOIDANCE_PER_LEVEL * per_level
            } else {
                0.0
            },
            glance: if attacker.hostile {
                0.0
            } else {
                GLANCE_PER_LEVEL * (1.0 + per_level)
            },
            block: if defender.can_block { BASE_BLOCK } else { 0.0 },
            glance_multiplier: GLANCE_MULTIPLIER,
            melee_hit: rating_to_chance(a[Stat::MeleeHit]),
            spell_hit: rating_to_chance(a[Stat::SpellHit]),
            melee_crit: (rating_to_chance(a[Stat::MeleeCrit])
                - CRIT_SUPPRESSION_PER_LEVEL * per_level)
                .max(0.0),
            spell_crit: rating_to_chance(a[Stat::SpellCrit]).max(0.0),
            armor_mitigation,
            block_value: d[Stat::BlockValue].max(0.0),
            damage_dealt: a[Stat::DamageDealtMultiplier],
            damage_taken: d[Stat::DamageTakenMultiplier],
        }
    }

    /// Miss chance of a melee or ranged attack after hit bonuses.
    pub fn melee_miss_chance(&self, white: bool, dual_wield: bool, bonus_hit: f64) -> f64 {
        let penalty = if white && dual_wield {
            DUAL_WIELD_PENALTY
        } else {
            0.0
        };
        (self.melee_miss + penalty - self.melee_hit - bonus_hit).max(0.0)
    }

    /// Spell miss chance after hit bonuses, never below the floor.
    pub fn spell_miss_chance(&self, bonus_hit: f64) -> f64 {
        (self.spell_miss - self.spell_hit - bonus_hit).max(SPELL_MISS_FLOOR)
    }

    pub fn melee_crit_chance(&self, bonus_crit: f64) -> f64 {
        (self.melee_crit + bonus_crit).clamp(0.0, 1.0)
    }

    pub fn spell_crit_chance(&self, bonus_crit: f64) -> f64 {
        (self.spell_crit + bonus_crit).clamp(0.0, 1.0)
    }

    /// One-roll melee table. `white` swings can glance; specials cannot.
    pub fn roll_melee(
        &self,
        roll: f64,
        white: bool,
        dual_wield: bool,
        bonus_hit: f64,
        bonus_crit: f64,
    ) -> HitOutcome {
        let mut edge = self.melee_miss_chance(white, dual_wield, bonus_hit);
        if roll < edge {
            return HitOutcome::Miss;
        }
        edge += self.dodge;
        if roll < edge {
            return HitOutcome::Dodge;
        }
        edge += self.parry;
        if roll < edge {
            return HitOutcome::Parry;
        }
        if white {
            edge += self.glance;
            if roll < edge {
                return HitOutcome::Glance;
            }
        }
        edge += self.block;
        if roll < edge {
            return HitOutcome::Block;
        }
        edge += self.melee_crit_chance(bonus_crit);
        if roll < edge {
            return HitOutcome::Crit;
        }
        HitOutcome::Hit
    }

    /// Ranged attacks can miss or crit but are never parried or glance.
    pub fn roll_ranged(&self, roll: f64, bonus_hit: f64, bonus_crit: f64) -> HitOutcome {
        let mut edge = self.melee_miss_chance(false, false, bonus_hit);
        if roll < edge {
            return HitOutcome::Miss;
        }
        edge += self.dodge;
        if roll < edge {
            return HitOutcome::Dodge;
        }
        edge += self.melee_crit_chance(bonus_crit);
        if roll < edge {
            return HitOutcome::Crit;
        }
        HitOutcome::Hit
    }

    /// `true` when the spell lands.
    pub fn roll_spell_hit(&self, roll: f64, bonus_hit: f64) -> bool {
        roll >= self.spell_miss_chance(bonus_hit)
    }

    /// `true` when `roll` falls inside `chance`.
    #[inline]
    pub fn roll_crit(roll: f64, chance: f64) -> bool {
        roll < chance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(level: u32) -> Combatant {
        Combatant {
            level,
            stats: StatBlock::neutral(),
            can_block: false,
            can_parry: false,
            hostile: false,
        }
    }

    fn boss(level: u32) -> Combatant {
        Combatant {
            level,
            stats: StatBlock::neutral(),
            can_block: false,
            can_parry: true,
            hostile: true,
        }
    }

    #[test]
    fn boss_level_penalties() {
        let table = AttackTable::compute(&player(60), &boss(63));
        assert_eq!(table.level_diff, 3);
        assert_eq!(table.melee_miss, 0.08);
        assert_eq!(table.spell_miss, 0.17);
        assert!((table.glance - 0.40).abs() < 1e-12);
        assert!((table.dodge - 0.065).abs() < 1e-12);
    }

    #[test]
    fn hostile_attacker_has_no_penalties_or_glances() {
        let table = AttackTable::compute(&boss(63), &player(60));
        assert_eq!(table.level_diff, 0);
        assert_eq!(table.glance, 0.0);
        assert_eq!(table.parry, 0.0);
    }

    #[test]
    fn melee_roll_walks_the_table_in_order() {
        let mut attacker = player(60);
        attacker.stats[Stat::MeleeCrit] = 20.0;
        let table = AttackTable::compute(&attacker, &boss(60));
        // miss 5%, dodge 5%, parry 5%, glance 10%, crit 20%
        assert_eq!(table.roll_melee(0.01, true, false, 0.0, 0.0), HitOutcome::Miss);
        assert_eq!(table.roll_melee(0.07, true, false, 0.0, 0.0), HitOutcome::Dodge);
        assert_eq!(table.roll_melee(0.12, true, false, 0.0, 0.0), HitOutcome::Parry);
        assert_eq!(table.roll_melee(0.20, true, false, 0.0, 0.0), HitOutcome::Glance);
        assert_eq!(table.roll_melee(0.30, true, false, 0.0, 0.0), HitOutcome::Crit);
        assert_eq!(table.roll_melee(0.50, true, false, 0.0, 0.0), HitOutcome::Hit);
        // specials skip the glance band
        assert_eq!(table.roll_melee(0.20, false, false, 0.0, 0.0), HitOutcome::Crit);
    }

    #[test]
    fn hit_rating_reduces_miss_and_spell_floor_holds() {
        let mut attacker = player(60);
        attacker.stats[Stat::MeleeHit] = 3.0;
        attacker.stats[Stat::SpellHit] = 30.0;
        let table = AttackTable::compute(&attacker, &boss(63));
        assert!((table.melee_miss_chance(false, false, 0.0) - 0.05).abs() < 1e-12);
        assert!((table.melee_miss_chance(true, true, 0.0) - 0.24).abs() < 1e-12);
        assert_eq!(table.spell_miss_chance(0.0), SPELL_MISS_FLOOR);
    }

    #[test]
    fn armor_mitigation_formula() {
        let mut target = boss(63);
        target.stats[Stat::Armor] = 3731.0;
        let table = AttackTable::compute(&player(60), &target);
        let expected = 3731.0 / (3731.0 + 400.0 + 85.0 * 60.0);
        assert!((table.armor_mitigation - expected).abs() < 1e-12);
    }
}
