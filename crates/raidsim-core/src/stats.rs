//! Stat sheets with token-based modifiers.
//!
//! A [`StatSheet`] holds a unit's base stats, a list of active modifiers, and
//! the effective values derived from them. Effective values are always
//! recomputed from scratch:
//!
//! ```text
//! effective[s] = (base[s] + sum(add[s]) + sum(coeff * effective[source])) * prod(mul[s])
//! ```
//!
//! Stats are evaluated in declaration order and a dependency may only read a
//! stat declared *before* its target, so one pass is enough and there are no
//! cycles. Because nothing is applied incrementally, applying a modifier and
//! reverting it through its [`ModifierToken`] restores the exact previous
//! values, no matter how many other modifiers came and went in between.

use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

use crate::SetupError;

// ---------------------------------------------------------------------------
// Stat
// ---------------------------------------------------------------------------

/// Every stat the engine understands.
///
/// Declaration order matters: it is the evaluation order of the stat sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stat {
    Strength,
    Agility,
    Stamina,
    Intellect,
    Spirit,
    AttackPower,
    RangedAttackPower,
    SpellPower,
    HealingPower,
    /// Flat bonus added to every weapon swing.
    BonusWeaponDamage,
    /// Hit rating; one point is one percent.
    MeleeHit,
    SpellHit,
    /// Crit rating; one point is one percent.
    MeleeCrit,
    SpellCrit,
    Armor,
    BlockValue,
    /// Mana regained every five seconds.
    Mp5,
    /// Attack speed multiplier for melee weapons.
    MeleeSpeed,
    RangedSpeed,
    CastSpeed,
    DamageDealtMultiplier,
    DamageTakenMultiplier,
    HealingDealtMultiplier,
    ThreatMultiplier,
}

/// Number of [`Stat`] variants.
pub const STAT_COUNT: usize = 24;

impl Stat {
    /// All stats in evaluation order.
    pub const ALL: [Stat; STAT_COUNT] = [
        Stat::Strength,
        Stat::Agility,
        Stat::Stamina,
        Stat::Intellect,
        Stat::Spirit,
        Stat::AttackPower,
        Stat::RangedAttackPower,
        Stat::SpellPower,
        Stat::HealingPower,
        Stat::BonusWeaponDamage,
        Stat::MeleeHit,
        Stat::SpellHit,
        Stat::MeleeCrit,
        Stat::SpellCrit,
        Stat::Armor,
        Stat::BlockValue,
        Stat::Mp5,
        Stat::MeleeSpeed,
        Stat::RangedSpeed,
        Stat::CastSpeed,
        Stat::DamageDealtMultiplier,
        Stat::DamageTakenMultiplier,
        Stat::HealingDealtMultiplier,
        Stat::ThreatMultiplier,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether the stat is a multiplier whose neutral value is `1.0`.
    pub fn is_multiplier(self) -> bool {
        matches!(
            self,
            Stat::MeleeSpeed
                | Stat::RangedSpeed
                | Stat::CastSpeed
                | Stat::DamageDealtMultiplier
                | Stat::DamageTakenMultiplier
                | Stat::HealingDealtMultiplier
                | Stat::ThreatMultiplier
        )
    }

    /// Neutral base value.
    pub fn neutral(self) -> f64 {
        if self.is_multiplier() {
            1.0
        } else {
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// StatBlock
// ---------------------------------------------------------------------------

/// One value per [`Stat`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatBlock {
    values: [f64; STAT_COUNT],
}

impl StatBlock {
    /// All zeros, including multipliers.
    pub fn zero() -> Self {
        Self {
            values: [0.0; STAT_COUNT],
        }
    }

    /// Neutral values: zero for flat stats, one for multipliers.
    pub fn neutral() -> Self {
        let mut block = Self::zero();
        for stat in Stat::ALL {
            block[stat] = stat.neutral();
        }
        block
    }

    /// Builder-style setter.
    pub fn with(mut self, stat: Stat, value: f64) -> Self {
        self[stat] = value;
        self
    }

    /// Neutral block overridden by `(stat, value)` pairs.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (Stat, f64)>,
    {
        let mut block = Self::neutral();
        for (stat, value) in pairs {
            block[stat] = value;
        }
        block
    }

    pub fn iter(&self) -> impl Iterator<Item = (Stat, f64)> + '_ {
        Stat::ALL.iter().map(move |&s| (s, self.values[s.index()]))
    }
}

impl Default for StatBlock {
    fn default() -> Self {
        Self::neutral()
    }
}

impl Index<Stat> for StatBlock {
    type Output = f64;

    fn index(&self, stat: Stat) -> &f64 {
        &self.values[stat.index()]
    }
}

impl IndexMut<Stat> for StatBlock {
    fn index_mut(&mut self, stat: Stat) -> &mut f64 {
        &mut self.values[stat.index()]
    }
}

// ---------------------------------------------------------------------------
// Modifiers
// ---------------------------------------------------------------------------

/// How a modifier combines with the stat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ModifierKind {
    /// Added to the pre-multiplier sum.
    Add(f64),
    /// Multiplied into the final value.
    Multiply(f64),
}

/// A single stat change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Modifier {
    pub stat: Stat,
    pub kind: ModifierKind,
}

impl Modifier {
    pub fn add(stat: Stat, amount: f64) -> Self {
        Self {
            stat,
            kind: ModifierKind::Add(amount),
        }
    }

    pub fn multiply(stat: Stat, factor: f64) -> Self {
        Self {
            stat,
            kind: ModifierKind::Multiply(factor),
        }
    }

    /// The modifier scaled for `stacks` stacks: additive amounts scale
    /// linearly, multipliers add their bonus once per stack.
    pub fn scaled(self, stacks: u32) -> Self {
        let n = f64::from(stacks);
        let kind = match self.kind {
            ModifierKind::Add(v) => ModifierKind::Add(v * n),
            ModifierKind::Multiply(f) => ModifierKind::Multiply(1.0 + (f - 1.0) * n),
        };
        Self { kind, ..self }
    }
}

/// Handle returned when a modifier is applied; reverting it removes exactly
/// that application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModifierToken(u64);

/// `target += coefficient * source`, evaluated after `source` is final.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatDependency {
    pub source: Stat,
    pub target: Stat,
    pub coefficient: f64,
}

impl StatDependency {
    pub fn new(source: Stat, target: Stat, coefficient: f64) -> Self {
        Self {
            source,
            target,
            coefficient,
        }
    }
}

// ---------------------------------------------------------------------------
// StatSheet
// ---------------------------------------------------------------------------

/// Base stats, active modifiers, and the derived effective values.
#[derive(Debug, Clone)]
pub struct StatSheet {
    base: StatBlock,
    dependencies: Vec<StatDependency>,
    /// Active modifiers in application order.
    modifiers: Vec<(ModifierToken, Modifier)>,
    next_token: u64,
    effective: StatBlock,
}

impl StatSheet {
    pub fn new(base: StatBlock) -> Self {
        Self {
            base,
            dependencies: Vec::new(),
            modifiers: Vec::new(),
            next_token: 0,
            effective: base,
        }
    }

    /// Declare a derived stat relationship. Permanent for the sheet's life.
    pub fn add_dependency(&mut self, dep: StatDependency) -> Result<(), SetupError> {
        if dep.source.index() >= dep.target.index() {
            return Err(SetupError::InvalidStatDependency {
                source_stat: dep.source,
                target: dep.target,
            });
        }
        self.dependencies.push(dep);
        self.recompute();
        Ok(())
    }

    /// Apply a modifier and return the token that reverts it.
    pub fn apply(&mut self, modifier: Modifier) -> ModifierToken {
        let token = ModifierToken(self.next_token);
        self.next_token += 1;
        self.modifiers.push((token, modifier));
        self.recompute();
        token
    }

    /// Revert a previously applied modifier. Unknown tokens are ignored.
    pub fn revert(&mut self, token: ModifierToken) -> Option<Modifier> {
        let pos = self.modifiers.iter().position(|(t, _)| *t == token)?;
        let (_, modifier) = self.modifiers.remove(pos);
        self.recompute();
        Some(modifier)
    }

    /// Effective value of `stat`.
    #[inline]
    pub fn get(&self, stat: Stat) -> f64 {
        self.effective[stat]
    }

    /// Unmodified base value of `stat`.
    #[inline]
    pub fn base(&self, stat: Stat) -> f64 {
        self.base[stat]
    }

    pub fn effective(&self) -> &StatBlock {
        &self.effective
    }

    /// Number of active modifiers.
    pub fn modifier_count(&self) -> usize {
        self.modifiers.len()
    }

    /// Drop every modifier, keeping base stats and dependencies.
    pub fn clear_modifiers(&mut self) {
        self.modifiers.clear();
        self.recompute();
    }

    fn recompute(&mut self) {
        let mut adds = StatBlock::zero();
        let mut muls = StatBlock::zero();
        for stat in Stat::ALL {
            muls[stat] = 1.0;
        }
        for (_, m) in &self.modifiers {
            match m.kind {
                ModifierKind::Add(v) => adds[m.stat] += v,
                ModifierKind::Multiply(f) => muls[m.stat] *= f,
            }
        }

        for stat in Stat::ALL {
            let mut value = self.base[stat] + adds[stat];
            for dep in self.dependencies.iter().filter(|d| d.target == stat) {
                value += dep.coefficient * self.effective[dep.source];
            }
            self.effective[stat] = value * muls[stat];
        }
    }
}
