//! Units: players, pets, and hostile targets.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auto_attack::{AutoAttackState, Weapon};
use crate::aura::AuraHandle;
use crate::metrics::UnitMetrics;
use crate::queue::ActionId;
use crate::resource::ResourcePool;
use crate::spell::{CastInProgress, ContentId, SpellHandle};
use crate::stats::{StatBlock, StatSheet};
use crate::timer::TimerId;

// ---------------------------------------------------------------------------
// UnitId
// ---------------------------------------------------------------------------

/// Index of a unit in its simulation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub(crate) u32);

impl UnitId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnitId({})", self.0)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// What side of the fight a unit is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitKind {
    Player,
    /// Controlled by, and reported under, its owner.
    Pet { owner: UnitId },
    /// Hostile; the encounter ends early once every target is dead.
    Target,
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Resource flavours with distinct generation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Regenerates on a tick from `Mp5` plus a flat amount.
    Mana,
    /// Generated from auto-attack damage; no passive regeneration.
    Rage,
    /// Regenerates a flat amount per tick.
    Energy,
}

/// Resource pool definition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    pub max: f64,
    /// Value at encounter start.
    pub starting: f64,
    /// Flat amount restored every regeneration tick.
    #[serde(default)]
    pub regen_per_tick: f64,
}

impl ResourceSpec {
    pub fn mana(max: f64) -> Self {
        Self {
            kind: ResourceKind::Mana,
            max,
            starting: max,
            regen_per_tick: 0.0,
        }
    }

    pub fn rage() -> Self {
        Self {
            kind: ResourceKind::Rage,
            max: 100.0,
            starting: 0.0,
            regen_per_tick: 0.0,
        }
    }

    pub fn energy() -> Self {
        Self {
            kind: ResourceKind::Energy,
            max: 100.0,
            starting: 100.0,
            regen_per_tick: 20.0,
        }
    }
}

// ---------------------------------------------------------------------------
// UnitSpec
// ---------------------------------------------------------------------------

/// Everything needed to add a unit to a simulation.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub name: String,
    pub kind: UnitKind,
    pub level: u32,
    pub base_stats: StatBlock,
    pub resource: Option<ResourceSpec>,
    /// `None` means the unit cannot die.
    pub health: Option<f64>,
    pub can_block: bool,
    pub can_parry: bool,
    /// Distance to the unit's target, in yards.
    pub distance: f64,
    pub main_hand: Option<Weapon>,
    pub off_hand: Option<Weapon>,
    pub ranged: Option<Weapon>,
}

impl UnitSpec {
    fn with_kind(name: impl Into<String>, kind: UnitKind, level: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            level,
            base_stats: StatBlock::neutral(),
            resource: None,
            health: None,
            can_block: false,
            can_parry: false,
            distance: 5.0,
            main_hand: None,
            off_hand: None,
            ranged: None,
        }
    }

    pub fn player(name: impl Into<String>, level: u32) -> Self {
        Self::with_kind(name, UnitKind::Player, level)
    }

    pub fn pet(name: impl Into<String>, owner: UnitId, level: u32) -> Self {
        Self::with_kind(name, UnitKind::Pet { owner }, level)
    }

    /// A hostile target. Targets parry by default, as raid bosses do from
    /// the front.
    pub fn target(name: impl Into<String>, level: u32) -> Self {
        let mut spec = Self::with_kind(name, UnitKind::Target, level);
        spec.can_parry = true;
        spec
    }

    pub fn with_stats(mut self, stats: StatBlock) -> Self {
        self.base_stats = stats;
        self
    }

    pub fn with_resource(mut self, resource: ResourceSpec) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_health(mut self, health: f64) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_distance(mut self, yards: f64) -> Self {
        self.distance = yards;
        self
    }

    pub fn with_main_hand(mut self, weapon: Weapon) -> Self {
        self.main_hand = Some(weapon);
        self
    }

    pub fn with_off_hand(mut self, weapon: Weapon) -> Self {
        self.off_hand = Some(weapon);
        self
    }

    pub fn with_ranged(mut self, weapon: Weapon) -> Self {
        self.ranged = Some(weapon);
        self
    }

    pub fn with_defenses(mut self, can_block: bool, can_parry: bool) -> Self {
        self.can_block = can_block;
        self.can_parry = can_parry;
        self
    }
}

// ---------------------------------------------------------------------------
// Unit
// ---------------------------------------------------------------------------

/// Live state of one unit. Setup-time fields survive trial resets; the rest
/// are reinitialized by [`Unit::reset`].
pub(crate) struct Unit {
    pub id: UnitId,
    pub name: String,
    pub kind: UnitKind,
    pub level: u32,
    pub stats: StatSheet,
    pub resource: Option<ResourcePool>,
    pub max_health: Option<f64>,
    pub health: f64,
    pub can_block: bool,
    pub can_parry: bool,
    pub distance: f64,

    /// Auras owned by this unit, in registration order.
    pub auras: Vec<AuraHandle>,
    pub aura_labels: HashMap<String, AuraHandle>,
    /// Spells cast by this unit, in registration order.
    pub spells: Vec<SpellHandle>,
    pub spell_ids: HashMap<ContentId, SpellHandle>,
    pub gcd: TimerId,
    pub shared_cooldowns: HashMap<u32, TimerId>,
    pub auto: AutoAttackState,

    /// Target every trial starts on.
    pub start_target: Option<UnitId>,
    pub current_target: Option<UnitId>,
    pub casting: Option<CastInProgress>,
    pub pending_wake: Option<ActionId>,
    pub resource_tick: Option<ActionId>,
    pub died_at: Option<Duration>,
    pub metrics: UnitMetrics,
}

impl Unit {
    pub fn new(id: UnitId, spec: UnitSpec, gcd: TimerId) -> Self {
        let resource = spec.resource.map(ResourcePool::new);
        let mut metrics = UnitMetrics::new(&spec.name, None);
        metrics.hostile = matches!(spec.kind, UnitKind::Target);
        Self {
            id,
            name: spec.name,
            kind: spec.kind,
            level: spec.level,
            stats: StatSheet::new(spec.base_stats),
            resource,
            max_health: spec.health,
            health: spec.health.unwrap_or(f64::INFINITY),
            can_block: spec.can_block,
            can_parry: spec.can_parry,
            distance: spec.distance,
            auras: Vec::new(),
            aura_labels: HashMap::new(),
            spells: Vec::new(),
            spell_ids: HashMap::new(),
            gcd,
            shared_cooldowns: HashMap::new(),
            auto: AutoAttackState::new([spec.main_hand, spec.off_hand, spec.ranged]),
            start_target: None,
            current_target: None,
            casting: None,
            pending_wake: None,
            resource_tick: None,
            died_at: None,
            metrics,
        }
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.died_at.is_none()
    }

    #[inline]
    pub fn is_target(&self) -> bool {
        matches!(self.kind, UnitKind::Target)
    }

    pub fn owner(&self) -> Option<UnitId> {
        match self.kind {
            UnitKind::Pet { owner } => Some(owner),
            _ => None,
        }
    }

    /// Per-trial state back to encounter start. Handles into the queue are
    /// dropped without cancelling; the queue is cleared alongside.
    pub fn reset(&mut self, owner_name: Option<String>) {
        self.stats.clear_modifiers();
        self.current_target = self.start_target;
        if let Some(pool) = self.resource.as_mut() {
            pool.reset();
        }
        self.health = self.max_health.unwrap_or(f64::INFINITY);
        self.auto.reset();
        self.casting = None;
        self.pending_wake = None;
        self.resource_tick = None;
        self.died_at = None;
        self.metrics = UnitMetrics::new(&self.name, owner_name);
        self.metrics.hostile = self.is_target();
    }
}
