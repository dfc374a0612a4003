//! Request and option types.
//!
//! A [`SimRequest`] is everything the harness needs for one submission: the
//! players with the content ids of their abilities, effects, and rotation;
//! the encounter; and the run options. All types are plain serde data so a
//! request can be loaded from JSON with [`SimRequest::from_json_str`] or
//! [`SimRequest::from_json_file`].

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use raidsim_core::auto_attack::Weapon;
use raidsim_core::spell::ContentId;
use raidsim_core::stats::{Stat, StatBlock, StatDependency};
use raidsim_core::unit::ResourceSpec;

use crate::HarnessError;

/// Longest encounter a request may ask for, variation included.
pub const MAX_ENCOUNTER_SECS: f64 = 86_400.0;

// ---------------------------------------------------------------------------
// SimOptions
// ---------------------------------------------------------------------------

/// How many trials to run and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimOptions {
    /// Number of trials.
    pub iterations: u64,
    /// Base seed; trial `i` is seeded from `(random_seed, i)`.
    pub random_seed: u64,
    /// Worker threads. Zero uses the available parallelism.
    pub concurrency: usize,
    /// Completed trials between progress updates.
    pub progress_interval: u64,
    /// Capacity of the progress channel.
    pub progress_buffer: usize,
    /// Record a combat log in every trial.
    pub debug_log: bool,
    /// Fail any trial that ends with an unexpired aura or a leftover stat
    /// modifier.
    pub validation_mode: bool,
    /// Index of the first trial. Sub-batches of a split request start at
    /// different offsets so their seeds never overlap.
    pub first_iteration: u64,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            iterations: 1000,
            random_seed: 0,
            concurrency: 0,
            progress_interval: 100,
            progress_buffer: 16,
            debug_log: false,
            validation_mode: false,
            first_iteration: 0,
        }
    }
}

impl SimOptions {
    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn with_concurrency(mut self, threads: usize) -> Self {
        self.concurrency = threads;
        self
    }

    pub fn with_progress_interval(mut self, every: u64) -> Self {
        self.progress_interval = every;
        self
    }

    pub fn with_progress_buffer(mut self, capacity: usize) -> Self {
        self.progress_buffer = capacity;
        self
    }

    pub fn with_debug_log(mut self, enabled: bool) -> Self {
        self.debug_log = enabled;
        self
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validation_mode = enabled;
        self
    }

    /// Worker count after resolving zero to the machine's parallelism.
    pub fn worker_threads(&self) -> usize {
        if self.concurrency > 0 {
            self.concurrency
        } else {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        }
    }
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

/// Weapon damage range and speed in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeaponConfig {
    pub min_damage: f64,
    pub max_damage: f64,
    pub speed_secs: f64,
}

impl WeaponConfig {
    pub fn new(min_damage: f64, max_damage: f64, speed_secs: f64) -> Self {
        Self {
            min_damage,
            max_damage,
            speed_secs,
        }
    }

    pub fn to_weapon(self) -> Weapon {
        Weapon::new(self.min_damage, self.max_damage, self.speed_secs)
    }
}

/// Base stats as a sparse map; unlisted stats take their neutral value.
pub type StatMap = BTreeMap<Stat, f64>;

pub(crate) fn stat_block(stats: &StatMap) -> StatBlock {
    let mut block = StatBlock::neutral();
    for (&stat, &value) in stats {
        block[stat] = value;
    }
    block
}

/// A hostile unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub name: String,
    pub level: u32,
    pub armor: f64,
    /// `None` for an unkillable target.
    pub health: Option<f64>,
    pub stats: StatMap,
    pub can_block: bool,
    pub can_parry: bool,
    pub distance: f64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: "Target".to_owned(),
            level: 63,
            armor: 0.0,
            health: None,
            stats: StatMap::new(),
            can_block: false,
            can_parry: true,
            distance: 5.0,
        }
    }
}

impl TargetConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    pub fn with_armor(mut self, armor: f64) -> Self {
        self.armor = armor;
        self
    }

    pub fn with_health(mut self, health: f64) -> Self {
        self.health = Some(health);
        self
    }
}

/// A pet controlled by a player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PetConfig {
    pub name: String,
    pub level: u32,
    pub resource: Option<ResourceSpec>,
    pub base_stats: StatMap,
    pub main_hand: Option<WeaponConfig>,
    pub abilities: Vec<ContentId>,
    pub rotation: Vec<ContentId>,
}

impl Default for PetConfig {
    fn default() -> Self {
        Self {
            name: "Pet".to_owned(),
            level: 60,
            resource: None,
            base_stats: StatMap::new(),
            main_hand: None,
            abilities: Vec::new(),
            rotation: Vec::new(),
        }
    }
}

/// A player build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub name: String,
    pub level: u32,
    pub resource: Option<ResourceSpec>,
    pub base_stats: StatMap,
    pub stat_dependencies: Vec<StatDependency>,
    pub main_hand: Option<WeaponConfig>,
    pub off_hand: Option<WeaponConfig>,
    pub ranged: Option<WeaponConfig>,
    /// Swing weapons automatically from the start of the fight.
    pub auto_attack: bool,
    pub abilities: Vec<ContentId>,
    pub effects: Vec<ContentId>,
    /// Priority list, highest first.
    pub rotation: Vec<ContentId>,
    /// Tried before `rotation` once the execute phase starts.
    pub execute_rotation: Vec<ContentId>,
    pub distance_to_target: f64,
    pub pet: Option<PetConfig>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            name: "Player".to_owned(),
            level: 60,
            resource: None,
            base_stats: StatMap::new(),
            stat_dependencies: Vec::new(),
            main_hand: None,
            off_hand: None,
            ranged: None,
            auto_attack: true,
            abilities: Vec::new(),
            effects: Vec::new(),
            rotation: Vec::new(),
            execute_rotation: Vec::new(),
            distance_to_target: 5.0,
            pet: None,
        }
    }
}

impl PlayerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    pub fn with_resource(mut self, resource: ResourceSpec) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_stat(mut self, stat: Stat, value: f64) -> Self {
        self.base_stats.insert(stat, value);
        self
    }

    pub fn with_stat_dependency(mut self, dep: StatDependency) -> Self {
        self.stat_dependencies.push(dep);
        self
    }

    pub fn with_main_hand(mut self, weapon: WeaponConfig) -> Self {
        self.main_hand = Some(weapon);
        self
    }

    pub fn with_off_hand(mut self, weapon: WeaponConfig) -> Self {
        self.off_hand = Some(weapon);
        self
    }

    pub fn with_ability(mut self, id: ContentId) -> Self {
        self.abilities.push(id);
        self
    }

    pub fn with_effect(mut self, id: ContentId) -> Self {
        self.effects.push(id);
        self
    }

    pub fn with_rotation(mut self, rotation: Vec<ContentId>) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_execute_rotation(mut self, rotation: Vec<ContentId>) -> Self {
        self.execute_rotation = rotation;
        self
    }

    pub fn with_pet(mut self, pet: PetConfig) -> Self {
        self.pet = Some(pet);
        self
    }
}

// ---------------------------------------------------------------------------
// EncounterConfig
// ---------------------------------------------------------------------------

/// Fight length and targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncounterConfig {
    pub duration_secs: f64,
    /// Each trial's length is drawn uniformly from
    /// `duration_secs ± duration_variation_secs`.
    pub duration_variation_secs: f64,
    pub targets: Vec<TargetConfig>,
    /// Health fraction (or, for unkillable targets, remaining time fraction)
    /// below which the execute rotation applies.
    pub execute_phase_threshold: Option<f64>,
}

impl Default for EncounterConfig {
    fn default() -> Self {
        Self {
            duration_secs: 180.0,
            duration_variation_secs: 0.0,
            targets: Vec::new(),
            execute_phase_threshold: None,
        }
    }
}

impl EncounterConfig {
    pub fn new(duration_secs: f64) -> Self {
        Self {
            duration_secs,
            ..Self::default()
        }
    }

    pub fn with_variation(mut self, secs: f64) -> Self {
        self.duration_variation_secs = secs;
        self
    }

    pub fn with_target(mut self, target: TargetConfig) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_execute_phase(mut self, threshold: f64) -> Self {
        self.execute_phase_threshold = Some(threshold);
        self
    }
}

// ---------------------------------------------------------------------------
// SimRequest
// ---------------------------------------------------------------------------

/// One submission to the harness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimRequest {
    pub request_id: String,
    #[serde(default)]
    pub players: Vec<PlayerConfig>,
    #[serde(default)]
    pub encounter: EncounterConfig,
    #[serde(default)]
    pub options: SimOptions,
}

impl SimRequest {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            players: Vec::new(),
            encounter: EncounterConfig::default(),
            options: SimOptions::default(),
        }
    }

    pub fn with_player(mut self, player: PlayerConfig) -> Self {
        self.players.push(player);
        self
    }

    pub fn with_encounter(mut self, encounter: EncounterConfig) -> Self {
        self.encounter = encounter;
        self
    }

    pub fn with_options(mut self, options: SimOptions) -> Self {
        self.options = options;
        self
    }

    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let request: SimRequest =
            serde_json::from_str(json).context("failed to parse simulation request")?;
        Ok(request)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read request file {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Check option ranges. Content ids are checked when the encounter is
    /// built.
    pub fn validate(&self) -> Result<(), HarnessError> {
        let bad = |msg: String| Err(HarnessError::InvalidOptions(msg));
        if self.request_id.is_empty() {
            return bad("request id is empty".to_owned());
        }
        if self.options.iterations == 0 {
            return bad("iterations must be positive".to_owned());
        }
        if self.options.progress_buffer == 0 {
            return bad("progress buffer must hold at least one update".to_owned());
        }
        let enc = &self.encounter;
        if !(enc.duration_secs.is_finite() && enc.duration_secs > 0.0) {
            return bad(format!("encounter duration {} is not positive", enc.duration_secs));
        }
        if !(0.0..=enc.duration_secs).contains(&enc.duration_variation_secs) {
            return bad(format!(
                "duration variation {} outside [0, {}]",
                enc.duration_variation_secs, enc.duration_secs
            ));
        }
        if enc.duration_secs + enc.duration_variation_secs > MAX_ENCOUNTER_SECS {
            return bad(format!(
                "encounter may run {} s, longer than the {MAX_ENCOUNTER_SECS} s limit",
                enc.duration_secs + enc.duration_variation_secs
            ));
        }
        if let Some(t) = enc.execute_phase_threshold {
            if !(0.0..=1.0).contains(&t) {
                return bad(format!("execute threshold {t} outside [0, 1]"));
            }
        }
        Ok(())
    }
}
