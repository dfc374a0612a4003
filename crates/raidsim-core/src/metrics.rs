//! Per-trial counters handed to the harness when a trial ends.
//!
//! Metrics accumulate on each [`Unit`](crate::unit) while the trial runs and
//! are snapshotted by [`Simulation::trial_result`](crate::sim::Simulation::trial_result).
//! Everything here is plain serializable data: the harness merges it across
//! trials and hashes it to check determinism.

use serde::{Deserialize, Serialize};

use crate::attack_table::HitOutcome;
use crate::spell::{ContentId, SpellResult};

// ---------------------------------------------------------------------------
// SpellMetrics
// ---------------------------------------------------------------------------

/// Outcome counts and totals for one spell of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpellMetrics {
    pub id: ContentId,
    pub name: String,
    pub casts: u32,
    pub hits: u32,
    pub crits: u32,
    pub misses: u32,
    pub dodges: u32,
    pub parries: u32,
    pub glances: u32,
    pub blocks: u32,
    pub ticks: u32,
    pub crit_ticks: u32,
    pub damage: f64,
    pub healing: f64,
    pub threat: f64,
}

impl SpellMetrics {
    pub fn new(id: ContentId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            casts: 0,
            hits: 0,
            crits: 0,
            misses: 0,
            dodges: 0,
            parries: 0,
            glances: 0,
            blocks: 0,
            ticks: 0,
            crit_ticks: 0,
            damage: 0.0,
            healing: 0.0,
            threat: 0.0,
        }
    }

    /// Count one damage or healing event.
    pub fn record(&mut self, result: &SpellResult) {
        if result.periodic {
            self.ticks += 1;
            if result.outcome.is_crit() {
                self.crit_ticks += 1;
            }
        } else {
            let counter = match result.outcome {
                HitOutcome::Miss => &mut self.misses,
                HitOutcome::Dodge => &mut self.dodges,
                HitOutcome::Parry => &mut self.parries,
                HitOutcome::Glance => &mut self.glances,
                HitOutcome::Block => &mut self.blocks,
                HitOutcome::Crit => &mut self.crits,
                HitOutcome::Hit => &mut self.hits,
            };
            *counter += 1;
        }
        if result.healing {
            self.healing += result.amount;
        } else {
            self.damage += result.amount;
        }
        self.threat += result.threat;
    }

    /// Direct (non-periodic) outcomes recorded, landed or not.
    pub fn attempts(&self) -> u32 {
        self.hits + self.crits + self.misses + self.dodges + self.parries + self.glances + self.blocks
    }

    /// Fold another trial's counts for the same spell into this one.
    pub fn merge(&mut self, other: &SpellMetrics) {
        self.casts += other.casts;
        self.hits += other.hits;
        self.crits += other.crits;
        self.misses += other.misses;
        self.dodges += other.dodges;
        self.parries += other.parries;
        self.glances += other.glances;
        self.blocks += other.blocks;
        self.ticks += other.ticks;
        self.crit_ticks += other.crit_ticks;
        self.damage += other.damage;
        self.healing += other.healing;
        self.threat += other.threat;
    }
}

// ---------------------------------------------------------------------------
// UnitMetrics
// ---------------------------------------------------------------------------

/// Totals for one unit over one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitMetrics {
    pub name: String,
    /// Owning unit's name for pets.
    pub owner: Option<String>,
    pub hostile: bool,
    pub damage_done: f64,
    pub healing_done: f64,
    pub threat: f64,
    pub damage_taken: f64,
    pub resources_spent: f64,
    pub resources_gained: f64,
    pub resources_refunded: f64,
    pub died_at_secs: Option<f64>,
    /// Sorted by spell id.
    pub spells: Vec<SpellMetrics>,
}

impl UnitMetrics {
    pub fn new(name: &str, owner: Option<String>) -> Self {
        Self {
            name: name.to_owned(),
            owner,
            hostile: false,
            damage_done: 0.0,
            healing_done: 0.0,
            threat: 0.0,
            damage_taken: 0.0,
            resources_spent: 0.0,
            resources_gained: 0.0,
            resources_refunded: 0.0,
            died_at_secs: None,
            spells: Vec::new(),
        }
    }

    /// Entry for `id`, inserted in sorted position if missing.
    pub fn spell_mut(&mut self, id: ContentId, name: &str) -> &mut SpellMetrics {
        let pos = match self.spells.binary_search_by(|s| s.id.cmp(&id)) {
            Ok(pos) => pos,
            Err(pos) => {
                self.spells.insert(pos, SpellMetrics::new(id, name));
                pos
            }
        };
        &mut self.spells[pos]
    }

    pub fn spell(&self, id: ContentId) -> Option<&SpellMetrics> {
        self.spells
            .binary_search_by(|s| s.id.cmp(&id))
            .ok()
            .map(|pos| &self.spells[pos])
    }
}

// ---------------------------------------------------------------------------
// AuraMetrics
// ---------------------------------------------------------------------------

/// Activation counts and uptime for one aura.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuraMetrics {
    pub unit: String,
    pub label: String,
    pub gains: u32,
    pub expirations: u32,
    pub refreshes: u32,
    pub uptime_secs: f64,
}

// ---------------------------------------------------------------------------
// TrialResult
// ---------------------------------------------------------------------------

/// Everything one trial produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub iteration: u64,
    pub seed: u64,
    pub duration_secs: f64,
    pub events_processed: u64,
    /// In unit registration order.
    pub units: Vec<UnitMetrics>,
    /// In aura registration order. Auras never gained are omitted.
    pub auras: Vec<AuraMetrics>,
}

impl TrialResult {
    pub fn unit(&self, name: &str) -> Option<&UnitMetrics> {
        self.units.iter().find(|u| u.name == name)
    }

    /// Stable hex digest of the serialized result. Two trials run with the
    /// same seed and setup produce the same digest.
    pub fn digest(&self) -> serde_json::Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spell::{SpellHandle, SpellSchool};
    use crate::unit::UnitId;

    fn result(outcome: HitOutcome, amount: f64, periodic: bool) -> SpellResult {
        SpellResult {
            spell: SpellHandle(0),
            id: ContentId::spell(1),
            caster: UnitId(0),
            target: UnitId(1),
            school: SpellSchool::Fire,
            outcome,
            amount,
            threat: amount,
            periodic,
            healing: false,
        }
    }

    #[test]
    fn record_splits_direct_and_periodic() {
        let mut m = SpellMetrics::new(ContentId::spell(1), "Immolate");
        m.record(&result(HitOutcome::Hit, 100.0, false));
        m.record(&result(HitOutcome::Miss, 0.0, false));
        m.record(&result(HitOutcome::Crit, 50.0, true));
        m.record(&result(HitOutcome::Hit, 25.0, true));
        assert_eq!(m.attempts(), 2);
        assert_eq!(m.ticks, 2);
        assert_eq!(m.crit_ticks, 1);
        assert_eq!(m.damage, 175.0);
    }

    #[test]
    fn spells_stay_sorted_by_id() {
        let mut unit = UnitMetrics::new("Mage", None);
        unit.spell_mut(ContentId::spell(30), "c");
        unit.spell_mut(ContentId::spell(10), "a");
        unit.spell_mut(ContentId::spell(20), "b").casts += 1;
        let ids: Vec<_> = unit.spells.iter().map(|s| s.id).collect();
        assert_eq!(
            ids,
            vec![ContentId::spell(10), ContentId::spell(20), ContentId::spell(30)]
        );
        assert_eq!(unit.spell(ContentId::spell(20)).unwrap().casts, 1);
        assert!(unit.spell(ContentId::spell(40)).is_none());
    }

    #[test]
    fn digest_tracks_content() {
        let mut a = TrialResult {
            iteration: 0,
            seed: 1,
            duration_secs: 10.0,
            events_processed: 3,
            units: vec![UnitMetrics::new("Mage", None)],
            auras: Vec::new(),
        };
        let b = a.clone();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        a.units[0].damage_done = 1.0;
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
    }
}
