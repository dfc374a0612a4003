//! Merging trial results into run-level statistics.
//!
//! Every type here merges associatively and commutatively (up to
//! floating-point rounding), so a request split into sub-batches reports the
//! same numbers as one batch. Maps are `BTreeMap`s so serialized aggregates
//! do not depend on insertion order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use raidsim_core::metrics::{SpellMetrics, TrialResult};
use raidsim_core::spell::ContentId;

// ---------------------------------------------------------------------------
// DistributionMetric
// ---------------------------------------------------------------------------

/// Running count, sum, sum of squares and extremes of one sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistributionMetric {
    pub count: u64,
    pub sum: f64,
    pub sum_sq: f64,
    /// Zero while empty.
    pub min: f64,
    /// Zero while empty.
    pub max: f64,
}

impl DistributionMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn merge(&mut self, other: &DistributionMetric) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = other.clone();
            return;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Population standard deviation.
    pub fn stdev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        (self.sum_sq / n - mean * mean).max(0.0).sqrt()
    }
}

// ---------------------------------------------------------------------------
// UnitAggregate
// ---------------------------------------------------------------------------

/// Per-unit statistics across trials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitAggregate {
    pub owner: Option<String>,
    pub hostile: bool,
    /// Damage per second including the unit's pets.
    pub dps: DistributionMetric,
    /// The unit's own damage.
    pub damage: DistributionMetric,
    pub healing: DistributionMetric,
    pub threat: DistributionMetric,
    pub damage_taken: DistributionMetric,
    pub resources_spent: DistributionMetric,
    pub deaths: u64,
    pub spells: BTreeMap<ContentId, SpellMetrics>,
}

impl UnitAggregate {
    pub fn merge(&mut self, other: &UnitAggregate) {
        if self.owner.is_none() {
            self.owner = other.owner.clone();
        }
        self.hostile |= other.hostile;
        self.dps.merge(&other.dps);
        self.damage.merge(&other.damage);
        self.healing.merge(&other.healing);
        self.threat.merge(&other.threat);
        self.damage_taken.merge(&other.damage_taken);
        self.resources_spent.merge(&other.resources_spent);
        self.deaths += other.deaths;
        for (id, spell) in &other.spells {
            merge_spell(&mut self.spells, *id, spell);
        }
    }
}

fn merge_spell(spells: &mut BTreeMap<ContentId, SpellMetrics>, id: ContentId, spell: &SpellMetrics) {
    match spells.get_mut(&id) {
        Some(existing) => existing.merge(spell),
        None => {
            spells.insert(id, spell.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// AuraAggregate
// ---------------------------------------------------------------------------

/// Per-aura statistics across trials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuraAggregate {
    pub unit: String,
    pub label: String,
    pub gains: u64,
    pub expirations: u64,
    pub refreshes: u64,
    /// Uptime as a fraction of each trial in which the aura was gained.
    pub uptime: DistributionMetric,
}

impl AuraAggregate {
    /// Mean uptime fraction over `iterations` trials, counting trials where
    /// the aura never appeared as zero.
    pub fn mean_uptime(&self, iterations: u64) -> f64 {
        if iterations == 0 {
            0.0
        } else {
            self.uptime.sum / iterations as f64
        }
    }

    pub fn merge(&mut self, other: &AuraAggregate) {
        if self.unit.is_empty() {
            self.unit = other.unit.clone();
            self.label = other.label.clone();
        }
        self.gains += other.gains;
        self.expirations += other.expirations;
        self.refreshes += other.refreshes;
        self.uptime.merge(&other.uptime);
    }
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

/// Summed damage per second of the friendly units of one trial.
pub fn raid_dps(result: &TrialResult) -> f64 {
    if result.duration_secs <= 0.0 {
        return 0.0;
    }
    let damage: f64 = result
        .units
        .iter()
        .filter(|u| !u.hostile)
        .map(|u| u.damage_done)
        .sum();
    damage / result.duration_secs
}

/// Everything a run reports about its successful trials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Successful trials folded in.
    pub iterations: u64,
    /// Trials that ended in a failure.
    pub failed: u64,
    pub events_processed: u64,
    pub duration: DistributionMetric,
    /// Summed damage per second of every friendly unit.
    pub raid_dps: DistributionMetric,
    /// Keyed by unit name.
    pub units: BTreeMap<String, UnitAggregate>,
    /// Keyed by `unit/label`.
    pub auras: BTreeMap<String, AuraAggregate>,
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one trial in.
    pub fn record(&mut self, result: &TrialResult) {
        self.iterations += 1;
        self.events_processed += result.events_processed;
        self.duration.push(result.duration_secs);
        let secs = result.duration_secs;
        let per_sec = |amount: f64| if secs > 0.0 { amount / secs } else { 0.0 };

        for unit in &result.units {
            let pet_damage: f64 = result
                .units
                .iter()
                .filter(|u| u.owner.as_deref() == Some(unit.name.as_str()))
                .map(|u| u.damage_done)
                .sum();

            let entry = self.units.entry(unit.name.clone()).or_default();
            entry.owner = unit.owner.clone();
            entry.hostile = unit.hostile;
            entry.dps.push(per_sec(unit.damage_done + pet_damage));
            entry.damage.push(unit.damage_done);
            entry.healing.push(unit.healing_done);
            entry.threat.push(unit.threat);
            entry.damage_taken.push(unit.damage_taken);
            entry.resources_spent.push(unit.resources_spent);
            if unit.died_at_secs.is_some() {
                entry.deaths += 1;
            }
            for spell in &unit.spells {
                merge_spell(&mut entry.spells, spell.id, spell);
            }
        }
        self.raid_dps.push(raid_dps(result));

        for aura in &result.auras {
            let entry = self
                .auras
                .entry(format!("{}/{}", aura.unit, aura.label))
                .or_default();
            if entry.unit.is_empty() {
                entry.unit = aura.unit.clone();
                entry.label = aura.label.clone();
            }
            entry.gains += u64::from(aura.gains);
            entry.expirations += u64::from(aura.expirations);
            entry.refreshes += u64::from(aura.refreshes);
            entry.uptime.push(per_sec(aura.uptime_secs));
        }
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    /// Fold another aggregate in. Order of merges does not matter.
    pub fn merge(&mut self, other: &Aggregate) {
        self.iterations += other.iterations;
        self.failed += other.failed;
        self.events_processed += other.events_processed;
        self.duration.merge(&other.duration);
        self.raid_dps.merge(&other.raid_dps);
        for (name, unit) in &other.units {
            self.units.entry(name.clone()).or_default().merge(unit);
        }
        for (key, aura) in &other.auras {
            self.auras.entry(key.clone()).or_default().merge(aura);
        }
    }

    pub fn unit(&self, name: &str) -> Option<&UnitAggregate> {
        self.units.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raidsim_core::metrics::{AuraMetrics, UnitMetrics};

    fn trial(iteration: u64, mage_damage: f64, pet_damage: f64) -> TrialResult {
        let mut mage = UnitMetrics::new("Mage", None);
        mage.damage_done = mage_damage;
        let mut spell = SpellMetrics::new(ContentId::spell(133), "Fireball");
        spell.casts = 2;
        spell.damage = mage_damage;
        mage.spells.push(spell);
        let mut imp = UnitMetrics::new("Imp", Some("Mage".to_owned()));
        imp.damage_done = pet_damage;
        let mut boss = UnitMetrics::new("Boss", None);
        boss.hostile = true;
        boss.damage_taken = mage_damage + pet_damage;
        TrialResult {
            iteration,
            seed: iteration,
            duration_secs: 10.0,
            events_processed: 5,
            units: vec![boss, mage, imp],
            auras: vec![AuraMetrics {
                unit: "Mage".to_owned(),
                label: "Clearcasting".to_owned(),
                gains: 2,
                expirations: 2,
                refreshes: 0,
                uptime_secs: 5.0,
            }],
        }
    }

    // -- 1. DistributionMetric -------------------------------------------

    #[test]
    fn distribution_moments() {
        let mut d = DistributionMetric::new();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            d.push(v);
        }
        assert_eq!(d.count, 8);
        assert!((d.mean() - 5.0).abs() < 1e-12);
        assert!((d.stdev() - 2.0).abs() < 1e-12);
        assert_eq!(d.min, 2.0);
        assert_eq!(d.max, 9.0);
    }

    #[test]
    fn empty_distribution_merges_as_identity() {
        let mut d = DistributionMetric::new();
        d.push(3.0);
        let before = d.clone();
        d.merge(&DistributionMetric::new());
        assert_eq!(d, before);

        let mut empty = DistributionMetric::new();
        empty.merge(&before);
        assert_eq!(empty, before);
        assert_eq!(DistributionMetric::new().stdev(), 0.0);
    }

    // -- 2. Aggregate ------------------------------------------------------

    #[test]
    fn pet_damage_counts_toward_owner_dps() {
        let mut agg = Aggregate::new();
        agg.record(&trial(0, 1000.0, 200.0));
        let mage = agg.unit("Mage").unwrap();
        assert!((mage.dps.mean() - 120.0).abs() < 1e-9);
        assert!((mage.damage.mean() - 1000.0).abs() < 1e-9);
        assert_eq!(agg.unit("Imp").unwrap().owner.as_deref(), Some("Mage"));
        // Raid dps counts each friendly unit once.
        assert!((agg.raid_dps.mean() - 120.0).abs() < 1e-9);
        assert!(agg.unit("Boss").unwrap().hostile);
    }

    #[test]
    fn auras_report_uptime_fraction() {
        let mut agg = Aggregate::new();
        agg.record(&trial(0, 100.0, 0.0));
        agg.record(&trial(1, 100.0, 0.0));
        let aura = &agg.auras["Mage/Clearcasting"];
        assert_eq!(aura.gains, 4);
        assert!((aura.mean_uptime(agg.iterations) - 0.5).abs() < 1e-12);
        assert!((aura.mean_uptime(4) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn merge_matches_single_batch() {
        let trials: Vec<_> = (0..6).map(|i| trial(i, 100.0 * i as f64, 10.0)).collect();
        let mut whole = Aggregate::new();
        for t in &trials {
            whole.record(t);
        }
        let mut left = Aggregate::new();
        let mut right = Aggregate::new();
        for t in &trials[..2] {
            left.record(t);
        }
        for t in &trials[2..] {
            right.record(t);
        }
        right.record_failure();
        let mut merged = Aggregate::new();
        merged.merge(&right);
        merged.merge(&left);

        assert_eq!(merged.iterations, whole.iterations);
        assert_eq!(merged.failed, 1);
        assert!((merged.raid_dps.mean() - whole.raid_dps.mean()).abs() < 1e-9);
        let spell = &merged.units["Mage"].spells[&ContentId::spell(133)];
        assert_eq!(spell.casts, 12);
        assert_eq!(merged.auras["Mage/Clearcasting"].gains, 12);
    }
}
