//! Turning a [`SimRequest`] into a ready-to-reset [`Simulation`].
//!
//! Building happens once per worker. Everything that can be wrong with a
//! request (unknown content ids, duplicate names, bad weapons) is reported
//! here as a [`SetupError`], before any trial runs.

use std::time::Duration;

use tracing::debug;

use raidsim_core::clock::seconds;
use raidsim_core::registry::ContentRegistry;
use raidsim_core::sim::Simulation;
use raidsim_core::spell::{ContentId, SpellHandle};
use raidsim_core::stats::Stat;
use raidsim_core::unit::{UnitId, UnitSpec};
use raidsim_core::SetupError;

use crate::config::{stat_block, PetConfig, PlayerConfig, SimRequest, TargetConfig};
use crate::rotation::{PriorityRotation, RotationDriver};

/// A built simulation plus the drivers of its units.
pub struct Encounter {
    pub sim: Simulation,
    /// One driver per unit with a rotation, in unit order.
    pub drivers: Vec<(UnitId, Box<dyn RotationDriver>)>,
    pub duration: Duration,
    pub duration_variation: Duration,
    pub base_seed: u64,
    /// Check aura and modifier bookkeeping after every trial.
    pub validate: bool,
}

impl std::fmt::Debug for Encounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encounter")
            .field("units", &self.sim.unit_count())
            .field("drivers", &self.drivers.len())
            .field("duration", &self.duration)
            .field("duration_variation", &self.duration_variation)
            .field("base_seed", &self.base_seed)
            .field("validate", &self.validate)
            .finish()
    }
}

/// Build the encounter described by `request`.
pub fn build_encounter(
    registry: &ContentRegistry,
    request: &SimRequest,
) -> Result<Encounter, SetupError> {
    let enc = &request.encounter;
    if enc.targets.is_empty() {
        return Err(SetupError::InvalidEncounter("no targets".to_owned()));
    }
    if request.players.is_empty() {
        return Err(SetupError::InvalidEncounter("no players".to_owned()));
    }

    let mut sim = Simulation::new();
    let mut targets = Vec::with_capacity(enc.targets.len());
    for target in &enc.targets {
        targets.push(sim.add_unit(target_spec(target))?);
    }
    let first_target = targets[0];

    let threshold = enc.execute_phase_threshold;
    let mut drivers: Vec<(UnitId, Box<dyn RotationDriver>)> = Vec::new();
    for player in &request.players {
        let unit = sim.add_unit(player_spec(player))?;
        for dep in &player.stat_dependencies {
            sim.add_stat_dependency(unit, *dep)?;
        }
        sim.set_current_target(unit, first_target)?;
        let wants_swings = player.main_hand.is_some() || player.ranged.is_some();
        if player.auto_attack && wants_swings {
            sim.enable_auto_attacks(unit)?;
        }
        for &effect in &player.effects {
            registry.install_effect(&mut sim, unit, effect)?;
        }
        install_abilities(registry, &mut sim, unit, &player.abilities)?;
        if let Some(driver) = rotation_for(
            registry,
            &mut sim,
            unit,
            &player.rotation,
            &player.execute_rotation,
            threshold,
        )? {
            drivers.push((unit, driver));
        }

        if let Some(pet) = &player.pet {
            let pet_unit = sim.add_unit(pet_spec(pet, unit))?;
            sim.set_current_target(pet_unit, first_target)?;
            if pet.main_hand.is_some() {
                sim.enable_auto_attacks(pet_unit)?;
            }
            install_abilities(registry, &mut sim, pet_unit, &pet.abilities)?;
            if let Some(driver) =
                rotation_for(registry, &mut sim, pet_unit, &pet.rotation, &[], None)?
            {
                drivers.push((pet_unit, driver));
            }
        }
    }

    if request.options.debug_log {
        sim.enable_log();
    }
    debug!(
        request_id = %request.request_id,
        units = sim.unit_count(),
        drivers = drivers.len(),
        "encounter built"
    );
    Ok(Encounter {
        sim,
        drivers,
        duration: seconds(enc.duration_secs),
        duration_variation: seconds(enc.duration_variation_secs),
        base_seed: request.options.random_seed,
        validate: request.options.validation_mode,
    })
}

fn target_spec(target: &TargetConfig) -> UnitSpec {
    let mut stats = stat_block(&target.stats);
    stats[Stat::Armor] += target.armor;
    let mut spec = UnitSpec::target(target.name.clone(), target.level)
        .with_stats(stats)
        .with_defenses(target.can_block, target.can_parry)
        .with_distance(target.distance);
    if let Some(health) = target.health {
        spec = spec.with_health(health);
    }
    spec
}

fn player_spec(player: &PlayerConfig) -> UnitSpec {
    let mut spec = UnitSpec::player(player.name.clone(), player.level)
        .with_stats(stat_block(&player.base_stats))
        .with_distance(player.distance_to_target);
    if let Some(resource) = player.resource {
        spec = spec.with_resource(resource);
    }
    if let Some(w) = player.main_hand {
        spec = spec.with_main_hand(w.to_weapon());
    }
    if let Some(w) = player.off_hand {
        spec = spec.with_off_hand(w.to_weapon());
    }
    if let Some(w) = player.ranged {
        spec = spec.with_ranged(w.to_weapon());
    }
    spec
}

fn pet_spec(pet: &PetConfig, owner: UnitId) -> UnitSpec {
    let mut spec =
        UnitSpec::pet(pet.name.clone(), owner, pet.level).with_stats(stat_block(&pet.base_stats));
    if let Some(resource) = pet.resource {
        spec = spec.with_resource(resource);
    }
    if let Some(w) = pet.main_hand {
        spec = spec.with_main_hand(w.to_weapon());
    }
    spec
}

fn install_abilities(
    registry: &ContentRegistry,
    sim: &mut Simulation,
    unit: UnitId,
    ids: &[ContentId],
) -> Result<(), SetupError> {
    for &id in ids {
        if sim.spell(unit, id).is_none() {
            registry.install_ability(sim, unit, id)?;
        }
    }
    Ok(())
}

/// Resolve rotation ids to the unit's spells, installing any ability the
/// build did not list explicitly.
fn resolve(
    registry: &ContentRegistry,
    sim: &mut Simulation,
    unit: UnitId,
    ids: &[ContentId],
) -> Result<Vec<SpellHandle>, SetupError> {
    ids.iter()
        .map(|&id| match sim.spell(unit, id) {
            Some(handle) => Ok(handle),
            None => registry.install_ability(sim, unit, id),
        })
        .collect()
}

fn rotation_for(
    registry: &ContentRegistry,
    sim: &mut Simulation,
    unit: UnitId,
    rotation: &[ContentId],
    execute: &[ContentId],
    threshold: Option<f64>,
) -> Result<Option<Box<dyn RotationDriver>>, SetupError> {
    if rotation.is_empty() && execute.is_empty() {
        return Ok(None);
    }
    let mut driver = PriorityRotation::new(resolve(registry, sim, unit, rotation)?);
    if let Some(threshold) = threshold {
        driver = driver.with_execute(resolve(registry, sim, unit, execute)?, threshold);
    }
    Ok(Some(Box::new(driver)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncounterConfig, WeaponConfig};
    use raidsim_core::prelude::*;

    fn registry() -> ContentRegistry {
        let mut registry = ContentRegistry::new(RegistrationMode::FirstWins);
        registry.register_ability(ContentId::spell(1), |_, _| {
            SpellConfig::new(ContentId::spell(1), "Bite")
        });
        registry.register_effect(ContentId::spell(9), |sim, unit| {
            sim.get_or_register_aura(
                unit,
                AuraDefinition::new("Trueshot").permanent().with_modifier(Modifier::add(
                    Stat::AttackPower,
                    100.0,
                )),
            )?;
            Ok(())
        });
        registry
    }

    fn request() -> SimRequest {
        SimRequest::new("setup")
            .with_encounter(
                EncounterConfig::new(60.0)
                    .with_target(TargetConfig::new("Boss").with_armor(3000.0))
                    .with_target(TargetConfig::new("Add").with_health(5000.0)),
            )
            .with_player(
                PlayerConfig::new("Hunter")
                    .with_main_hand(WeaponConfig::new(50.0, 80.0, 2.8))
                    .with_effect(ContentId::spell(9))
                    .with_rotation(vec![ContentId::spell(1)])
                    .with_pet(PetConfig {
                        name: "Wolf".to_owned(),
                        rotation: vec![ContentId::spell(1)],
                        ..PetConfig::default()
                    }),
            )
    }

    #[test]
    fn builds_units_drivers_and_content() {
        let enc = build_encounter(&registry(), &request()).unwrap();
        let sim = &enc.sim;
        let boss = sim.unit_by_name("Boss").unwrap();
        let hunter = sim.unit_by_name("Hunter").unwrap();
        let wolf = sim.unit_by_name("Wolf").unwrap();
        assert_eq!(sim.targets().len(), 2);
        assert_eq!(sim.stat(boss, Stat::Armor), 3000.0);
        assert_eq!(sim.current_target(hunter), Some(boss));
        assert_eq!(sim.unit_kind(wolf), Some(UnitKind::Pet { owner: hunter }));
        assert!(sim.spell(hunter, ContentId::spell(1)).is_some());
        assert!(sim.spell(wolf, ContentId::spell(1)).is_some());
        assert!(sim.aura(hunter, "Trueshot").is_some());
        let driven: Vec<_> = enc.drivers.iter().map(|(u, _)| *u).collect();
        assert_eq!(driven, vec![hunter, wolf]);
        assert_eq!(enc.duration, Duration::from_secs(60));
    }

    #[test]
    fn unknown_content_fails_setup() {
        let mut req = request();
        req.players[0].rotation.push(ContentId::spell(404));
        assert!(matches!(
            build_encounter(&registry(), &req),
            Err(SetupError::UnknownContent(id)) if id == ContentId::spell(404)
        ));
    }

    #[test]
    fn empty_encounter_is_invalid() {
        let req = SimRequest::new("empty").with_player(PlayerConfig::new("Solo"));
        assert!(matches!(
            build_encounter(&registry(), &req),
            Err(SetupError::InvalidEncounter(_))
        ));
    }
}
