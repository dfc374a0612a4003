//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use raidsim_engine::prelude::*;

pub const FIREBALL: ContentId = ContentId::spell(133);
pub const CORRUPTION: ContentId = ContentId::spell(172);
pub const SLOW_BOLT: ContentId = ContentId::spell(686);
pub const ARCANE_CONCENTRATION: ContentId = ContentId::spell(11213);

/// Install a test-writer subscriber honoring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Abilities and effects used across the tests.
pub fn registry() -> ContentRegistry {
    let mut registry = ContentRegistry::new(RegistrationMode::FirstWins);

    registry.register_ability(FIREBALL, |_, _| {
        SpellConfig::new(FIREBALL, "Fireball")
            .with_school(SpellSchool::Fire)
            .with_cast_time(Duration::from_millis(3000))
            .with_cost(CostModel::mana(400.0))
            .with_effect(|sim, spell, target| {
                let base = sim.roll_range(596.0, 760.0);
                sim.calc_and_deal_damage(spell, target, base, OutcomeKind::MagicHitAndCrit)?;
                Ok(())
            })
    });

    // Fixed 100 per tick, no scaling and no crits.
    registry.register_ability(CORRUPTION, |_, _| {
        SpellConfig::new(CORRUPTION, "Corruption")
            .with_school(SpellSchool::Shadow)
            .with_dot(DotConfig::new("Corruption", 5, Duration::from_secs(3)).with_base_tick(100.0))
            .with_effect(|sim, spell, target| {
                let dot = sim.spell_dot(spell, target)?;
                sim.apply_dot(dot)
            })
    });

    // Burns wall-clock time so a run stays in flight long enough to abort.
    registry.register_ability(SLOW_BOLT, |_, _| {
        SpellConfig::new(SLOW_BOLT, "Slow Bolt")
            .with_school(SpellSchool::Shadow)
            .with_effect(|sim, spell, target| {
                std::thread::sleep(Duration::from_millis(1));
                sim.calc_and_deal_damage(spell, target, 50.0, OutcomeKind::AlwaysHit)?;
                Ok(())
            })
    });

    // Permanent talent that procs a 15 s damage buff on hits.
    registry.register_effect(ARCANE_CONCENTRATION, |sim, unit| {
        let clearcasting = sim.get_or_register_aura(
            unit,
            AuraDefinition::new("Clearcasting")
                .with_duration(Duration::from_secs(15))
                .with_modifier(Modifier::multiply(Stat::DamageDealtMultiplier, 1.1))
                .with_modifier(Modifier::add(Stat::SpellPower, 50.0)),
        )?;
        sim.get_or_register_aura(
            unit,
            AuraDefinition::new("Arcane Concentration")
                .permanent()
                .on(HookTrigger::Reset, |sim, aura, _| sim.activate_aura(aura))
                .on(HookTrigger::HitDealt, move |sim, _, _| {
                    if sim.proc(0.3) {
                        sim.activate_aura(clearcasting)?;
                    }
                    Ok(())
                }),
        )?;
        Ok(())
    });

    registry
}

pub fn mage() -> PlayerConfig {
    PlayerConfig::new("Mage")
        .with_resource(ResourceSpec::mana(6000.0))
        .with_stat(Stat::SpellPower, 400.0)
        .with_stat(Stat::SpellCrit, 8.0)
        .with_stat(Stat::SpellHit, 6.0)
        .with_stat(Stat::Mp5, 40.0)
        .with_effect(ARCANE_CONCENTRATION)
        .with_rotation(vec![FIREBALL])
}

/// A mage on a raid boss with some duration spread.
pub fn mage_request(id: &str, iterations: u64, seed: u64) -> SimRequest {
    SimRequest::new(id)
        .with_player(mage())
        .with_encounter(
            EncounterConfig::new(120.0)
                .with_variation(15.0)
                .with_target(TargetConfig::new("Ragnaros").with_armor(3731.0)),
        )
        .with_options(
            SimOptions::default()
                .with_iterations(iterations)
                .with_seed(seed)
                .with_concurrency(4),
        )
}
