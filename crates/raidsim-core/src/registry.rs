//! Read-only catalog of abilities and effects, keyed by [`ContentId`].
//!
//! Content code registers builders here once at process start. The harness
//! shares the finished registry between worker threads and uses it to turn a
//! build description into spells and auras on a fresh [`Simulation`].
//!
//! At most one registration wins per id. In [`RegistrationMode::FirstWins`]
//! later registrations are ignored with a warning, which is what validation
//! runs want. [`RegistrationMode::Overwrite`] lets the last one win.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::sim::Simulation;
use crate::spell::{ContentId, SpellConfig};
use crate::unit::UnitId;
use crate::{SetupError, SimResult};

/// Produces a spell definition for a specific caster. The builder may read
/// the caster's setup state (level, stats) but not mutate it.
pub type AbilityBuilder = Arc<dyn Fn(&Simulation, UnitId) -> SpellConfig + Send + Sync>;

/// Installs a passive effect (auras, hooks, stat dependencies) on a unit.
pub type EffectSetup = Arc<dyn Fn(&mut Simulation, UnitId) -> SimResult<()> + Send + Sync>;

/// What happens when an id is registered twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationMode {
    /// Keep the first registration.
    #[default]
    FirstWins,
    /// Replace the existing registration.
    Overwrite,
}

/// Ability and effect tables.
#[derive(Default, Clone)]
pub struct ContentRegistry {
    mode: RegistrationMode,
    abilities: HashMap<ContentId, AbilityBuilder>,
    effects: HashMap<ContentId, EffectSetup>,
}

impl ContentRegistry {
    pub fn new(mode: RegistrationMode) -> Self {
        Self {
            mode,
            abilities: HashMap::new(),
            effects: HashMap::new(),
        }
    }

    pub fn mode(&self) -> RegistrationMode {
        self.mode
    }

    /// Register an ability builder. Returns whether this registration is now
    /// the one in effect.
    pub fn register_ability<F>(&mut self, id: ContentId, builder: F) -> bool
    where
        F: Fn(&Simulation, UnitId) -> SpellConfig + Send + Sync + 'static,
    {
        if self.mode == RegistrationMode::FirstWins && self.abilities.contains_key(&id) {
            warn!(%id, "duplicate ability registration ignored");
            return false;
        }
        self.abilities.insert(id, Arc::new(builder));
        true
    }

    /// Replace an ability regardless of mode.
    pub fn overwrite_ability<F>(&mut self, id: ContentId, builder: F)
    where
        F: Fn(&Simulation, UnitId) -> SpellConfig + Send + Sync + 'static,
    {
        self.abilities.insert(id, Arc::new(builder));
    }

    /// Register a passive effect. Same winning rules as abilities.
    pub fn register_effect<F>(&mut self, id: ContentId, setup: F) -> bool
    where
        F: Fn(&mut Simulation, UnitId) -> SimResult<()> + Send + Sync + 'static,
    {
        if self.mode == RegistrationMode::FirstWins && self.effects.contains_key(&id) {
            warn!(%id, "duplicate effect registration ignored");
            return false;
        }
        self.effects.insert(id, Arc::new(setup));
        true
    }

    pub fn ability(&self, id: ContentId) -> Result<&AbilityBuilder, SetupError> {
        self.abilities.get(&id).ok_or(SetupError::UnknownContent(id))
    }

    pub fn effect(&self, id: ContentId) -> Result<&EffectSetup, SetupError> {
        self.effects.get(&id).ok_or(SetupError::UnknownContent(id))
    }

    pub fn has_ability(&self, id: ContentId) -> bool {
        self.abilities.contains_key(&id)
    }

    /// Registered ability ids, sorted.
    pub fn ability_ids(&self) -> Vec<ContentId> {
        let mut ids: Vec<_> = self.abilities.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Build `id` for `unit` and register the result on `sim`.
    pub fn install_ability(
        &self,
        sim: &mut Simulation,
        unit: UnitId,
        id: ContentId,
    ) -> Result<crate::spell::SpellHandle, SetupError> {
        let builder = Arc::clone(self.ability(id)?);
        let config = builder(&*sim, unit);
        Ok(sim.register_spell(unit, config)?)
    }

    /// Run the setup of effect `id` on `unit`.
    pub fn install_effect(
        &self,
        sim: &mut Simulation,
        unit: UnitId,
        id: ContentId,
    ) -> Result<(), SetupError> {
        let setup = Arc::clone(self.effect(id)?);
        setup(sim, unit)?;
        Ok(())
    }
}

impl std::fmt::Debug for ContentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentRegistry")
            .field("mode", &self.mode)
            .field("abilities", &self.abilities.len())
            .field("effects", &self.effects.len())
            .finish()
    }
}
