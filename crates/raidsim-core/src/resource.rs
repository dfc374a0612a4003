//! Mana, rage, and energy.

use std::time::Duration;

use tracing::trace;

use crate::log::LogKind;
use crate::sim::{Action, Simulation};
use crate::spell::ContentId;
use crate::stats::Stat;
use crate::unit::{ResourceKind, ResourceSpec, UnitId};
use crate::{SimError, SimResult};

/// Interval between passive regeneration ticks.
pub const RESOURCE_TICK: Duration = Duration::from_secs(2);
/// Source id recorded for passive regeneration.
pub const REGEN_SOURCE: ContentId = ContentId::other(2);
/// Source id recorded for rage from dealing damage.
pub const RAGE_FROM_DAMAGE_SOURCE: ContentId = ContentId::other(3);

/// Rage conversion value for a unit of `level`: dealing this much damage
/// yields 7.5 rage.
pub fn rage_conversion(level: u32) -> f64 {
    let l = f64::from(level);
    0.0091107836 * l * l + 3.225598133 * l + 4.2652911
}

/// A unit's current resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourcePool {
    spec: ResourceSpec,
    current: f64,
}

impl ResourcePool {
    pub fn new(spec: ResourceSpec) -> Self {
        Self {
            current: spec.starting.clamp(0.0, spec.max),
            spec,
        }
    }

    #[inline]
    pub fn kind(&self) -> ResourceKind {
        self.spec.kind
    }

    #[inline]
    pub fn current(&self) -> f64 {
        self.current
    }

    #[inline]
    pub fn max(&self) -> f64 {
        self.spec.max
    }

    pub fn regen_per_tick(&self) -> f64 {
        self.spec.regen_per_tick
    }

    /// Add up to the cap; returns the amount actually gained.
    pub fn gain(&mut self, amount: f64) -> f64 {
        let before = self.current;
        self.current = (self.current + amount.max(0.0)).min(self.spec.max);
        self.current - before
    }

    /// Subtract `amount`, refusing to go negative.
    pub fn spend(&mut self, amount: f64) -> bool {
        if amount > self.current {
            return false;
        }
        self.current -= amount;
        true
    }

    pub fn reset(&mut self) {
        self.current = self.spec.starting.clamp(0.0, self.spec.max);
    }
}

// ---------------------------------------------------------------------------
// Simulation: resource operations
// ---------------------------------------------------------------------------

impl Simulation {
    /// Current resource of `unit`, `None` without a pool.
    pub fn resource(&self, unit: UnitId) -> Option<f64> {
        self.units
            .get(unit.index())
            .and_then(|u| u.resource.as_ref())
            .map(ResourcePool::current)
    }

    /// Deduct `amount` of `kind` from `unit`. Spending more than the unit has
    /// is an invariant violation: callers validate first.
    pub fn spend_resource(
        &mut self,
        unit: UnitId,
        kind: ResourceKind,
        amount: f64,
        source: ContentId,
    ) -> SimResult<()> {
        let u = self.unit_mut(unit)?;
        let pool = match u.resource.as_mut() {
            Some(pool) if pool.kind() == kind => pool,
            _ => return Err(SimError::NoResourcePool { unit, kind }),
        };
        let available = pool.current();
        if !pool.spend(amount) {
            return Err(SimError::InsufficientResource {
                unit,
                kind,
                amount,
                available,
            });
        }
        u.metrics.resources_spent += amount;
        trace!(unit = %unit, ?kind, amount, %source, "resource spent");
        self.log_event(LogKind::Resource {
            unit,
            kind,
            delta: -amount,
            source,
        });
        Ok(())
    }

    /// Add `amount` of `kind` to `unit`, capped at the pool maximum. Units
    /// without a matching pool ignore the gain.
    pub fn gain_resource(
        &mut self,
        unit: UnitId,
        kind: ResourceKind,
        amount: f64,
        source: ContentId,
    ) -> SimResult<()> {
        let u = self.unit_mut(unit)?;
        let gained = match u.resource.as_mut() {
            Some(pool) if pool.kind() == kind => pool.gain(amount),
            _ => return Ok(()),
        };
        u.metrics.resources_gained += gained;
        if gained > 0.0 {
            self.log_event(LogKind::Resource {
                unit,
                kind,
                delta: gained,
                source,
            });
        }
        Ok(())
    }

    /// Rage earned from `damage` dealt by a white swing.
    pub(crate) fn rage_from_damage(&mut self, unit: UnitId, damage: f64) -> SimResult<()> {
        let u = self.unit(unit)?;
        if !matches!(u.resource.as_ref().map(ResourcePool::kind), Some(ResourceKind::Rage)) {
            return Ok(());
        }
        let rage = 7.5 * damage / rage_conversion(u.level);
        self.gain_resource(unit, ResourceKind::Rage, rage, RAGE_FROM_DAMAGE_SOURCE)
    }

    pub(crate) fn start_resource_ticks(&mut self, unit: UnitId) -> SimResult<()> {
        let needs_tick = match self.unit(unit)?.resource.as_ref() {
            Some(pool) => pool.kind() == ResourceKind::Mana || pool.regen_per_tick() > 0.0,
            None => false,
        };
        if needs_tick {
            let at = self.current_time() + RESOURCE_TICK;
            let id = self.schedule_action(at, Action::ResourceTick { unit })?;
            self.unit_mut(unit)?.resource_tick = Some(id);
        }
        Ok(())
    }

    pub(crate) fn resource_tick(&mut self, unit: UnitId) -> SimResult<()> {
        let u = self.unit(unit)?;
        let Some(pool) = u.resource.as_ref() else {
            return Ok(());
        };
        let kind = pool.kind();
        let mut amount = pool.regen_per_tick();
        if kind == ResourceKind::Mana {
            amount += u.stats.get(Stat::Mp5) * RESOURCE_TICK.as_secs_f64() / 5.0;
        }
        if amount > 0.0 {
            self.gain_resource(unit, kind, amount, REGEN_SOURCE)?;
        }
        let at = self.current_time() + RESOURCE_TICK;
        let id = self.schedule_action(at, Action::ResourceTick { unit })?;
        self.unit_mut(unit)?.resource_tick = Some(id);
        Ok(())
    }
}
