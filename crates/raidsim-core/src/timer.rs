//! Ready-at timers and cooldowns.
//!
//! A timer is nothing more than an instant before which something is not
//! ready. Global cooldowns, spell cooldowns, and shared cooldown groups are
//! all timers owned by a unit and stored in the simulation's timer arena.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Index of a timer in the simulation's timer arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerId(pub(crate) u32);

impl TimerId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A single ready-at instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timer {
    ready_at: Duration,
}

impl Timer {
    /// When the timer is (or was) ready.
    #[inline]
    pub fn ready_at(&self) -> Duration {
        self.ready_at
    }

    /// Whether the timer is ready at `now`.
    #[inline]
    pub fn is_ready(&self, now: Duration) -> bool {
        self.ready_at <= now
    }

    /// Time left until ready, zero if already ready.
    #[inline]
    pub fn remaining(&self, now: Duration) -> Duration {
        self.ready_at.saturating_sub(now)
    }

    /// Overwrite the ready instant.
    #[inline]
    pub fn set(&mut self, ready_at: Duration) {
        self.ready_at = ready_at;
    }

    /// Back to ready-at-zero.
    #[inline]
    pub fn reset(&mut self) {
        self.ready_at = Duration::ZERO;
    }
}

/// A timer paired with the duration it is armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cooldown {
    /// Timer tracking readiness.
    pub timer: TimerId,
    /// Length of one cooldown period.
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_readiness() {
        let mut t = Timer::default();
        assert!(t.is_ready(Duration::ZERO));
        t.set(Duration::from_secs(6));
        assert!(!t.is_ready(Duration::from_secs(5)));
        assert!(t.is_ready(Duration::from_secs(6)));
        assert_eq!(t.remaining(Duration::from_secs(4)), Duration::from_secs(2));
        assert_eq!(t.remaining(Duration::from_secs(9)), Duration::ZERO);
        t.reset();
        assert_eq!(t.ready_at(), Duration::ZERO);
    }
}
