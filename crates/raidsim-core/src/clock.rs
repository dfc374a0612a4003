//! Simulation time.
//!
//! Time is an absolute [`Duration`] since encounter start. The clock only
//! moves forward, and only when the queue hands out the next due action.

use std::time::Duration;

use crate::{SimError, SimResult};

/// Converts fractional seconds into a [`Duration`], clamping negatives and
/// NaN to zero and saturating values too large to represent.
#[inline]
pub fn seconds(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Monotonic simulation clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Clock {
    now: Duration,
}

impl Clock {
    /// A clock at encounter start.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulation time.
    #[inline]
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Advance to `at`. Moving backwards is an engine invariant violation.
    pub fn advance_to(&mut self, at: Duration) -> SimResult<()> {
        if at < self.now {
            return Err(SimError::ScheduledInPast { at, now: self.now });
        }
        self.now = at;
        Ok(())
    }

    /// Rewind to zero for the next trial.
    pub fn reset(&mut self) {
        self.now = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_refuses_to_move_backwards() {
        let mut clock = Clock::new();
        clock.advance_to(Duration::from_secs(3)).unwrap();
        clock.advance_to(Duration::from_secs(3)).unwrap();
        let err = clock.advance_to(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, SimError::ScheduledInPast { .. }));
        assert_eq!(clock.now(), Duration::from_secs(3));
    }

    #[test]
    fn seconds_clamps_garbage() {
        assert_eq!(seconds(-1.0), Duration::ZERO);
        assert_eq!(seconds(f64::NAN), Duration::ZERO);
        assert_eq!(seconds(1.5), Duration::from_millis(1500));
        assert_eq!(seconds(1e20), Duration::MAX);
        assert_eq!(seconds(f64::INFINITY), Duration::MAX);
    }
}
