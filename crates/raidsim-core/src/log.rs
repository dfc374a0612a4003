//! Optional combat log.
//!
//! When enabled with [`Simulation::enable_log`](crate::sim::Simulation::enable_log),
//! the simulation appends one [`LogEntry`] per observable event: casts, damage,
//! healing, aura transitions, resource changes, and deaths. Entries are
//! appended in dispatch order, so their `(at, seq)` pairs are non-decreasing.
//! The log is cleared by every trial reset.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::attack_table::HitOutcome;
use crate::spell::ContentId;
use crate::unit::{ResourceKind, UnitId};

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogKind {
    Cast {
        unit: UnitId,
        spell: ContentId,
        target: UnitId,
    },
    Damage {
        caster: UnitId,
        target: UnitId,
        spell: ContentId,
        outcome: HitOutcome,
        amount: f64,
        periodic: bool,
    },
    Healing {
        caster: UnitId,
        target: UnitId,
        spell: ContentId,
        amount: f64,
        periodic: bool,
    },
    AuraGained {
        unit: UnitId,
        label: String,
    },
    AuraExpired {
        unit: UnitId,
        label: String,
    },
    StacksChanged {
        unit: UnitId,
        label: String,
        stacks: u32,
    },
    /// Positive for gains, negative for spending.
    Resource {
        unit: UnitId,
        kind: ResourceKind,
        delta: f64,
        source: ContentId,
    },
    Death {
        unit: UnitId,
    },
}

/// One timestamped log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: Duration,
    /// Strictly increasing within a trial.
    pub seq: u64,
    pub kind: LogKind,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:>9.3}] ", self.at.as_secs_f64())?;
        match &self.kind {
            LogKind::Cast { unit, spell, target } => {
                write!(f, "{unit} casts {spell} on {target}")
            }
            LogKind::Damage {
                caster,
                target,
                spell,
                outcome,
                amount,
                periodic,
            } => {
                let tick = if *periodic { " (tick)" } else { "" };
                write!(f, "{caster} {spell} {outcome:?} {target} for {amount:.1}{tick}")
            }
            LogKind::Healing {
                caster,
                target,
                spell,
                amount,
                periodic,
            } => {
                let tick = if *periodic { " (tick)" } else { "" };
                write!(f, "{caster} {spell} heals {target} for {amount:.1}{tick}")
            }
            LogKind::AuraGained { unit, label } => write!(f, "{unit} gains {label}"),
            LogKind::AuraExpired { unit, label } => write!(f, "{unit} loses {label}"),
            LogKind::StacksChanged { unit, label, stacks } => {
                write!(f, "{unit} {label} stacks -> {stacks}")
            }
            LogKind::Resource {
                unit,
                kind,
                delta,
                source,
            } => write!(f, "{unit} {kind:?} {delta:+.1} from {source}"),
            LogKind::Death { unit } => write!(f, "{unit} dies"),
        }
    }
}

/// Append-only list of entries for one trial.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CombatLog {
    entries: Vec<LogEntry>,
}

impl CombatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, at: Duration, kind: LogKind) {
        let seq = self.entries.len() as u64;
        self.entries.push(LogEntry { at, seq, kind });
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that involve `unit` in any role.
    pub fn entries_for_unit(&self, unit: UnitId) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |e| match &e.kind {
            LogKind::Cast {
                unit: u, target, ..
            } => *u == unit || *target == unit,
            LogKind::Damage { caster, target, .. } | LogKind::Healing { caster, target, .. } => {
                *caster == unit || *target == unit
            }
            LogKind::AuraGained { unit: u, .. }
            | LogKind::AuraExpired { unit: u, .. }
            | LogKind::StacksChanged { unit: u, .. }
            | LogKind::Resource { unit: u, .. }
            | LogKind::Death { unit: u } => *u == unit,
        })
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_increases_and_filter_by_unit() {
        let mut log = CombatLog::new();
        let a = UnitId(0);
        let b = UnitId(1);
        log.push(Duration::ZERO, LogKind::AuraGained { unit: a, label: "x".into() });
        log.push(Duration::from_secs(1), LogKind::Death { unit: b });
        log.push(
            Duration::from_secs(1),
            LogKind::Cast {
                unit: a,
                spell: ContentId::spell(1),
                target: b,
            },
        );
        let seqs: Vec<_> = log.entries().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(log.entries_for_unit(b).count(), 2);
        assert_eq!(log.entries_for_unit(a).count(), 2);
    }

    #[test]
    fn display_is_readable() {
        let entry = LogEntry {
            at: Duration::from_millis(1500),
            seq: 0,
            kind: LogKind::Death { unit: UnitId(3) },
        };
        assert_eq!(entry.to_string(), "[    1.500] unit#3 dies");
    }
}
