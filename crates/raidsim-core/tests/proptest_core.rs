//! Property tests for the event queue and stat sheets.
//!
//! Random schedules and modifier sequences are generated with `proptest`;
//! each test checks an ordering or symmetry invariant after replaying them.

use std::time::Duration;

use proptest::prelude::*;
use raidsim_core::prelude::*;
use raidsim_core::stats::StatSheet;

// ---------------------------------------------------------------------------
// Event queue
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2_000))]

    #[test]
    fn queue_pops_in_time_then_insertion_order(
        entries in prop::collection::vec((0u64..50, any::<bool>()), 1..80)
    ) {
        let mut queue = EventQueue::new();
        let mut ids = Vec::new();
        for (i, &(ms, _)) in entries.iter().enumerate() {
            ids.push(queue.schedule(Duration::from_millis(ms), i));
        }
        let mut cancelled = 0;
        for (id, &(_, cancel)) in ids.iter().zip(&entries) {
            if cancel {
                prop_assert!(queue.cancel(*id));
                prop_assert!(!queue.cancel(*id));
                cancelled += 1;
            }
        }
        prop_assert_eq!(queue.len(), entries.len() - cancelled);

        let mut last: Option<(Duration, u64)> = None;
        let mut popped = 0;
        while let Some(s) = queue.pop_due(Duration::from_secs(1)) {
            prop_assert!(!entries[s.action].1, "cancelled action {} popped", s.action);
            prop_assert_eq!(s.at, Duration::from_millis(entries[s.action].0));
            if let Some(prev) = last {
                prop_assert!(prev < (s.at, s.seq));
            }
            last = Some((s.at, s.seq));
            popped += 1;
        }
        prop_assert_eq!(popped, entries.len() - cancelled);
        prop_assert!(queue.is_empty());
    }

    #[test]
    fn pop_due_never_returns_future_actions(
        times in prop::collection::vec(0u64..100, 1..40),
        horizon in 0u64..100,
    ) {
        let mut queue = EventQueue::new();
        for &ms in &times {
            queue.schedule(Duration::from_millis(ms), ());
        }
        let until = Duration::from_millis(horizon);
        let mut due = 0;
        while let Some(s) = queue.pop_due(until) {
            prop_assert!(s.at <= until);
            due += 1;
        }
        prop_assert_eq!(due, times.iter().filter(|&&t| t <= horizon).count());
        prop_assert_eq!(queue.len(), times.len() - due);
    }
}

// ---------------------------------------------------------------------------
// Stat modifiers
// ---------------------------------------------------------------------------

fn stat_strategy() -> impl Strategy<Value = Stat> {
    (0..Stat::ALL.len()).prop_map(|i| Stat::ALL[i])
}

fn modifier_strategy() -> impl Strategy<Value = Modifier> {
    prop_oneof![
        (stat_strategy(), -500.0f64..500.0).prop_map(|(s, v)| Modifier::add(s, v)),
        (stat_strategy(), 0.5f64..2.0).prop_map(|(s, v)| Modifier::multiply(s, v)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1_000))]

    #[test]
    fn reverting_every_token_restores_base(
        mods in prop::collection::vec(modifier_strategy(), 1..30),
        order in any::<u64>(),
    ) {
        let base = StatBlock::neutral()
            .with(Stat::Strength, 120.0)
            .with(Stat::Agility, 80.0);
        let mut sheet = StatSheet::new(base);
        sheet
            .add_dependency(StatDependency::new(Stat::Strength, Stat::AttackPower, 2.0))
            .unwrap();
        let before = *sheet.effective();

        let mut tokens: Vec<_> = mods.iter().map(|m| sheet.apply(*m)).collect();
        prop_assert_eq!(sheet.modifier_count(), mods.len());

        // Revert in a scrambled but reproducible order.
        let n = tokens.len();
        for i in 0..n {
            let j = (order as usize).wrapping_add(i * 7) % (n - i);
            let token = tokens.swap_remove(j);
            prop_assert!(sheet.revert(token).is_some());
            prop_assert!(sheet.revert(token).is_none());
        }
        prop_assert_eq!(sheet.modifier_count(), 0);
        prop_assert_eq!(*sheet.effective(), before);
    }

    #[test]
    fn modifier_removal_is_independent_of_other_modifiers(
        first in modifier_strategy(),
        others in prop::collection::vec(modifier_strategy(), 0..10),
    ) {
        let mut with_first = StatSheet::new(StatBlock::neutral());
        let token = with_first.apply(first);
        for m in &others {
            with_first.apply(*m);
        }
        with_first.revert(token);

        let mut without = StatSheet::new(StatBlock::neutral());
        for m in &others {
            without.apply(*m);
        }
        prop_assert_eq!(*with_first.effective(), *without.effective());
    }
}
