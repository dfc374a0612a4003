//! Time-ordered pending action queue.
//!
//! The [`EventQueue`] holds every pending action of a trial, ordered by the
//! total order `(time, insertion sequence)`. Two actions due at the same
//! instant run in the order they were scheduled (FIFO). This is the single
//! source of ordering in a trial: given the same schedule calls in the same
//! order, actions pop in the same order.
//!
//! Cancellation is lazy. [`EventQueue::cancel`] flips a status flag and the
//! entry is discarded when it reaches the head of the heap, so cancelling an
//! action never has to search the heap.
//!
//! The payload type is generic so the queue can be exercised on its own; the
//! simulation instantiates it with its internal action enum.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use raidsim_core::queue::EventQueue;
//!
//! let mut queue = EventQueue::new();
//! let late = queue.schedule(Duration::from_secs(2), "late");
//! queue.schedule(Duration::from_secs(1), "first");
//! queue.schedule(Duration::from_secs(1), "second");
//! assert!(queue.cancel(late));
//!
//! let order: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|e| e.action).collect();
//! assert_eq!(order, vec!["first", "second"]);
//! ```

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ActionId
// ---------------------------------------------------------------------------

/// Handle to a scheduled action, usable for cancellation.
///
/// The raw value is the action's insertion sequence number, which is unique
/// within a trial (the counter restarts on [`EventQueue::clear`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(u64);

impl ActionId {
    /// Insertion sequence number of this action.
    #[inline]
    pub fn seq(self) -> u64 {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Scheduled
// ---------------------------------------------------------------------------

/// An action popped from the queue together with its ordering key.
#[derive(Debug)]
pub struct Scheduled<A> {
    /// When the action is due.
    pub at: Duration,
    /// Insertion sequence number (the FIFO tie-break).
    pub seq: u64,
    /// The payload.
    pub action: A,
}

struct Entry<A> {
    at: Duration,
    seq: u64,
    action: A,
}

impl<A> PartialEq for Entry<A> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<A> Eq for Entry<A> {}

impl<A> PartialOrd for Entry<A> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<A> Ord for Entry<A> {
    // Reversed so the std max-heap pops the earliest (time, seq) first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Cancelled,
    Done,
}

// ---------------------------------------------------------------------------
// EventQueue
// ---------------------------------------------------------------------------

/// Min-heap of pending actions keyed by `(time, seq)`.
pub struct EventQueue<A> {
    heap: BinaryHeap<Entry<A>>,
    /// Status per sequence number; indexed by `seq`.
    status: Vec<Status>,
    next_seq: u64,
    live: usize,
}

impl<A> EventQueue<A> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            status: Vec::new(),
            next_seq: 0,
            live: 0,
        }
    }

    /// Insert an action due at `at`.
    ///
    /// The queue does not know the current time; callers reject past
    /// timestamps before reaching it.
    pub fn schedule(&mut self, at: Duration, action: A) -> ActionId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.status.push(Status::Pending);
        self.heap.push(Entry { at, seq, action });
        self.live += 1;
        ActionId(seq)
    }

    /// Cancel a pending action.
    ///
    /// Returns `true` if the action was pending and is now cancelled. Cancelling
    /// an action that already ran, was already cancelled, or belongs to a
    /// previous trial is a no-op returning `false`.
    pub fn cancel(&mut self, id: ActionId) -> bool {
        match self.status.get_mut(id.0 as usize) {
            Some(status @ Status::Pending) => {
                *status = Status::Cancelled;
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    /// Whether `id` is still waiting to run.
    pub fn is_pending(&self, id: ActionId) -> bool {
        matches!(self.status.get(id.0 as usize), Some(Status::Pending))
    }

    /// Due time of the earliest live action, discarding cancelled heads.
    pub fn peek_time(&mut self) -> Option<Duration> {
        self.discard_cancelled_head();
        self.heap.peek().map(|e| e.at)
    }

    /// Pop the earliest live action.
    pub fn pop(&mut self) -> Option<Scheduled<A>> {
        self.discard_cancelled_head();
        let entry = self.heap.pop()?;
        self.status[entry.seq as usize] = Status::Done;
        self.live -= 1;
        Some(Scheduled {
            at: entry.at,
            seq: entry.seq,
            action: entry.action,
        })
    }

    /// Pop the earliest live action if it is due at or before `until`.
    pub fn pop_due(&mut self, until: Duration) -> Option<Scheduled<A>> {
        match self.peek_time() {
            Some(at) if at <= until => self.pop(),
            _ => None,
        }
    }

    /// Number of live (pending, not cancelled) actions.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no live actions remain.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Sequence number the next scheduled action will receive.
    #[inline]
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Drop every action and restart the sequence counter. Allocations are
    /// kept for the next trial.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.status.clear();
        self.next_seq = 0;
        self.live = 0;
    }

    fn discard_cancelled_head(&mut self) {
        while let Some(head) = self.heap.peek() {
            if self.status[head.seq as usize] != Status::Cancelled {
                break;
            }
            let seq = head.seq as usize;
            self.heap.pop();
            self.status[seq] = Status::Done;
        }
    }
}

impl<A> Default for EventQueue<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn equal_times_pop_in_insertion_order() {
        let mut q = EventQueue::new();
        for i in 0..5 {
            q.schedule(ms(100), i);
        }
        q.schedule(ms(50), 99);
        let popped: Vec<i32> = std::iter::from_fn(|| q.pop()).map(|s| s.action).collect();
        assert_eq!(popped, vec![99, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn cancelled_actions_never_pop() {
        let mut q = EventQueue::new();
        let a = q.schedule(ms(10), "a");
        q.schedule(ms(20), "b");
        assert!(q.cancel(a));
        assert!(!q.cancel(a), "second cancel is a no-op");
        assert_eq!(q.len(), 1);
        assert_eq!(q.peek_time(), Some(ms(20)));
        assert_eq!(q.pop().map(|s| s.action), Some("b"));
        assert!(q.pop().is_none());
    }

    #[test]
    fn cancel_after_run_is_noop() {
        let mut q = EventQueue::new();
        let a = q.schedule(ms(10), ());
        assert!(q.pop().is_some());
        assert!(!q.cancel(a));
        assert!(q.is_empty());
    }

    #[test]
    fn pop_due_respects_bound() {
        let mut q = EventQueue::new();
        q.schedule(ms(10), 1);
        q.schedule(ms(30), 2);
        assert_eq!(q.pop_due(ms(20)).map(|s| s.action), Some(1));
        assert!(q.pop_due(ms(20)).is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn clear_restarts_sequence_and_forgets_handles() {
        let mut q = EventQueue::new();
        let old = q.schedule(ms(5), 0);
        q.clear();
        assert_eq!(q.next_seq(), 0);
        assert!(!q.cancel(old));
        let fresh = q.schedule(ms(5), 1);
        assert_eq!(fresh.seq(), 0);
        assert!(q.is_pending(fresh));
    }
}
