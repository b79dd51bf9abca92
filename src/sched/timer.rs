//! Timer heap for deadline management.
//!
//! A min-heap of deadlines tracks delayed tasks and watch timeouts.
//! Entries are never removed early: a fired entry whose target slot has
//! already been retired simply fails the generation check and is dropped.

use super::slab::Slot;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

/// What a timer entry fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerTarget {
    /// A delayed task stored in the scheduler's delayed-task arena.
    Task(Slot),
    /// The timeout of an fd watch.
    Watch(Slot),
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct TimerEntry {
    deadline: Instant,
    /// Tie-breaker preserving submission order for equal deadlines.
    sequence: u64,
    target: TimerTarget,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of timers ordered by deadline.
#[derive(Debug, Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    next_sequence: u64,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Adds a timer firing the given target at the given deadline.
    pub(crate) fn insert(&mut self, deadline: Instant, target: TimerTarget) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(TimerEntry {
            deadline,
            sequence,
            target,
        });
    }

    /// Returns the earliest deadline, if any.
    pub(crate) fn peek_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pops all timers whose deadline has passed.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<TimerTarget> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline <= now {
                let entry = self.heap.pop().expect("peeked entry present");
                expired.push(entry.target);
            } else {
                break;
            }
        }
        expired
    }
}
