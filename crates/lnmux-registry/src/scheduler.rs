//! Time-ordered queue of invoice deadlines.
//!
//! Deadlines are advisory: when one fires, the registry re-checks the
//! invoice state before acting on it. Rescheduling or cancelling a deadline
//! does not touch the heap; stale heap entries are skipped when popped.

use chrono::{DateTime, Utc};
use lnmux_core::PaymentHash;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// What a deadline guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeadlineKind {
    /// The invoice expiry; cancels an invoice still `Open`.
    InvoiceExpiry,
    /// Cancels an invoice whose held HTLCs were not completed or settled.
    AcceptTimeout,
}

/// A deadline that came due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub hash: PaymentHash,
    pub kind: DeadlineKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    at: DateTime<Utc>,
    generation: u64,
    hash: PaymentHash,
    kind: DeadlineKind,
}

/// Pending deadlines, at most one per (invoice, kind).
#[derive(Debug, Default)]
pub struct DeadlineQueue {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    live: HashMap<(PaymentHash, DeadlineKind), u64>,
    next_generation: u64,
}

impl DeadlineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a deadline, replacing any earlier one of the same kind.
    pub fn schedule(&mut self, hash: PaymentHash, kind: DeadlineKind, at: DateTime<Utc>) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.live.insert((hash, kind), generation);
        self.heap.push(Reverse(HeapEntry {
            at,
            generation,
            hash,
            kind,
        }));
    }

    pub fn cancel(&mut self, hash: &PaymentHash, kind: DeadlineKind) {
        self.live.remove(&(*hash, kind));
    }

    /// Drop every deadline of an invoice.
    pub fn cancel_all(&mut self, hash: &PaymentHash) {
        self.cancel(hash, DeadlineKind::InvoiceExpiry);
        self.cancel(hash, DeadlineKind::AcceptTimeout);
    }

    /// Remove and return every live deadline due at or before `now`, oldest first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<Deadline> {
        let mut due = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.at > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            if self.is_live(&entry) {
                self.live.remove(&(entry.hash, entry.kind));
                due.push(Deadline {
                    hash: entry.hash,
                    kind: entry.kind,
                    at: entry.at,
                });
            }
        }
        due
    }

    /// The earliest live deadline, discarding stale entries on the way.
    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse(top)) = self.heap.peek() {
            if self.is_live(top) {
                return Some(top.at);
            }
            self.heap.pop();
        }
        None
    }

    /// Number of live deadlines.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn is_live(&self, entry: &HeapEntry) -> bool {
        self.live.get(&(entry.hash, entry.kind)) == Some(&entry.generation)
    }
}
