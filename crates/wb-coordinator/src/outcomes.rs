//! Outcome bags
//!
//! Appends accumulate between batch exchanges; a snapshot is what goes
//! into the request, and only an acknowledged exchange drops the
//! snapshotted prefix. A failed exchange leaves the bag intact, so the
//! next tick resubmits the very same outcomes and the store absorbs any
//! duplicates.

use std::sync::Mutex;

use wb_domain::{EventRecord, MessageId, WorkMessage};
use wb_ports::{Completion, FailureOutcome};

/// Append-only bag drained by exactly one worker loop.
pub struct OutcomeBag<T> {
    items: Mutex<Vec<T>>,
}

impl<T: Clone> OutcomeBag<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        self.items.lock().unwrap().extend(items);
    }

    /// Clone the current contents without consuming them.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().unwrap().clone()
    }

    /// Drop the first `count` items once the store has acknowledged them.
    /// Appends since the snapshot stay queued for the next exchange.
    pub fn ack(&self, count: usize) {
        let mut items = self.items.lock().unwrap();
        let count = count.min(items.len());
        items.drain(..count);
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

impl<T: Clone> Default for OutcomeBag<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-process outcome bags. Each bag has a single draining owner:
/// the publisher drains the outbox bags and the staged work, the consumer
/// drains the inbox/receptor bags. The dispatcher and the processing
/// stages only append.
#[derive(Default)]
pub struct Outcomes {
    pub outbox_completions: OutcomeBag<Completion>,
    pub outbox_failures: OutcomeBag<FailureOutcome>,
    pub renew_outbox: OutcomeBag<MessageId>,
    pub inbox_completions: OutcomeBag<Completion>,
    pub inbox_failures: OutcomeBag<FailureOutcome>,
    pub receptor_completions: OutcomeBag<Completion>,
    pub renew_inbox: OutcomeBag<MessageId>,
    pub staged_outbox: OutcomeBag<WorkMessage>,
    pub staged_inbox: OutcomeBag<WorkMessage>,
    pub staged_events: OutcomeBag<EventRecord>,
}

impl Outcomes {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_does_not_consume() {
        let bag = OutcomeBag::new();
        bag.push(1);
        bag.push(2);
        assert_eq!(bag.snapshot(), vec![1, 2]);
        assert_eq!(bag.len(), 2);
    }

    #[test]
    fn test_ack_drops_only_the_acknowledged_prefix() {
        let bag = OutcomeBag::new();
        bag.push(1);
        bag.push(2);
        let snapshot = bag.snapshot();

        // An append lands between snapshot and ack.
        bag.push(3);
        bag.ack(snapshot.len());
        assert_eq!(bag.snapshot(), vec![3]);
    }

    #[test]
    fn test_failed_exchange_keeps_the_bag_intact() {
        let bag = OutcomeBag::new();
        bag.push("a");
        let first = bag.snapshot();
        // No ack (the exchange failed); the next snapshot resubmits the
        // same items.
        let second = bag.snapshot();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ack_beyond_len_is_safe() {
        let bag = OutcomeBag::new();
        bag.push(1);
        bag.ack(10);
        assert!(bag.is_empty());
    }
}
