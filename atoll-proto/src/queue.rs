//! Reliable message queues
//!
//! Provides:
//! - [`MessageQueueOutbox`]: producer-side durable ring buffer with
//!   monotonically increasing sequence numbers
//! - [`MessageQueueInbox`]: consumer-side deduplicating receiver
//!
//! The sender attaches `(first_sequence_number, items)` to every heartbeat
//! and trims up to the receiver's acknowledged sequence; the receiver skips
//! already-delivered prefixes, so each item is delivered exactly once in
//! sender order even across reconnects.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::warn;

/// A contiguous slice of an outbox, as carried by one heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSegment<T> {
    /// Sequence number of `items[0]`; meaningless when `items` is empty
    pub first_sequence_number: u64,
    pub items: Vec<T>,
}

impl<T> QueueSegment<T> {
    /// An empty segment
    pub fn empty() -> Self {
        Self {
            first_sequence_number: 0,
            items: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Default for QueueSegment<T> {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug)]
struct OutboxState<T> {
    /// Sequence number of the front item; the next enqueue gets
    /// `first_sequence_number + items.len()`
    first_sequence_number: u64,
    items: VecDeque<T>,
}

/// Producer-side durable ring buffer.
///
/// Items stay queued until the peer acknowledges them, so a reconnecting
/// receiver sees every unacknowledged item again and dedups by sequence.
#[derive(Debug)]
pub struct MessageQueueOutbox<T> {
    name: &'static str,
    state: Mutex<OutboxState<T>>,
}

impl<T: Clone> MessageQueueOutbox<T> {
    /// Create an empty outbox; `name` shows up in logs
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(OutboxState {
                first_sequence_number: 1,
                items: VecDeque::new(),
            }),
        }
    }

    /// Append an item; returns its sequence number
    pub fn enqueue(&self, item: T) -> u64 {
        let mut state = self.state.lock();
        let sequence_number = state.first_sequence_number + state.items.len() as u64;
        state.items.push_back(item);
        sequence_number
    }

    /// Append many items at once; returns the sequence of the first one
    pub fn enqueue_many(&self, items: impl IntoIterator<Item = T>) -> u64 {
        let mut state = self.state.lock();
        let first = state.first_sequence_number + state.items.len() as u64;
        state.items.extend(items);
        first
    }

    /// Build the segment to attach to the next heartbeat
    pub fn build_outgoing(&self) -> QueueSegment<T> {
        let state = self.state.lock();
        QueueSegment {
            first_sequence_number: state.first_sequence_number,
            items: state.items.iter().cloned().collect(),
        }
    }

    /// Process the receiver's acknowledgment: drop every item with a
    /// sequence number `<= acknowledged`.
    pub fn handle_status(&self, acknowledged: u64) {
        let mut state = self.state.lock();
        while state.first_sequence_number <= acknowledged {
            if state.items.pop_front().is_none() {
                warn!(
                    outbox = self.name,
                    acknowledged,
                    first_sequence_number = state.first_sequence_number,
                    "Peer acknowledged a sequence number past the outbox tail"
                );
                state.first_sequence_number = acknowledged + 1;
                return;
            }
            state.first_sequence_number += 1;
        }
    }

    /// Items not yet acknowledged
    pub fn pending_count(&self) -> usize {
        self.state.lock().items.len()
    }
}

/// Consumer-side deduplicating receiver.
///
/// Tracks the next expected sequence number; items below it are duplicates
/// from a resend and are skipped.
#[derive(Debug)]
pub struct MessageQueueInbox {
    name: &'static str,
    next_expected: Mutex<u64>,
}

impl MessageQueueInbox {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_expected: Mutex::new(1),
        }
    }

    /// Deliver the fresh suffix of an incoming segment, in order, exactly
    /// once. Returns the number of items actually delivered.
    pub fn handle_incoming<T>(
        &self,
        segment: QueueSegment<T>,
        mut handler: impl FnMut(T),
    ) -> usize {
        if segment.items.is_empty() {
            return 0;
        }
        let mut next_expected = self.next_expected.lock();
        let first = segment.first_sequence_number;
        let count = segment.items.len() as u64;
        if first > *next_expected {
            // The sender trimmed past our ack; only possible if acks were
            // lost together with receiver state. Jump forward rather than
            // stall the stream.
            warn!(
                inbox = self.name,
                expected = *next_expected,
                received_first = first,
                "Gap in incoming message stream"
            );
            *next_expected = first;
        }
        let skip = (*next_expected - first) as usize;
        if skip >= segment.items.len() {
            return 0;
        }
        let mut delivered = 0;
        for item in segment.items.into_iter().skip(skip) {
            handler(item);
            delivered += 1;
        }
        *next_expected = first + count;
        delivered
    }

    /// Highest contiguous sequence number delivered so far; this is the ack
    /// to report back to the sender.
    pub fn report_status(&self) -> u64 {
        *self.next_expected.lock() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_sequences_start_at_one() {
        let outbox = MessageQueueOutbox::new("test");
        assert_eq!(outbox.enqueue("a"), 1);
        assert_eq!(outbox.enqueue("b"), 2);
        let segment = outbox.build_outgoing();
        assert_eq!(segment.first_sequence_number, 1);
        assert_eq!(segment.items, vec!["a", "b"]);
    }

    #[test]
    fn test_outbox_trims_on_ack() {
        let outbox = MessageQueueOutbox::new("test");
        outbox.enqueue(1);
        outbox.enqueue(2);
        outbox.enqueue(3);
        outbox.handle_status(2);
        let segment = outbox.build_outgoing();
        assert_eq!(segment.first_sequence_number, 3);
        assert_eq!(segment.items, vec![3]);
        assert_eq!(outbox.pending_count(), 1);
    }

    #[test]
    fn test_inbox_delivers_exactly_once() {
        let outbox = MessageQueueOutbox::new("out");
        let inbox = MessageQueueInbox::new("in");
        outbox.enqueue("a");
        outbox.enqueue("b");

        let mut delivered = Vec::new();
        inbox.handle_incoming(outbox.build_outgoing(), |item| delivered.push(item));
        assert_eq!(delivered, vec!["a", "b"]);
        assert_eq!(inbox.report_status(), 2);

        // A resend of the same segment is entirely deduplicated.
        let count = inbox.handle_incoming(outbox.build_outgoing(), |item| delivered.push(item));
        assert_eq!(count, 0);
        assert_eq!(delivered, vec!["a", "b"]);
    }

    #[test]
    fn test_reconnect_resumes_from_ack() {
        let outbox = MessageQueueOutbox::new("out");
        let inbox = MessageQueueInbox::new("in");
        outbox.enqueue(10);
        outbox.enqueue(20);

        let mut delivered = Vec::new();
        inbox.handle_incoming(outbox.build_outgoing(), |item| delivered.push(item));
        outbox.handle_status(inbox.report_status());
        outbox.enqueue(30);

        // The connection drops before the segment with 30 is acked; the
        // sender resends from ack+1 and the receiver takes only the fresh
        // suffix.
        inbox.handle_incoming(outbox.build_outgoing(), |item| delivered.push(item));
        inbox.handle_incoming(outbox.build_outgoing(), |item| delivered.push(item));
        assert_eq!(delivered, vec![10, 20, 30]);
        assert_eq!(inbox.report_status(), 3);
    }

    #[test]
    fn test_partial_overlap_delivery() {
        let inbox = MessageQueueInbox::new("in");
        inbox.handle_incoming(
            QueueSegment {
                first_sequence_number: 1,
                items: vec!["a", "b"],
            },
            |_| {},
        );
        let mut delivered = Vec::new();
        inbox.handle_incoming(
            QueueSegment {
                first_sequence_number: 2,
                items: vec!["b", "c"],
            },
            |item| delivered.push(item),
        );
        assert_eq!(delivered, vec!["c"]);
        assert_eq!(inbox.report_status(), 3);
    }

    #[test]
    fn test_empty_segment_is_noop() {
        let inbox = MessageQueueInbox::new("in");
        let count = inbox.handle_incoming(QueueSegment::<u32>::empty(), |_| {});
        assert_eq!(count, 0);
        assert_eq!(inbox.report_status(), 0);
    }
}
