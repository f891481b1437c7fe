use crate::reassembly::queue::ReassemblyQueue;
use crate::util::seq_num::SeqNum;
use std::collections::BTreeMap;
use tracing::{debug, trace};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageInsertResult {
    Accepted,
    /// a message with the same start was buffered before, or it was delivered already
    Duplicate,
    /// the reassembly queue is at capacity
    Dropped,
}

/// Reassembly of messages that each occupy a range of the sequence space. Messages are
///  delivered in sequence order once all data up to their end was received, and each message
///  is delivered at most once.
pub struct MessageReassemblyQueue<M> {
    queue: ReassemblyQueue,
    /// keyed by the message's unwrapped start
    messages: BTreeMap<u64, (u32, M)>,
    /// messages starting below this position were delivered
    delivered: u64,
}

impl<M> MessageReassemblyQueue<M> {
    pub fn new(start_seq: SeqNum, max_ranges: usize) -> MessageReassemblyQueue<M> {
        MessageReassemblyQueue {
            queue: ReassemblyQueue::new(start_seq, max_ranges),
            messages: Default::default(),
            delivered: start_seq.initial_abs(),
        }
    }

    fn abs(&self, seq: SeqNum) -> u64 {
        seq.unwrap_near(self.delivered)
    }

    pub fn virtual_start(&self) -> SeqNum {
        self.queue.virtual_start()
    }

    pub fn num_buffered_messages(&self) -> usize {
        self.messages.len()
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.queue.buffered_bytes()
    }

    pub fn insert(&mut self, start: SeqNum, len: u32, message: M) -> MessageInsertResult {
        assert!(len > 0, "messages occupy at least one sequence number");

        let start_abs = self.abs(start);
        if start_abs < self.delivered || self.messages.contains_key(&start_abs) {
            trace!("duplicate message at {} - rejecting", start);
            return MessageInsertResult::Duplicate;
        }

        let outcome = self.queue.insert_range(start, len, None);
        if let Some((evicted_start, evicted_end)) = outcome.evicted {
            let evicted_start = self.abs(evicted_start);
            let evicted_end = self.abs(evicted_end);
            let evicted_keys = self.messages.range(evicted_start..evicted_end)
                .map(|(&k, _)| k)
                .collect::<Vec<_>>();
            debug!("discarding {} messages whose data was evicted", evicted_keys.len());
            for key in evicted_keys {
                self.messages.remove(&key);
            }
        }
        if !outcome.accepted {
            return MessageInsertResult::Dropped;
        }

        self.messages.insert(start_abs, (len, message));
        MessageInsertResult::Accepted
    }

    /// Returns the next message if all data up to its end was received
    pub fn pop_deliverable(&mut self) -> Option<(SeqNum, M)> {
        let virtual_start = self.abs(self.queue.virtual_start());
        let (&start, &(len, _)) = self.messages.first_key_value()?;
        let end = start + u64::from(len);
        if end > virtual_start + 1 {
            return None;
        }

        let (_, (_, message)) = self.messages.pop_first()?;
        self.delivered = end;
        while self.queue.extract_up_to(SeqNum::from_abs(end - 1)).is_some() {}

        Some((SeqNum::from_abs(start), message))
    }

    pub fn clear(&mut self) {
        if !self.messages.is_empty() {
            debug!("discarding {} undelivered messages", self.messages.len());
        }
        self.messages.clear();
        self.queue.clear();
    }
}
