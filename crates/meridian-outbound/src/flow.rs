//! Per-identity flow state: a byte-accounted FIFO plus fairness bookkeeping.

use std::collections::VecDeque;

use crate::types::OutboundMessage;

/// Queued messages and fairness state for one identity.
///
/// The queue is strictly FIFO; fairness decides which *flow* is served next,
/// never the order within a flow. A flow with an empty queue is inactive: it
/// keeps its weight, finish time, and byte counters, but the scheduler
/// excludes it from selection until a message arrives.
#[derive(Debug)]
pub(crate) struct Flow {
    weight: f64,
    /// Virtual finish time: cumulative `size / weight` charge. The flow with
    /// the smallest value is served next.
    finish_time: f64,
    queue: VecDeque<OutboundMessage>,
    queued_bytes: usize,
    bytes_sent: u64,
    /// Set when the transport rejected this flow's head; cleared at tick start.
    deferred: bool,
}

impl Flow {
    pub(crate) fn new(weight: f64) -> Self {
        Flow {
            weight,
            finish_time: 0.0,
            queue: VecDeque::new(),
            queued_bytes: 0,
            bytes_sent: 0,
            deferred: false,
        }
    }

    /// Appends a message to the tail. Cannot fail; memory growth is bounded
    /// by callers applying admission control against `size_bytes()`.
    pub(crate) fn push(&mut self, msg: OutboundMessage) {
        self.queued_bytes += msg.size_bytes();
        self.queue.push_back(msg);
    }

    pub(crate) fn peek(&self) -> Option<&OutboundMessage> {
        self.queue.front()
    }

    /// Removes and returns the head message.
    pub(crate) fn pop(&mut self) -> Option<OutboundMessage> {
        let msg = self.queue.pop_front()?;
        self.queued_bytes -= msg.size_bytes();
        Some(msg)
    }

    /// Sum of queued message sizes, for fairness accounting and for depth
    /// reporting to callers implementing source-side flow control.
    pub(crate) fn size_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn weight(&self) -> f64 {
        self.weight
    }

    /// Future charges use the new weight; the accumulated finish time is not
    /// rescaled.
    pub(crate) fn set_weight(&mut self, weight: f64) {
        self.weight = weight;
    }

    pub(crate) fn finish_time(&self) -> f64 {
        self.finish_time
    }

    /// Charges `size` bytes of service against this flow's virtual clock.
    pub(crate) fn charge(&mut self, size: usize) {
        self.finish_time += size as f64 / self.weight;
    }

    /// Brings a reactivating flow forward to the scheduler's virtual clock so
    /// idle time cannot be banked against currently active flows.
    pub(crate) fn fast_forward(&mut self, clock: f64) {
        if clock > self.finish_time {
            self.finish_time = clock;
        }
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub(crate) fn note_sent(&mut self, size: usize) {
        self.bytes_sent += size as u64;
    }

    pub(crate) fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub(crate) fn set_deferred(&mut self, deferred: bool) {
        self.deferred = deferred;
    }
}
