//! Transport and statistics collaborator seams.
//!
//! The scheduler core owns no sockets and no wire format. It drives whatever
//! implements [`Transport`] and reports deliveries to whatever implements
//! [`StatsSink`]; both are borrowed for the duration of a service tick, not
//! owned.

use bytes::Bytes;
use quanta::Instant;

use crate::types::ServerId;

/// Outcome of a non-blocking transport send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The transport took the bytes; the message may be popped.
    Accepted,
    /// The transport cannot accept data right now. The message stays at the
    /// head of its flow and is retried on a later tick.
    Rejected,
    /// The destination is permanently unreachable.
    Fatal,
}

/// The byte mover the pipeline drives each tick.
///
/// `send` must never block: poll-and-reject semantics only. A blocking
/// transport would stall the whole tick and break fairness across unrelated
/// flows. It must also be safe to call repeatedly with the same head message
/// after a rejection.
pub trait Transport {
    fn send(&mut self, destination: ServerId, payload: &Bytes) -> SendOutcome;
}

/// Fire-and-forget bandwidth-usage sink. Must never block or fail the
/// caller.
pub trait StatsSink {
    fn record(&mut self, destination: ServerId, bytes: usize, at: Instant);
}

/// Sink that discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl StatsSink for NullSink {
    fn record(&mut self, _destination: ServerId, _bytes: usize, _at: Instant) {}
}
