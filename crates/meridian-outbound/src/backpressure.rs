//! Backpressure adapter between the outer scheduler and the transport.
//!
//! Classifies each transport outcome into the action the transmit loop takes:
//! commit the delivery, defer the flow for the rest of the tick, or tear the
//! flow down. A rejection never pops, reorders, or duplicates the head
//! message: the queue is byte-for-byte identical however often the
//! transport pushes back.

use bytes::Bytes;

use tracing::{debug, warn};

use crate::transport::{SendOutcome, Transport};
use crate::types::ServerId;

/// What became of one transmission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Sent. Pop the message and charge the tick budget.
    Delivered,
    /// Transport backpressure. Keep the head in place, defer the flow until
    /// the next tick, leave the remaining budget for other flows.
    Blocked,
    /// Destination gone. Drop the flow and notify the registering context.
    Failed,
}

pub(crate) fn attempt_send<T: Transport + ?Sized>(
    transport: &mut T,
    destination: ServerId,
    payload: &Bytes,
) -> Delivery {
    match transport.send(destination, payload) {
        SendOutcome::Accepted => Delivery::Delivered,
        SendOutcome::Rejected => {
            debug!(%destination, bytes = payload.len(), "transport backpressure, deferring flow");
            Delivery::Blocked
        }
        SendOutcome::Fatal => {
            warn!(%destination, "transport reports destination unreachable");
            Delivery::Failed
        }
    }
}

/// Queue-depth snapshot for admission-control decisions by enclosing layers.
///
/// The core never caps memory itself; callers are expected to stop feeding
/// `enqueue` when these numbers cross their own thresholds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DepthReport {
    /// Messages still waiting in the client (inner) stage.
    pub client_messages: usize,
    pub client_bytes: usize,
    /// Messages promoted to (or directly enqueued in) the server stage.
    pub server_messages: usize,
    pub server_bytes: usize,
}

impl DepthReport {
    pub fn total_messages(&self) -> usize {
        self.client_messages + self.server_messages
    }

    pub fn total_bytes(&self) -> usize {
        self.client_bytes + self.server_bytes
    }
}
