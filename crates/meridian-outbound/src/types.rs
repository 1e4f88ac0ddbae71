//! Identity and message types shared across the scheduler stages.

use std::fmt;
use std::hash::Hash;

use bytes::Bytes;

/// Identifier of a destination simulation server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId(pub u32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "srv-{}", self.0)
    }
}

/// Identifier of a simulated object acting as a message producer.
///
/// UUID-width and opaque: the scheduler only hashes and orders it. The total
/// order exists so tie-breaks and iteration are deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u128);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj-{:032x}", self.0)
    }
}

/// Key type a [`FairScheduler`](crate::scheduler::FairScheduler) can be
/// parameterized over. Blanket-implemented; both [`ServerId`] and
/// [`ObjectId`] qualify.
pub trait FlowKey: Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display {}

impl<T: Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display> FlowKey for T {}

/// A buffered outbound message.
///
/// Immutable once enqueued. The scheduler exclusively owns the payload from
/// `enqueue` until it is handed to the transport or dropped; `Bytes` makes
/// the enqueue a move and the select-then-commit window a refcount bump
/// rather than a copy.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    destination: ServerId,
    source: Option<ObjectId>,
    payload: Bytes,
}

impl OutboundMessage {
    /// System/control traffic not attributable to any producer object.
    /// Bypasses client-stage fairness and competes only at server granularity.
    pub fn system(destination: ServerId, payload: Bytes) -> Self {
        OutboundMessage {
            destination,
            source: None,
            payload,
        }
    }

    /// Traffic produced by a simulated object, subject to client-stage
    /// fairness before it reaches the destination's flow.
    pub fn from_object(destination: ServerId, source: ObjectId, payload: Bytes) -> Self {
        OutboundMessage {
            destination,
            source: Some(source),
            payload,
        }
    }

    pub fn destination(&self) -> ServerId {
        self.destination
    }

    pub fn source(&self) -> Option<ObjectId> {
        self.source
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Size used for fairness accounting and budget charging.
    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }

    /// Hands the payload to the transport layer.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
