//! Aggregate pipeline statistics.
//!
//! Counters only; designed for JSON export alongside the rest of the
//! server's telemetry.

use serde::Serialize;

/// Cumulative counters for one pipeline instance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    /// Messages accepted by `enqueue` (both stages).
    pub messages_enqueued: u64,
    /// Messages promoted from the client stage into a server flow.
    pub promotions: u64,
    /// Messages the transport accepted.
    pub messages_sent: u64,
    /// Payload bytes the transport accepted.
    pub bytes_sent: u64,
    /// Transient transport rejections (retried next tick, never lost).
    pub rejected_sends: u64,
    /// Fatal transport errors (one per occurrence, not per dropped message).
    pub fatal_errors: u64,
    /// Promotions dropped because their destination was marked unreachable.
    pub dropped_unreachable: u64,
    /// Service ticks executed.
    pub ticks: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mean delivered message size in bytes.
    pub fn mean_message_size(&self) -> f64 {
        if self.messages_sent == 0 {
            0.0
        } else {
            self.bytes_sent as f64 / self.messages_sent as f64
        }
    }

    /// Fraction of send attempts the transport pushed back on.
    pub fn rejection_ratio(&self) -> f64 {
        let attempts = self.messages_sent + self.rejected_sends;
        if attempts == 0 {
            0.0
        } else {
            self.rejected_sends as f64 / attempts as f64
        }
    }
}
