//! Property tests for the scheduling invariants that must hold for any
//! enqueue history: per-flow FIFO delivery and the per-tick byte cap.

use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use quanta::Instant;

use meridian_outbound::{
    NullSink, OutboundMessage, PipelineConfig, SendOutcome, SendPipeline, ServerId, Transport,
};

const TICK: Duration = Duration::from_millis(100);
const DESTINATIONS: u32 = 3;

#[derive(Default)]
struct CountingTransport {
    accepted: Vec<(ServerId, Bytes)>,
}

impl Transport for CountingTransport {
    fn send(&mut self, destination: ServerId, payload: &Bytes) -> SendOutcome {
        self.accepted.push((destination, payload.clone()));
        SendOutcome::Accepted
    }
}

// Sizes stay under the smallest carry cap exercised below (rate 500 B/s ×
// 500 ms burst window = 250 bytes), so every message can eventually fit a
// tick's budget.
fn message_plan() -> impl Strategy<Value = Vec<(u32, usize)>> {
    proptest::collection::vec(((0..DESTINATIONS), 3usize..240), 1..60)
}

fn build_pipeline(bytes_per_sec: f64) -> SendPipeline {
    let mut pipeline = SendPipeline::new(PipelineConfig {
        bytes_per_sec,
        ..PipelineConfig::default()
    });
    for dest in 0..DESTINATIONS {
        pipeline
            .register_server(ServerId(dest), (dest + 1) as f64)
            .unwrap();
    }
    pipeline
}

/// Encodes (destination, per-destination sequence number) into the payload
/// so delivery order can be audited at the transport.
fn tagged_payload(dest: u32, seq: usize, size: usize) -> Bytes {
    let mut body = vec![dest as u8; size];
    body[1] = (seq & 0xff) as u8;
    body[2] = ((seq >> 8) & 0xff) as u8;
    Bytes::from(body)
}

proptest! {
    #[test]
    fn per_flow_delivery_preserves_enqueue_order(plan in message_plan()) {
        let mut pipeline = build_pipeline(10_000.0);
        let mut transport = CountingTransport::default();
        let mut sink = NullSink;

        let mut seqs = vec![0usize; DESTINATIONS as usize];
        for &(dest, size) in &plan {
            let seq = seqs[dest as usize];
            seqs[dest as usize] += 1;
            pipeline
                .enqueue(OutboundMessage::system(
                    ServerId(dest),
                    tagged_payload(dest, seq, size),
                ))
                .unwrap();
        }

        let t0 = Instant::now();
        let mut n = 0u32;
        while transport.accepted.len() < plan.len() {
            prop_assert!(n < 1000, "backlog failed to drain");
            pipeline.service(t0 + n * TICK, &mut transport, &mut sink);
            n += 1;
        }

        // No loss, no duplication, and FIFO order within every destination.
        prop_assert_eq!(transport.accepted.len(), plan.len());
        for dest in 0..DESTINATIONS {
            let delivered: Vec<usize> = transport
                .accepted
                .iter()
                .filter(|(d, _)| *d == ServerId(dest))
                .map(|(_, p)| p[1] as usize | (p[2] as usize) << 8)
                .collect();
            let expected: Vec<usize> = (0..seqs[dest as usize]).collect();
            prop_assert_eq!(delivered, expected);
        }
    }

    #[test]
    fn tick_bytes_never_exceed_budget_plus_one_message(
        plan in message_plan(),
        rate in 500f64..5000.0,
    ) {
        let mut pipeline = build_pipeline(rate);
        let mut transport = CountingTransport::default();
        let mut sink = NullSink;

        let max_size = plan.iter().map(|&(_, size)| size).max().unwrap_or(0);
        let mut seqs = vec![0usize; DESTINATIONS as usize];
        for &(dest, size) in &plan {
            let seq = seqs[dest as usize];
            seqs[dest as usize] += 1;
            pipeline
                .enqueue(OutboundMessage::system(
                    ServerId(dest),
                    tagged_payload(dest, seq, size),
                ))
                .unwrap();
        }

        let per_tick = rate * TICK.as_secs_f64();
        let t0 = Instant::now();
        pipeline.service(t0, &mut transport, &mut sink);

        let mut delivered = 0usize;
        for n in 1..1000u32 {
            pipeline.service(t0 + n * TICK, &mut transport, &mut sink);
            let tick_bytes: usize = transport.accepted[delivered..]
                .iter()
                .map(|(_, p)| p.len())
                .sum();
            delivered = transport.accepted.len();
            prop_assert!(
                (tick_bytes as f64) <= per_tick + max_size as f64 + 1e-6,
                "tick {} sent {} bytes against budget {}",
                n,
                tick_bytes,
                per_tick
            );
            if delivered == plan.len() {
                break;
            }
        }
        prop_assert_eq!(delivered, plan.len());
    }
}
