//! Hot-path benchmarks for the outbound scheduler.
//!
//! Measures:
//! - FairScheduler select+commit across many active flows
//! - A full pipeline service tick (drain + transmit) under backlog
//!
//! Run with: cargo bench --package meridian-outbound

use std::time::Duration;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use quanta::Instant;

use meridian_outbound::{
    FairScheduler, NullSink, ObjectId, OutboundMessage, PipelineConfig, SendOutcome, SendPipeline,
    ServerId, Transport,
};

struct SinkTransport;

impl Transport for SinkTransport {
    fn send(&mut self, _destination: ServerId, _payload: &Bytes) -> SendOutcome {
        SendOutcome::Accepted
    }
}

fn bench_select_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("fair_scheduler");
    group.throughput(Throughput::Elements(1));

    for flows in [16u32, 256, 1024] {
        group.bench_function(format!("select_commit_{flows}_flows"), |b| {
            let mut sched = FairScheduler::new();
            let payload = Bytes::from_static(&[0u8; 256]);
            // Equal weights and round-robin refill keep the whole set active,
            // so every selection scans `flows` live candidates.
            for id in 0..flows {
                sched.register(id, 1.0).unwrap();
                for _ in 0..4 {
                    sched
                        .enqueue(id, OutboundMessage::system(ServerId(0), payload.clone()))
                        .unwrap();
                }
            }
            let mut refill = 0u32;
            b.iter(|| {
                sched
                    .enqueue(refill % flows, OutboundMessage::system(ServerId(0), payload.clone()))
                    .unwrap();
                refill += 1;
                let selection = sched.select_next(f64::INFINITY).unwrap();
                black_box(sched.commit(selection.id));
            });
        });
    }
    group.finish();
}

fn bench_service_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");

    group.bench_function("service_tick_64_clients", |b| {
        let mut pipeline = SendPipeline::new(PipelineConfig {
            bytes_per_sec: 1e9,
            ..PipelineConfig::default()
        });
        let mut transport = SinkTransport;
        let mut sink = NullSink;
        let payload = Bytes::from_static(&[0u8; 256]);

        for id in 0..8u32 {
            pipeline.register_server(ServerId(id), 1.0).unwrap();
        }
        for id in 0..64u128 {
            pipeline.register_client(ObjectId(id), 1.0).unwrap();
        }

        let t0 = Instant::now();
        pipeline.service(t0, &mut transport, &mut sink);
        let mut tick = 0u32;
        b.iter(|| {
            for id in 0..64u128 {
                pipeline
                    .enqueue(OutboundMessage::from_object(
                        ServerId((id % 8) as u32),
                        ObjectId(id),
                        payload.clone(),
                    ))
                    .unwrap();
            }
            tick += 1;
            pipeline.service(
                t0 + tick * Duration::from_millis(10),
                &mut transport,
                &mut sink,
            );
            black_box(pipeline.stats().messages_sent);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_select_commit, bench_service_tick);
criterion_main!(benches);
