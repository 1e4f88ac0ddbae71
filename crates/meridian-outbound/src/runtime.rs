//! Worker-thread runtime for the send pipeline.
//!
//! The pipeline is single-writer; this runtime is the dedicated writer. A
//! background thread owns the [`SendPipeline`] and the transport, ticking at
//! a fixed period. **Hot path** (message submission) uses a lock-free SPSC
//! ring buffer (`rtrb`). **Control path** (registration, weights, rate,
//! shutdown) uses a bounded crossbeam channel. Pipeline events are forwarded
//! on a bounded channel and never block the worker.
//!
//! Dropping the runtime triggers a graceful shutdown: shutdown flag, control
//! message, thread join. No busy-waiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use quanta::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::pipeline::{PipelineEvent, SendPipeline};
use crate::stats::PipelineStats;
use crate::transport::{NullSink, StatsSink, Transport};
use crate::types::{ObjectId, OutboundMessage, ServerId};

/// Error returned when a message or control request cannot reach the worker.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("outbound message ring is full")]
    Full,
    #[error("outbound runtime has shut down")]
    Disconnected,
}

enum ControlMessage {
    RegisterServer(ServerId, f64),
    RemoveServer(ServerId),
    RegisterClient(ObjectId, f64),
    RemoveClient(ObjectId),
    SetServerWeight(ServerId, f64),
    SetClientWeight(ObjectId, f64),
    SetRate(f64),
    Shutdown,
}

/// Thread-safe handle to the outbound scheduler worker.
///
/// Control requests are applied by the worker between ticks; a request that
/// fails there (duplicate registration, unknown flow) is logged at `warn`.
/// Callers that need synchronous errors drive a [`SendPipeline`] directly.
pub struct OutboundRuntime {
    message_tx: rtrb::Producer<OutboundMessage>,
    control_tx: Sender<ControlMessage>,
    events_rx: Receiver<PipelineEvent>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Mutex<PipelineStats>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl OutboundRuntime {
    /// Spawns the worker with a discarding stats sink.
    pub fn spawn<T>(transport: T, config: RuntimeConfig) -> Self
    where
        T: Transport + Send + 'static,
    {
        Self::spawn_with_sink(transport, NullSink, config)
    }

    pub fn spawn_with_sink<T, S>(transport: T, sink: S, config: RuntimeConfig) -> Self
    where
        T: Transport + Send + 'static,
        S: StatsSink + Send + 'static,
    {
        let (message_tx, message_rx) = rtrb::RingBuffer::new(config.message_ring_capacity);
        let (control_tx, control_rx) = bounded(64);
        let (events_tx, events_rx) = bounded(config.event_capacity);
        let stats = Arc::new(Mutex::new(PipelineStats::new()));
        let stats_clone = stats.clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::Builder::new()
            .name("meridian-outbound".into())
            .spawn(move || {
                runtime_worker(
                    message_rx,
                    control_rx,
                    events_tx,
                    stats_clone,
                    transport,
                    sink,
                    config,
                    shutdown_clone,
                )
            })
            .expect("failed to spawn outbound runtime worker");

        OutboundRuntime {
            message_tx,
            control_tx,
            events_rx,
            shutdown,
            stats,
            handle: Some(handle),
        }
    }

    /// Enqueues a message for transmission. Returns immediately.
    ///
    /// `Full` is the admission-control signal: the caller should back off
    /// and retry rather than grow an unbounded queue of its own.
    pub fn try_enqueue(&mut self, msg: OutboundMessage) -> Result<(), SubmitError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SubmitError::Disconnected);
        }
        self.message_tx
            .push(msg)
            .map_err(|_| SubmitError::Full)
    }

    pub fn register_server(&self, id: ServerId, weight: f64) -> Result<(), SubmitError> {
        self.control(ControlMessage::RegisterServer(id, weight))
    }

    pub fn remove_server(&self, id: ServerId) -> Result<(), SubmitError> {
        self.control(ControlMessage::RemoveServer(id))
    }

    pub fn register_client(&self, id: ObjectId, weight: f64) -> Result<(), SubmitError> {
        self.control(ControlMessage::RegisterClient(id, weight))
    }

    pub fn remove_client(&self, id: ObjectId) -> Result<(), SubmitError> {
        self.control(ControlMessage::RemoveClient(id))
    }

    pub fn set_server_weight(&self, id: ServerId, weight: f64) -> Result<(), SubmitError> {
        self.control(ControlMessage::SetServerWeight(id, weight))
    }

    pub fn set_client_weight(&self, id: ObjectId, weight: f64) -> Result<(), SubmitError> {
        self.control(ControlMessage::SetClientWeight(id, weight))
    }

    /// Updates the global rate limit; applied on the worker's next tick.
    pub fn set_rate(&self, bytes_per_sec: f64) -> Result<(), SubmitError> {
        self.control(ControlMessage::SetRate(bytes_per_sec))
    }

    /// Receiver for out-of-band pipeline notifications.
    pub fn events(&self) -> &Receiver<PipelineEvent> {
        &self.events_rx
    }

    /// Snapshot of the pipeline counters as of the last completed tick.
    pub fn stats_snapshot(&self) -> PipelineStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn control(&self, msg: ControlMessage) -> Result<(), SubmitError> {
        self.control_tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => SubmitError::Full,
            TrySendError::Disconnected(_) => SubmitError::Disconnected,
        })
    }
}

impl Drop for OutboundRuntime {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.control_tx.try_send(ControlMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn runtime_worker<T, S>(
    mut message_rx: rtrb::Consumer<OutboundMessage>,
    control_rx: Receiver<ControlMessage>,
    events_tx: Sender<PipelineEvent>,
    stats: Arc<Mutex<PipelineStats>>,
    mut transport: T,
    mut sink: S,
    config: RuntimeConfig,
    shutdown: Arc<AtomicBool>,
) where
    T: Transport + Send + 'static,
    S: StatsSink + Send + 'static,
{
    let mut pipeline = SendPipeline::new(config.pipeline.clone());
    let mut next_tick = Instant::now() + config.tick;

    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let wait = next_tick.duration_since(Instant::now());
        match control_rx.recv_timeout(wait) {
            Ok(ControlMessage::Shutdown) => break,
            Ok(msg) => apply_control(&mut pipeline, msg),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        if now >= next_tick {
            // Pull submissions in right before servicing so they are not
            // delayed a full period.
            while let Ok(msg) = message_rx.pop() {
                if let Err(e) = pipeline.enqueue(msg) {
                    warn!(error = %e, "dropping message for unregistered flow");
                }
            }

            pipeline.service(now, &mut transport, &mut sink);

            for event in pipeline.take_events() {
                if events_tx.try_send(event).is_err() {
                    debug!("event channel full, dropping notification");
                }
            }
            if let Ok(mut shared) = stats.lock() {
                *shared = pipeline.stats().clone();
            }
            next_tick = now + config.tick;
        }
    }
    debug!("outbound runtime worker exited");
}

fn apply_control(pipeline: &mut SendPipeline, msg: ControlMessage) {
    match msg {
        ControlMessage::RegisterServer(id, weight) => {
            if let Err(e) = pipeline.register_server(id, weight) {
                warn!(error = %e, "register_server failed");
            }
        }
        ControlMessage::RemoveServer(id) => {
            if let Err(e) = pipeline.remove_server(id) {
                warn!(error = %e, "remove_server failed");
            }
        }
        ControlMessage::RegisterClient(id, weight) => {
            if let Err(e) = pipeline.register_client(id, weight) {
                warn!(error = %e, "register_client failed");
            }
        }
        ControlMessage::RemoveClient(id) => {
            if let Err(e) = pipeline.remove_client(id) {
                warn!(error = %e, "remove_client failed");
            }
        }
        ControlMessage::SetServerWeight(id, weight) => {
            if let Err(e) = pipeline.set_server_weight(id, weight) {
                warn!(error = %e, "set_server_weight failed");
            }
        }
        ControlMessage::SetClientWeight(id, weight) => {
            if let Err(e) = pipeline.set_client_weight(id, weight) {
                warn!(error = %e, "set_client_weight failed");
            }
        }
        ControlMessage::SetRate(bytes_per_sec) => {
            if let Err(e) = pipeline.set_rate(bytes_per_sec) {
                warn!(error = %e, "set_rate failed");
            }
        }
        ControlMessage::Shutdown => {}
    }
}
