//! Two-stage send pipeline: client fairness feeding server fairness under a
//! global byte-rate budget.
//!
//! Both stages are instances of [`FairScheduler`]. The inner stage is keyed
//! by source object and arbitrates between producers; the outer stage is
//! keyed by destination server and enforces the rate cap. Each service tick:
//!
//! ```text
//! 1. Budget accrual   — bytes_per_sec × elapsed, fractional carry kept,
//!                       banked carry capped at the burst window
//! 2. Drain phase      — inner winners promoted into their destination's
//!                       outer flow (bounded per tick, never rate-limited)
//! 3. Transmit phase   — outer winners handed to the transport while budget
//!                       remains; rejection defers the flow, fatal removes it
//! ```
//!
//! Messages move: a promotion transfers ownership from the client flow to
//! the server flow, and a committed delivery transfers it to the transport.

use std::collections::HashSet;
use std::mem;

use quanta::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use crate::backpressure::{attempt_send, Delivery, DepthReport};
use crate::config::{ConfigError, PipelineConfig, SystemTrafficPolicy};
use crate::scheduler::{Drained, FairScheduler, SchedulerError};
use crate::stats::PipelineStats;
use crate::transport::{StatsSink, Transport};
use crate::types::{ObjectId, OutboundMessage, ServerId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    /// The message names a source object that was never registered.
    #[error("client flow {0} is not registered")]
    UnknownClientFlow(ObjectId),
    /// Sourceless traffic names a destination that was never registered.
    #[error("server flow {0} is not registered")]
    UnknownFlow(ServerId),
}

/// Out-of-band notifications for the registering context, drained via
/// [`SendPipeline::take_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// The transport declared `server` permanently unreachable. Its flow and
    /// queued messages were discarded. Emitted once per occurrence, not once
    /// per dropped message.
    DestinationUnreachable {
        server: ServerId,
        dropped_messages: usize,
        dropped_bytes: usize,
    },
}

/// The outbound traffic scheduler for one server process.
///
/// Single-writer: all mutation (`register_*`, `remove_*`, `enqueue`,
/// `service`) must be serialized onto one execution context, either a mutex
/// or a dedicated worker thread
/// ([`OutboundRuntime`](crate::runtime::OutboundRuntime)).
/// No operation here blocks; the transport's `send` is poll-and-reject.
pub struct SendPipeline {
    clients: FairScheduler<ObjectId>,
    servers: FairScheduler<ServerId>,
    /// Dedicated outer stage for system traffic under
    /// [`SystemTrafficPolicy::Reserved`].
    system: Option<FairScheduler<ServerId>>,
    config: PipelineConfig,
    /// Unspent byte budget carried between ticks, fractional part included.
    carry: f64,
    last_service: Option<Instant>,
    /// Destinations whose flows exist only through drain-phase lazy
    /// registration; an explicit `register_server` upgrades these in place.
    lazy_servers: HashSet<ServerId>,
    /// Destinations the transport declared dead; cleared by re-registration.
    unreachable: HashSet<ServerId>,
    events: Vec<PipelineEvent>,
    stats: PipelineStats,
}

impl SendPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let system = match config.system_traffic {
            SystemTrafficPolicy::Shared => None,
            SystemTrafficPolicy::Reserved { .. } => Some(FairScheduler::new()),
        };
        SendPipeline {
            clients: FairScheduler::new(),
            servers: FairScheduler::new(),
            system,
            config,
            carry: 0.0,
            last_service: None,
            lazy_servers: HashSet::new(),
            unreachable: HashSet::new(),
            events: Vec::new(),
            stats: PipelineStats::new(),
        }
    }

    // ─── Registration ───────────────────────────────────────────────────

    /// Registers a destination server flow. If the drain phase already
    /// created the flow lazily, the caller's weight replaces the default;
    /// *DuplicateFlow* is reserved for a second explicit registration.
    pub fn register_server(&mut self, id: ServerId, weight: f64) -> Result<(), SchedulerError> {
        if self.lazy_servers.contains(&id) {
            self.servers.set_weight(id, weight)?;
            self.lazy_servers.remove(&id);
        } else {
            self.servers.register(id, weight)?;
        }
        self.unreachable.remove(&id);
        if let Some(system) = self.system.as_mut() {
            if system.contains(id) {
                system.set_weight(id, weight)?;
            }
        }
        Ok(())
    }

    /// Removes a destination flow, discarding its undelivered messages.
    pub fn remove_server(&mut self, id: ServerId) -> Result<Drained, SchedulerError> {
        let mut drained = self.servers.remove(id)?;
        if let Some(system) = self.system.as_mut() {
            if let Ok(extra) = system.remove(id) {
                drained.messages += extra.messages;
                drained.bytes += extra.bytes;
            }
        }
        self.lazy_servers.remove(&id);
        self.unreachable.remove(&id);
        Ok(drained)
    }

    pub fn register_client(&mut self, id: ObjectId, weight: f64) -> Result<(), SchedulerError> {
        self.clients.register(id, weight)
    }

    /// Removes a client flow, discarding messages not yet promoted. Messages
    /// already promoted belong to their destination's flow and still go out.
    pub fn remove_client(&mut self, id: ObjectId) -> Result<Drained, SchedulerError> {
        self.clients.remove(id)
    }

    pub fn set_server_weight(&mut self, id: ServerId, weight: f64) -> Result<(), SchedulerError> {
        self.servers.set_weight(id, weight)?;
        if let Some(system) = self.system.as_mut() {
            if system.contains(id) {
                system.set_weight(id, weight)?;
            }
        }
        Ok(())
    }

    pub fn set_client_weight(&mut self, id: ObjectId, weight: f64) -> Result<(), SchedulerError> {
        self.clients.set_weight(id, weight)
    }

    /// Updates the global rate limit. Takes effect on the next service tick,
    /// never mid-tick.
    pub fn set_rate(&mut self, bytes_per_sec: f64) -> Result<(), ConfigError> {
        if !bytes_per_sec.is_finite() || bytes_per_sec <= 0.0 {
            return Err(ConfigError::InvalidRate(bytes_per_sec));
        }
        self.config.bytes_per_sec = bytes_per_sec;
        Ok(())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ─── Enqueue ────────────────────────────────────────────────────────

    /// Buffers a message for transmission.
    ///
    /// Client-attributed messages land in their source's client flow and
    /// reach the destination only by winning inner-stage arbitration.
    /// Sourceless system traffic is not attributable to a throttleable
    /// producer, so it bypasses client fairness and competes only at server
    /// granularity. Its destination must already be registered.
    pub fn enqueue(&mut self, msg: OutboundMessage) -> Result<(), EnqueueError> {
        match msg.source() {
            Some(source) => self
                .clients
                .enqueue(source, msg)
                .map_err(|_| EnqueueError::UnknownClientFlow(source))?,
            None => {
                let dest = msg.destination();
                if !self.servers.contains(dest) {
                    return Err(EnqueueError::UnknownFlow(dest));
                }
                match self.system.as_mut() {
                    Some(system) => {
                        if !system.contains(dest) {
                            let weight = self
                                .servers
                                .weight_of(dest)
                                .unwrap_or(self.config.default_server_weight);
                            system.register(dest, weight).ok();
                        }
                        system.enqueue(dest, msg).ok();
                    }
                    None => {
                        self.servers.enqueue(dest, msg).ok();
                    }
                }
            }
        }
        self.stats.messages_enqueued += 1;
        Ok(())
    }

    // ─── Service tick ───────────────────────────────────────────────────

    /// Runs one scheduling tick: accrue budget, promote inner winners,
    /// transmit outer winners. Mutations queued by callers between ticks are
    /// already applied by the time this runs (single-writer model).
    pub fn service<T: Transport, S: StatsSink>(
        &mut self,
        now: Instant,
        transport: &mut T,
        sink: &mut S,
    ) {
        if let Some(last) = self.last_service {
            let elapsed = now.duration_since(last).as_secs_f64();
            let max_carry = self.config.bytes_per_sec * self.config.burst_window.as_secs_f64();
            self.carry = (self.carry + self.config.bytes_per_sec * elapsed).min(max_carry);
        }
        self.last_service = Some(now);

        self.servers.clear_deferrals();
        if let Some(system) = self.system.as_mut() {
            system.clear_deferrals();
        }

        self.drain_clients();

        let mut budget = self.carry;
        if let SystemTrafficPolicy::Reserved { fraction } = self.config.system_traffic {
            if let Some(system) = self.system.as_mut() {
                let reserve = budget * fraction;
                let mut system_budget = reserve;
                let fatals = Self::run_transmit(
                    system,
                    &mut system_budget,
                    now,
                    transport,
                    sink,
                    &mut self.stats,
                );
                budget = budget - reserve + system_budget;
                self.handle_fatals(fatals);
            }
        }
        let fatals = Self::run_transmit(
            &mut self.servers,
            &mut budget,
            now,
            transport,
            sink,
            &mut self.stats,
        );
        self.carry = budget.max(0.0);
        self.handle_fatals(fatals);

        self.stats.ticks += 1;
    }

    /// Promotes inner-stage winners into their destination's outer flow.
    /// Client fairness is not rate-limited; only the promotion count bounds
    /// the work done here per tick.
    fn drain_clients(&mut self) {
        for _ in 0..self.config.max_promotions_per_tick {
            let Some(selection) = self.clients.select_next(f64::INFINITY) else {
                break;
            };
            let Some(msg) = self.clients.commit(selection.id) else {
                break;
            };
            let dest = msg.destination();
            if self.unreachable.contains(&dest) {
                self.stats.dropped_unreachable += 1;
                debug!(server = %dest, source = %selection.id, "dropping promotion to unreachable destination");
                continue;
            }
            if !self.servers.contains(dest)
                && self
                    .servers
                    .register(dest, self.config.default_server_weight)
                    .is_ok()
            {
                self.lazy_servers.insert(dest);
                debug!(server = %dest, "lazily registered server flow at default weight");
            }
            self.servers.enqueue(dest, msg).ok();
            self.stats.promotions += 1;
        }
    }

    /// Transmit loop for one outer stage. Every iteration makes progress:
    /// a delivery shrinks a queue, a rejection defers a flow, a fatal
    /// removes one. Returns destinations the transport declared dead
    /// (already removed from `sched`).
    fn run_transmit<T: Transport, S: StatsSink>(
        sched: &mut FairScheduler<ServerId>,
        budget: &mut f64,
        now: Instant,
        transport: &mut T,
        sink: &mut S,
        stats: &mut PipelineStats,
    ) -> Vec<(ServerId, Drained)> {
        let mut fatals = Vec::new();
        loop {
            let Some(selection) = sched.select_next(*budget) else {
                break;
            };
            match attempt_send(transport, selection.id, &selection.payload) {
                Delivery::Delivered => {
                    if sched.commit(selection.id).is_some() {
                        *budget -= selection.size as f64;
                        stats.messages_sent += 1;
                        stats.bytes_sent += selection.size as u64;
                        sink.record(selection.id, selection.size, now);
                    }
                }
                Delivery::Blocked => {
                    sched.defer(selection.id);
                    stats.rejected_sends += 1;
                }
                Delivery::Failed => {
                    stats.fatal_errors += 1;
                    if let Ok(drained) = sched.remove(selection.id) {
                        fatals.push((selection.id, drained));
                    }
                }
            }
        }
        fatals
    }

    /// A fatal in either outer stage kills the destination in both and
    /// surfaces a single notification.
    fn handle_fatals(&mut self, fatals: Vec<(ServerId, Drained)>) {
        for (id, mut drained) in fatals {
            if let Ok(extra) = self.servers.remove(id) {
                drained.messages += extra.messages;
                drained.bytes += extra.bytes;
            }
            if let Some(system) = self.system.as_mut() {
                if let Ok(extra) = system.remove(id) {
                    drained.messages += extra.messages;
                    drained.bytes += extra.bytes;
                }
            }
            self.lazy_servers.remove(&id);
            self.unreachable.insert(id);
            warn!(
                server = %id,
                dropped_messages = drained.messages,
                dropped_bytes = drained.bytes,
                "destination unreachable, flow discarded"
            );
            self.events.push(PipelineEvent::DestinationUnreachable {
                server: id,
                dropped_messages: drained.messages,
                dropped_bytes: drained.bytes,
            });
        }
    }

    // ─── Introspection ──────────────────────────────────────────────────

    /// Drains pending out-of-band notifications.
    pub fn take_events(&mut self) -> Vec<PipelineEvent> {
        mem::take(&mut self.events)
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Queue depths for admission control by the enclosing layer.
    pub fn depth_report(&self) -> DepthReport {
        let mut server_messages = self.servers.total_queued_messages();
        let mut server_bytes = self.servers.total_queued_bytes();
        if let Some(system) = &self.system {
            server_messages += system.total_queued_messages();
            server_bytes += system.total_queued_bytes();
        }
        DepthReport {
            client_messages: self.clients.total_queued_messages(),
            client_bytes: self.clients.total_queued_bytes(),
            server_messages,
            server_bytes,
        }
    }

    pub fn client_queued_bytes(&self, id: ObjectId) -> Option<usize> {
        self.clients.queued_bytes(id)
    }

    /// Bytes queued for a destination across both outer stages.
    pub fn server_queued_bytes(&self, id: ServerId) -> Option<usize> {
        let main = self.servers.queued_bytes(id);
        let system = self.system.as_ref().and_then(|s| s.queued_bytes(id));
        match (main, system) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        }
    }

    /// Bytes delivered to a destination across both outer stages.
    pub fn server_bytes_sent(&self, id: ServerId) -> Option<u64> {
        let main = self.servers.bytes_sent(id);
        let system = self.system.as_ref().and_then(|s| s.bytes_sent(id));
        match (main, system) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        }
    }

    pub fn server_weight(&self, id: ServerId) -> Option<f64> {
        self.servers.weight_of(id)
    }

    pub fn client_weight(&self, id: ObjectId) -> Option<f64> {
        self.clients.weight_of(id)
    }

    pub fn is_unreachable(&self, id: ServerId) -> bool {
        self.unreachable.contains(&id)
    }
}
