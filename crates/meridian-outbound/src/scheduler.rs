//! Weighted fair scheduler over a set of flows.
//!
//! Start-time fair queueing: every flow carries a virtual finish time that
//! advances by `message_size / weight` each time the flow is selected, and
//! the active flow with the smallest finish time wins. Byte-weighted (not
//! message-count-weighted) charging means a flow sending many small messages
//! gains no advantage over one sending fewer large ones.
//!
//! Selection is deterministic: equal finish times break to the lowest
//! identity, so a given enqueue history always replays the same schedule.

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;
use thiserror::Error;

use crate::flow::Flow;
use crate::types::{FlowKey, OutboundMessage};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("flow {0} is already registered")]
    DuplicateFlow(String),
    #[error("flow {0} is not registered")]
    UnknownFlow(String),
    #[error("flow {id} weight must be positive and finite, got {weight}")]
    InvalidWeight { id: String, weight: f64 },
}

/// Active-set ordering key. Finish times are finite (weights are validated
/// positive), so `total_cmp` is a plain numeric order here.
#[derive(Debug, Clone, Copy, PartialEq)]
struct FinishTime(f64);

impl Eq for FinishTime {}

impl PartialOrd for FinishTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FinishTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// A selected, not-yet-delivered head-of-flow message.
///
/// The message stays at the head of its queue until the caller commits the
/// delivery, so a transport rejection cannot lose or reorder it. The payload
/// is a refcounted view, not a copy.
#[derive(Debug, Clone)]
pub struct Selection<K> {
    pub id: K,
    pub payload: Bytes,
    pub size: usize,
}

/// What `remove` discarded along with the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Drained {
    pub messages: usize,
    pub bytes: usize,
}

/// Manages the flows for one scheduling stage.
///
/// Both pipeline stages are instances of this type: the inner stage keyed by
/// [`ObjectId`](crate::types::ObjectId), the outer by
/// [`ServerId`](crate::types::ServerId).
pub struct FairScheduler<K: FlowKey> {
    flows: HashMap<K, Flow>,
    /// Active flows ordered by (finish time, identity). A flow appears here
    /// iff its queue is non-empty.
    active: BTreeSet<(FinishTime, K)>,
    /// Flows deferred this tick, kept for cheap clearing.
    deferred: Vec<K>,
    /// Virtual clock: start tag of the most recent selection. Reactivating
    /// flows fast-forward to this value.
    clock: f64,
    total_queued_bytes: usize,
    total_queued_messages: usize,
}

impl<K: FlowKey> FairScheduler<K> {
    pub fn new() -> Self {
        FairScheduler {
            flows: HashMap::new(),
            active: BTreeSet::new(),
            deferred: Vec::new(),
            clock: 0.0,
            total_queued_bytes: 0,
            total_queued_messages: 0,
        }
    }

    fn check_weight(id: K, weight: f64) -> Result<(), SchedulerError> {
        if weight.is_finite() && weight > 0.0 {
            Ok(())
        } else {
            Err(SchedulerError::InvalidWeight {
                id: id.to_string(),
                weight,
            })
        }
    }

    /// Adds a flow. Registering an existing identity is an error; updating a
    /// weight is the separate, explicit [`set_weight`](Self::set_weight).
    pub fn register(&mut self, id: K, weight: f64) -> Result<(), SchedulerError> {
        Self::check_weight(id, weight)?;
        if self.flows.contains_key(&id) {
            return Err(SchedulerError::DuplicateFlow(id.to_string()));
        }
        self.flows.insert(id, Flow::new(weight));
        Ok(())
    }

    /// Updates a flow's weight. Takes effect from the next charge; the
    /// accumulated finish time is not rescaled.
    pub fn set_weight(&mut self, id: K, weight: f64) -> Result<(), SchedulerError> {
        Self::check_weight(id, weight)?;
        let flow = self
            .flows
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::UnknownFlow(id.to_string()))?;
        flow.set_weight(weight);
        Ok(())
    }

    /// Destroys a flow, discarding any undelivered messages it holds.
    pub fn remove(&mut self, id: K) -> Result<Drained, SchedulerError> {
        let flow = self
            .flows
            .remove(&id)
            .ok_or_else(|| SchedulerError::UnknownFlow(id.to_string()))?;
        if !flow.is_empty() {
            self.active.remove(&(FinishTime(flow.finish_time()), id));
        }
        let drained = Drained {
            messages: flow.len(),
            bytes: flow.size_bytes(),
        };
        self.total_queued_bytes -= drained.bytes;
        self.total_queued_messages -= drained.messages;
        Ok(drained)
    }

    /// Appends a message to the named flow's queue, activating the flow if it
    /// was empty. Callers must register before first use; unregistered flows
    /// would otherwise silently receive an unintended default weight.
    pub fn enqueue(&mut self, id: K, msg: OutboundMessage) -> Result<(), SchedulerError> {
        let clock = self.clock;
        let flow = self
            .flows
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::UnknownFlow(id.to_string()))?;
        let was_empty = flow.is_empty();
        if was_empty {
            flow.fast_forward(clock);
        }
        self.total_queued_bytes += msg.size_bytes();
        self.total_queued_messages += 1;
        flow.push(msg);
        if was_empty {
            self.active.insert((FinishTime(flow.finish_time()), id));
        }
        Ok(())
    }

    /// Picks the active, non-deferred flow with the smallest finish time
    /// whose head message fits `budget_bytes`, charges it `size / weight`,
    /// and returns the head *without* removing it. Removal happens in
    /// [`commit`](Self::commit), after the transport accepted the bytes.
    ///
    /// Returns `None` when no eligible flow fits; callers stop the phase
    /// rather than fragment a message.
    pub fn select_next(&mut self, budget_bytes: f64) -> Option<Selection<K>> {
        let mut winner = None;
        for &(ft, id) in &self.active {
            let Some(flow) = self.flows.get(&id) else {
                continue;
            };
            if flow.is_deferred() {
                continue;
            }
            let Some(head) = flow.peek() else {
                continue;
            };
            if head.size_bytes() as f64 <= budget_bytes {
                winner = Some((ft, id));
                break;
            }
        }
        let (ft, id) = winner?;
        self.active.remove(&(ft, id));
        let flow = self.flows.get_mut(&id)?;
        let head = flow.peek()?;
        let payload = head.payload().clone();
        let size = head.size_bytes();
        if ft.0 > self.clock {
            self.clock = ft.0;
        }
        flow.charge(size);
        self.active.insert((FinishTime(flow.finish_time()), id));
        Some(Selection { id, payload, size })
    }

    /// Completes a delivery: pops the flow's head, credits its byte counter,
    /// and deactivates the flow if the queue drained.
    pub fn commit(&mut self, id: K) -> Option<OutboundMessage> {
        let flow = self.flows.get_mut(&id)?;
        let finish_time = flow.finish_time();
        let msg = flow.pop()?;
        let size = msg.size_bytes();
        flow.note_sent(size);
        self.total_queued_bytes -= size;
        self.total_queued_messages -= 1;
        if flow.is_empty() {
            self.active.remove(&(FinishTime(finish_time), id));
        }
        Some(msg)
    }

    /// Excludes a flow from selection for the rest of the tick. Used after a
    /// transport rejection so a known-blocked destination is not retried in a
    /// busy loop while other flows still have budget.
    pub fn defer(&mut self, id: K) {
        if let Some(flow) = self.flows.get_mut(&id) {
            if !flow.is_deferred() {
                flow.set_deferred(true);
                self.deferred.push(id);
            }
        }
    }

    /// Makes all deferred flows eligible again. Called at tick start.
    pub fn clear_deferrals(&mut self) {
        for id in self.deferred.drain(..) {
            if let Some(flow) = self.flows.get_mut(&id) {
                flow.set_deferred(false);
            }
        }
    }

    pub fn contains(&self, id: K) -> bool {
        self.flows.contains_key(&id)
    }

    pub fn weight_of(&self, id: K) -> Option<f64> {
        self.flows.get(&id).map(Flow::weight)
    }

    pub fn queued_bytes(&self, id: K) -> Option<usize> {
        self.flows.get(&id).map(Flow::size_bytes)
    }

    pub fn queued_len(&self, id: K) -> Option<usize> {
        self.flows.get(&id).map(Flow::len)
    }

    pub fn bytes_sent(&self, id: K) -> Option<u64> {
        self.flows.get(&id).map(Flow::bytes_sent)
    }

    /// Number of registered flows, active or not.
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Number of flows with queued messages.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn total_queued_bytes(&self) -> usize {
        self.total_queued_bytes
    }

    pub fn total_queued_messages(&self) -> usize {
        self.total_queued_messages
    }
}

impl<K: FlowKey> Default for FairScheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServerId;
    use bytes::Bytes;

    fn msg(len: usize) -> OutboundMessage {
        OutboundMessage::system(ServerId(0), Bytes::from(vec![0u8; len]))
    }

    fn drain_one(sched: &mut FairScheduler<u32>, budget: f64) -> Option<u32> {
        let sel = sched.select_next(budget)?;
        sched.commit(sel.id);
        Some(sel.id)
    }

    #[test]
    fn register_rejects_duplicates_and_bad_weights() {
        let mut sched = FairScheduler::new();
        sched.register(1u32, 1.0).unwrap();
        assert!(matches!(
            sched.register(1, 2.0),
            Err(SchedulerError::DuplicateFlow(_))
        ));
        assert!(matches!(
            sched.register(2, 0.0),
            Err(SchedulerError::InvalidWeight { .. })
        ));
        assert!(matches!(
            sched.register(2, f64::NAN),
            Err(SchedulerError::InvalidWeight { .. })
        ));
        assert_eq!(sched.flow_count(), 1);
    }

    #[test]
    fn enqueue_requires_registration() {
        let mut sched = FairScheduler::new();
        assert!(matches!(
            sched.enqueue(9u32, msg(10)),
            Err(SchedulerError::UnknownFlow(_))
        ));
        assert_eq!(sched.total_queued_bytes(), 0);
    }

    #[test]
    fn selection_shares_bytes_by_weight() {
        let mut sched = FairScheduler::new();
        sched.register(1u32, 1.0).unwrap();
        sched.register(2u32, 3.0).unwrap();
        for _ in 0..40 {
            sched.enqueue(1, msg(100)).unwrap();
            sched.enqueue(2, msg(100)).unwrap();
        }

        let mut wins = [0u32; 2];
        for _ in 0..40 {
            match drain_one(&mut sched, f64::INFINITY) {
                Some(1) => wins[0] += 1,
                Some(2) => wins[1] += 1,
                other => panic!("unexpected winner {other:?}"),
            }
        }
        // 1:3 split, within one message of slack.
        assert!((9..=11).contains(&wins[0]), "flow 1 won {} times", wins[0]);
        assert!((29..=31).contains(&wins[1]), "flow 2 won {} times", wins[1]);
    }

    #[test]
    fn equal_finish_times_break_to_lowest_identity() {
        let mut sched = FairScheduler::new();
        sched.register(5u32, 1.0).unwrap();
        sched.register(3u32, 1.0).unwrap();
        sched.enqueue(5, msg(100)).unwrap();
        sched.enqueue(3, msg(100)).unwrap();
        assert_eq!(drain_one(&mut sched, f64::INFINITY), Some(3));
        assert_eq!(drain_one(&mut sched, f64::INFINITY), Some(5));
    }

    #[test]
    fn budget_skips_flows_whose_head_does_not_fit() {
        let mut sched = FairScheduler::new();
        sched.register(1u32, 1.0).unwrap();
        sched.register(2u32, 1.0).unwrap();
        sched.enqueue(1, msg(500)).unwrap();
        sched.enqueue(2, msg(100)).unwrap();

        // Flow 1 would win on finish time (tie, lower id), but its head does
        // not fit. No fragmentation: flow 2 is served instead.
        let sel = sched.select_next(200.0).unwrap();
        assert_eq!(sel.id, 2);
        assert_eq!(sel.size, 100);
        sched.commit(2);

        assert!(sched.select_next(200.0).is_none());
        let sel = sched.select_next(500.0).unwrap();
        assert_eq!(sel.id, 1);
    }

    #[test]
    fn selection_leaves_head_in_place_until_commit() {
        let mut sched = FairScheduler::new();
        sched.register(1u32, 1.0).unwrap();
        sched.enqueue(1, msg(10)).unwrap();

        let sel = sched.select_next(f64::INFINITY).unwrap();
        assert_eq!(sel.id, 1);
        assert_eq!(sched.queued_len(1), Some(1));

        let msg = sched.commit(1).unwrap();
        assert_eq!(msg.size_bytes(), 10);
        assert_eq!(sched.queued_len(1), Some(0));
        assert_eq!(sched.bytes_sent(1), Some(10));
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn deferred_flows_are_skipped_until_cleared() {
        let mut sched = FairScheduler::new();
        sched.register(1u32, 1.0).unwrap();
        sched.register(2u32, 1.0).unwrap();
        sched.enqueue(1, msg(100)).unwrap();
        sched.enqueue(2, msg(100)).unwrap();

        sched.defer(1);
        assert_eq!(drain_one(&mut sched, f64::INFINITY), Some(2));
        assert!(sched.select_next(f64::INFINITY).is_none());

        sched.clear_deferrals();
        assert_eq!(drain_one(&mut sched, f64::INFINITY), Some(1));
    }

    #[test]
    fn remove_reports_discarded_backlog() {
        let mut sched = FairScheduler::new();
        sched.register(1u32, 1.0).unwrap();
        sched.enqueue(1, msg(100)).unwrap();
        sched.enqueue(1, msg(50)).unwrap();

        let drained = sched.remove(1).unwrap();
        assert_eq!(
            drained,
            Drained {
                messages: 2,
                bytes: 150
            }
        );
        assert_eq!(sched.total_queued_bytes(), 0);
        assert!(matches!(sched.remove(1), Err(SchedulerError::UnknownFlow(_))));
        assert!(sched.select_next(f64::INFINITY).is_none());
    }

    #[test]
    fn reactivated_flow_cannot_replay_idle_time() {
        let mut sched = FairScheduler::new();
        sched.register(1u32, 1.0).unwrap();
        sched.register(2u32, 1.0).unwrap();

        // Flow 1 works alone for a while; flow 2 sits registered but idle.
        for _ in 0..10 {
            sched.enqueue(1, msg(100)).unwrap();
        }
        for _ in 0..5 {
            assert_eq!(drain_one(&mut sched, f64::INFINITY), Some(1));
        }

        // Flow 2 wakes up. It gets the next slot, then service alternates;
        // it does not burn through its banked idle time in a burst.
        for _ in 0..10 {
            sched.enqueue(2, msg(100)).unwrap();
        }
        let winners: Vec<_> = (0..6)
            .map(|_| drain_one(&mut sched, f64::INFINITY).unwrap())
            .collect();
        assert_eq!(winners, vec![2, 1, 2, 1, 2, 1]);
    }

    #[test]
    fn set_weight_applies_to_future_charges() {
        let mut sched = FairScheduler::new();
        sched.register(1u32, 1.0).unwrap();
        sched.register(2u32, 1.0).unwrap();
        for _ in 0..12 {
            sched.enqueue(1, msg(100)).unwrap();
            sched.enqueue(2, msg(100)).unwrap();
        }

        sched.set_weight(2, 3.0).unwrap();
        let mut wins = [0u32; 2];
        for _ in 0..16 {
            match drain_one(&mut sched, f64::INFINITY) {
                Some(1) => wins[0] += 1,
                Some(2) => wins[1] += 1,
                other => panic!("unexpected winner {other:?}"),
            }
        }
        assert!(wins[1] > 2 * wins[0], "weights not respected: {wins:?}");

        assert!(matches!(
            sched.set_weight(9, 1.0),
            Err(SchedulerError::UnknownFlow(_))
        ));
    }
}
