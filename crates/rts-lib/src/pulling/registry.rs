//! Registry of container pulling groups
//!
//! One mutex guards both the group map and the metric to group reverse
//! index. It is only held for structural changes, never across a publish.
//! Each group's ticker runs in its own task and asks the registry to run
//! the tick; when the group has nothing left the registry removes it in the
//! same critical section, so an `add_metric` can never land in a group that
//! is about to disappear.

use super::entry::MetricPullingEntry;
use super::group::{
    AddOutcome, ContainerPullingGroup, GroupKey, GroupState, PullingTarget, TickOutcome,
};
use crate::broker::{Publishing, Topology};
use crate::channel::PublishSink;
use crate::envelope::{Envelope, StatusCode};
use crate::error::{RtsError, RtsResult};
use crate::models::MetricType;
use crate::observability::{RtsMetrics, StructuredLogger};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Read-only view of a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot {
    pub key: GroupKey,
    pub state: GroupState,
    pub interval: Duration,
    pub entries: Vec<MetricPullingEntry>,
}

/// What a ticker does after a tick
enum TickAction {
    Publish(Publishing),
    Skip,
    Exit,
}

struct GroupSlot {
    group: ContainerPullingGroup,
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    groups: HashMap<GroupKey, GroupSlot>,
    metric_index: HashMap<i32, GroupKey>,
    next_generation: u64,
}

impl RegistryState {
    /// Drop a group and every index entry pointing at it
    fn remove_group(&mut self, key: &GroupKey) -> Option<GroupSlot> {
        let mut slot = self.groups.remove(key)?;
        for id in slot.group.stop() {
            if self.metric_index.get(&id) == Some(key) {
                self.metric_index.remove(&id);
            }
        }
        slot.cancel.cancel();
        Some(slot)
    }
}

struct Shared {
    state: Mutex<RegistryState>,
    publisher: PublishSink,
    fetch_exchange: String,
    poll_reply_key: String,
    message_ttl: Duration,
    root: CancellationToken,
    metrics: RtsMetrics,
    logger: StructuredLogger,
}

/// Owner of every container pulling group of the service
#[derive(Clone)]
pub struct PullingRegistry {
    shared: Arc<Shared>,
}

impl PullingRegistry {
    pub fn new(
        publisher: PublishSink,
        topology: &Topology,
        message_ttl: Duration,
        metrics: RtsMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RegistryState::default()),
                publisher,
                fetch_exchange: topology.fetch_exchange.clone(),
                poll_reply_key: topology.poll_reply_key.clone(),
                message_ttl,
                root: CancellationToken::new(),
                metrics,
                logger,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn update_gauges(&self, state: &RegistryState) {
        self.shared
            .metrics
            .set_pulling(state.groups.len(), state.metric_index.len());
    }

    /// Start polling a metric, creating the group for its target if needed
    ///
    /// A metric already polled by a different group (the container interval
    /// changed) is moved out of that group first. Targets polled more often
    /// than once per millisecond are refused.
    pub fn add_metric(
        &self,
        target: PullingTarget,
        metric_id: i32,
        metric_type: MetricType,
        pulling_times: u16,
    ) -> RtsResult<AddOutcome> {
        if target.interval.as_millis() == 0 {
            warn!(
                container_id = target.container_id,
                metric_id = metric_id,
                interval = ?target.interval,
                "Refusing pulling target without a usable interval"
            );
            return Err(RtsError::NotConfigured {
                what: "container",
                id: target.container_id,
            });
        }
        let key = target.key();
        let mut stopped = None;
        let mut spawn = None;

        let outcome = {
            let mut state = self.state();

            if let Some(previous) = state.metric_index.get(&metric_id).copied() {
                if previous != key {
                    let now_empty = state
                        .groups
                        .get_mut(&previous)
                        .map(|slot| {
                            slot.group.remove_metric(metric_id);
                            slot.group.is_empty()
                        })
                        .unwrap_or(false);
                    state.metric_index.remove(&metric_id);
                    if now_empty {
                        state.remove_group(&previous);
                        stopped = Some(previous);
                    }
                }
            }

            if !state.groups.contains_key(&key) {
                state.next_generation += 1;
                let generation = state.next_generation;
                let cancel = self.shared.root.child_token();
                state.groups.insert(
                    key,
                    GroupSlot {
                        group: ContainerPullingGroup::new(target.clone()),
                        generation,
                        cancel: cancel.clone(),
                    },
                );
                spawn = Some((generation, cancel));
            }

            let outcome = match state.groups.get_mut(&key) {
                Some(slot) => slot.group.add_metric(metric_id, metric_type, pulling_times),
                None => AddOutcome::Inserted,
            };
            state.metric_index.insert(metric_id, key);
            self.update_gauges(&state);
            outcome
        };

        if let Some(previous) = stopped {
            self.shared
                .logger
                .log_group_stopped(&previous.to_string(), "metric moved to another interval");
        }

        if let Some((generation, cancel)) = spawn {
            self.shared
                .logger
                .log_group_started(&key.to_string(), target.interval);
            tokio::spawn(run_group(
                self.clone(),
                key,
                generation,
                target.interval,
                cancel,
            ));
        }

        debug!(group = %key, metric_id = metric_id, outcome = ?outcome, "Metric added to pulling group");
        Ok(outcome)
    }

    /// Reset a metric's pulling budget; false when it is not being polled
    pub fn refresh_metric(&self, metric_id: i32) -> bool {
        let mut state = self.state();
        let Some(key) = state.metric_index.get(&metric_id).copied() else {
            return false;
        };
        state
            .groups
            .get_mut(&key)
            .map(|slot| slot.group.refresh(metric_id))
            .unwrap_or(false)
    }

    /// Stop polling one metric; a group left without metrics stops at once
    pub fn remove_metric(&self, metric_id: i32) -> bool {
        let stopped = {
            let mut state = self.state();
            let Some(key) = state.metric_index.remove(&metric_id) else {
                return false;
            };
            let now_empty = state
                .groups
                .get_mut(&key)
                .map(|slot| {
                    slot.group.remove_metric(metric_id);
                    slot.group.is_empty()
                })
                .unwrap_or(false);
            let stopped = if now_empty {
                state.remove_group(&key).map(|_| key)
            } else {
                None
            };
            self.update_gauges(&state);
            stopped
        };

        if let Some(key) = stopped {
            self.shared
                .logger
                .log_group_stopped(&key.to_string(), "last metric removed");
        }
        true
    }

    /// Stop every group polling `container_id`; returns how many stopped
    pub fn stop_container(&self, container_id: i32) -> usize {
        let stopped: Vec<GroupKey> = {
            let mut state = self.state();
            let keys: Vec<GroupKey> = state
                .groups
                .keys()
                .filter(|k| k.container_id == container_id)
                .copied()
                .collect();
            for key in &keys {
                state.remove_group(key);
            }
            self.update_gauges(&state);
            keys
        };

        for key in &stopped {
            self.shared
                .logger
                .log_group_stopped(&key.to_string(), "container changed");
        }
        stopped.len()
    }

    /// Stop every group; returns how many stopped
    pub fn stop_all(&self) -> usize {
        let stopped = {
            let mut state = self.state();
            let keys: Vec<GroupKey> = state.groups.keys().copied().collect();
            for key in &keys {
                state.remove_group(key);
            }
            self.update_gauges(&state);
            keys.len()
        };
        debug!(groups = stopped, "Stopped all pulling groups");
        stopped
    }

    /// Cancel every ticker for good
    pub fn shutdown(&self) {
        self.stop_all();
        self.shared.root.cancel();
    }

    /// Run one tick of a group and build the message to publish
    ///
    /// The ticker exits when the group stopped, or when the slot now belongs
    /// to a newer group with the same key.
    fn tick(&self, key: &GroupKey, generation: u64) -> TickAction {
        let (outcome, routing_key) = {
            let mut state = self.state();
            let Some(slot) = state.groups.get_mut(key) else {
                return TickAction::Exit;
            };
            if slot.generation != generation {
                return TickAction::Exit;
            }
            let routing_key = slot.group.target().routing_key.clone();
            let outcome = slot.group.tick();

            match &outcome {
                TickOutcome::Stop => {
                    state.remove_group(key);
                }
                TickOutcome::Poll { expired, .. } => {
                    for id in expired {
                        if state.metric_index.get(id) == Some(key) {
                            state.metric_index.remove(id);
                        }
                    }
                }
            }
            self.update_gauges(&state);
            (outcome, routing_key)
        };

        match outcome {
            TickOutcome::Stop => {
                self.shared
                    .logger
                    .log_group_stopped(&key.to_string(), "no metrics left");
                TickAction::Exit
            }
            TickOutcome::Poll { request, expired } => {
                if !expired.is_empty() {
                    debug!(group = %key, expired = ?expired, "Pulling budget used up");
                }
                match Envelope::encode(&request, StatusCode::Ok) {
                    Ok(envelope) => {
                        let envelope = envelope
                            .with_correlation_id(uuid::Uuid::new_v4().to_string())
                            .reply_to(self.shared.poll_reply_key.clone())
                            .with_expiration(self.shared.message_ttl);
                        TickAction::Publish(Publishing::new(
                            self.shared.fetch_exchange.clone(),
                            routing_key,
                            envelope,
                        ))
                    }
                    Err(e) => {
                        warn!(group = %key, error = %e, "Failed to encode poll request");
                        TickAction::Skip
                    }
                }
            }
        }
    }

    /// Number of live groups
    pub fn group_count(&self) -> usize {
        self.state().groups.len()
    }

    /// Number of metrics being polled across all groups
    pub fn entry_count(&self) -> usize {
        self.state().metric_index.len()
    }

    /// Group currently polling `metric_id`
    pub fn group_of(&self, metric_id: i32) -> Option<GroupKey> {
        self.state().metric_index.get(&metric_id).copied()
    }

    pub fn entry(&self, metric_id: i32) -> Option<MetricPullingEntry> {
        let state = self.state();
        let key = state.metric_index.get(&metric_id)?;
        state.groups.get(key)?.group.entry(metric_id).cloned()
    }

    pub fn snapshot(&self, key: &GroupKey) -> Option<GroupSnapshot> {
        let state = self.state();
        let slot = state.groups.get(key)?;
        Some(GroupSnapshot {
            key: *key,
            state: slot.group.state(),
            interval: slot.group.target().interval,
            entries: slot.group.entries(),
        })
    }

    /// Keys of all live groups, sorted
    pub fn keys(&self) -> Vec<GroupKey> {
        let mut keys: Vec<GroupKey> = self.state().groups.keys().copied().collect();
        keys.sort_by_key(|k| (k.container_id, k.interval_ms));
        keys
    }
}

/// Ticker loop of one group; ticks never overlap
async fn run_group(
    registry: PullingRegistry,
    key: GroupKey,
    generation: u64,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let publishing = match registry.tick(&key, generation) {
                    TickAction::Publish(publishing) => publishing,
                    TickAction::Skip => continue,
                    TickAction::Exit => break,
                };
                match registry.shared.publisher.publish(publishing).await {
                    Ok(()) => registry.shared.metrics.inc_polls_published(),
                    Err(e) => warn!(group = %key, error = %e, "Failed to publish poll request"),
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    debug!(group = %key, "Pulling group ticker exited");
}
