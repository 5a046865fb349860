//! Container pulling group state machine
//!
//! A group moves `Active -> Empty -> Stopped`. Losing its last entry to
//! budget exhaustion only makes it `Empty`; the stop happens on the next
//! tick, so a metric added in between keeps the group alive.

use super::entry::MetricPullingEntry;
use crate::models::{ContainerType, MetricType, MetricsRequest};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Identity of a group: one container polled at one interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub container_id: i32,
    pub interval_ms: u64,
}

impl GroupKey {
    pub fn new(container_id: i32, interval: Duration) -> Self {
        Self {
            container_id,
            interval_ms: interval.as_millis() as u64,
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.container_id, self.interval_ms)
    }
}

/// Where and how often a container is polled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullingTarget {
    pub container_id: i32,
    pub container_type: ContainerType,
    /// Translator routing key for the container type
    pub routing_key: String,
    pub interval: Duration,
}

impl PullingTarget {
    pub fn key(&self) -> GroupKey {
        GroupKey::new(self.container_id, self.interval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Ticker running with at least one entry
    Active,
    /// Ticker running, last entry just left
    Empty,
    /// Ticker cancelled
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    Refreshed,
}

/// Result of one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Publish `request`; `expired` metrics left the group on this tick
    Poll {
        request: MetricsRequest,
        expired: Vec<i32>,
    },
    /// Nothing left to poll, the owner must deregister the group
    Stop,
}

/// Background polling unit for one container at one interval
#[derive(Debug, Clone)]
pub struct ContainerPullingGroup {
    target: PullingTarget,
    entries: HashMap<i32, MetricPullingEntry>,
    state: GroupState,
}

impl ContainerPullingGroup {
    pub fn new(target: PullingTarget) -> Self {
        Self {
            target,
            entries: HashMap::new(),
            state: GroupState::Empty,
        }
    }

    pub fn key(&self) -> GroupKey {
        self.target.key()
    }

    pub fn target(&self) -> &PullingTarget {
        &self.target
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, metric_id: i32) -> Option<&MetricPullingEntry> {
        self.entries.get(&metric_id)
    }

    /// Entries sorted by metric id
    pub fn entries(&self) -> Vec<MetricPullingEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.metric_id());
        entries
    }

    /// Add a metric, or renew it when it is already polled
    pub fn add_metric(
        &mut self,
        metric_id: i32,
        metric_type: MetricType,
        pulling_times: u16,
    ) -> AddOutcome {
        if self.state != GroupState::Stopped {
            self.state = GroupState::Active;
        }
        match self.entries.get_mut(&metric_id) {
            Some(entry) => {
                entry.renew(metric_type, pulling_times);
                AddOutcome::Refreshed
            }
            None => {
                self.entries.insert(
                    metric_id,
                    MetricPullingEntry::new(metric_id, metric_type, pulling_times),
                );
                AddOutcome::Inserted
            }
        }
    }

    /// Reset a metric's budget; false when the metric is not polled here
    pub fn refresh(&mut self, metric_id: i32) -> bool {
        match self.entries.get_mut(&metric_id) {
            Some(entry) => {
                entry.refresh();
                true
            }
            None => false,
        }
    }

    pub fn remove_metric(&mut self, metric_id: i32) -> Option<MetricPullingEntry> {
        let removed = self.entries.remove(&metric_id);
        if self.entries.is_empty() && self.state == GroupState::Active {
            self.state = GroupState::Empty;
        }
        removed
    }

    /// Run one polling round
    pub fn tick(&mut self) -> TickOutcome {
        if self.state == GroupState::Stopped || self.entries.is_empty() {
            self.state = GroupState::Stopped;
            return TickOutcome::Stop;
        }

        let mut metrics: Vec<_> = self.entries.values().map(|e| e.selector()).collect();
        metrics.sort_by_key(|m| m.id);
        let request = MetricsRequest {
            container_id: self.target.container_id,
            container_type: self.target.container_type,
            metrics,
        };

        let mut expired = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.consume() {
                expired.push(entry.metric_id());
            }
        }
        expired.sort_unstable();
        for id in &expired {
            self.entries.remove(id);
        }
        if self.entries.is_empty() {
            self.state = GroupState::Empty;
        }

        TickOutcome::Poll { request, expired }
    }

    /// Stop the group, returning the metric ids it still held
    pub fn stop(&mut self) -> Vec<i32> {
        self.state = GroupState::Stopped;
        let mut ids: Vec<i32> = self.entries.drain().map(|(id, _)| id).collect();
        ids.sort_unstable();
        ids
    }
}
