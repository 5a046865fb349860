//! Per-metric pulling budget

use crate::models::{MetricSelector, MetricType};

/// One metric being polled inside a container pulling group
///
/// `pulling_remaining` stays within `0..=pulling_times`: it is reset to
/// `pulling_times` on refresh and drops by one per tick otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricPullingEntry {
    metric_id: i32,
    metric_type: MetricType,
    pulling_remaining: u16,
    pulling_times: u16,
}

impl MetricPullingEntry {
    pub fn new(metric_id: i32, metric_type: MetricType, pulling_times: u16) -> Self {
        Self {
            metric_id,
            metric_type,
            pulling_remaining: pulling_times,
            pulling_times,
        }
    }

    pub fn metric_id(&self) -> i32 {
        self.metric_id
    }

    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    pub fn pulling_remaining(&self) -> u16 {
        self.pulling_remaining
    }

    pub fn pulling_times(&self) -> u16 {
        self.pulling_times
    }

    pub fn is_exhausted(&self) -> bool {
        self.pulling_remaining == 0
    }

    /// Restore the full budget
    pub fn refresh(&mut self) {
        self.pulling_remaining = self.pulling_times;
    }

    /// Re-subscription: take the new type and budget, then refresh
    pub fn renew(&mut self, metric_type: MetricType, pulling_times: u16) {
        self.metric_type = metric_type;
        self.pulling_times = pulling_times;
        self.refresh();
    }

    /// Account for one poll; true when the budget is used up
    pub fn consume(&mut self) -> bool {
        self.pulling_remaining = self.pulling_remaining.saturating_sub(1);
        self.is_exhausted()
    }

    pub fn selector(&self) -> MetricSelector {
        MetricSelector {
            id: self.metric_id,
            metric_type: self.metric_type,
        }
    }
}
