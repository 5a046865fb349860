//! Background polling of subscribed metrics
//!
//! This module provides:
//! - Per-metric pulling budgets
//! - Container pulling groups that batch every metric of one container
//!   polled at the same interval
//! - The registry that owns the groups and their ticker tasks

mod entry;
mod group;
mod registry;

#[cfg(test)]
mod tests;

pub use entry::MetricPullingEntry;
pub use group::{
    AddOutcome, ContainerPullingGroup, GroupKey, GroupState, PullingTarget, TickOutcome,
};
pub use registry::{GroupSnapshot, PullingRegistry};
