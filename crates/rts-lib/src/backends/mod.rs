//! Collaborator seams of the real-time core
//!
//! The core never talks to the cache, the relational store or the
//! time-series store directly; it goes through these traits. The
//! in-memory implementations back single-node deployments and tests.

mod memory;

pub use memory::{MemoryCache, MemoryHistory, MemoryStore};

use crate::models::{ContainerRtsInfo, MetricDataResponse, MetricRequest, RtsMetricConfig};
use anyhow::Result;
use std::time::Duration;

pub use async_trait::async_trait;

/// Shared cache of metric values and real-time settings
#[async_trait]
pub trait MetricCache: Send + Sync {
    /// Encoded `MetricDataResponse` of a metric, if still valid
    async fn get_metric_data(&self, metric_id: i32) -> Result<Option<Vec<u8>>>;

    async fn set_metric_data(&self, metric_id: i32, data: Vec<u8>, ttl: Duration) -> Result<()>;

    async fn get_rts_metric_config(&self, metric_id: i32) -> Result<Option<RtsMetricConfig>>;

    async fn set_rts_metric_config(&self, metric_id: i32, config: RtsMetricConfig) -> Result<()>;

    async fn delete_rts_metric_config(&self, metric_id: i32) -> Result<()>;
}

/// Persistent store holding the real-time configuration
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_metric_rts_config(&self, metric_id: i32) -> Result<Option<RtsMetricConfig>>;

    async fn get_container_rts_info(&self, container_id: i32) -> Result<Option<ContainerRtsInfo>>;

    /// Every metric flagged for real-time polling
    async fn list_rts_metrics(&self) -> Result<Vec<MetricRequest>>;
}

/// Time-series store fed by background polls
#[async_trait]
pub trait HistoryWriter: Send + Sync {
    async fn write_point(&self, response: &MetricDataResponse) -> Result<()>;
}
