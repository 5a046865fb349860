//! Lookup of real-time settings
//!
//! Metric settings are read from the cache first and fall back to the
//! persistent store; a store hit is written back to the cache. Container
//! polling intervals always come from the store.

use crate::backends::{ConfigStore, MetricCache};
use crate::error::{RtsError, RtsResult};
use crate::models::RtsMetricConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct RtsConfigLoader {
    cache: Arc<dyn MetricCache>,
    store: Arc<dyn ConfigStore>,
}

impl RtsConfigLoader {
    pub fn new(cache: Arc<dyn MetricCache>, store: Arc<dyn ConfigStore>) -> Self {
        Self { cache, store }
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// Real-time settings of `metric_id`
    pub async fn metric_config(&self, metric_id: i32) -> RtsResult<RtsMetricConfig> {
        if let Some(config) = self
            .cache
            .get_rts_metric_config(metric_id)
            .await
            .map_err(RtsError::Cache)?
        {
            return Ok(config);
        }

        let config = self
            .store
            .get_metric_rts_config(metric_id)
            .await
            .map_err(RtsError::Store)?
            .ok_or(RtsError::NotConfigured {
                what: "metric",
                id: metric_id,
            })?;

        debug!(metric_id = metric_id, pulling_times = config.pulling_times, "Loaded real-time config from store");

        // A failed write-back only costs a store read next time
        if let Err(e) = self.cache.set_rts_metric_config(metric_id, config).await {
            warn!(metric_id = metric_id, error = %e, "Failed to cache real-time config");
        }
        Ok(config)
    }

    /// Polling interval configured for `container_id`
    ///
    /// Intervals below one millisecond count as not configured.
    pub async fn container_interval(&self, container_id: i32) -> RtsResult<Duration> {
        self.store
            .get_container_rts_info(container_id)
            .await
            .map_err(RtsError::Store)?
            .map(|info| info.pulling_interval)
            .filter(|interval| interval.as_millis() > 0)
            .ok_or(RtsError::NotConfigured {
                what: "container",
                id: container_id,
            })
    }

    /// Forget the cached settings of `metric_id`
    pub async fn invalidate(&self, metric_id: i32) -> RtsResult<()> {
        self.cache
            .delete_rts_metric_config(metric_id)
            .await
            .map_err(RtsError::Cache)
    }
}
