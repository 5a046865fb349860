use super::{ConfigStore, HistoryWriter, MetricCache};
use crate::models::{ContainerRtsInfo, MetricDataResponse, MetricRequest, RtsMetricConfig};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct CachedValue {
    data: Vec<u8>,
    expires_at: Instant,
}

/// In-process cache with per-entry TTL
///
/// Expired values are dropped when read, and every write sweeps out the
/// ones nobody read since they expired. Real-time settings never expire
/// and are only removed by `delete_rts_metric_config`.
#[derive(Debug, Default)]
pub struct MemoryCache {
    data: DashMap<i32, CachedValue>,
    configs: DashMap<i32, RtsMetricConfig>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values, including expired ones not swept yet
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn has_config(&self, metric_id: i32) -> bool {
        self.configs.contains_key(&metric_id)
    }
}

#[async_trait]
impl MetricCache for MemoryCache {
    async fn get_metric_data(&self, metric_id: i32) -> Result<Option<Vec<u8>>> {
        let expired = match self.data.get(&metric_id) {
            Some(value) if Instant::now() < value.expires_at => {
                return Ok(Some(value.data.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.data.remove(&metric_id);
            debug!(metric_id = metric_id, "Cached value expired");
        }
        Ok(None)
    }

    async fn set_metric_data(&self, metric_id: i32, data: Vec<u8>, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, value| now < value.expires_at);
        let swept = before.saturating_sub(self.data.len());
        if swept > 0 {
            debug!(swept = swept, "Swept expired cached values");
        }

        self.data.insert(
            metric_id,
            CachedValue {
                data,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn get_rts_metric_config(&self, metric_id: i32) -> Result<Option<RtsMetricConfig>> {
        Ok(self.configs.get(&metric_id).map(|c| *c))
    }

    async fn set_rts_metric_config(&self, metric_id: i32, config: RtsMetricConfig) -> Result<()> {
        self.configs.insert(metric_id, config);
        Ok(())
    }

    async fn delete_rts_metric_config(&self, metric_id: i32) -> Result<()> {
        self.configs.remove(&metric_id);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StoreTables {
    metrics: HashMap<i32, (MetricRequest, RtsMetricConfig)>,
    containers: HashMap<i32, ContainerRtsInfo>,
}

/// In-process stand-in for the relational store
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<StoreTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag a metric for real-time polling
    pub fn insert_metric(&self, request: MetricRequest, config: RtsMetricConfig) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.metrics.insert(request.metric_id, (request, config));
    }

    pub fn remove_metric(&self, metric_id: i32) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.metrics.remove(&metric_id);
    }

    pub fn set_container_interval(&self, container_id: i32, pulling_interval: Duration) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables
            .containers
            .insert(container_id, ContainerRtsInfo { pulling_interval });
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_metric_rts_config(&self, metric_id: i32) -> Result<Option<RtsMetricConfig>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.metrics.get(&metric_id).map(|(_, config)| *config))
    }

    async fn get_container_rts_info(&self, container_id: i32) -> Result<Option<ContainerRtsInfo>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.containers.get(&container_id).copied())
    }

    async fn list_rts_metrics(&self) -> Result<Vec<MetricRequest>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let mut requests: Vec<MetricRequest> = tables
            .metrics
            .values()
            .map(|(request, _)| request.clone())
            .collect();
        requests.sort_by_key(|r| r.metric_id);
        Ok(requests)
    }
}

/// History writer that keeps every point in memory
#[derive(Debug, Default)]
pub struct MemoryHistory {
    points: Mutex<Vec<MetricDataResponse>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<MetricDataResponse> {
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl HistoryWriter for MemoryHistory {
    async fn write_point(&self, response: &MetricDataResponse) -> Result<()> {
        debug!(
            container_id = response.container_id,
            metric_id = response.metric_id,
            "Writing history point"
        );
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(response.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerType, MetricType};

    fn request(metric_id: i32) -> MetricRequest {
        MetricRequest {
            container_id: 7,
            container_type: ContainerType::SnmpV2c,
            metric_id,
            metric_type: MetricType::Int,
            data_policy_id: 1,
        }
    }

    fn config() -> RtsMetricConfig {
        RtsMetricConfig {
            pulling_times: 3,
            cache_duration: Duration::from_secs(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_value_expires_after_ttl() {
        let cache = MemoryCache::new();
        cache
            .set_metric_data(42, vec![1, 2, 3], Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(cache.get_metric_data(42).await.unwrap(), Some(vec![1, 2, 3]));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get_metric_data(42).await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unread_expired_values_are_swept_on_write() {
        let cache = MemoryCache::new();
        for id in 1..=3 {
            cache
                .set_metric_data(id, vec![id as u8], Duration::from_secs(5))
                .await
                .unwrap();
        }
        cache
            .set_metric_data(4, vec![4], Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.len(), 4);

        tokio::time::advance(Duration::from_secs(6)).await;
        cache
            .set_metric_data(5, vec![5], Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_metric_data(4).await.unwrap(), Some(vec![4]));
        assert_eq!(cache.get_metric_data(5).await.unwrap(), Some(vec![5]));
    }

    #[tokio::test]
    async fn test_config_cache_roundtrip_and_delete() {
        let cache = MemoryCache::new();
        assert!(cache.get_rts_metric_config(42).await.unwrap().is_none());

        cache.set_rts_metric_config(42, config()).await.unwrap();
        assert_eq!(cache.get_rts_metric_config(42).await.unwrap(), Some(config()));

        cache.delete_rts_metric_config(42).await.unwrap();
        assert!(!cache.has_config(42));
    }

    #[tokio::test]
    async fn test_store_lists_flagged_metrics_in_id_order() {
        let store = MemoryStore::new();
        store.insert_metric(request(43), config());
        store.insert_metric(request(42), config());
        store.set_container_interval(7, Duration::from_millis(5000));

        let ids: Vec<i32> = store
            .list_rts_metrics()
            .await
            .unwrap()
            .iter()
            .map(|r| r.metric_id)
            .collect();
        assert_eq!(ids, vec![42, 43]);
        assert_eq!(
            store.get_container_rts_info(7).await.unwrap().unwrap().pulling_interval,
            Duration::from_millis(5000)
        );
        assert!(store.get_container_rts_info(8).await.unwrap().is_none());

        store.remove_metric(42);
        assert!(store.get_metric_rts_config(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_records_points() {
        let history = MemoryHistory::new();
        let response = MetricDataResponse::no_data(&request(42));
        history.write_point(&response).await.unwrap();
        assert_eq!(history.points(), vec![response]);
    }
}
