//! End-to-end scenarios over the in-memory broker
//!
//! These tests verify:
//! - A client request round trip through a fake translator
//! - Background polls filling the cache
//! - Lifecycle broadcasts tearing down pulling state

use super::*;
use crate::backends::{MemoryCache, MemoryHistory, MemoryStore};
use crate::broker::{Consumer, MemoryBroker, Publishing};
use crate::envelope::StatusCode;
use crate::models::{
    ContainerNotice, ContainerType, DataPolicyNotice, MetricDataResponse, MetricDataResponses,
    MetricNotice, MetricRequest, MetricType, MetricValue, MetricsRequest, RtsMetricConfig,
};
use crate::pulling::GroupKey;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const INTERVAL: Duration = Duration::from_millis(5000);
const CACHE_DURATION: Duration = Duration::from_secs(8);

fn request(metric_id: i32) -> MetricRequest {
    MetricRequest {
        container_id: 7,
        container_type: ContainerType::SnmpV2c,
        metric_id,
        metric_type: MetricType::Int,
        data_policy_id: 1,
    }
}

fn sample(container_id: i32, metric_id: i32) -> MetricDataResponse {
    MetricDataResponse {
        container_id,
        metric_id,
        metric_type: MetricType::Int,
        value: Some(MetricValue::Int(i64::from(metric_id) * 10)),
        timestamp: 1_700_000_000,
    }
}

/// Stand-in for the SNMP translator: answers direct fetches and polls
fn spawn_translator(broker: Arc<MemoryBroker>, mut consumer: Consumer, fetches: Arc<AtomicUsize>) {
    tokio::spawn(async move {
        while let Some(delivery) = consumer.recv().await {
            let envelope = delivery.envelope;
            let Some(reply_key) = envelope.reply_routing_key().map(str::to_string) else {
                continue;
            };

            let reply = if reply_key == "rts" {
                let batch: MetricsRequest = envelope.decode().unwrap();
                let responses = batch
                    .metrics
                    .iter()
                    .map(|m| sample(batch.container_id, m.id))
                    .collect();
                Envelope::encode(
                    &MetricDataResponses {
                        container_id: batch.container_id,
                        responses,
                    },
                    StatusCode::Ok,
                )
                .unwrap()
            } else {
                fetches.fetch_add(1, Ordering::SeqCst);
                let single: MetricRequest = envelope.decode().unwrap();
                Envelope::encode(&sample(single.container_id, single.metric_id), StatusCode::Ok)
                    .unwrap()
            };

            let reply = reply.with_correlation_id(envelope.correlation_id.clone());
            broker
                .publish(Publishing::new("metric.response", reply_key, reply))
                .await
                .unwrap();
        }
    });
}

struct Scenario {
    broker: Arc<MemoryBroker>,
    cache: Arc<MemoryCache>,
    store: Arc<MemoryStore>,
    history: Arc<MemoryHistory>,
    client: Consumer,
    fetches: Arc<AtomicUsize>,
    service: RtsService,
}

impl Scenario {
    async fn start(history_enabled: bool) -> Self {
        let broker = Arc::new(MemoryBroker::new());
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryStore::new());
        let history = Arc::new(MemoryHistory::new());
        let config = RtsMetricConfig {
            pulling_times: 3,
            cache_duration: CACHE_DURATION,
        };
        store.insert_metric(request(42), config);
        store.insert_metric(request(43), config);
        store.set_container_interval(7, INTERVAL);

        let fetches = Arc::new(AtomicUsize::new(0));
        let translator = broker
            .open_consumer(&Binding::direct("metric.fetch", "translator.snmp", "snmp"))
            .await
            .unwrap();
        spawn_translator(broker.clone(), translator, fetches.clone());
        let client = broker
            .open_consumer(&Binding::direct("metric.response", "client.queue", "client-1"))
            .await
            .unwrap();

        let mut settings = ServiceSettings::new("rts-test");
        settings.history_enabled = history_enabled;
        let collaborators = Collaborators {
            broker: broker.clone(),
            cache: cache.clone(),
            store: store.clone(),
            history: Some(history.clone()),
        };
        let service = RtsService::start(settings, collaborators, HealthRegistry::new()).await;
        settle().await;

        Self {
            broker,
            cache,
            store,
            history,
            client,
            fetches,
            service,
        }
    }

    async fn ask(&mut self, metric_id: i32, correlation_id: &str) -> Envelope {
        let envelope = Envelope::encode(&request(metric_id), StatusCode::Ok)
            .unwrap()
            .with_correlation_id(correlation_id)
            .reply_to("client-1");
        self.broker
            .publish(Publishing::new("rts.request", "rts", envelope))
            .await
            .unwrap();
        self.client.recv().await.unwrap().envelope
    }

    async fn broadcast<T: serde::Serialize>(&self, exchange: &str, notice: &T) {
        let envelope = Envelope::encode(notice, StatusCode::Ok).unwrap();
        self.broker
            .publish(Publishing::new(exchange, "", envelope))
            .await
            .unwrap();
        settle().await;
    }
}

/// Let every spawned task run to its next wait point
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_warm_start_and_readiness() {
    let scenario = Scenario::start(false).await;

    let registry = scenario.service.registry();
    assert_eq!(registry.keys(), vec![GroupKey::new(7, INTERVAL)]);
    assert_eq!(registry.entry_count(), 2);
    assert!(scenario.service.health().readiness().await.ready);

    scenario.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_request_round_trip_through_translator() {
    let mut scenario = Scenario::start(false).await;

    let reply = scenario.ask(42, "req-1").await;
    assert_eq!(reply.correlation_id, "req-1");
    assert_eq!(reply.status(), StatusCode::Ok);
    let answer: MetricDataResponse = reply.decode().unwrap();
    assert_eq!(answer, sample(7, 42));
    assert_eq!(scenario.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(
        scenario.service.registry().group_of(42),
        Some(GroupKey::new(7, INTERVAL))
    );

    // Second ask is a cache hit, no new fetch
    let again = scenario.ask(42, "req-2").await;
    assert_eq!(again.correlation_id, "req-2");
    assert_eq!(again.decode::<MetricDataResponse>().unwrap(), sample(7, 42));
    assert_eq!(scenario.fetches.load(Ordering::SeqCst), 1);

    scenario.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_background_poll_fills_cache_and_history() {
    let scenario = Scenario::start(true).await;
    assert!(scenario.cache.get_metric_data(43).await.unwrap().is_none());

    tokio::time::sleep(INTERVAL + Duration::from_millis(10)).await;

    let cached = scenario.cache.get_metric_data(43).await.unwrap().unwrap();
    let decoded: MetricDataResponse = bincode::deserialize(&cached).unwrap();
    assert_eq!(decoded, sample(7, 43));
    assert_eq!(scenario.history.points().len(), 2);
    assert_eq!(scenario.fetches.load(Ordering::SeqCst), 0);

    scenario.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_container_deleted_forces_full_miss_path() {
    let mut scenario = Scenario::start(false).await;
    scenario.ask(42, "before").await;
    assert_eq!(scenario.fetches.load(Ordering::SeqCst), 1);

    scenario
        .broadcast("container.deleted", &ContainerNotice { container_id: 7 })
        .await;
    assert_eq!(scenario.service.registry().group_count(), 0);

    // Once the cached value is gone the request goes back to the translator
    tokio::time::sleep(CACHE_DURATION).await;
    let reply = scenario.ask(42, "after").await;
    assert_eq!(reply.correlation_id, "after");
    assert_eq!(scenario.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(
        scenario.service.registry().group_of(42),
        Some(GroupKey::new(7, INTERVAL))
    );

    scenario.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_metric_deleted_leaves_siblings() {
    let scenario = Scenario::start(false).await;
    let cache_config = scenario.cache.has_config(42);

    scenario
        .broadcast(
            "metric.deleted",
            &MetricNotice {
                container_id: 7,
                metric_id: 42,
            },
        )
        .await;

    let registry = scenario.service.registry();
    assert!(registry.group_of(42).is_none());
    assert_eq!(registry.group_of(43), Some(GroupKey::new(7, INTERVAL)));
    assert!(cache_config);
    assert!(!scenario.cache.has_config(42));

    scenario.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_data_policy_deleted_rebuilds_from_store() {
    let scenario = Scenario::start(false).await;
    scenario.store.remove_metric(43);

    scenario
        .broadcast("data_policy.deleted", &DataPolicyNotice { data_policy_id: 1 })
        .await;

    let registry = scenario.service.registry();
    assert_eq!(registry.group_count(), 1);
    assert_eq!(registry.entry_count(), 1);
    assert!(registry.group_of(43).is_none());
    assert_eq!(registry.entry(42).unwrap().pulling_remaining(), 3);

    scenario.service.shutdown().await;
}
