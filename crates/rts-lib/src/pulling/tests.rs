//! Registry tests driven by a paused clock
//!
//! These tests verify:
//! - Tick cadence and batching of poll requests
//! - Budget exhaustion and the stop on the following tick
//! - Explicit removal, container stops and interval migration

use super::*;
use crate::broker::{Publishing, Topology};
use crate::channel::PublishSink;
use crate::models::{ContainerType, MetricType, MetricsRequest};
use crate::observability::{RtsMetrics, StructuredLogger};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const INTERVAL: Duration = Duration::from_millis(5000);

fn registry() -> (PullingRegistry, mpsc::Receiver<Publishing>) {
    let (sink, rx) = PublishSink::channel(64);
    let registry = PullingRegistry::new(
        sink,
        &Topology::default(),
        Duration::from_secs(30),
        RtsMetrics::new(),
        StructuredLogger::new("rts-test"),
    );
    (registry, rx)
}

fn target(container_id: i32, interval: Duration) -> PullingTarget {
    PullingTarget {
        container_id,
        container_type: ContainerType::SnmpV2c,
        routing_key: "snmp".to_string(),
        interval,
    }
}

fn polled_ids(publishing: &Publishing) -> Vec<i32> {
    let request: MetricsRequest = publishing.envelope.decode().unwrap();
    request.metrics.iter().map(|m| m.id).collect()
}

/// True when nothing gets published within `window`
async fn quiet_for(rx: &mut mpsc::Receiver<Publishing>, window: Duration) -> bool {
    tokio::time::timeout(window, rx.recv()).await.is_err()
}

mod ticking {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_polls_after_one_interval() {
        let (registry, mut rx) = registry();
        let start = Instant::now();

        let outcome = registry.add_metric(target(7, INTERVAL), 42, MetricType::Int, 3).unwrap();
        assert_eq!(outcome, AddOutcome::Inserted);
        assert_eq!(registry.keys(), vec![GroupKey::new(7, INTERVAL)]);
        assert_eq!(registry.keys()[0].to_string(), "7_5000");

        let publishing = rx.recv().await.unwrap();
        assert!(start.elapsed() >= INTERVAL);
        assert_eq!(publishing.exchange, "metric.fetch");
        assert_eq!(publishing.routing_key, "snmp");
        assert_eq!(publishing.envelope.reply_routing_key(), Some("rts"));
        assert!(!publishing.envelope.correlation_id.is_empty());
        assert_eq!(polled_ids(&publishing), vec![42]);

        assert_eq!(registry.entry(42).unwrap().pulling_remaining(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_of_one_container_share_a_request() {
        let (registry, mut rx) = registry();
        registry.add_metric(target(7, INTERVAL), 42, MetricType::Int, 3).unwrap();
        registry.add_metric(target(7, INTERVAL), 43, MetricType::Float, 3).unwrap();
        assert_eq!(registry.group_count(), 1);
        assert_eq!(registry.entry_count(), 2);

        let publishing = rx.recv().await.unwrap();
        assert_eq!(polled_ids(&publishing), vec![42, 43]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_group_stops_on_following_tick() {
        let (registry, mut rx) = registry();
        let key = GroupKey::new(7, INTERVAL);
        registry.add_metric(target(7, INTERVAL), 42, MetricType::Int, 3).unwrap();

        for _ in 0..3 {
            let publishing = rx.recv().await.unwrap();
            assert_eq!(polled_ids(&publishing), vec![42]);
        }
        // Entry gone after the third tick, group still registered
        assert!(registry.entry(42).is_none());
        assert_eq!(registry.snapshot(&key).unwrap().state, GroupState::Empty);

        // Fourth tick stops the group without publishing
        assert!(quiet_for(&mut rx, INTERVAL * 3).await);
        assert_eq!(registry.group_count(), 0);
        assert!(registry.snapshot(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_before_stop_tick_keeps_group() {
        let (registry, mut rx) = registry();
        registry.add_metric(target(7, INTERVAL), 42, MetricType::Int, 1).unwrap();
        rx.recv().await.unwrap();
        assert_eq!(registry.group_count(), 1);

        registry.add_metric(target(7, INTERVAL), 44, MetricType::Int, 2).unwrap();
        let publishing = rx.recv().await.unwrap();
        assert_eq!(polled_ids(&publishing), vec![44]);
        assert_eq!(registry.group_count(), 1);
    }
}

mod subscriptions {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_refresh_restores_budget() {
        let (registry, mut rx) = registry();
        registry.add_metric(target(7, INTERVAL), 42, MetricType::Int, 3).unwrap();
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(registry.entry(42).unwrap().pulling_remaining(), 1);

        assert!(registry.refresh_metric(42));
        assert!(registry.refresh_metric(42));
        assert_eq!(registry.entry(42).unwrap().pulling_remaining(), 3);
        assert!(!registry.refresh_metric(99));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readding_metric_does_not_duplicate() {
        let (registry, mut rx) = registry();
        registry.add_metric(target(7, INTERVAL), 42, MetricType::Int, 3).unwrap();
        rx.recv().await.unwrap();

        let outcome = registry.add_metric(target(7, INTERVAL), 42, MetricType::Int, 3).unwrap();
        assert_eq!(outcome, AddOutcome::Refreshed);
        assert_eq!(registry.entry_count(), 1);
        assert_eq!(registry.entry(42).unwrap().pulling_remaining(), 3);

        let publishing = rx.recv().await.unwrap();
        assert_eq!(polled_ids(&publishing), vec![42]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removing_last_metric_stops_group_at_once() {
        let (registry, mut rx) = registry();
        registry.add_metric(target(7, INTERVAL), 42, MetricType::Int, 10).unwrap();
        rx.recv().await.unwrap();

        assert!(registry.remove_metric(42));
        assert!(!registry.remove_metric(42));
        assert_eq!(registry.group_count(), 0);
        assert!(quiet_for(&mut rx, INTERVAL * 3).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removing_one_metric_keeps_the_others() {
        let (registry, mut rx) = registry();
        registry.add_metric(target(7, INTERVAL), 42, MetricType::Int, 10).unwrap();
        registry.add_metric(target(7, INTERVAL), 43, MetricType::Int, 10).unwrap();

        assert!(registry.remove_metric(42));
        let publishing = rx.recv().await.unwrap();
        assert_eq!(polled_ids(&publishing), vec![43]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_migrates_metric() {
        let (registry, mut rx) = registry();
        let slow = Duration::from_secs(10);
        registry.add_metric(target(7, INTERVAL), 42, MetricType::Int, 5).unwrap();
        registry.add_metric(target(7, slow), 42, MetricType::Int, 5).unwrap();

        assert_eq!(registry.group_of(42), Some(GroupKey::new(7, slow)));
        assert_eq!(registry.keys(), vec![GroupKey::new(7, slow)]);

        let start = Instant::now();
        let publishing = rx.recv().await.unwrap();
        assert!(start.elapsed() >= slow);
        assert_eq!(polled_ids(&publishing), vec![42]);
    }
}

mod intervals {
    use super::*;
    use crate::error::RtsError;

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_refused() {
        let (registry, mut rx) = registry();

        let refused = registry.add_metric(target(7, Duration::ZERO), 42, MetricType::Int, 3);
        assert!(matches!(
            refused,
            Err(RtsError::NotConfigured { what: "container", id: 7 })
        ));
        let sub_milli = target(7, Duration::from_micros(900));
        assert!(registry.add_metric(sub_milli, 42, MetricType::Int, 3).is_err());

        assert_eq!(registry.group_count(), 0);
        assert!(registry.entry(42).is_none());
        assert!(!registry.refresh_metric(42));
        assert!(quiet_for(&mut rx, Duration::from_secs(3600)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_interval_leaves_existing_group_alone() {
        let (registry, mut rx) = registry();
        registry.add_metric(target(7, INTERVAL), 42, MetricType::Int, 3).unwrap();

        assert!(registry
            .add_metric(target(7, Duration::ZERO), 42, MetricType::Int, 3)
            .is_err());
        assert_eq!(registry.group_of(42), Some(GroupKey::new(7, INTERVAL)));

        let publishing = rx.recv().await.unwrap();
        assert_eq!(polled_ids(&publishing), vec![42]);
    }
}

mod stopping {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_stop_container_only_touches_that_container() {
        let (registry, mut rx) = registry();
        registry.add_metric(target(7, INTERVAL), 42, MetricType::Int, 10).unwrap();
        registry.add_metric(target(7, Duration::from_secs(10)), 43, MetricType::Int, 10).unwrap();
        registry.add_metric(target(8, INTERVAL), 50, MetricType::Int, 10).unwrap();
        assert_eq!(registry.group_count(), 3);

        assert_eq!(registry.stop_container(7), 2);
        assert_eq!(registry.keys(), vec![GroupKey::new(8, INTERVAL)]);
        assert!(registry.group_of(42).is_none());
        assert!(registry.group_of(43).is_none());

        let publishing = rx.recv().await.unwrap();
        let request: MetricsRequest = publishing.envelope.decode().unwrap();
        assert_eq!(request.container_id, 8);
        assert!(quiet_for(&mut rx, INTERVAL / 2).await);
        assert_eq!(registry.stop_container(7), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_then_resubscribe() {
        let (registry, mut rx) = registry();
        registry.add_metric(target(7, INTERVAL), 42, MetricType::Int, 10).unwrap();
        registry.add_metric(target(8, INTERVAL), 50, MetricType::Int, 10).unwrap();

        assert_eq!(registry.stop_all(), 2);
        assert_eq!(registry.entry_count(), 0);
        assert!(quiet_for(&mut rx, INTERVAL * 2).await);

        // Same key again gets a fresh group and ticker
        registry.add_metric(target(7, INTERVAL), 42, MetricType::Int, 10).unwrap();
        let publishing = rx.recv().await.unwrap();
        assert_eq!(polled_ids(&publishing), vec![42]);
        assert!(quiet_for(&mut rx, INTERVAL - Duration::from_millis(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_silences_every_ticker() {
        let (registry, mut rx) = registry();
        registry.add_metric(target(7, INTERVAL), 42, MetricType::Int, 10).unwrap();
        registry.shutdown();
        assert_eq!(registry.group_count(), 0);
        assert!(quiet_for(&mut rx, INTERVAL * 2).await);
    }
}
