//! Inbound metric requests
//!
//! Every request arriving on the request queue is resolved in its own task,
//! so a slow fetch never holds up the requests behind it.

use crate::broker::Delivery;
use crate::channel::{PublishSink, Subscription};
use crate::models::MetricRequest;
use crate::observability::RtsMetrics;
use crate::resolver::{BrokerReplySink, CacheFirstResolver, Resolution};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct RequestDispatcher {
    resolver: Arc<CacheFirstResolver>,
    publisher: PublishSink,
    response_exchange: String,
    metrics: RtsMetrics,
}

impl RequestDispatcher {
    pub fn new(
        resolver: Arc<CacheFirstResolver>,
        publisher: PublishSink,
        response_exchange: impl Into<String>,
        metrics: RtsMetrics,
    ) -> Self {
        Self {
            resolver,
            publisher,
            response_exchange: response_exchange.into(),
            metrics,
        }
    }

    /// Start resolving one request; `None` when the delivery was dropped
    pub fn dispatch(&self, delivery: Delivery) -> Option<JoinHandle<()>> {
        let envelope = delivery.envelope;

        let request: MetricRequest = match envelope.decode() {
            Ok(request) => request,
            Err(e) => {
                self.metrics.inc_decode_failures();
                warn!(error = %e, "Failed to decode metric request, dropping");
                return None;
            }
        };

        let Some(reply_key) = envelope.reply_routing_key() else {
            warn!(metric_id = request.metric_id, "Metric request without reply routing key, dropping");
            return None;
        };

        let sink = BrokerReplySink::new(
            self.publisher.clone(),
            self.response_exchange.clone(),
            reply_key,
            envelope.correlation_id.clone(),
        );
        let resolver = self.resolver.clone();
        let timeout = resolver.config().fetch_timeout;

        Some(tokio::spawn(async move {
            match resolver.resolve(&request, &sink, timeout).await {
                Ok(Resolution::Cached) => {}
                Ok(resolution) => {
                    debug!(metric_id = request.metric_id, resolution = ?resolution, "Metric request resolved")
                }
                Err(e) if e.is_timeout() => {}
                Err(e) => warn!(
                    metric_id = request.metric_id,
                    container_id = request.container_id,
                    error = %e,
                    "Failed to resolve metric request"
                ),
            }
        }))
    }

    pub fn spawn(self, mut subscription: Subscription) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(delivery) = subscription.recv().await {
                self.dispatch(delivery);
            }
            debug!("Request dispatcher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MemoryCache, MemoryStore};
    use crate::broker::{Publishing, RoutingTable, Topology};
    use crate::envelope::{Envelope, StatusCode};
    use crate::models::{ContainerType, MetricDataResponse, MetricType};
    use crate::observability::StructuredLogger;
    use crate::plumber::Plumber;
    use crate::pulling::PullingRegistry;
    use crate::resolver::ResolverConfig;
    use crate::rts_config::RtsConfigLoader;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn dispatcher() -> (RequestDispatcher, mpsc::Receiver<Publishing>) {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryStore::new());
        let (publisher, published) = PublishSink::channel(16);
        let metrics = RtsMetrics::new();
        let logger = StructuredLogger::new("rts-test");
        let topology = Topology::default();
        let registry = PullingRegistry::new(
            publisher.clone(),
            &topology,
            Duration::from_secs(30),
            metrics.clone(),
            logger.clone(),
        );
        let resolver = Arc::new(CacheFirstResolver::new(
            cache.clone(),
            RtsConfigLoader::new(cache, store),
            registry,
            publisher.clone(),
            Arc::new(Plumber::new()),
            RoutingTable::empty(),
            &topology,
            ResolverConfig::default(),
            metrics.clone(),
            logger,
        ));
        let dispatcher =
            RequestDispatcher::new(resolver, publisher, topology.response_exchange, metrics);
        (dispatcher, published)
    }

    fn request() -> MetricRequest {
        MetricRequest {
            container_id: 7,
            container_type: ContainerType::Generic,
            metric_id: 42,
            metric_type: MetricType::Int,
            data_policy_id: 1,
        }
    }

    fn delivery(envelope: Envelope) -> Delivery {
        Delivery {
            exchange: "rts.request".to_string(),
            routing_key: "rts".to_string(),
            envelope,
        }
    }

    #[tokio::test]
    async fn test_answer_goes_to_requester_with_correlation_id() {
        let (dispatcher, mut published) = dispatcher();
        let envelope = Envelope::encode(&request(), StatusCode::Ok)
            .unwrap()
            .with_correlation_id("req-1")
            .reply_to("alarms");

        let task = dispatcher.dispatch(delivery(envelope)).unwrap();
        task.await.unwrap();

        let answer = published.recv().await.unwrap();
        assert_eq!(answer.exchange, "metric.response");
        assert_eq!(answer.routing_key, "alarms");
        assert_eq!(answer.envelope.correlation_id, "req-1");
        let response: MetricDataResponse = answer.envelope.decode().unwrap();
        assert_eq!(response.metric_id, 42);
        assert!(response.value.is_none());
    }

    #[tokio::test]
    async fn test_undecodable_request_is_dropped() {
        let (dispatcher, mut published) = dispatcher();
        let garbage = Envelope::from_body(vec![1], StatusCode::Ok).reply_to("alarms");

        assert!(dispatcher.dispatch(delivery(garbage)).is_none());
        assert!(published.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_request_without_reply_key_is_dropped() {
        let (dispatcher, mut published) = dispatcher();
        let envelope = Envelope::encode(&request(), StatusCode::Ok).unwrap();

        assert!(dispatcher.dispatch(delivery(envelope)).is_none());
        assert!(published.try_recv().is_err());
    }
}
