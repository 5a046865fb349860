//! Cache-first resolution of metric requests
//!
//! This module provides:
//! - The resolver deciding between a cached answer, a synthesized empty
//!   answer and a correlated fetch through a translator service
//! - Reply sinks that carry the answer back to the requester
//! - The warm start that rebuilds pulling groups from the store
//!
//! Concurrent misses for the same metric are not coalesced: each one
//! publishes its own fetch and waits for its own reply.

mod sink;


pub use sink::{BrokerReplySink, ReplySink};

use crate::backends::MetricCache;
use crate::broker::{Publishing, RoutingTable, Topology};
use crate::channel::PublishSink;
use crate::envelope::{Envelope, StatusCode};
use crate::error::{RtsError, RtsResult};
use crate::models::{MetricDataResponse, MetricRequest, RtsMetricConfig};
use crate::observability::{RtsMetrics, StructuredLogger};
use crate::plumber::Plumber;
use crate::pulling::{PullingRegistry, PullingTarget};
use crate::rts_config::RtsConfigLoader;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for the resolver
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Upper bound on the wait for a correlated reply
    pub fetch_timeout: Duration,
    /// Routing key translators reply to, the identity of this service
    pub reply_routing_key: String,
    /// Broker TTL of published fetch requests
    pub message_ttl: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(25),
            reply_routing_key: "rts-1".to_string(),
            message_ttl: Duration::from_secs(30),
        }
    }
}

impl ResolverConfig {
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_reply_routing_key(mut self, key: impl Into<String>) -> Self {
        self.reply_routing_key = key.into();
        self
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = ttl;
        self
    }
}

/// How a request was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Served from the cache, pulling budget refreshed
    Cached,
    /// No translator handles the container type, empty answer sent
    NoRoute,
    /// Answered by a translator reply with the given status
    Fetched(StatusCode),
}

/// Request entry point of the real-time core
pub struct CacheFirstResolver {
    cache: Arc<dyn MetricCache>,
    loader: RtsConfigLoader,
    registry: PullingRegistry,
    publisher: PublishSink,
    plumber: Arc<Plumber<Envelope>>,
    pending: DashMap<String, RtsMetricConfig>,
    routes: RoutingTable,
    fetch_exchange: String,
    config: ResolverConfig,
    metrics: RtsMetrics,
    logger: StructuredLogger,
}

impl CacheFirstResolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<dyn MetricCache>,
        loader: RtsConfigLoader,
        registry: PullingRegistry,
        publisher: PublishSink,
        plumber: Arc<Plumber<Envelope>>,
        routes: RoutingTable,
        topology: &Topology,
        config: ResolverConfig,
        metrics: RtsMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            cache,
            loader,
            registry,
            publisher,
            plumber,
            pending: DashMap::new(),
            routes,
            fetch_exchange: topology.fetch_exchange.clone(),
            config,
            metrics,
            logger,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn registry(&self) -> &PullingRegistry {
        &self.registry
    }

    /// Fetches published and still waiting for their reply
    pub fn pending_fetches(&self) -> usize {
        self.pending.len()
    }

    /// Answer `request` through `sink`
    ///
    /// A timeout is returned as [`RtsError::Timeout`] and nothing is sent
    /// to the sink; the requester runs into its own timeout.
    pub async fn resolve(
        &self,
        request: &MetricRequest,
        sink: &dyn ReplySink,
        timeout: Duration,
    ) -> RtsResult<Resolution> {
        let started = Instant::now();

        let cached = self
            .cache
            .get_metric_data(request.metric_id)
            .await
            .map_err(RtsError::Cache)?;

        if let Some(data) = cached {
            self.metrics.inc_cache_hits();
            let refreshed = self.registry.refresh_metric(request.metric_id);
            debug!(metric_id = request.metric_id, refreshed = refreshed, "Serving metric from cache");
            sink.deliver(Envelope::from_body(data, StatusCode::Ok)).await?;
            self.metrics.observe_resolve_latency(started.elapsed());
            return Ok(Resolution::Cached);
        }
        self.metrics.inc_cache_misses();

        let Some(routing_key) = self.routes.routing_key(request.container_type) else {
            debug!(
                metric_id = request.metric_id,
                container_type = %request.container_type,
                "No translator for container type, answering without data"
            );
            let reply = Envelope::encode(&MetricDataResponse::no_data(request), StatusCode::Ok)?;
            sink.deliver(reply).await?;
            return Ok(Resolution::NoRoute);
        };
        let routing_key = routing_key.to_string();

        let config = self.loader.metric_config(request.metric_id).await?;
        let interval = self.loader.container_interval(request.container_id).await?;

        self.registry.add_metric(
            PullingTarget {
                container_id: request.container_id,
                container_type: request.container_type,
                routing_key: routing_key.clone(),
                interval,
            },
            request.metric_id,
            request.metric_type,
            config.pulling_times,
        )?;

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let fetch = Envelope::encode(request, StatusCode::Ok)?
            .with_correlation_id(correlation_id.clone())
            .reply_to(self.config.reply_routing_key.clone())
            .with_expiration(self.config.message_ttl);

        self.pending.insert(correlation_id.clone(), config);
        if let Err(e) = self
            .publisher
            .publish(Publishing::new(self.fetch_exchange.clone(), routing_key, fetch))
            .await
        {
            self.pending.remove(&correlation_id);
            return Err(e);
        }
        self.metrics.inc_fetches_issued();
        debug!(
            metric_id = request.metric_id,
            correlation_id = %correlation_id,
            "Fetch published, waiting for reply"
        );

        let reply = match self.plumber.listen(&correlation_id, timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                self.pending.remove(&correlation_id);
                if e.is_timeout() {
                    self.metrics.inc_fetch_timeouts();
                    self.logger
                        .log_fetch_timeout(request.metric_id, &correlation_id, timeout);
                }
                return Err(e);
            }
        };

        let config = self
            .pending
            .remove(&correlation_id)
            .map(|(_, config)| config)
            .unwrap_or(config);

        let status = reply.status();
        if status.is_ok() {
            if let Err(e) = self
                .cache
                .set_metric_data(request.metric_id, reply.body.clone(), config.cache_duration)
                .await
            {
                warn!(metric_id = request.metric_id, error = %e, "Failed to cache fetched value");
            }
        } else {
            debug!(metric_id = request.metric_id, status = %status, "Translator replied without data");
        }

        sink.deliver(reply).await?;
        self.metrics.observe_resolve_latency(started.elapsed());
        Ok(Resolution::Fetched(status))
    }

    /// Rebuild pulling groups for every real-time metric in the store
    ///
    /// Metrics that cannot be routed or lack settings are skipped.
    /// Returns how many metrics were scheduled.
    pub async fn reload_from_store(&self) -> RtsResult<usize> {
        let requests = self
            .loader
            .store()
            .list_rts_metrics()
            .await
            .map_err(RtsError::Store)?;

        let mut scheduled = 0;
        for request in &requests {
            match self.schedule(request).await {
                Ok(true) => scheduled += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    metric_id = request.metric_id,
                    container_id = request.container_id,
                    error = %e,
                    "Skipping metric during reload"
                ),
            }
        }

        info!(
            listed = requests.len(),
            scheduled = scheduled,
            groups = self.registry.group_count(),
            "Pulling groups rebuilt from store"
        );
        Ok(scheduled)
    }

    async fn schedule(&self, request: &MetricRequest) -> RtsResult<bool> {
        let Some(routing_key) = self.routes.routing_key(request.container_type) else {
            return Ok(false);
        };
        let config = self.loader.metric_config(request.metric_id).await?;
        let interval = self.loader.container_interval(request.container_id).await?;
        self.registry.add_metric(
            PullingTarget {
                container_id: request.container_id,
                container_type: request.container_type,
                routing_key: routing_key.to_string(),
                interval,
            },
            request.metric_id,
            request.metric_type,
            config.pulling_times,
        )?;
        Ok(true)
    }
}
