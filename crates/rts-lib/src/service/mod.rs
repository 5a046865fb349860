//! Wiring of the real-time core
//!
//! Builds every component from the service settings and the collaborator
//! handles, opens the broker subscriptions, rebuilds pulling groups from
//! the store and exposes the pieces callers need.

#[cfg(test)]
mod tests;

use crate::backends::{ConfigStore, HistoryWriter, MetricCache};
use crate::broker::{Binding, BrokerConnection, RoutingTable, Topology};
use crate::channel::{ChannelConfig, ChannelManager, PublishSink};
use crate::dispatch::RequestDispatcher;
use crate::envelope::Envelope;
use crate::health::{components, HealthRegistry};
use crate::lifecycle::{LifecycleListener, LifecycleTopic};
use crate::observability::{RtsMetrics, StructuredLogger};
use crate::plumber::Plumber;
use crate::pulling::PullingRegistry;
use crate::replies::{PollReplyHandler, ReplyRouter};
use crate::resolver::{CacheFirstResolver, ResolverConfig};
use crate::rts_config::RtsConfigLoader;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Everything tunable about one service instance
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Identity of the instance, also its point-to-point reply key
    pub service_id: String,
    pub channel: ChannelConfig,
    pub resolver: ResolverConfig,
    pub topology: Topology,
    pub routes: RoutingTable,
    /// Write background poll results to the time-series store
    pub history_enabled: bool,
}

impl ServiceSettings {
    pub fn new(service_id: impl Into<String>) -> Self {
        let service_id = service_id.into();
        Self {
            resolver: ResolverConfig::default().with_reply_routing_key(service_id.clone()),
            service_id,
            channel: ChannelConfig::default(),
            topology: Topology::default(),
            routes: RoutingTable::default(),
            history_enabled: false,
        }
    }
}

/// External systems the core talks to
#[derive(Clone)]
pub struct Collaborators {
    pub broker: Arc<dyn BrokerConnection>,
    pub cache: Arc<dyn MetricCache>,
    pub store: Arc<dyn ConfigStore>,
    pub history: Option<Arc<dyn HistoryWriter>>,
}

/// A running real-time service
pub struct RtsService {
    channels: ChannelManager,
    resolver: Arc<CacheFirstResolver>,
    health: HealthRegistry,
    tasks: Vec<JoinHandle<()>>,
}

impl RtsService {
    /// Start every component; must be called inside a tokio runtime
    pub async fn start(
        settings: ServiceSettings,
        collaborators: Collaborators,
        health: HealthRegistry,
    ) -> Self {
        let metrics = RtsMetrics::new();
        let logger = StructuredLogger::new(settings.service_id.clone());
        let topology = &settings.topology;
        health.register_all().await;

        let (shutdown, _) = broadcast::channel(1);
        let channels = ChannelManager::start(
            collaborators.broker.clone(),
            settings.channel.clone(),
            shutdown,
            metrics.clone(),
            health.clone(),
        );

        let registry = PullingRegistry::new(
            channels.publisher(),
            topology,
            settings.resolver.message_ttl,
            metrics.clone(),
            logger.clone(),
        );
        let loader = RtsConfigLoader::new(collaborators.cache.clone(), collaborators.store.clone());
        let plumber = Arc::new(Plumber::<Envelope>::new());

        let resolver = Arc::new(CacheFirstResolver::new(
            collaborators.cache.clone(),
            loader.clone(),
            registry,
            channels.publisher(),
            plumber.clone(),
            settings.routes.clone(),
            topology,
            settings.resolver.clone(),
            metrics.clone(),
            logger.clone(),
        ));

        let mut tasks = Vec::new();

        let replies = channels.listen(Binding::direct(
            topology.response_exchange.clone(),
            topology.reply_queue(&settings.service_id),
            settings.resolver.reply_routing_key.clone(),
        ));
        tasks.push(ReplyRouter::new(plumber, metrics.clone()).spawn(replies));

        let polls = channels.listen(Binding::direct(
            topology.response_exchange.clone(),
            topology.poll_reply_queue.clone(),
            topology.poll_reply_key.clone(),
        ));
        let history = if settings.history_enabled {
            collaborators.history.clone()
        } else {
            None
        };
        tasks.push(
            PollReplyHandler::new(
                collaborators.cache.clone(),
                loader.clone(),
                history,
                metrics.clone(),
            )
            .spawn(polls),
        );

        let lifecycle = LifecycleTopic::ALL
            .iter()
            .map(|topic| {
                let binding = Binding::fanout(topic.exchange(&topology.lifecycle));
                (*topic, channels.listen(binding))
            })
            .collect();
        tasks.push(
            LifecycleListener::new(
                resolver.clone(),
                loader,
                health.clone(),
                metrics.clone(),
                logger.clone(),
            )
            .spawn(lifecycle),
        );

        let requests = channels.listen(Binding::direct(
            topology.request_exchange.clone(),
            topology.request_queue.clone(),
            topology.request_routing_key.clone(),
        ));
        tasks.push(
            RequestDispatcher::new(
                resolver.clone(),
                channels.publisher(),
                topology.response_exchange.clone(),
                metrics,
            )
            .spawn(requests),
        );

        match resolver.reload_from_store().await {
            Ok(scheduled) => info!(scheduled = scheduled, "Warm start complete"),
            Err(e) => {
                warn!(error = %e, "Warm start failed, pulling groups start empty");
                health
                    .set_degraded(components::RESOLVER, format!("Warm start failed: {e}"))
                    .await;
            }
        }
        health.set_ready(true).await;

        Self {
            channels,
            resolver,
            health,
            tasks,
        }
    }

    pub fn resolver(&self) -> &Arc<CacheFirstResolver> {
        &self.resolver
    }

    pub fn registry(&self) -> &PullingRegistry {
        self.resolver.registry()
    }

    pub fn publisher(&self) -> PublishSink {
        self.channels.publisher()
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Stop tickers, subscriptions and senders, then wait for the handlers
    pub async fn shutdown(self) {
        self.health.set_ready(false).await;
        self.resolver.registry().shutdown();
        self.channels.shutdown().await;
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Real-time service stopped");
    }
}
