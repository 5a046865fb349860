//! Lifecycle notification listener
//!
//! One fanout subscription per topic feeds a single handler task. Each
//! broadcast is decoded into a [`LifecycleEvent`] and applied to the
//! pulling registry:
//!
//! | event                 | effect                                      |
//! |-----------------------|---------------------------------------------|
//! | container updated     | stop every group of the container           |
//! | container deleted     | stop every group of the container           |
//! | metric updated        | drop the entry, forget its cached settings  |
//! | metric deleted        | drop the entry, forget its cached settings  |
//! | data policy deleted   | stop every group, rebuild from the store    |

use crate::broker::{Delivery, LifecycleExchanges};
use crate::channel::Subscription;
use crate::error::RtsResult;
use crate::health::{components, HealthRegistry};
use crate::models::{ContainerNotice, DataPolicyNotice, MetricNotice};
use crate::observability::{RtsMetrics, StructuredLogger};
use crate::resolver::CacheFirstResolver;
use crate::rts_config::RtsConfigLoader;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Broadcast topics the listener subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleTopic {
    ContainerUpdated,
    ContainerDeleted,
    MetricUpdated,
    MetricDeleted,
    DataPolicyDeleted,
}

impl LifecycleTopic {
    pub const ALL: [LifecycleTopic; 5] = [
        LifecycleTopic::ContainerUpdated,
        LifecycleTopic::ContainerDeleted,
        LifecycleTopic::MetricUpdated,
        LifecycleTopic::MetricDeleted,
        LifecycleTopic::DataPolicyDeleted,
    ];

    pub fn exchange<'a>(&self, exchanges: &'a LifecycleExchanges) -> &'a str {
        match self {
            LifecycleTopic::ContainerUpdated => &exchanges.container_updated,
            LifecycleTopic::ContainerDeleted => &exchanges.container_deleted,
            LifecycleTopic::MetricUpdated => &exchanges.metric_updated,
            LifecycleTopic::MetricDeleted => &exchanges.metric_deleted,
            LifecycleTopic::DataPolicyDeleted => &exchanges.data_policy_deleted,
        }
    }

    /// Decode a broadcast received on this topic
    pub fn decode(self, delivery: &Delivery) -> RtsResult<LifecycleEvent> {
        let envelope = &delivery.envelope;
        Ok(match self {
            LifecycleTopic::ContainerUpdated => {
                let notice: ContainerNotice = envelope.decode()?;
                LifecycleEvent::ContainerUpdated {
                    container_id: notice.container_id,
                }
            }
            LifecycleTopic::ContainerDeleted => {
                let notice: ContainerNotice = envelope.decode()?;
                LifecycleEvent::ContainerDeleted {
                    container_id: notice.container_id,
                }
            }
            LifecycleTopic::MetricUpdated => {
                let notice: MetricNotice = envelope.decode()?;
                LifecycleEvent::MetricUpdated {
                    container_id: notice.container_id,
                    metric_id: notice.metric_id,
                }
            }
            LifecycleTopic::MetricDeleted => {
                let notice: MetricNotice = envelope.decode()?;
                LifecycleEvent::MetricDeleted {
                    container_id: notice.container_id,
                    metric_id: notice.metric_id,
                }
            }
            LifecycleTopic::DataPolicyDeleted => {
                let notice: DataPolicyNotice = envelope.decode()?;
                LifecycleEvent::DataPolicyDeleted {
                    data_policy_id: notice.data_policy_id,
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    ContainerUpdated { container_id: i32 },
    ContainerDeleted { container_id: i32 },
    MetricUpdated { container_id: i32, metric_id: i32 },
    MetricDeleted { container_id: i32, metric_id: i32 },
    DataPolicyDeleted { data_policy_id: i32 },
}

impl LifecycleEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::ContainerUpdated { .. } => "container_updated",
            LifecycleEvent::ContainerDeleted { .. } => "container_deleted",
            LifecycleEvent::MetricUpdated { .. } => "metric_updated",
            LifecycleEvent::MetricDeleted { .. } => "metric_deleted",
            LifecycleEvent::DataPolicyDeleted { .. } => "data_policy_deleted",
        }
    }

    /// Id of the container, metric or data policy the event is about
    pub fn subject(&self) -> i32 {
        match *self {
            LifecycleEvent::ContainerUpdated { container_id }
            | LifecycleEvent::ContainerDeleted { container_id } => container_id,
            LifecycleEvent::MetricUpdated { metric_id, .. }
            | LifecycleEvent::MetricDeleted { metric_id, .. } => metric_id,
            LifecycleEvent::DataPolicyDeleted { data_policy_id } => data_policy_id,
        }
    }
}

/// Applies lifecycle events to the pulling state
#[derive(Clone)]
pub struct LifecycleListener {
    resolver: Arc<CacheFirstResolver>,
    loader: RtsConfigLoader,
    health: HealthRegistry,
    metrics: RtsMetrics,
    logger: StructuredLogger,
}

impl LifecycleListener {
    pub fn new(
        resolver: Arc<CacheFirstResolver>,
        loader: RtsConfigLoader,
        health: HealthRegistry,
        metrics: RtsMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            resolver,
            loader,
            health,
            metrics,
            logger,
        }
    }

    /// Apply one event; returns how many groups or entries it stopped
    pub async fn apply(&self, event: LifecycleEvent) -> usize {
        let registry = self.resolver.registry();

        let affected = match event {
            LifecycleEvent::ContainerUpdated { container_id }
            | LifecycleEvent::ContainerDeleted { container_id } => {
                registry.stop_container(container_id)
            }
            LifecycleEvent::MetricUpdated { metric_id, .. }
            | LifecycleEvent::MetricDeleted { metric_id, .. } => {
                let removed = registry.remove_metric(metric_id);
                if let Err(e) = self.loader.invalidate(metric_id).await {
                    warn!(metric_id = metric_id, error = %e, "Failed to drop cached real-time config");
                }
                usize::from(removed)
            }
            LifecycleEvent::DataPolicyDeleted { .. } => {
                let stopped = registry.stop_all();
                match self.resolver.reload_from_store().await {
                    Ok(_) => self.health.set_healthy(components::RESOLVER).await,
                    Err(e) => {
                        warn!(error = %e, "Failed to reload pulling groups after data policy deletion");
                        self.health
                            .set_degraded(components::RESOLVER, format!("Reload failed: {e}"))
                            .await;
                    }
                }
                stopped
            }
        };

        self.metrics.inc_lifecycle_event(event.kind());
        self.logger
            .log_lifecycle(event.kind(), event.subject(), affected);
        affected
    }

    /// Merge the topic subscriptions into one handler task
    pub fn spawn(self, subscriptions: Vec<(LifecycleTopic, Subscription)>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel(256);

        for (topic, mut subscription) in subscriptions {
            let tx = tx.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                while let Some(delivery) = subscription.recv().await {
                    match topic.decode(&delivery) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            metrics.inc_decode_failures();
                            warn!(topic = ?topic, error = %e, "Failed to decode lifecycle event, dropping");
                        }
                    }
                }
            });
        }
        drop(tx);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.apply(event).await;
            }
            debug!("Lifecycle listener stopped");
        })
    }
}
