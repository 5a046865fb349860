//! Resilient broker channels
//!
//! This module provides:
//! - Subscriptions that re-declare themselves after the broker cancels or
//!   closes them, so consumers see one uninterrupted delivery queue
//! - A shared publish sink drained by background sender tasks
//! - Broker health derived from how many subscriptions are down

use crate::broker::{Binding, BrokerConnection, Delivery, Publishing};
use crate::error::{RtsError, RtsResult};
use crate::health::{components, HealthRegistry};
use crate::observability::RtsMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for broker channels
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Fixed pause before re-declaring a lost subscription
    pub reconnect_delay: Duration,
    /// Number of background tasks draining the publish sink
    pub sender_count: usize,
    /// Capacity of the publish sink
    pub publish_buffer: usize,
    /// Capacity of each subscription's delivery queue
    pub delivery_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            sender_count: 2,
            publish_buffer: 1024,
            delivery_buffer: 1024,
        }
    }
}

/// Cloneable handle for publishing through the background senders
#[derive(Clone, Debug)]
pub struct PublishSink {
    tx: mpsc::Sender<Publishing>,
}

impl PublishSink {
    /// Create a sink and the receiving end the senders drain
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Publishing>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    /// Queue a message for publishing
    pub async fn publish(&self, publishing: Publishing) -> RtsResult<()> {
        self.tx
            .send(publishing)
            .await
            .map_err(|_| RtsError::ChannelClosed)
    }
}

/// Always-on delivery stream of one logical subscription
///
/// `recv` only returns `None` after shutdown.
pub struct Subscription {
    deliveries: mpsc::Receiver<Delivery>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }

    /// Split into the delivery queue and the task keeping it alive
    pub fn into_parts(self) -> (mpsc::Receiver<Delivery>, JoinHandle<()>) {
        (self.deliveries, self.task)
    }
}

/// Keeps the BROKER component degraded while any subscription is down
#[derive(Clone)]
struct BrokerHealth {
    health: HealthRegistry,
    down: Arc<Mutex<usize>>,
}

impl BrokerHealth {
    fn new(health: HealthRegistry) -> Self {
        Self {
            health,
            down: Arc::new(Mutex::new(0)),
        }
    }

    async fn lost(&self, exchange: &str) {
        let mut down = self.down.lock().await;
        *down += 1;
        self.health
            .set_degraded(
                components::BROKER,
                format!("{} subscription(s) down, last lost on {exchange}", *down),
            )
            .await;
    }

    async fn restored(&self) {
        let mut down = self.down.lock().await;
        *down = down.saturating_sub(1);
        if *down == 0 {
            self.health.set_healthy(components::BROKER).await;
        }
    }
}

/// Owns the broker connection for the service
pub struct ChannelManager {
    broker: Arc<dyn BrokerConnection>,
    config: ChannelConfig,
    sink: PublishSink,
    shutdown: broadcast::Sender<()>,
    metrics: RtsMetrics,
    health: BrokerHealth,
    senders: Vec<JoinHandle<()>>,
}

impl ChannelManager {
    /// Start the background senders; must be called inside a tokio runtime
    pub fn start(
        broker: Arc<dyn BrokerConnection>,
        config: ChannelConfig,
        shutdown: broadcast::Sender<()>,
        metrics: RtsMetrics,
        health: HealthRegistry,
    ) -> Self {
        let (sink, rx) = PublishSink::channel(config.publish_buffer);
        let rx = Arc::new(Mutex::new(rx));

        let senders = (0..config.sender_count.max(1))
            .map(|id| {
                tokio::spawn(run_sender(
                    id,
                    broker.clone(),
                    rx.clone(),
                    shutdown.subscribe(),
                    metrics.clone(),
                ))
            })
            .collect();

        info!(
            senders = config.sender_count.max(1),
            reconnect_delay_ms = config.reconnect_delay.as_millis() as u64,
            "Broker channel manager started"
        );

        Self {
            broker,
            config,
            sink,
            shutdown,
            metrics,
            health: BrokerHealth::new(health),
            senders,
        }
    }

    /// Handle for publishing from other components
    pub fn publisher(&self) -> PublishSink {
        self.sink.clone()
    }

    pub async fn publish(&self, publishing: Publishing) -> RtsResult<()> {
        self.sink.publish(publishing).await
    }

    /// Open a subscription that survives cancellation and channel loss
    pub fn listen(&self, binding: Binding) -> Subscription {
        let (tx, deliveries) = mpsc::channel(self.config.delivery_buffer);
        let task = tokio::spawn(run_listener(
            self.broker.clone(),
            binding,
            tx,
            self.shutdown.subscribe(),
            self.config.reconnect_delay,
            self.metrics.clone(),
            self.health.clone(),
        ));
        Subscription { deliveries, task }
    }

    /// Receiver that fires when the service shuts down
    pub fn done(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Stop every listener and sender
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        for sender in self.senders {
            let _ = sender.await;
        }
        info!("Broker channel manager stopped");
    }
}

/// Keep one subscription alive until shutdown
///
/// Reconnection retries forever with a fixed delay; giving up is left to
/// whatever supervises the service.
async fn run_listener(
    broker: Arc<dyn BrokerConnection>,
    binding: Binding,
    out: mpsc::Sender<Delivery>,
    mut shutdown: broadcast::Receiver<()>,
    reconnect_delay: Duration,
    metrics: RtsMetrics,
    health: BrokerHealth,
) {
    let mut failures = 0u32;
    let mut down = false;

    loop {
        match broker.open_consumer(&binding).await.map_err(RtsError::Broker) {
            Ok(mut consumer) => {
                if failures > 0 {
                    info!(
                        exchange = %binding.exchange,
                        queue = %consumer.queue(),
                        attempts = failures,
                        "Subscription re-established"
                    );
                    metrics.inc_channel_reconnects();
                } else {
                    debug!(
                        exchange = %binding.exchange,
                        queue = %consumer.queue(),
                        "Subscription established"
                    );
                }
                failures = 0;
                if down {
                    down = false;
                    health.restored().await;
                }

                loop {
                    tokio::select! {
                        delivery = consumer.recv() => match delivery {
                            Some(delivery) => {
                                if out.send(delivery).await.is_err() {
                                    debug!(exchange = %binding.exchange, "Subscriber dropped, closing listener");
                                    return;
                                }
                            }
                            None => {
                                warn!(
                                    exchange = %binding.exchange,
                                    queue = %consumer.queue(),
                                    "Subscription cancelled by broker"
                                );
                                break;
                            }
                        },
                        _ = shutdown.recv() => {
                            debug!(exchange = %binding.exchange, "Listener shutting down");
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(
                    exchange = %binding.exchange,
                    error = %e,
                    attempt = failures + 1,
                    "Failed to open subscription"
                );
            }
        }

        failures += 1;
        if !down {
            down = true;
            health.lost(&binding.exchange).await;
        }

        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown.recv() => return,
        }
    }
}

async fn publish_one(broker: &dyn BrokerConnection, publishing: Publishing) -> RtsResult<()> {
    broker.publish(publishing).await.map_err(RtsError::Broker)
}

/// Drain the publish sink into the broker; failures are logged and dropped
async fn run_sender(
    id: usize,
    broker: Arc<dyn BrokerConnection>,
    rx: Arc<Mutex<mpsc::Receiver<Publishing>>>,
    mut shutdown: broadcast::Receiver<()>,
    metrics: RtsMetrics,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                publishing = rx.recv() => publishing,
                _ = shutdown.recv() => None,
            }
        };

        let Some(publishing) = next else {
            debug!(sender = id, "Publish sender stopped");
            return;
        };

        if let Err(e) = publish_one(broker.as_ref(), publishing.clone()).await {
            metrics.inc_publish_failures();
            warn!(
                sender = id,
                exchange = %publishing.exchange,
                routing_key = %publishing.routing_key,
                error = %e,
                "Failed to publish message, dropping it"
            );
        }
    }
}
