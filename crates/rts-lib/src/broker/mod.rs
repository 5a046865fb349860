//! Message broker seam
//!
//! This module provides:
//! - The `BrokerConnection` trait the channel layer talks to
//! - Exchange/queue binding descriptions
//! - An in-process broker used by tests and single-node deployments
//! - The exchange, queue and routing key layout of the platform

mod memory;
mod topology;

pub use memory::MemoryBroker;
pub use topology::{LifecycleExchanges, RoutingTable, Topology};

use crate::envelope::Envelope;
use anyhow::Result;
use tokio::sync::mpsc;

pub use async_trait::async_trait;

/// Exchange routing behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route on exact routing key match
    Direct,
    /// Copy every message to every bound queue
    Fanout,
}

/// Queue to declare for a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueSpec {
    /// Shared, named queue that outlives its consumers when durable
    Named { name: String, durable: bool },
    /// Server-named, non-durable queue private to one consumer
    Exclusive,
}

/// Everything needed to (re)declare a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub kind: ExchangeKind,
    pub queue: QueueSpec,
    pub routing_keys: Vec<String>,
}

impl Binding {
    /// Durable named queue bound to a direct exchange
    pub fn direct(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            kind: ExchangeKind::Direct,
            queue: QueueSpec::Named {
                name: queue.into(),
                durable: true,
            },
            routing_keys: vec![routing_key.into()],
        }
    }

    /// Exclusive auto-named queue on a fanout exchange
    pub fn fanout(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            kind: ExchangeKind::Fanout,
            queue: QueueSpec::Exclusive,
            routing_keys: vec![String::new()],
        }
    }
}

/// Message received from a subscription
#[derive(Debug, Clone)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: Envelope,
}

/// Message to be published
#[derive(Debug, Clone)]
pub struct Publishing {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: Envelope,
}

impl Publishing {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        envelope: Envelope,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            envelope,
        }
    }
}

/// Live consumer on a broker channel
///
/// `recv` returns `None` once the broker cancelled the consumer or the
/// channel closed.
pub struct Consumer {
    queue: String,
    rx: mpsc::Receiver<Delivery>,
}

impl Consumer {
    pub fn new(queue: impl Into<String>, rx: mpsc::Receiver<Delivery>) -> Self {
        Self {
            queue: queue.into(),
            rx,
        }
    }

    /// Name of the queue the consumer reads from
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// Connection to a message broker
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Declare the exchange and queue described by `binding`, bind them and
    /// start consuming
    async fn open_consumer(&self, binding: &Binding) -> Result<Consumer>;

    /// Publish one message
    async fn publish(&self, publishing: Publishing) -> Result<()>;
}
