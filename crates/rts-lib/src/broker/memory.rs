//! In-process broker
//!
//! Implements direct and fanout exchanges, durable named queues that keep a
//! backlog while nobody consumes them, and exclusive queues that vanish with
//! their consumer. Consumers can be cancelled from the "server" side and new
//! connections can be refused, which lets the reconnect path be exercised
//! without a real broker.

use super::{
    async_trait, Binding, BrokerConnection, Consumer, Delivery, ExchangeKind, Publishing, QueueSpec,
};
use crate::envelope::Envelope;
use anyhow::{bail, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CONSUMER_BUFFER: usize = 1024;
const MAX_BACKLOG: usize = 10_000;

#[derive(Default)]
struct QueueState {
    exclusive: bool,
    consumers: Vec<mpsc::Sender<Delivery>>,
    next_consumer: usize,
    backlog: VecDeque<Delivery>,
}

impl QueueState {
    /// Hand a delivery to the next live consumer, round robin
    fn deliver(&mut self, delivery: Delivery) -> Option<Delivery> {
        self.consumers.retain(|tx| !tx.is_closed());
        if self.consumers.is_empty() {
            return Some(delivery);
        }

        let idx = self.next_consumer % self.consumers.len();
        self.next_consumer = self.next_consumer.wrapping_add(1);
        match self.consumers[idx].try_send(delivery) {
            Ok(()) => None,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Consumer buffer full, dropping delivery");
                None
            }
            Err(mpsc::error::TrySendError::Closed(delivery)) => Some(delivery),
        }
    }
}

struct BindingEntry {
    exchange: String,
    routing_key: String,
    queue: String,
}

#[derive(Default)]
struct MemoryState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingEntry>,
    next_auto_queue: u64,
    refuse_connections: bool,
}

impl MemoryState {
    fn drop_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|b| b.queue != name);
    }
}

/// Broker living inside the current process
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel every consumer, as a broker does when a channel is closed on
    /// its side. Exclusive queues are deleted, durable ones keep their
    /// backlog.
    pub fn cancel_all_consumers(&self) {
        let mut state = self.state();
        let exclusive: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.exclusive)
            .map(|(name, _)| name.clone())
            .collect();
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
        for name in exclusive {
            state.drop_queue(&name);
        }
        debug!("Cancelled all consumers");
    }

    /// Refuse (or accept again) new consumers, simulating a broker outage
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }

    /// Number of live consumers on a queue
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Number of messages waiting on a queue with no consumer
    pub fn backlog_len(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.backlog.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BrokerConnection for MemoryBroker {
    async fn open_consumer(&self, binding: &Binding) -> Result<Consumer> {
        let mut state = self.state();

        if state.refuse_connections {
            bail!("broker is not accepting connections");
        }

        match state.exchanges.get(&binding.exchange).copied() {
            Some(kind) if kind != binding.kind => {
                bail!(
                    "exchange {} already declared as {:?}",
                    binding.exchange,
                    kind
                );
            }
            Some(_) => {}
            None => {
                state
                    .exchanges
                    .insert(binding.exchange.clone(), binding.kind);
            }
        }

        let (queue_name, exclusive) = match &binding.queue {
            QueueSpec::Named { name, .. } => (name.clone(), false),
            QueueSpec::Exclusive => {
                state.next_auto_queue += 1;
                (format!("amq.gen-{}", state.next_auto_queue), true)
            }
        };

        for key in &binding.routing_keys {
            let exists = state.bindings.iter().any(|b| {
                b.exchange == binding.exchange && b.routing_key == *key && b.queue == queue_name
            });
            if !exists {
                state.bindings.push(BindingEntry {
                    exchange: binding.exchange.clone(),
                    routing_key: key.clone(),
                    queue: queue_name.clone(),
                });
            }
        }

        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        let queue = state.queues.entry(queue_name.clone()).or_default();
        queue.exclusive = exclusive;

        // Flush whatever piled up while the queue had no consumer
        while let Some(delivery) = queue.backlog.pop_front() {
            if tx.try_send(delivery).is_err() {
                break;
            }
        }
        queue.consumers.push(tx);

        debug!(queue = %queue_name, exchange = %binding.exchange, "Consumer opened");
        Ok(Consumer::new(queue_name, rx))
    }

    async fn publish(&self, publishing: Publishing) -> Result<()> {
        let mut state = self.state();

        if state.refuse_connections {
            bail!("broker is not accepting connections");
        }

        let Some(kind) = state.exchanges.get(&publishing.exchange).copied() else {
            debug!(exchange = %publishing.exchange, "Unroutable message dropped, no such exchange");
            return Ok(());
        };

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == publishing.exchange)
            .filter(|b| kind == ExchangeKind::Fanout || b.routing_key == publishing.routing_key)
            .map(|b| b.queue.clone())
            .collect();

        // Every queue gets its own copy of the frame
        let frame = publishing.envelope.to_bytes()?;

        for queue_name in targets {
            let delivery = Delivery {
                exchange: publishing.exchange.clone(),
                routing_key: publishing.routing_key.clone(),
                envelope: Envelope::from_bytes(&frame)?,
            };
            let Some(queue) = state.queues.get_mut(&queue_name) else {
                continue;
            };
            if let Some(undelivered) = queue.deliver(delivery) {
                if queue.exclusive {
                    continue;
                }
                if queue.backlog.len() >= MAX_BACKLOG {
                    queue.backlog.pop_front();
                }
                queue.backlog.push_back(undelivered);
            }
        }

        Ok(())
    }
}
