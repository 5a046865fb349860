//! Correlation plumber
//!
//! Lets a task publish a request and then wait for the asynchronous reply
//! that carries the same correlation id. Each `listen` owns a single-slot
//! registration that is removed again before `listen` returns, whatever
//! the outcome.
//!
//! Only one `listen` per correlation id may be outstanding. A second
//! registration under the same id replaces the first, which then times out.

use crate::error::{RtsError, RtsResult};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

struct Waiter<T> {
    ticket: u64,
    slot: oneshot::Sender<T>,
}

struct Registry<T> {
    next_ticket: u64,
    waiters: HashMap<String, Waiter<T>>,
}

/// Registry of tasks waiting for correlated replies
pub struct Plumber<T> {
    registry: Mutex<Registry<T>>,
}

impl<T> Default for Plumber<T> {
    fn default() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_ticket: 0,
                waiters: HashMap::new(),
            }),
        }
    }
}

impl<T: Send> Plumber<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the reply correlated by `correlation_id`, at most `timeout`
    pub async fn listen(&self, correlation_id: &str, timeout: Duration) -> RtsResult<T> {
        let (tx, rx) = oneshot::channel();
        let ticket = {
            let mut registry = self.registry();
            registry.next_ticket = registry.next_ticket.wrapping_add(1);
            let ticket = registry.next_ticket;
            registry.waiters.insert(
                correlation_id.to_string(),
                Waiter { ticket, slot: tx },
            );
            ticket
        };

        let outcome = tokio::time::timeout(timeout, rx).await;

        // Only remove our own registration, a newer listen may own the id now
        {
            let mut registry = self.registry();
            if registry
                .waiters
                .get(correlation_id)
                .is_some_and(|w| w.ticket == ticket)
            {
                registry.waiters.remove(correlation_id);
            }
        }

        match outcome {
            Ok(Ok(payload)) => Ok(payload),
            // Sender dropped: our registration was replaced
            Ok(Err(_)) | Err(_) => {
                debug!(correlation_id = %correlation_id, timeout_ms = timeout.as_millis() as u64, "Correlated wait expired");
                Err(RtsError::Timeout {
                    correlation_id: correlation_id.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Hand `payload` to the task waiting on `correlation_id`
    ///
    /// Returns false when nobody is waiting, in which case the payload is
    /// discarded.
    pub fn send(&self, correlation_id: &str, payload: T) -> bool {
        let waiter = self.registry().waiters.remove(correlation_id);
        match waiter {
            Some(waiter) => waiter.slot.send(payload).is_ok(),
            None => {
                trace!(correlation_id = %correlation_id, "No waiter for reply, discarding");
                false
            }
        }
    }

    /// Number of registered waiters
    pub fn pending(&self) -> usize {
        self.registry().waiters.len()
    }
}
