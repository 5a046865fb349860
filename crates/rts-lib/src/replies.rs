//! Handling of translator replies
//!
//! Two subscriptions carry replies back to the service:
//! - The point-to-point one, keyed by the service identity, answers
//!   correlated fetches and is handed to the plumber
//! - The shared one answers background polls; nobody waits on those, so
//!   each batched response is written straight into the cache

use crate::backends::{HistoryWriter, MetricCache};
use crate::broker::Delivery;
use crate::channel::Subscription;
use crate::envelope::Envelope;
use crate::models::MetricDataResponses;
use crate::observability::RtsMetrics;
use crate::plumber::Plumber;
use crate::rts_config::RtsConfigLoader;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Routes correlated replies to the task waiting for them
#[derive(Clone)]
pub struct ReplyRouter {
    plumber: Arc<Plumber<Envelope>>,
    metrics: RtsMetrics,
}

impl ReplyRouter {
    pub fn new(plumber: Arc<Plumber<Envelope>>, metrics: RtsMetrics) -> Self {
        Self { plumber, metrics }
    }

    /// Returns false when no task was waiting for the reply
    pub fn route(&self, delivery: Delivery) -> bool {
        let envelope = delivery.envelope;
        if envelope.correlation_id.is_empty() {
            self.metrics.inc_unmatched_replies();
            warn!(routing_key = %delivery.routing_key, "Reply without correlation id, dropping");
            return false;
        }

        let correlation_id = envelope.correlation_id.clone();
        let matched = self.plumber.send(&correlation_id, envelope);
        if !matched {
            self.metrics.inc_unmatched_replies();
            debug!(correlation_id = %correlation_id, "Late or unknown reply discarded");
        }
        matched
    }

    pub fn spawn(self, mut subscription: Subscription) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(delivery) = subscription.recv().await {
                self.route(delivery);
            }
            debug!("Correlated reply router stopped");
        })
    }
}

/// Writes background poll results into the cache
#[derive(Clone)]
pub struct PollReplyHandler {
    cache: Arc<dyn MetricCache>,
    loader: RtsConfigLoader,
    history: Option<Arc<dyn HistoryWriter>>,
    metrics: RtsMetrics,
}

impl PollReplyHandler {
    pub fn new(
        cache: Arc<dyn MetricCache>,
        loader: RtsConfigLoader,
        history: Option<Arc<dyn HistoryWriter>>,
        metrics: RtsMetrics,
    ) -> Self {
        Self {
            cache,
            loader,
            history,
            metrics,
        }
    }

    /// Cache every response of a batched reply; returns how many were stored
    pub async fn handle(&self, delivery: Delivery) -> usize {
        let status = delivery.envelope.status();
        if !status.is_ok() {
            debug!(status = %status, "Poll reply without data");
            return 0;
        }

        let batch: MetricDataResponses = match delivery.envelope.decode() {
            Ok(batch) => batch,
            Err(e) => {
                self.metrics.inc_decode_failures();
                warn!(error = %e, "Failed to decode poll reply, dropping");
                return 0;
            }
        };

        let mut stored = 0;
        for response in &batch.responses {
            let config = match self.loader.metric_config(response.metric_id).await {
                Ok(config) => config,
                Err(e) => {
                    warn!(metric_id = response.metric_id, error = %e, "No cache duration for polled metric");
                    continue;
                }
            };

            let data = match bincode::serialize(response) {
                Ok(data) => data,
                Err(e) => {
                    warn!(metric_id = response.metric_id, error = %e, "Failed to encode polled value");
                    continue;
                }
            };

            match self
                .cache
                .set_metric_data(response.metric_id, data, config.cache_duration)
                .await
            {
                Ok(()) => stored += 1,
                Err(e) => {
                    warn!(metric_id = response.metric_id, error = %e, "Failed to cache polled value");
                    continue;
                }
            }

            if let Some(history) = &self.history {
                if let Err(e) = history.write_point(response).await {
                    warn!(metric_id = response.metric_id, error = %e, "Failed to write history point");
                }
            }
        }

        debug!(
            container_id = batch.container_id,
            received = batch.responses.len(),
            stored = stored,
            "Poll reply cached"
        );
        stored
    }

    pub fn spawn(self, mut subscription: Subscription) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(delivery) = subscription.recv().await {
                self.handle(delivery).await;
            }
            debug!("Poll reply handler stopped");
        })
    }
}
