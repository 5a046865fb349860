use crate::broker::Publishing;
use crate::channel::PublishSink;
use crate::envelope::Envelope;
use crate::error::RtsResult;
use async_trait::async_trait;

/// Destination of the answer to one request
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver(&self, reply: Envelope) -> RtsResult<()>;
}

/// Publishes the answer on the response exchange under the requester's key,
/// echoing the request's correlation id
#[derive(Debug, Clone)]
pub struct BrokerReplySink {
    publisher: PublishSink,
    exchange: String,
    routing_key: String,
    correlation_id: String,
}

impl BrokerReplySink {
    pub fn new(
        publisher: PublishSink,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            correlation_id: correlation_id.into(),
        }
    }
}

#[async_trait]
impl ReplySink for BrokerReplySink {
    async fn deliver(&self, reply: Envelope) -> RtsResult<()> {
        let reply = reply.with_correlation_id(self.correlation_id.clone());
        self.publisher
            .publish(Publishing::new(
                self.exchange.clone(),
                self.routing_key.clone(),
                reply,
            ))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::StatusCode;

    #[tokio::test]
    async fn test_reply_echoes_correlation_id() {
        let (publisher, mut rx) = PublishSink::channel(4);
        let sink = BrokerReplySink::new(publisher, "metric.response", "alarms-1", "abc");

        sink.deliver(Envelope::from_body(vec![1], StatusCode::Ok))
            .await
            .unwrap();

        let publishing = rx.recv().await.unwrap();
        assert_eq!(publishing.exchange, "metric.response");
        assert_eq!(publishing.routing_key, "alarms-1");
        assert_eq!(publishing.envelope.correlation_id, "abc");
        assert_eq!(publishing.envelope.body, vec![1]);
    }
}
