//! Exchange, queue and routing key layout

use crate::models::ContainerType;
use std::collections::HashMap;

/// Fanout exchanges carrying lifecycle broadcasts
#[derive(Debug, Clone)]
pub struct LifecycleExchanges {
    pub container_updated: String,
    pub container_deleted: String,
    pub metric_updated: String,
    pub metric_deleted: String,
    pub data_policy_deleted: String,
}

impl Default for LifecycleExchanges {
    fn default() -> Self {
        Self {
            container_updated: "container.updated".to_string(),
            container_deleted: "container.deleted".to_string(),
            metric_updated: "metric.updated".to_string(),
            metric_deleted: "metric.deleted".to_string(),
            data_policy_deleted: "data_policy.deleted".to_string(),
        }
    }
}

/// Logical broker layout used by the real-time service
#[derive(Debug, Clone)]
pub struct Topology {
    /// Direct exchange translators consume fetch requests from, keyed by protocol
    pub fetch_exchange: String,
    /// Direct exchange translators publish replies to
    pub response_exchange: String,
    /// Direct exchange other services send metric requests to
    pub request_exchange: String,
    /// Queue and routing key of inbound metric requests
    pub request_queue: String,
    pub request_routing_key: String,
    /// Shared routing key of fire-and-forget background poll replies
    pub poll_reply_key: String,
    pub poll_reply_queue: String,
    pub lifecycle: LifecycleExchanges,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            fetch_exchange: "metric.fetch".to_string(),
            response_exchange: "metric.response".to_string(),
            request_exchange: "rts.request".to_string(),
            request_queue: "rts.metric.request".to_string(),
            request_routing_key: "rts".to_string(),
            poll_reply_key: "rts".to_string(),
            poll_reply_queue: "rts.poll.response".to_string(),
            lifecycle: LifecycleExchanges::default(),
        }
    }
}

impl Topology {
    /// Private reply queue of one service instance
    pub fn reply_queue(&self, service_id: &str) -> String {
        format!("{}.{}", self.response_exchange, service_id)
    }
}

/// Maps container types to the routing key of the translator serving them
#[derive(Debug, Clone)]
pub struct RoutingTable {
    keys: HashMap<ContainerType, String>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        let mut keys = HashMap::new();
        keys.insert(ContainerType::SnmpV1, "snmp".to_string());
        keys.insert(ContainerType::SnmpV2c, "snmp".to_string());
        keys.insert(ContainerType::SnmpV3, "snmp".to_string());
        keys.insert(ContainerType::FlexLegacy, "flex-legacy".to_string());
        Self { keys }
    }
}

impl RoutingTable {
    /// Table with no routes at all
    pub fn empty() -> Self {
        Self {
            keys: HashMap::new(),
        }
    }

    pub fn with_route(mut self, container_type: ContainerType, key: impl Into<String>) -> Self {
        self.keys.insert(container_type, key.into());
        self
    }

    pub fn routing_key(&self, container_type: ContainerType) -> Option<&str> {
        self.keys.get(&container_type).map(String::as_str)
    }
}
