//! Core data models for the real-time service
//!
//! Every payload that crosses the broker is encoded field-by-field in
//! declaration order, so the order of struct fields here is part of the
//! wire contract with the translator services.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Kind of device container a metric belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerType {
    Generic,
    SnmpV1,
    SnmpV2c,
    SnmpV3,
    FlexLegacy,
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerType::Generic => write!(f, "generic"),
            ContainerType::SnmpV1 => write!(f, "snmpv1"),
            ContainerType::SnmpV2c => write!(f, "snmpv2c"),
            ContainerType::SnmpV3 => write!(f, "snmpv3"),
            ContainerType::FlexLegacy => write!(f, "flex-legacy"),
        }
    }
}

/// Value type of a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    Int,
    Float,
    Text,
    Bool,
}

/// One metric and enough protocol context to route a fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRequest {
    pub container_id: i32,
    pub container_type: ContainerType,
    pub metric_id: i32,
    pub metric_type: MetricType,
    pub data_policy_id: i32,
}

/// Metric id and type pair carried in a batched fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSelector {
    pub id: i32,
    pub metric_type: MetricType,
}

/// Batched fetch for several metrics of one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsRequest {
    pub container_id: i32,
    pub container_type: ContainerType,
    pub metrics: Vec<MetricSelector>,
}

/// A sampled metric value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

/// Translator reply for a single metric
///
/// `value` is `None` when the device has no value for the metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDataResponse {
    pub container_id: i32,
    pub metric_id: i32,
    pub metric_type: MetricType,
    pub value: Option<MetricValue>,
    pub timestamp: i64,
}

impl MetricDataResponse {
    /// Response carrying no value, used when a fetch cannot be routed
    pub fn no_data(request: &MetricRequest) -> Self {
        Self {
            container_id: request.container_id,
            metric_id: request.metric_id,
            metric_type: request.metric_type,
            value: None,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Translator reply for a batched fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDataResponses {
    pub container_id: i32,
    pub responses: Vec<MetricDataResponse>,
}

/// Real-time settings of a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtsMetricConfig {
    /// Polls left before a pulling entry expires
    pub pulling_times: u16,
    /// Validity of a cached value
    pub cache_duration: Duration,
}

/// Container level polling settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRtsInfo {
    pub pulling_interval: Duration,
}

/// Payload of the container lifecycle broadcasts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerNotice {
    pub container_id: i32,
}

/// Payload of the metric lifecycle broadcasts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricNotice {
    pub container_id: i32,
    pub metric_id: i32,
}

/// Payload of the data policy lifecycle broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPolicyNotice {
    pub data_policy_id: i32,
}
