//! Transport envelope codec
//!
//! Wraps typed payloads into the broker message format. The body is a
//! compact binary encoding in which structs are written as their fields
//! in declaration order, without field names. The status of a message
//! travels as a small integer rendered into the `msg_type` string.

use crate::error::RtsResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Status code carried in the message type field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusCode {
    #[default]
    Untyped,
    Ok,
    InvalidBody,
    NotFound,
    Failed,
    InternalError,
}

impl StatusCode {
    pub fn code(self) -> u8 {
        match self {
            StatusCode::Untyped => 0,
            StatusCode::Ok => 1,
            StatusCode::InvalidBody => 2,
            StatusCode::NotFound => 3,
            StatusCode::Failed => 4,
            StatusCode::InternalError => 5,
        }
    }

    /// Parse a message type field; anything unknown is `Untyped`
    pub fn from_type(msg_type: &str) -> Self {
        match msg_type.trim().parse::<u8>() {
            Ok(1) => StatusCode::Ok,
            Ok(2) => StatusCode::InvalidBody,
            Ok(3) => StatusCode::NotFound,
            Ok(4) => StatusCode::Failed,
            Ok(5) => StatusCode::InternalError,
            _ => StatusCode::Untyped,
        }
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Routing header telling the consumer where to send its reply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHeader {
    pub routing_key: String,
}

/// Broker message envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_type: String,
    pub correlation_id: String,
    pub routing_header: RoutingHeader,
    pub expiration: String,
    pub body: Vec<u8>,
}

impl Envelope {
    /// Encode a payload into a new envelope tagged with `status`
    pub fn encode<T: Serialize>(payload: &T, status: StatusCode) -> RtsResult<Self> {
        Ok(Self {
            msg_type: status.to_string(),
            body: bincode::serialize(payload)?,
            ..Default::default()
        })
    }

    /// Wrap an already encoded body, such as a cached payload
    pub fn from_body(body: Vec<u8>, status: StatusCode) -> Self {
        Self {
            msg_type: status.to_string(),
            body,
            ..Default::default()
        }
    }

    /// Decode the body as `T`
    pub fn decode<T: DeserializeOwned>(&self) -> RtsResult<T> {
        Ok(bincode::deserialize(&self.body)?)
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Set the routing key the consumer should reply to
    pub fn reply_to(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_header.routing_key = routing_key.into();
        self
    }

    /// Set the broker-side message TTL, rendered in milliseconds
    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = ttl.as_millis().to_string();
        self
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_type(&self.msg_type)
    }

    pub fn reply_routing_key(&self) -> Option<&str> {
        let key = self.routing_header.routing_key.as_str();
        (!key.is_empty()).then_some(key)
    }

    /// Serialize the whole envelope into a wire frame
    pub fn to_bytes(&self) -> RtsResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parse a wire frame produced by [`Envelope::to_bytes`]
    pub fn from_bytes(frame: &[u8]) -> RtsResult<Self> {
        Ok(bincode::deserialize(frame)?)
    }
}
