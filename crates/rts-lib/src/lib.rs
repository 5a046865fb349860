//! Real-time data acquisition core of the telemetry platform
//!
//! This crate provides the core functionality for:
//! - Broker channels that survive cancellation and reconnects
//! - Correlating asynchronous replies with waiting requests
//! - Background polling of subscribed metrics per container
//! - Cache-first resolution of metric requests
//! - Reacting to container, metric and data policy lifecycle broadcasts
//! - Health checks and observability

pub mod backends;
pub mod broker;
pub mod channel;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod plumber;
pub mod pulling;
pub mod replies;
pub mod resolver;
pub mod rts_config;
pub mod service;

pub use error::{RtsError, RtsResult};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{RtsMetrics, StructuredLogger};
pub use service::{Collaborators, RtsService, ServiceSettings};
