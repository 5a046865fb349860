//! Error types shared by the real-time core

use std::time::Duration;
use thiserror::Error;

pub type RtsResult<T> = std::result::Result<T, RtsError>;

#[derive(Debug, Error)]
pub enum RtsError {
    #[error("failed to encode or decode payload: {0}")]
    Codec(#[from] bincode::Error),

    #[error("publish channel closed")]
    ChannelClosed,

    #[error("broker error: {0}")]
    Broker(#[source] anyhow::Error),

    #[error("no reply for correlation id {correlation_id} within {after:?}")]
    Timeout {
        correlation_id: String,
        after: Duration,
    },

    #[error("{what} {id} has no real-time configuration")]
    NotConfigured { what: &'static str, id: i32 },

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("cache error: {0}")]
    Cache(#[source] anyhow::Error),
}

impl RtsError {
    /// True when the error is a correlated wait that ran out of time
    pub fn is_timeout(&self) -> bool {
        matches!(self, RtsError::Timeout { .. })
    }
}
