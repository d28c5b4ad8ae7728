use crate::ingest::Channel;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BenchError {
    #[error("invalid session config: {0}")]
    InvalidConfig(String),
    #[error("cannot {action} while session is {status}")]
    InvalidTransition {
        action: &'static str,
        status: &'static str,
    },
    #[error("command rejected: {reason}")]
    UnsafeCommand { reason: String },
}

impl BenchError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Advisory only; ingestion continues while a channel is stale.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("channel {channel} silent for {silent_for_ms}ms")]
pub struct StaleChannelWarning {
    pub channel: Channel,
    pub silent_for_ms: i64,
}
