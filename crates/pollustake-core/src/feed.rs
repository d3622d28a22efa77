use crate::types::{EntityId, SensorSample};
use async_trait::async_trait;
use thiserror::Error;

/// Sensor feed failures. The monitor never retries within a cycle.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("no sensor registered for entity '{0}'")]
    UnknownEntity(String),

    #[error("sensor unavailable: {0}")]
    Unavailable(String),

    #[error("sensor misconfigured: {0}")]
    Misconfigured(String),
}

/// Source of one structured reading per entity per cycle.
#[async_trait]
pub trait SensorFeed: Send + Sync {
    async fn next_reading(&self, entity_id: &EntityId) -> Result<SensorSample, FeedError>;
}
