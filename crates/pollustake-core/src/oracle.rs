use crate::types::{EntityId, Reading};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Breach prediction for the next reading of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub breach_predicted: bool,
    pub predicted_value: f64,
}

impl Forecast {
    /// The non-alerting outcome used whenever the oracle cannot answer.
    pub const FAIL_OPEN: Forecast = Forecast {
        breach_predicted: false,
        predicted_value: 0.0,
    };
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("forecast model unavailable: {0}")]
    Unavailable(String),

    #[error("history window has {actual} readings, oracle expects {expected}")]
    WindowMismatch { expected: usize, actual: usize },

    #[error("prediction failed: {0}")]
    Prediction(String),
}

/// Opaque forecasting model consumed by the monitor.
///
/// Implementations must be deterministic for a fixed model version and identical input.
#[async_trait]
pub trait ForecastOracle: Send + Sync {
    /// Number of readings required by `predict_breach`. Queried once at monitor construction.
    fn lookback(&self) -> usize;

    /// `history` is chronological (oldest first) and exactly `lookback()` long.
    async fn predict_breach(&self, history: &[Reading]) -> Result<Forecast, OracleError>;
}

/// Consult the oracle, converting any failure into [`Forecast::FAIL_OPEN`].
pub async fn predict_fail_open(
    oracle: &dyn ForecastOracle,
    entity_id: &EntityId,
    history: &[Reading],
) -> Forecast {
    match oracle.predict_breach(history).await {
        Ok(forecast) => forecast,
        Err(e) => {
            warn!(entity_id = %entity_id, error = %e, "Forecast oracle failed, assuming no breach");
            Forecast::FAIL_OPEN
        }
    }
}
