use crate::oracle::Forecast;
use crate::types::ComplianceStatus;

/// Outcome of evaluating one reading against the two-tier policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Tier 2: the current reading is above the penalty threshold.
    ActualBreach { pm2_5: f64 },
    /// Tier 1 could not run: fewer readings than the oracle's lookback.
    InsufficientHistory { available: usize, required: usize },
    /// Tier 1 ran and produced a forecast.
    Forecast(Forecast),
}

impl Verdict {
    /// Status implied by this verdict. Never depends on the previous status.
    pub fn status(&self) -> ComplianceStatus {
        match self {
            Self::ActualBreach { .. } => ComplianceStatus::Penalty,
            Self::InsufficientHistory { .. } => ComplianceStatus::Normal,
            Self::Forecast(forecast) if forecast.breach_predicted => ComplianceStatus::Alert,
            Self::Forecast(_) => ComplianceStatus::Normal,
        }
    }
}

/// Actual-breach rule. The forecast threshold belongs to the oracle, not here.
#[derive(Debug, Clone, Copy)]
pub struct BreachPolicy {
    pub actual_penalty_threshold: f64,
}

impl BreachPolicy {
    pub fn new(actual_penalty_threshold: f64) -> Self {
        Self {
            actual_penalty_threshold,
        }
    }

    pub fn is_actual_breach(&self, pm2_5: f64) -> bool {
        pm2_5 > self.actual_penalty_threshold
    }

    /// Pure transition function. `forecast` is only consulted when tier 2 does not
    /// fire and the history window is complete.
    pub fn evaluate(
        &self,
        pm2_5: f64,
        available: usize,
        required: usize,
        forecast: Option<Forecast>,
    ) -> Verdict {
        if self.is_actual_breach(pm2_5) {
            return Verdict::ActualBreach { pm2_5 };
        }
        match forecast {
            Some(forecast) if available >= required => Verdict::Forecast(forecast),
            _ => Verdict::InsufficientHistory {
                available,
                required,
            },
        }
    }
}
