use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a store or ledger error inside one entity's iteration affects the rest of the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abandon the remaining entities of the cycle and retry on the next one.
    #[default]
    AbortCycle,
    /// Record the failure and keep processing the remaining entities.
    IsolateEntity,
}

/// Compliance monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// PM2.5 strictly above this value is an actual breach and triggers a slash.
    pub actual_penalty_threshold: f64,
    /// Fixed delay between the end of one cycle and the start of the next.
    #[serde(with = "duration_secs")]
    pub monitoring_interval: Duration,
    /// Upper bound of a single slash, in stake minor units.
    pub fixed_slash_amount: u64,
    /// Delay before the first cycle so the rest of the process can finish starting.
    #[serde(with = "duration_secs")]
    pub startup_delay: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            actual_penalty_threshold: 200.0,
            monitoring_interval: Duration::from_secs(3),
            fixed_slash_amount: 10,
            startup_delay: Duration::from_secs(1),
            failure_policy: FailurePolicy::AbortCycle,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|e| {
            serde::de::Error::custom(format!("invalid duration of {secs} seconds: {e}"))
        })
    }
}
