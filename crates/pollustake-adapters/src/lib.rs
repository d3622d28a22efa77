//! Sensor feed and forecast oracle adapters for PolluStake.

#![deny(unsafe_code)]

use async_trait::async_trait;
use pollustake_core::{
    EntityId, FeedError, Forecast, ForecastOracle, OracleError, Reading, SensorFeed, SensorSample,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Emission profile of one simulated stack.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulatorProfile {
    /// Level the walk reverts towards.
    pub base_level: f64,
    /// Probability that a reading is a spike instead of a walk step.
    pub spike_chance: f64,
    /// Readings are clamped to `[0, max_level]`.
    pub max_level: f64,
    /// Fraction of the distance to `base_level` recovered each step.
    pub reversion: f64,
    /// Half-width of the uniform step noise.
    pub step: f64,
}

impl SimulatorProfile {
    pub fn new(base_level: f64, spike_chance: f64, max_level: f64) -> Self {
        Self {
            base_level,
            spike_chance: spike_chance.clamp(0.0, 1.0),
            max_level,
            reversion: 0.2,
            step: 8.0,
        }
    }

    /// Heavy industry with frequent spikes.
    pub fn steel_plant() -> Self {
        Self::new(80.0, 0.05, 220.0)
    }

    pub fn cement_works() -> Self {
        Self::new(60.0, 0.02, 220.0)
    }

    /// Reject profiles the walk cannot sample from. Deserialized profiles
    /// bypass the clamping in [`SimulatorProfile::new`].
    pub fn validate(&self) -> Result<(), FeedError> {
        let fields = [
            ("base_level", self.base_level),
            ("spike_chance", self.spike_chance),
            ("max_level", self.max_level),
            ("reversion", self.reversion),
            ("step", self.step),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, value)| !value.is_finite()) {
            return Err(FeedError::Misconfigured(format!("{name} must be finite")));
        }
        if !(0.0..=1.0).contains(&self.spike_chance) {
            return Err(FeedError::Misconfigured(format!(
                "spike_chance {} is outside [0, 1]",
                self.spike_chance
            )));
        }
        if !(0.0..=1.0).contains(&self.reversion) {
            return Err(FeedError::Misconfigured(format!(
                "reversion {} is outside [0, 1]",
                self.reversion
            )));
        }
        if self.max_level < 0.0 {
            return Err(FeedError::Misconfigured(format!(
                "max_level {} is negative",
                self.max_level
            )));
        }
        if self.step < 0.0 {
            return Err(FeedError::Misconfigured(format!(
                "step {} is negative",
                self.step
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct WalkState {
    rng: StdRng,
    levels: HashMap<EntityId, f64>,
}

/// Mean-reverting random walk with occasional spikes, one walk per entity.
///
/// SO2 and NOx are derived from PM2.5 with a little noise. A fixed seed makes
/// the whole sequence reproducible.
#[derive(Debug)]
pub struct RandomWalkSensorFeed {
    profiles: HashMap<EntityId, SimulatorProfile>,
    state: Mutex<WalkState>,
}

impl RandomWalkSensorFeed {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            profiles: HashMap::new(),
            state: Mutex::new(WalkState {
                rng,
                levels: HashMap::new(),
            }),
        }
    }

    pub fn with_profile(
        mut self,
        entity_id: EntityId,
        profile: SimulatorProfile,
    ) -> Result<Self, FeedError> {
        if let Err(FeedError::Misconfigured(reason)) = profile.validate() {
            return Err(FeedError::Misconfigured(format!(
                "profile for '{entity_id}': {reason}"
            )));
        }
        self.profiles.insert(entity_id, profile);
        Ok(self)
    }
}

#[async_trait]
impl SensorFeed for RandomWalkSensorFeed {
    async fn next_reading(&self, entity_id: &EntityId) -> Result<SensorSample, FeedError> {
        let profile = self
            .profiles
            .get(entity_id)
            .ok_or_else(|| FeedError::UnknownEntity(entity_id.to_string()))?;

        let mut state = self
            .state
            .lock()
            .map_err(|_| FeedError::Unavailable("simulator state poisoned".to_string()))?;
        let WalkState { rng, levels } = &mut *state;

        let previous = *levels
            .entry(entity_id.clone())
            .or_insert(profile.base_level);
        let pm2_5 = if rng.gen_bool(profile.spike_chance) {
            rng.gen_range(profile.max_level * 0.85..=profile.max_level)
        } else {
            let pull = profile.reversion * (profile.base_level - previous);
            previous + pull + rng.gen_range(-profile.step..=profile.step)
        }
        .clamp(0.0, profile.max_level);
        levels.insert(entity_id.clone(), pm2_5);

        let so2 = (pm2_5 * 0.12 + rng.gen_range(-1.5..=1.5)).max(0.0);
        let nox = (pm2_5 * 0.25 + rng.gen_range(-3.0..=3.0)).max(0.0);
        let sample = SensorSample::new(round2(pm2_5), round2(so2), round2(nox));
        debug!(entity_id = %entity_id, pm2_5 = sample.pm2_5, "Simulated reading");
        Ok(sample)
    }
}

/// Least-squares trend oracle: fits a line through the window and extrapolates
/// one step ahead.
#[derive(Debug, Clone)]
pub struct TrendForecastOracle {
    lookback: usize,
    forecast_alert_threshold: f64,
}

impl TrendForecastOracle {
    pub const DEFAULT_LOOKBACK: usize = 10;
    pub const DEFAULT_ALERT_THRESHOLD: f64 = 150.0;

    pub fn new(lookback: usize, forecast_alert_threshold: f64) -> Self {
        Self {
            lookback,
            forecast_alert_threshold,
        }
    }

    fn extrapolate(values: &[f64]) -> f64 {
        let n = values.len() as f64;
        if values.len() < 2 {
            return values.first().copied().unwrap_or_default();
        }
        let mean_x = (n - 1.0) / 2.0;
        let mean_y = values.iter().sum::<f64>() / n;
        let (mut covariance, mut variance) = (0.0, 0.0);
        for (i, y) in values.iter().enumerate() {
            let dx = i as f64 - mean_x;
            covariance += dx * (y - mean_y);
            variance += dx * dx;
        }
        let slope = covariance / variance;
        mean_y + slope * (n - mean_x)
    }
}

impl Default for TrendForecastOracle {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LOOKBACK, Self::DEFAULT_ALERT_THRESHOLD)
    }
}

#[async_trait]
impl ForecastOracle for TrendForecastOracle {
    fn lookback(&self) -> usize {
        self.lookback
    }

    async fn predict_breach(&self, history: &[Reading]) -> Result<Forecast, OracleError> {
        if history.len() != self.lookback {
            return Err(OracleError::WindowMismatch {
                expected: self.lookback,
                actual: history.len(),
            });
        }
        let values: Vec<f64> = history.iter().map(|reading| reading.pm2_5).collect();
        if values.iter().any(|value| !value.is_finite()) {
            return Err(OracleError::Prediction(
                "history contains non-finite readings".to_string(),
            ));
        }

        let predicted_value = round2(Self::extrapolate(&values).max(0.0));
        Ok(Forecast {
            breach_predicted: predicted_value > self.forecast_alert_threshold,
            predicted_value,
        })
    }
}

/// Feed that never produces a reading. Chaos fixture.
#[derive(Debug, Clone)]
pub struct AlwaysFailFeed {
    reason: String,
}

impl AlwaysFailFeed {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl SensorFeed for AlwaysFailFeed {
    async fn next_reading(&self, entity_id: &EntityId) -> Result<SensorSample, FeedError> {
        Err(FeedError::Unavailable(format!("{} ({entity_id})", self.reason)))
    }
}

/// Oracle whose model never loaded.
#[derive(Debug, Clone)]
pub struct UnavailableOracle {
    lookback: usize,
}

impl UnavailableOracle {
    pub fn new(lookback: usize) -> Self {
        Self { lookback }
    }
}

#[async_trait]
impl ForecastOracle for UnavailableOracle {
    fn lookback(&self) -> usize {
        self.lookback
    }

    async fn predict_breach(&self, _history: &[Reading]) -> Result<Forecast, OracleError> {
        Err(OracleError::Unavailable("model weights not loaded".to_string()))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn window(values: &[f64]) -> Vec<Reading> {
        values
            .iter()
            .map(|pm2_5| Reading {
                entity_id: EntityId::new("factory-001"),
                pm2_5: *pm2_5,
                so2: 0.0,
                nox: 0.0,
                recorded_at: Utc::now(),
            })
            .collect()
    }

    #[tokio::test]
    async fn rising_trend_predicts_breach() {
        let oracle = TrendForecastOracle::new(4, 150.0);
        let forecast = oracle
            .predict_breach(&window(&[120.0, 130.0, 140.0, 150.0]))
            .await
            .unwrap();
        assert!(forecast.breach_predicted);
        assert_eq!(forecast.predicted_value, 160.0);
    }

    #[tokio::test]
    async fn flat_window_predicts_same_level() {
        let oracle = TrendForecastOracle::new(3, 150.0);
        let forecast = oracle
            .predict_breach(&window(&[90.0, 90.0, 90.0]))
            .await
            .unwrap();
        assert!(!forecast.breach_predicted);
        assert_eq!(forecast.predicted_value, 90.0);
    }

    #[tokio::test]
    async fn forecast_is_deterministic() {
        let oracle = TrendForecastOracle::default();
        let history = window(&[81.3, 95.1, 77.0, 102.4, 88.8, 91.2, 99.9, 110.5, 104.1, 120.7]);
        let a = oracle.predict_breach(&history).await.unwrap();
        let b = oracle.predict_breach(&history).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn prediction_never_goes_negative() {
        let oracle = TrendForecastOracle::new(3, 150.0);
        let forecast = oracle
            .predict_breach(&window(&[40.0, 20.0, 0.0]))
            .await
            .unwrap();
        assert_eq!(forecast.predicted_value, 0.0);
    }

    #[tokio::test]
    async fn wrong_window_length_is_rejected() {
        let oracle = TrendForecastOracle::new(10, 150.0);
        let err = oracle.predict_breach(&window(&[1.0, 2.0])).await.unwrap_err();
        assert!(matches!(
            err,
            OracleError::WindowMismatch {
                expected: 10,
                actual: 2
            }
        ));
    }

    #[tokio::test]
    async fn seeded_feed_is_reproducible_and_bounded() {
        let id = EntityId::new("factory-001");
        let a = RandomWalkSensorFeed::new(Some(7))
            .with_profile(id.clone(), SimulatorProfile::steel_plant())
            .unwrap();
        let b = RandomWalkSensorFeed::new(Some(7))
            .with_profile(id.clone(), SimulatorProfile::steel_plant())
            .unwrap();

        for _ in 0..200 {
            let left = a.next_reading(&id).await.unwrap();
            let right = b.next_reading(&id).await.unwrap();
            assert_eq!(left, right);
            assert!((0.0..=220.0).contains(&left.pm2_5));
            assert!(left.so2 >= 0.0 && left.nox >= 0.0);
        }
    }

    #[test]
    fn out_of_range_profiles_are_rejected() {
        let id = EntityId::new("factory-001");
        let bad = [
            SimulatorProfile {
                spike_chance: 1.5,
                ..SimulatorProfile::steel_plant()
            },
            SimulatorProfile {
                max_level: -1.0,
                ..SimulatorProfile::steel_plant()
            },
            SimulatorProfile {
                step: -8.0,
                ..SimulatorProfile::cement_works()
            },
            SimulatorProfile {
                base_level: f64::NAN,
                ..SimulatorProfile::cement_works()
            },
        ];
        for profile in bad {
            let err = RandomWalkSensorFeed::new(Some(1))
                .with_profile(id.clone(), profile)
                .unwrap_err();
            assert!(matches!(err, FeedError::Misconfigured(_)), "{profile:?}");
        }
    }

    #[tokio::test]
    async fn deserialized_profile_is_validated() {
        let id = EntityId::new("factory-001");
        let profile: SimulatorProfile = serde_json::from_str(
            r#"{"base_level": 80.0, "spike_chance": 2.0, "max_level": 220.0, "reversion": 0.2, "step": 8.0}"#,
        )
        .unwrap();
        assert!(RandomWalkSensorFeed::new(Some(3))
            .with_profile(id.clone(), profile)
            .is_err());

        let fixed = SimulatorProfile {
            spike_chance: 1.0,
            ..profile
        };
        let feed = RandomWalkSensorFeed::new(Some(3))
            .with_profile(id.clone(), fixed)
            .unwrap();
        let sample = feed.next_reading(&id).await.unwrap();
        assert!((187.0..=220.0).contains(&sample.pm2_5));
    }

    #[tokio::test]
    async fn unknown_entity_is_reported() {
        let feed = RandomWalkSensorFeed::new(Some(1));
        let err = feed.next_reading(&EntityId::new("ghost")).await.unwrap_err();
        assert!(matches!(err, FeedError::UnknownEntity(_)));
    }

    #[tokio::test]
    async fn chaos_fixtures_fail() {
        let id = EntityId::new("factory-001");
        assert!(AlwaysFailFeed::new("sensor offline")
            .next_reading(&id)
            .await
            .is_err());
        assert!(matches!(
            UnavailableOracle::new(10).predict_breach(&[]).await,
            Err(OracleError::Unavailable(_))
        ));
    }
}
