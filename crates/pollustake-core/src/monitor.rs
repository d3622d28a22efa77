//! Autonomous compliance monitor.
//!
//! One cycle walks the registry sequentially. For each entity it pulls a
//! reading, persists it, and either slashes (actual breach) or consults the
//! forecast oracle. The next cycle starts a fixed delay after the previous one
//! finished, so cadence is processing time plus delay.

use crate::config::{FailurePolicy, MonitorConfig};
use crate::error::{ComplianceError, ErrorKind};
use crate::feed::SensorFeed;
use crate::ledger::SlashLedger;
use crate::oracle::{predict_fail_open, ForecastOracle};
use crate::policy::{BreachPolicy, Verdict};
use crate::registry::EntityRegistry;
use crate::store::StateStore;
use crate::types::{ComplianceStatus, EntityId, ForecastLogEntry, NewReading, Reading, SlashEvent};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Result of evaluating one entity in one cycle.
#[derive(Debug, Clone)]
pub struct EntityOutcome {
    pub entity_id: EntityId,
    pub reading: Reading,
    pub verdict: Verdict,
    pub status: ComplianceStatus,
    pub slash: Option<SlashEvent>,
    pub forecast_logged: bool,
}

/// An entity whose iteration did not complete.
#[derive(Debug, Clone)]
pub struct EntityFailure {
    pub entity_id: EntityId,
    pub kind: ErrorKind,
    pub message: String,
}

/// Summary of one pass over the registry.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<EntityOutcome>,
    pub failures: Vec<EntityFailure>,
    /// Entities after the first failure were skipped.
    pub aborted: bool,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn slashed(&self) -> impl Iterator<Item = &SlashEvent> {
        self.outcomes.iter().filter_map(|outcome| outcome.slash.as_ref())
    }

    /// First failure that retrying cannot fix.
    pub fn fatal(&self) -> Option<&EntityFailure> {
        self.failures
            .iter()
            .find(|failure| failure.kind == ErrorKind::Fatal)
    }

    pub fn outcome(&self, entity_id: &EntityId) -> Option<&EntityOutcome> {
        self.outcomes
            .iter()
            .find(|outcome| &outcome.entity_id == entity_id)
    }
}

pub struct ComplianceMonitor {
    store: Arc<dyn StateStore>,
    feed: Arc<dyn SensorFeed>,
    oracle: Arc<dyn ForecastOracle>,
    ledger: SlashLedger,
    registry: EntityRegistry,
    policy: BreachPolicy,
    config: MonitorConfig,
    lookback: usize,
    cycles: AtomicU64,
}

impl ComplianceMonitor {
    pub fn new(
        store: Arc<dyn StateStore>,
        feed: Arc<dyn SensorFeed>,
        oracle: Arc<dyn ForecastOracle>,
        registry: EntityRegistry,
        config: MonitorConfig,
    ) -> Result<Self, ComplianceError> {
        if !config.actual_penalty_threshold.is_finite() {
            return Err(ComplianceError::Validation(
                "actual penalty threshold must be finite".to_string(),
            ));
        }
        let lookback = oracle.lookback();
        if lookback == 0 {
            return Err(ComplianceError::Validation(
                "forecast oracle reported a zero-length lookback window".to_string(),
            ));
        }

        Ok(Self {
            ledger: SlashLedger::new(store.clone(), config.fixed_slash_amount),
            policy: BreachPolicy::new(config.actual_penalty_threshold),
            store,
            feed,
            oracle,
            registry,
            config,
            lookback,
            cycles: AtomicU64::new(0),
        })
    }

    pub fn lookback(&self) -> usize {
        self.lookback
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &SlashLedger {
        &self.ledger
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Run one evaluation step for a single entity.
    pub async fn evaluate_entity(
        &self,
        entity_id: &EntityId,
    ) -> Result<EntityOutcome, ComplianceError> {
        let sample =
            self.feed
                .next_reading(entity_id)
                .await
                .map_err(|e| ComplianceError::Feed {
                    entity_id: entity_id.to_string(),
                    message: e.to_string(),
                })?;

        let reading = self
            .store
            .append_reading(
                entity_id,
                NewReading {
                    sample,
                    recorded_at: Utc::now(),
                },
            )
            .await?;
        let history = self.store.recent_readings(entity_id, self.lookback).await?;

        if self.policy.is_actual_breach(reading.pm2_5) {
            warn!(entity_id = %entity_id, pm2_5 = reading.pm2_5, "Actual breach detected");
            let event = self
                .ledger
                .slash(entity_id, format!("Actual PM2.5 breach: {}", reading.pm2_5))
                .await?;
            return Ok(EntityOutcome {
                entity_id: entity_id.clone(),
                verdict: Verdict::ActualBreach {
                    pm2_5: reading.pm2_5,
                },
                reading,
                status: ComplianceStatus::Penalty,
                slash: Some(event),
                forecast_logged: false,
            });
        }

        let mut forecast_logged = false;
        let verdict = if history.len() < self.lookback {
            self.policy
                .evaluate(reading.pm2_5, history.len(), self.lookback, None)
        } else {
            let forecast = predict_fail_open(self.oracle.as_ref(), entity_id, &history).await;
            self.store
                .append_forecast(ForecastLogEntry {
                    entity_id: entity_id.clone(),
                    predicted_value: forecast.predicted_value,
                    breach_predicted: forecast.breach_predicted,
                    recorded_at: Utc::now(),
                })
                .await?;
            forecast_logged = true;
            self.policy
                .evaluate(reading.pm2_5, history.len(), self.lookback, Some(forecast))
        };

        let status = verdict.status();
        if let Verdict::Forecast(forecast) = &verdict {
            if forecast.breach_predicted {
                warn!(
                    entity_id = %entity_id,
                    predicted = forecast.predicted_value,
                    "Breach predicted"
                );
            }
        }
        self.store.set_status(entity_id, status).await?;

        Ok(EntityOutcome {
            entity_id: entity_id.clone(),
            reading,
            verdict,
            status,
            slash: None,
            forecast_logged,
        })
    }

    /// One sequential pass over every registered entity.
    pub async fn run_cycle(&self) -> CycleReport {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let started_at = Utc::now();
        let mut outcomes = Vec::with_capacity(self.registry.len());
        let mut failures = Vec::new();
        let mut aborted = false;

        for entity_id in self.registry.iter() {
            match self.evaluate_entity(entity_id).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    let feed_failure = matches!(e, ComplianceError::Feed { .. });
                    failures.push(EntityFailure {
                        entity_id: entity_id.clone(),
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                    if feed_failure {
                        warn!(cycle, entity_id = %entity_id, error = %e, "Skipping entity this cycle");
                        continue;
                    }
                    error!(cycle, entity_id = %entity_id, error = %e, "Entity evaluation failed");
                    // Fatal errors end the cycle under either policy.
                    if e.kind() == ErrorKind::Fatal
                        || self.config.failure_policy == FailurePolicy::AbortCycle
                    {
                        aborted = true;
                        break;
                    }
                }
            }
        }

        CycleReport {
            cycle,
            started_at,
            finished_at: Utc::now(),
            outcomes,
            failures,
            aborted,
        }
    }

    /// Run cycles until `shutdown` turns true or its sender is dropped.
    ///
    /// Shutdown is observed between cycles; a cycle in progress always completes.
    /// Transient and validation failures are retried on the next cycle; a fatal
    /// failure (broken ledger invariant, missing schema) ends the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            entities = self.registry.len(),
            lookback = self.lookback,
            interval_secs = self.config.monitoring_interval.as_secs_f64(),
            "Starting autonomous monitoring"
        );

        if wait_or_shutdown(&mut shutdown, self.config.startup_delay).await {
            info!("Compliance monitor stopped before first cycle");
            return;
        }

        let mut failed_streak: u64 = 0;
        loop {
            let report = self.run_cycle().await;
            if let Some(fatal) = report.fatal() {
                error!(
                    cycle = report.cycle,
                    entity_id = %fatal.entity_id,
                    error = %fatal.message,
                    "Stopping compliance monitor after unrecoverable error"
                );
                break;
            }
            if report.is_clean() {
                if failed_streak > 0 {
                    info!(
                        cycle = report.cycle,
                        failed_cycles = failed_streak,
                        "Monitoring recovered"
                    );
                }
                failed_streak = 0;
            } else {
                failed_streak += 1;
                error!(
                    cycle = report.cycle,
                    failures = report.failures.len(),
                    aborted = report.aborted,
                    consecutive_failed_cycles = failed_streak,
                    "Monitoring cycle completed with failures"
                );
            }
            debug!(
                cycle = report.cycle,
                evaluated = report.outcomes.len(),
                slashed = report.slashed().count(),
                "Monitoring cycle finished"
            );

            if wait_or_shutdown(&mut shutdown, self.config.monitoring_interval).await {
                break;
            }
        }

        info!(cycles = self.cycles_completed(), "Compliance monitor stopped");
    }

    /// Spawn the loop on the tokio runtime.
    pub fn spawn(self: Arc<Self>) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });
        MonitorHandle { shutdown_tx, task }
    }
}

/// Handle to a spawned monitor loop.
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signal shutdown and wait for the in-flight cycle to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Compliance monitor task ended abnormally");
        }
    }
}

/// Sleep for `delay` unless shutdown is requested first. Returns `true` on shutdown.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
