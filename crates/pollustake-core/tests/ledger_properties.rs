//! Property tests: the slash ledger conserves value and never overdraws a stake,
//! whatever sequence of readings the monitor sees.

use async_trait::async_trait;
use pollustake_core::*;
use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Helpers / Strategies
// ---------------------------------------------------------------------------

/// Feed that hands out one shared sequence of PM2.5 values, in call order.
struct SequenceFeed {
    values: Mutex<VecDeque<f64>>,
}

#[async_trait]
impl SensorFeed for SequenceFeed {
    async fn next_reading(&self, _entity_id: &EntityId) -> Result<SensorSample, FeedError> {
        self.values
            .lock()
            .unwrap()
            .pop_front()
            .map(|pm2_5| SensorSample::new(pm2_5, 10.0, 20.0))
            .ok_or_else(|| FeedError::Unavailable("sequence exhausted".into()))
    }
}

/// Oracle alerting whenever the last reading of the window exceeds 150.
struct LastValueOracle;

#[async_trait]
impl ForecastOracle for LastValueOracle {
    fn lookback(&self) -> usize {
        2
    }

    async fn predict_breach(&self, history: &[Reading]) -> Result<Forecast, OracleError> {
        let last = history.last().map(|r| r.pm2_5).unwrap_or_default();
        Ok(Forecast {
            breach_predicted: last > 150.0,
            predicted_value: last,
        })
    }
}

/// PM2.5 values clustered around both thresholds.
fn arb_pm2_5() -> impl Strategy<Value = f64> {
    prop_oneof![
        0.0f64..150.0,
        150.0f64..=200.0,
        Just(200.0),
        200.0f64..400.0,
    ]
}

fn arb_stakes() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..60, 1..4)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn fund_equals_total_slashed_and_stakes_stay_bounded(
        stakes in arb_stakes(),
        fixed in 1u64..25,
        values in prop::collection::vec(arb_pm2_5(), 1..40),
    ) {
        runtime().block_on(async move {
            let store = Arc::new(InMemoryStateStore::with_entities(
                stakes
                    .iter()
                    .enumerate()
                    .map(|(i, stake)| NewEntity::new(format!("factory-{i:03}"), "plant", *stake)),
            ));
            let initial_total: u64 = stakes.iter().sum();
            let cycles = values.len() / stakes.len();
            let feed = Arc::new(SequenceFeed { values: Mutex::new(values.into_iter().collect()) });
            let registry = EntityRegistry::from_store(store.as_ref()).await.unwrap();
            let config = MonitorConfig { fixed_slash_amount: fixed, ..MonitorConfig::default() };
            let monitor = ComplianceMonitor::new(
                store.clone(),
                feed,
                Arc::new(LastValueOracle),
                registry,
                config,
            )
            .unwrap();

            for _ in 0..cycles {
                let report = monitor.run_cycle().await;
                prop_assert!(report.is_clean());
                for outcome in &report.outcomes {
                    // Tier precedence: actual breach always wins and always slashes.
                    let breach = outcome.reading.pm2_5 > 200.0;
                    prop_assert_eq!(outcome.status == ComplianceStatus::Penalty, breach);
                    prop_assert_eq!(outcome.slash.is_some(), breach);
                    prop_assert_eq!(outcome.forecast_logged, !breach && monitor.lookback() <= report.cycle as usize);
                    if let Some(event) = &outcome.slash {
                        prop_assert!(event.amount <= fixed);
                        prop_assert!(event.amount <= event.stake_before);
                        prop_assert_eq!(event.amount, event.stake_before.min(fixed));
                    }
                }
            }

            let audit = audit_ledger(store.as_ref()).await.unwrap();
            prop_assert!(audit.is_consistent());

            let remaining: u64 = store
                .list_entities()
                .await
                .unwrap()
                .iter()
                .map(|e| e.stake_balance)
                .sum();
            prop_assert_eq!(remaining + audit.admin_fund_balance, initial_total);
            Ok(())
        })?;
    }

    #[test]
    fn stake_is_monotonically_non_increasing(
        stake in 0u64..40,
        fixed in 1u64..15,
        breaches in 1usize..10,
    ) {
        runtime().block_on(async move {
            let store = Arc::new(InMemoryStateStore::with_entities([
                NewEntity::new("factory-001", "Bhilai Steel Plant", stake),
            ]));
            let ledger = SlashLedger::new(store.clone(), fixed);
            let id = EntityId::new("factory-001");

            let mut previous = stake;
            for _ in 0..breaches {
                let event = ledger.slash(&id, "Actual PM2.5 breach: 250").await.unwrap();
                prop_assert_eq!(event.stake_before, previous);
                prop_assert!(event.stake_after() <= previous);
                previous = event.stake_after();
            }

            let expected = stake.saturating_sub(fixed.saturating_mul(breaches as u64));
            prop_assert_eq!(previous, expected);
            prop_assert_eq!(
                store.protocol_fund().await.unwrap().admin_fund_balance,
                stake - expected
            );
            Ok(())
        })?;
    }
}
