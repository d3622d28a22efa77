//! PolluStake compliance core.
//!
//! This crate owns the always-running compliance cycle and the stake-slashing
//! ledger:
//! - each cycle pulls one reading per registered entity, persists it and
//!   classifies it against a two-tier policy (actual breach, forecast breach)
//! - an actual breach slashes the entity's stake inside one store transaction
//! - status is recomputed from scratch every cycle
//!
//! Sensor feeds, forecast oracles and storage backends sit behind traits so
//! the monitor can run against Postgres in production and in memory in tests.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod audit;
pub mod config;
pub mod error;
pub mod feed;
pub mod ledger;
pub mod monitor;
pub mod oracle;
pub mod policy;
pub mod registry;
pub mod store;
pub mod types;

pub use audit::{audit_ledger, LedgerAudit};
pub use config::{FailurePolicy, MonitorConfig};
pub use error::{ComplianceError, ErrorKind, StoreError, StoreResult};
pub use feed::{FeedError, SensorFeed};
pub use ledger::{slash_amount, SlashLedger, SlashRequest};
pub use monitor::{ComplianceMonitor, CycleReport, EntityFailure, EntityOutcome, MonitorHandle};
pub use oracle::{predict_fail_open, Forecast, ForecastOracle, OracleError};
pub use policy::{BreachPolicy, Verdict};
pub use registry::EntityRegistry;
pub use store::memory::InMemoryStateStore;
#[cfg(feature = "postgres")]
pub use store::postgres::PostgresStateStore;
pub use store::{LedgerSnapshot, QueryWindow, StateStore, StorageConfig};
pub use types::{
    ComplianceStatus, Entity, EntityId, ForecastLogEntry, NewEntity, NewReading, ProtocolFund,
    Reading, SensorSample, SlashEvent, SlashTrigger,
};
