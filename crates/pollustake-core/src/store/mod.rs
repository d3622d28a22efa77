//! Persistent state behind the compliance core.
//!
//! The store holds entities, readings, the forecast log, the slash ledger and
//! the protocol fund. The slash transaction is a single trait method so each
//! backend can make it atomic with its own primitives.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::error::{StoreError, StoreResult};
use crate::ledger::SlashRequest;
use crate::types::{
    ComplianceStatus, Entity, EntityId, ForecastLogEntry, NewEntity, NewReading, ProtocolFund,
    Reading, SlashEvent,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Generic query window for paged reads. `limit == 0` means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

impl QueryWindow {
    pub fn latest(limit: usize) -> Self {
        Self { limit, offset: 0 }
    }
}

/// The protocol fund together with every slash event (newest first), read from
/// one consistent snapshot.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    pub fund: ProtocolFund,
    pub slash_events: Vec<SlashEvent>,
}

/// Transactional state store shared by the monitor and the query API.
#[async_trait]
pub trait StateStore: Send + Sync {
    fn backend_label(&self) -> &'static str;

    /// Insert an entity unless one with the same id exists. Returns whether a row was inserted.
    async fn register_entity(&self, entity: NewEntity) -> StoreResult<bool>;

    /// Create the protocol fund singleton if missing.
    async fn ensure_protocol_fund(&self) -> StoreResult<()>;

    /// All entities in registration order.
    async fn list_entities(&self) -> StoreResult<Vec<Entity>>;

    async fn get_entity(&self, entity_id: &EntityId) -> StoreResult<Option<Entity>>;

    async fn append_reading(&self, entity_id: &EntityId, reading: NewReading)
        -> StoreResult<Reading>;

    /// Up to `limit` most recent readings, oldest first.
    async fn recent_readings(&self, entity_id: &EntityId, limit: usize)
        -> StoreResult<Vec<Reading>>;

    async fn append_forecast(&self, entry: ForecastLogEntry) -> StoreResult<()>;

    async fn latest_forecast(&self, entity_id: &EntityId) -> StoreResult<Option<ForecastLogEntry>>;

    async fn set_status(&self, entity_id: &EntityId, status: ComplianceStatus) -> StoreResult<()>;

    /// Apply a slash atomically: status, stake debit, fund credit and ledger append
    /// all commit together or not at all.
    async fn apply_slash(&self, request: SlashRequest) -> StoreResult<SlashEvent>;

    /// Slash events newest first, optionally restricted to one entity.
    async fn list_slash_events(
        &self,
        entity_id: Option<&EntityId>,
        window: QueryWindow,
    ) -> StoreResult<Vec<SlashEvent>>;

    async fn protocol_fund(&self) -> StoreResult<ProtocolFund>;

    /// Fund and ledger as of one point in time. No slash may commit between the two reads.
    async fn ledger_snapshot(&self) -> StoreResult<LedgerSnapshot>;

    /// Release backend resources. Called once the monitor has stopped.
    async fn close(&self) {}
}

/// State store backend configuration.
#[derive(Debug, Clone, Default)]
pub enum StorageConfig {
    /// Keep all state in process memory only.
    #[default]
    Memory,
    /// Persist all state in PostgreSQL through a bounded connection pool.
    Postgres {
        database_url: String,
        max_connections: u32,
        acquire_timeout_secs: u64,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
            acquire_timeout_secs: 5,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }

    /// Open the configured backend. Any error here is fatal for the process.
    pub async fn connect(&self) -> StoreResult<Arc<dyn StateStore>> {
        match self {
            Self::Memory => Ok(Arc::new(memory::InMemoryStateStore::new())),
            #[cfg(feature = "postgres")]
            Self::Postgres {
                database_url,
                max_connections,
                acquire_timeout_secs,
            } => {
                let store = postgres::PostgresStateStore::connect_with_options(
                    database_url,
                    *max_connections,
                    *acquire_timeout_secs,
                )
                .await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "postgres"))]
            Self::Postgres { .. } => Err(StoreError::Schema(
                "postgres storage requested but pollustake-core was built without the 'postgres' feature"
                    .to_string(),
            )),
        }
    }
}

pub(crate) fn apply_window<T>(items: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = items.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}

pub(crate) fn not_found(entity_id: &EntityId) -> StoreError {
    StoreError::NotFound(format!("entity '{entity_id}' not found"))
}
