//! PostgreSQL state store.
//!
//! This is the transactional source of truth. The slash transaction locks the
//! entity row (`SELECT ... FOR UPDATE`) so concurrent slashes against one
//! entity serialize; everything else relies on single-statement atomicity.

use super::{not_found, LedgerSnapshot, QueryWindow, StateStore};
use crate::error::{StoreError, StoreResult};
use crate::ledger::{slash_amount, SlashRequest};
use crate::types::{
    ComplianceStatus, Entity, EntityId, ForecastLogEntry, NewEntity, NewReading, ProtocolFund,
    Reading, SlashEvent, SlashTrigger,
};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;

/// PostgreSQL-backed state store over a bounded connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    /// Connect with default pool parameters and initialize the schema.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        acquire_timeout_secs: u64,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(acquire_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Schema(format!("failed to connect postgres: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and initialize the schema.
    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                registration_seq BIGSERIAL NOT NULL,
                name TEXT NOT NULL,
                owner TEXT,
                location TEXT,
                stake_balance BIGINT NOT NULL CHECK (stake_balance >= 0),
                status TEXT NOT NULL DEFAULT 'NORMAL',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS readings (
                id BIGSERIAL PRIMARY KEY,
                entity_id TEXT NOT NULL REFERENCES entities (id),
                pm2_5 DOUBLE PRECISION NOT NULL,
                so2 DOUBLE PRECISION NOT NULL,
                nox DOUBLE PRECISION NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_readings_entity_time ON readings (entity_id, recorded_at)",
            r#"
            CREATE TABLE IF NOT EXISTS forecast_log (
                id BIGSERIAL PRIMARY KEY,
                entity_id TEXT NOT NULL REFERENCES entities (id),
                predicted_value DOUBLE PRECISION NOT NULL,
                breach_predicted BOOLEAN NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_forecast_log_entity_time ON forecast_log (entity_id, recorded_at)",
            r#"
            CREATE TABLE IF NOT EXISTS slash_events (
                id BIGSERIAL PRIMARY KEY,
                entity_id TEXT NOT NULL REFERENCES entities (id),
                amount BIGINT NOT NULL CHECK (amount >= 0),
                stake_before BIGINT NOT NULL CHECK (stake_before >= amount),
                reason TEXT NOT NULL,
                triggered_by TEXT NOT NULL,
                tx_hash TEXT NOT NULL UNIQUE,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_slash_events_entity ON slash_events (entity_id)",
            r#"
            CREATE TABLE IF NOT EXISTS protocol_fund (
                id SMALLINT PRIMARY KEY CHECK (id = 1),
                admin_fund_balance BIGINT NOT NULL DEFAULT 0 CHECK (admin_fund_balance >= 0)
            )
            "#,
        ];

        for statement in ddl {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Schema(format!("postgres schema init failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn register_entity(&self, entity: NewEntity) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO entities (id, name, owner, location, stake_balance, status)
            VALUES ($1, $2, $3, $4, $5, 'NORMAL')
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(entity.id.as_str())
        .bind(&entity.name)
        .bind(&entity.owner)
        .bind(&entity.location)
        .bind(to_i64(entity.stake_balance)?)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn ensure_protocol_fund(&self) -> StoreResult<()> {
        sqlx::query("INSERT INTO protocol_fund (id) VALUES (1) ON CONFLICT (id) DO NOTHING")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_entities(&self) -> StoreResult<Vec<Entity>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, owner, location, stake_balance, status
              FROM entities
             ORDER BY registration_seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn get_entity(&self, entity_id: &EntityId) -> StoreResult<Option<Entity>> {
        let row = sqlx::query(
            "SELECT id, name, owner, location, stake_balance, status FROM entities WHERE id = $1",
        )
        .bind(entity_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(entity_from_row).transpose()
    }

    async fn append_reading(
        &self,
        entity_id: &EntityId,
        reading: NewReading,
    ) -> StoreResult<Reading> {
        sqlx::query(
            r#"
            INSERT INTO readings (entity_id, pm2_5, so2, nox, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entity_id.as_str())
        .bind(reading.sample.pm2_5)
        .bind(reading.sample.so2)
        .bind(reading.sample.nox)
        .bind(reading.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                not_found(entity_id)
            } else {
                backend(e)
            }
        })?;

        Ok(Reading {
            entity_id: entity_id.clone(),
            pm2_5: reading.sample.pm2_5,
            so2: reading.sample.so2,
            nox: reading.sample.nox,
            recorded_at: reading.recorded_at,
        })
    }

    async fn recent_readings(
        &self,
        entity_id: &EntityId,
        limit: usize,
    ) -> StoreResult<Vec<Reading>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, pm2_5, so2, nox, recorded_at
              FROM readings
             WHERE entity_id = $1
             ORDER BY recorded_at DESC, id DESC
             LIMIT $2
            "#,
        )
        .bind(entity_id.as_str())
        .bind(to_i64(limit as u64)?)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        // Newest-first from the index scan; callers expect chronological order.
        let mut readings = rows
            .iter()
            .map(reading_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        readings.reverse();
        Ok(readings)
    }

    async fn append_forecast(&self, entry: ForecastLogEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO forecast_log (entity_id, predicted_value, breach_predicted, recorded_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(entry.entity_id.as_str())
        .bind(entry.predicted_value)
        .bind(entry.breach_predicted)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                not_found(&entry.entity_id)
            } else {
                backend(e)
            }
        })?;
        Ok(())
    }

    async fn latest_forecast(&self, entity_id: &EntityId) -> StoreResult<Option<ForecastLogEntry>> {
        let row = sqlx::query(
            r#"
            SELECT entity_id, predicted_value, breach_predicted, recorded_at
              FROM forecast_log
             WHERE entity_id = $1
             ORDER BY recorded_at DESC, id DESC
             LIMIT 1
            "#,
        )
        .bind(entity_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(|row| {
            Ok(ForecastLogEntry {
                entity_id: EntityId::new(row.try_get::<String, _>("entity_id").map_err(decode)?),
                predicted_value: row.try_get("predicted_value").map_err(decode)?,
                breach_predicted: row.try_get("breach_predicted").map_err(decode)?,
                recorded_at: row.try_get("recorded_at").map_err(decode)?,
            })
        })
        .transpose()
    }

    async fn set_status(&self, entity_id: &EntityId, status: ComplianceStatus) -> StoreResult<()> {
        let result = sqlx::query("UPDATE entities SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(entity_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(not_found(entity_id));
        }
        Ok(())
    }

    async fn apply_slash(&self, request: SlashRequest) -> StoreResult<SlashEvent> {
        // Dropping `tx` without commit rolls back every statement below.
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let updated = sqlx::query("UPDATE entities SET status = $1 WHERE id = $2")
            .bind(ComplianceStatus::Penalty.as_str())
            .bind(request.entity_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        if updated.rows_affected() == 0 {
            return Err(not_found(&request.entity_id));
        }

        let row = sqlx::query("SELECT stake_balance FROM entities WHERE id = $1 FOR UPDATE")
            .bind(request.entity_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(backend)?;
        let stake_before = to_u64(row.try_get("stake_balance").map_err(decode)?)?;
        let amount = slash_amount(stake_before, request.fixed_amount);

        sqlx::query("UPDATE entities SET stake_balance = $1 WHERE id = $2")
            .bind(to_i64(stake_before - amount)?)
            .bind(request.entity_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        let credited = sqlx::query(
            "UPDATE protocol_fund SET admin_fund_balance = admin_fund_balance + $1 WHERE id = 1",
        )
        .bind(to_i64(amount)?)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        if credited.rows_affected() == 0 {
            return Err(StoreError::InvariantViolation(
                "protocol fund is not initialised".to_string(),
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO slash_events
                (entity_id, amount, stake_before, reason, triggered_by, tx_hash, recorded_at)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(request.entity_id.as_str())
        .bind(to_i64(amount)?)
        .bind(to_i64(stake_before)?)
        .bind(&request.reason)
        .bind(request.triggered_by.as_str())
        .bind(&request.tx_hash)
        .bind(request.recorded_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::InvariantViolation(format!(
                    "duplicate slash transaction '{}'",
                    request.tx_hash
                ))
            } else {
                backend(e)
            }
        })?;

        tx.commit().await.map_err(backend)?;

        Ok(SlashEvent {
            entity_id: request.entity_id,
            amount,
            stake_before,
            reason: request.reason,
            triggered_by: request.triggered_by,
            tx_hash: request.tx_hash,
            recorded_at: request.recorded_at,
        })
    }

    async fn list_slash_events(
        &self,
        entity_id: Option<&EntityId>,
        window: QueryWindow,
    ) -> StoreResult<Vec<SlashEvent>> {
        let limit = if window.limit == 0 {
            None
        } else {
            Some(to_i64(window.limit as u64)?)
        };
        let rows = sqlx::query(
            r#"
            SELECT entity_id, amount, stake_before, reason, triggered_by, tx_hash, recorded_at
              FROM slash_events
             WHERE ($1::TEXT IS NULL OR entity_id = $1)
             ORDER BY id DESC
             LIMIT $2 OFFSET $3
            "#,
        )
        .bind(entity_id.map(EntityId::as_str))
        .bind(limit)
        .bind(to_i64(window.offset as u64)?)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(slash_event_from_row).collect()
    }

    async fn protocol_fund(&self) -> StoreResult<ProtocolFund> {
        let row = sqlx::query("SELECT admin_fund_balance FROM protocol_fund WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| {
                StoreError::InvariantViolation("protocol fund is not initialised".to_string())
            })?;
        Ok(ProtocolFund {
            admin_fund_balance: to_u64(row.try_get("admin_fund_balance").map_err(decode)?)?,
        })
    }

    async fn ledger_snapshot(&self) -> StoreResult<LedgerSnapshot> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        // Both reads must see the same committed state.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        let fund_row = sqlx::query("SELECT admin_fund_balance FROM protocol_fund WHERE id = 1")
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| {
                StoreError::InvariantViolation("protocol fund is not initialised".to_string())
            })?;
        let fund = ProtocolFund {
            admin_fund_balance: to_u64(fund_row.try_get("admin_fund_balance").map_err(decode)?)?,
        };

        let rows = sqlx::query(
            r#"
            SELECT entity_id, amount, stake_before, reason, triggered_by, tx_hash, recorded_at
              FROM slash_events
             ORDER BY id DESC
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(backend)?;
        let slash_events = rows
            .iter()
            .map(slash_event_from_row)
            .collect::<StoreResult<Vec<_>>>()?;

        tx.commit().await.map_err(backend)?;
        Ok(LedgerSnapshot { fund, slash_events })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn entity_from_row(row: &PgRow) -> StoreResult<Entity> {
    let status: String = row.try_get("status").map_err(decode)?;
    Ok(Entity {
        id: EntityId::new(row.try_get::<String, _>("id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        owner: row.try_get("owner").map_err(decode)?,
        location: row.try_get("location").map_err(decode)?,
        stake_balance: to_u64(row.try_get("stake_balance").map_err(decode)?)?,
        status: status.parse()?,
    })
}

fn reading_from_row(row: &PgRow) -> StoreResult<Reading> {
    Ok(Reading {
        entity_id: EntityId::new(row.try_get::<String, _>("entity_id").map_err(decode)?),
        pm2_5: row.try_get("pm2_5").map_err(decode)?,
        so2: row.try_get("so2").map_err(decode)?,
        nox: row.try_get("nox").map_err(decode)?,
        recorded_at: row.try_get("recorded_at").map_err(decode)?,
    })
}

fn slash_event_from_row(row: &PgRow) -> StoreResult<SlashEvent> {
    let triggered_by: String = row.try_get("triggered_by").map_err(decode)?;
    Ok(SlashEvent {
        entity_id: EntityId::new(row.try_get::<String, _>("entity_id").map_err(decode)?),
        amount: to_u64(row.try_get("amount").map_err(decode)?)?,
        stake_before: to_u64(row.try_get("stake_before").map_err(decode)?)?,
        reason: row.try_get("reason").map_err(decode)?,
        triggered_by: triggered_by.parse::<SlashTrigger>()?,
        tx_hash: row.try_get("tx_hash").map_err(decode)?,
        recorded_at: row.try_get("recorded_at").map_err(decode)?,
    })
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn decode(e: sqlx::Error) -> StoreError {
    StoreError::Backend(format!("postgres decode failed: {e}"))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

fn is_foreign_key_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_foreign_key_violation())
        .unwrap_or(false)
}

fn to_i64(value: u64) -> StoreResult<i64> {
    i64::try_from(value)
        .map_err(|_| StoreError::InvalidInput(format!("value {value} exceeds BIGINT range")))
}

fn to_u64(value: i64) -> StoreResult<u64> {
    u64::try_from(value)
        .map_err(|_| StoreError::InvariantViolation(format!("negative amount {value} in storage")))
}
