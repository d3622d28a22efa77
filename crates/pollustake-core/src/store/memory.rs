//! In-memory reference implementation of [`StateStore`].
//!
//! All state sits behind one lock, so every trait method (including the slash
//! transaction) is atomic with respect to every other. Production deployments
//! should use the PostgreSQL backend.

use super::{apply_window, not_found, LedgerSnapshot, QueryWindow, StateStore};
use crate::error::{StoreError, StoreResult};
use crate::ledger::{slash_amount, SlashRequest};
use crate::types::{
    ComplianceStatus, Entity, EntityId, ForecastLogEntry, NewEntity, NewReading, ProtocolFund,
    Reading, SlashEvent,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct MemoryState {
    /// Registration order.
    entities: Vec<Entity>,
    readings: HashMap<EntityId, Vec<Reading>>,
    forecasts: Vec<ForecastLogEntry>,
    slash_events: Vec<SlashEvent>,
    fund: Option<ProtocolFund>,
}

impl MemoryState {
    fn entity_mut(&mut self, entity_id: &EntityId) -> StoreResult<&mut Entity> {
        self.entities
            .iter_mut()
            .find(|entity| &entity.id == entity_id)
            .ok_or_else(|| not_found(entity_id))
    }

    fn contains(&self, entity_id: &EntityId) -> bool {
        self.entities.iter().any(|entity| &entity.id == entity_id)
    }
}

/// In-memory state store.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with the protocol fund initialised and `entities` registered in order.
    pub fn with_entities(entities: impl IntoIterator<Item = NewEntity>) -> Self {
        let store = Self::new();
        {
            let mut state = store
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.fund = Some(ProtocolFund::default());
            for entity in entities {
                if !state.contains(&entity.id) {
                    state.entities.push(into_entity(entity));
                }
            }
        }
        store
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| StoreError::Backend("state lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| StoreError::Backend("state lock poisoned".to_string()))
    }
}

fn into_entity(entity: NewEntity) -> Entity {
    Entity {
        id: entity.id,
        name: entity.name,
        owner: entity.owner,
        location: entity.location,
        stake_balance: entity.stake_balance,
        status: ComplianceStatus::Normal,
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn register_entity(&self, entity: NewEntity) -> StoreResult<bool> {
        let mut state = self.write()?;
        if state.contains(&entity.id) {
            return Ok(false);
        }
        state.entities.push(into_entity(entity));
        Ok(true)
    }

    async fn ensure_protocol_fund(&self) -> StoreResult<()> {
        let mut state = self.write()?;
        state.fund.get_or_insert_with(ProtocolFund::default);
        Ok(())
    }

    async fn list_entities(&self) -> StoreResult<Vec<Entity>> {
        Ok(self.read()?.entities.clone())
    }

    async fn get_entity(&self, entity_id: &EntityId) -> StoreResult<Option<Entity>> {
        Ok(self
            .read()?
            .entities
            .iter()
            .find(|entity| &entity.id == entity_id)
            .cloned())
    }

    async fn append_reading(
        &self,
        entity_id: &EntityId,
        reading: NewReading,
    ) -> StoreResult<Reading> {
        let mut state = self.write()?;
        if !state.contains(entity_id) {
            return Err(not_found(entity_id));
        }
        let record = Reading {
            entity_id: entity_id.clone(),
            pm2_5: reading.sample.pm2_5,
            so2: reading.sample.so2,
            nox: reading.sample.nox,
            recorded_at: reading.recorded_at,
        };
        state
            .readings
            .entry(entity_id.clone())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn recent_readings(
        &self,
        entity_id: &EntityId,
        limit: usize,
    ) -> StoreResult<Vec<Reading>> {
        let state = self.read()?;
        let Some(readings) = state.readings.get(entity_id) else {
            return Ok(Vec::new());
        };
        let start = readings.len().saturating_sub(limit);
        Ok(readings[start..].to_vec())
    }

    async fn append_forecast(&self, entry: ForecastLogEntry) -> StoreResult<()> {
        let mut state = self.write()?;
        if !state.contains(&entry.entity_id) {
            return Err(not_found(&entry.entity_id));
        }
        state.forecasts.push(entry);
        Ok(())
    }

    async fn latest_forecast(&self, entity_id: &EntityId) -> StoreResult<Option<ForecastLogEntry>> {
        Ok(self
            .read()?
            .forecasts
            .iter()
            .rev()
            .find(|entry| &entry.entity_id == entity_id)
            .cloned())
    }

    async fn set_status(&self, entity_id: &EntityId, status: ComplianceStatus) -> StoreResult<()> {
        let mut state = self.write()?;
        state.entity_mut(entity_id)?.status = status;
        Ok(())
    }

    async fn apply_slash(&self, request: SlashRequest) -> StoreResult<SlashEvent> {
        let mut state = self.write()?;

        // Validate everything before the first mutation so a failure leaves no trace.
        let fund = state.fund.ok_or_else(|| {
            StoreError::InvariantViolation("protocol fund is not initialised".to_string())
        })?;
        if state
            .slash_events
            .iter()
            .any(|event| event.tx_hash == request.tx_hash)
        {
            return Err(StoreError::InvariantViolation(format!(
                "duplicate slash transaction '{}'",
                request.tx_hash
            )));
        }
        let stake_before = state.entity_mut(&request.entity_id)?.stake_balance;
        let amount = slash_amount(stake_before, request.fixed_amount);
        let admin_fund_balance = fund.admin_fund_balance.checked_add(amount).ok_or_else(|| {
            StoreError::InvariantViolation("protocol fund balance overflow".to_string())
        })?;

        let entity = state.entity_mut(&request.entity_id)?;
        entity.status = ComplianceStatus::Penalty;
        entity.stake_balance = stake_before - amount;
        state.fund = Some(ProtocolFund { admin_fund_balance });

        let event = SlashEvent {
            entity_id: request.entity_id,
            amount,
            stake_before,
            reason: request.reason,
            triggered_by: request.triggered_by,
            tx_hash: request.tx_hash,
            recorded_at: request.recorded_at,
        };
        state.slash_events.push(event.clone());
        Ok(event)
    }

    async fn list_slash_events(
        &self,
        entity_id: Option<&EntityId>,
        window: QueryWindow,
    ) -> StoreResult<Vec<SlashEvent>> {
        let state = self.read()?;
        let values = state
            .slash_events
            .iter()
            .rev()
            .filter(|event| entity_id.map_or(true, |id| &event.entity_id == id))
            .cloned()
            .collect();
        Ok(apply_window(values, window))
    }

    async fn protocol_fund(&self) -> StoreResult<ProtocolFund> {
        self.read()?.fund.ok_or_else(|| {
            StoreError::InvariantViolation("protocol fund is not initialised".to_string())
        })
    }

    async fn ledger_snapshot(&self) -> StoreResult<LedgerSnapshot> {
        let state = self.read()?;
        let fund = state.fund.ok_or_else(|| {
            StoreError::InvariantViolation("protocol fund is not initialised".to_string())
        })?;
        Ok(LedgerSnapshot {
            fund,
            slash_events: state.slash_events.iter().rev().cloned().collect(),
        })
    }
}
