use crate::error::ComplianceError;
use crate::store::StateStore;
use crate::types::{EntityId, SlashEvent, SlashTrigger};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Amount actually debited by one slash: never more than the stake held.
pub fn slash_amount(current_stake: u64, fixed_amount: u64) -> u64 {
    current_stake.min(fixed_amount)
}

/// A fully-specified slash handed to [`StateStore::apply_slash`].
///
/// The store reads the stake under an exclusive lock and derives the amount
/// with [`slash_amount`]; the request only carries the upper bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlashRequest {
    pub entity_id: EntityId,
    pub fixed_amount: u64,
    pub reason: String,
    pub triggered_by: SlashTrigger,
    pub tx_hash: String,
    pub recorded_at: DateTime<Utc>,
}

/// Stake penalty ledger.
///
/// Every slash runs as one store transaction: status is set to PENALTY, the
/// stake is debited by `min(stake, fixed_slash_amount)`, the protocol fund is
/// credited by the same amount and an immutable [`SlashEvent`] is appended.
#[derive(Clone)]
pub struct SlashLedger {
    store: Arc<dyn StateStore>,
    fixed_slash_amount: u64,
}

impl SlashLedger {
    pub fn new(store: Arc<dyn StateStore>, fixed_slash_amount: u64) -> Self {
        Self {
            store,
            fixed_slash_amount,
        }
    }

    /// Slash on behalf of the autonomous monitor.
    pub async fn slash(
        &self,
        entity_id: &EntityId,
        reason: impl Into<String>,
    ) -> Result<SlashEvent, ComplianceError> {
        self.slash_with_trigger(entity_id, reason, SlashTrigger::Oracle)
            .await
    }

    pub async fn slash_with_trigger(
        &self,
        entity_id: &EntityId,
        reason: impl Into<String>,
        triggered_by: SlashTrigger,
    ) -> Result<SlashEvent, ComplianceError> {
        let reason = reason.into();
        if reason.trim().is_empty() {
            return Err(ComplianceError::Validation(
                "slash reason must not be empty".to_string(),
            ));
        }

        let recorded_at = Utc::now();
        let request = SlashRequest {
            entity_id: entity_id.clone(),
            fixed_amount: self.fixed_slash_amount,
            tx_hash: transaction_hash(entity_id, &reason, recorded_at),
            reason,
            triggered_by,
            recorded_at,
        };

        let event = self.store.apply_slash(request).await.map_err(|e| match e {
            crate::error::StoreError::NotFound(_) => {
                ComplianceError::EntityNotFound(entity_id.to_string())
            }
            other => ComplianceError::Store(other),
        })?;

        warn!(
            entity_id = %event.entity_id,
            amount = event.amount,
            stake_before = event.stake_before,
            stake_after = event.stake_after(),
            tx_hash = %event.tx_hash,
            "Stake slashed"
        );
        Ok(event)
    }
}

/// Unique ledger transaction identifier.
fn transaction_hash(entity_id: &EntityId, reason: &str, at: DateTime<Utc>) -> String {
    let nonce = Uuid::new_v4();
    let mut hasher = blake3::Hasher::new();
    hasher.update(entity_id.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(reason.as_bytes());
    hasher.update(&[0]);
    hasher.update(at.to_rfc3339().as_bytes());
    hasher.update(nonce.as_bytes());
    format!("0x{}", hasher.finalize().to_hex())
}
