use crate::error::ComplianceError;
use crate::store::StateStore;
use crate::types::EntityId;
use serde::Serialize;
use std::collections::BTreeMap;

/// Ledger consistency report.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerAudit {
    pub admin_fund_balance: u64,
    pub total_slashed: u64,
    pub slashed_by_entity: BTreeMap<EntityId, u64>,
    pub slash_events: usize,
    /// Events whose amount exceeded the stake held just before them.
    pub overdrawn_events: usize,
}

impl LedgerAudit {
    /// The protocol fund equals the sum of all slash amounts.
    pub fn is_conserved(&self) -> bool {
        self.admin_fund_balance == self.total_slashed
    }

    pub fn is_consistent(&self) -> bool {
        self.is_conserved() && self.overdrawn_events == 0
    }
}

/// Recompute ledger totals from the append-only slash events and compare them
/// with the protocol fund, both taken from one store snapshot.
pub async fn audit_ledger(store: &dyn StateStore) -> Result<LedgerAudit, ComplianceError> {
    let snapshot = store.ledger_snapshot().await?;
    let (fund, events) = (snapshot.fund, snapshot.slash_events);

    let mut slashed_by_entity: BTreeMap<EntityId, u64> = BTreeMap::new();
    let mut total_slashed: u64 = 0;
    let mut overdrawn_events = 0;
    for event in &events {
        if event.amount > event.stake_before {
            overdrawn_events += 1;
        }
        total_slashed = total_slashed.saturating_add(event.amount);
        *slashed_by_entity.entry(event.entity_id.clone()).or_default() += event.amount;
    }

    Ok(LedgerAudit {
        admin_fund_balance: fund.admin_fund_balance,
        total_slashed,
        slashed_by_entity,
        slash_events: events.len(),
        overdrawn_events,
    })
}
