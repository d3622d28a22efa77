//! The ledger audit must see the fund and the slash events as of the same
//! moment, even while the monitor keeps slashing.

use async_trait::async_trait;
use pollustake_core::*;
use std::sync::Arc;

/// Store that lets a real slash commit between any two separate reads, the
/// way a concurrent monitor cycle would.
struct BusyStore {
    inner: Arc<InMemoryStateStore>,
    ledger: SlashLedger,
    target: EntityId,
}

impl BusyStore {
    fn new() -> Self {
        let inner = Arc::new(InMemoryStateStore::with_entities([
            NewEntity::new("kiln-1", "Kiln One", 100),
        ]));
        let ledger = SlashLedger::new(inner.clone(), 10);
        Self {
            inner,
            ledger,
            target: EntityId::new("kiln-1"),
        }
    }

    async fn concurrent_slash(&self) {
        self.ledger
            .slash(&self.target, "Actual PM2.5 breach: 250")
            .await
            .unwrap();
    }
}

#[async_trait]
impl StateStore for BusyStore {
    fn backend_label(&self) -> &'static str {
        "busy"
    }

    async fn register_entity(&self, entity: NewEntity) -> StoreResult<bool> {
        self.inner.register_entity(entity).await
    }

    async fn ensure_protocol_fund(&self) -> StoreResult<()> {
        self.inner.ensure_protocol_fund().await
    }

    async fn list_entities(&self) -> StoreResult<Vec<Entity>> {
        self.inner.list_entities().await
    }

    async fn get_entity(&self, entity_id: &EntityId) -> StoreResult<Option<Entity>> {
        self.inner.get_entity(entity_id).await
    }

    async fn append_reading(
        &self,
        entity_id: &EntityId,
        reading: NewReading,
    ) -> StoreResult<Reading> {
        self.inner.append_reading(entity_id, reading).await
    }

    async fn recent_readings(
        &self,
        entity_id: &EntityId,
        limit: usize,
    ) -> StoreResult<Vec<Reading>> {
        self.inner.recent_readings(entity_id, limit).await
    }

    async fn append_forecast(&self, entry: ForecastLogEntry) -> StoreResult<()> {
        self.inner.append_forecast(entry).await
    }

    async fn latest_forecast(&self, entity_id: &EntityId) -> StoreResult<Option<ForecastLogEntry>> {
        self.inner.latest_forecast(entity_id).await
    }

    async fn set_status(&self, entity_id: &EntityId, status: ComplianceStatus) -> StoreResult<()> {
        self.inner.set_status(entity_id, status).await
    }

    async fn apply_slash(&self, request: SlashRequest) -> StoreResult<SlashEvent> {
        self.inner.apply_slash(request).await
    }

    async fn list_slash_events(
        &self,
        entity_id: Option<&EntityId>,
        window: QueryWindow,
    ) -> StoreResult<Vec<SlashEvent>> {
        let events = self.inner.list_slash_events(entity_id, window).await?;
        self.concurrent_slash().await;
        Ok(events)
    }

    async fn protocol_fund(&self) -> StoreResult<ProtocolFund> {
        let fund = self.inner.protocol_fund().await?;
        self.concurrent_slash().await;
        Ok(fund)
    }

    async fn ledger_snapshot(&self) -> StoreResult<LedgerSnapshot> {
        let snapshot = self.inner.ledger_snapshot().await?;
        self.concurrent_slash().await;
        Ok(snapshot)
    }
}

#[tokio::test]
async fn audit_is_conserved_while_slashes_land() {
    let store = BusyStore::new();

    let first = audit_ledger(&store).await.unwrap();
    assert!(first.is_consistent());
    assert_eq!(first.admin_fund_balance, 0);
    assert_eq!(first.total_slashed, 0);

    // Every audit let one more slash through; each still sees a matching pair.
    for round in 1..=3u64 {
        let audit = audit_ledger(&store).await.unwrap();
        assert!(audit.is_conserved(), "round {round}: {audit:?}");
        assert_eq!(audit.slash_events as u64, round);
        assert_eq!(audit.admin_fund_balance, round * 10);
    }

    let kiln = store.get_entity(&store.target).await.unwrap().unwrap();
    assert_eq!(kiln.stake_balance, 60);
}

#[tokio::test]
async fn snapshot_pairs_fund_with_its_events() {
    let store = Arc::new(InMemoryStateStore::with_entities([NewEntity::new("a", "Alpha", 15)]));
    let ledger = SlashLedger::new(store.clone(), 10);
    let a = EntityId::new("a");

    ledger.slash(&a, "first breach").await.unwrap();
    ledger.slash(&a, "second breach").await.unwrap();

    let snapshot = store.ledger_snapshot().await.unwrap();
    assert_eq!(snapshot.fund.admin_fund_balance, 15);
    let amounts: Vec<u64> = snapshot.slash_events.iter().map(|e| e.amount).collect();
    assert_eq!(amounts, vec![5, 10]);
}

#[tokio::test]
async fn snapshot_requires_initialised_fund() {
    let store = InMemoryStateStore::new();

    let err = store.ledger_snapshot().await.unwrap_err();
    assert!(matches!(err, StoreError::InvariantViolation(_)));
}
