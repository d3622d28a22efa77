use crate::error::ComplianceError;
use crate::store::StateStore;
use crate::types::{EntityId, NewEntity};
use tracing::info;

/// Ordered set of entities the monitor evaluates each cycle.
///
/// Built once at startup and handed to the monitor; iteration order is
/// registration order.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    ids: Vec<EntityId>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the id was already registered.
    pub fn register(&mut self, entity_id: EntityId) -> bool {
        if self.contains(&entity_id) {
            return false;
        }
        self.ids.push(entity_id);
        true
    }

    pub fn contains(&self, entity_id: &EntityId) -> bool {
        self.ids.iter().any(|id| id == entity_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityId> {
        self.ids.iter()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Register every entity already present in the store, in store order.
    pub async fn from_store(store: &dyn StateStore) -> Result<Self, ComplianceError> {
        let mut registry = Self::new();
        for entity in store.list_entities().await? {
            registry.register(entity.id);
        }
        Ok(registry)
    }

    /// Seed `entities` into the store (existing rows are left untouched), make sure the
    /// protocol fund exists, and return a registry over the seeded ids.
    pub async fn seed(
        store: &dyn StateStore,
        entities: impl IntoIterator<Item = NewEntity>,
    ) -> Result<Self, ComplianceError> {
        store.ensure_protocol_fund().await?;
        let mut registry = Self::new();
        for entity in entities {
            let id = entity.id.clone();
            if store.register_entity(entity).await? {
                info!(entity_id = %id, "Registered entity");
            }
            registry.register(id);
        }
        Ok(registry)
    }
}

impl FromIterator<EntityId> for EntityRegistry {
    fn from_iter<T: IntoIterator<Item = EntityId>>(iter: T) -> Self {
        let mut registry = Self::new();
        for id in iter {
            registry.register(id);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStateStore;

    #[test]
    fn keeps_registration_order_without_duplicates() {
        let registry: EntityRegistry = ["b", "a", "b"].into_iter().map(EntityId::from).collect();
        let ids: Vec<&str> = registry.iter().map(EntityId::as_str).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn seeding_twice_keeps_existing_stake() {
        let store = InMemoryStateStore::new();
        EntityRegistry::seed(&store, [NewEntity::new("factory-001", "Bhilai", 100)])
            .await
            .unwrap();
        let registry =
            EntityRegistry::seed(&store, [NewEntity::new("factory-001", "Bhilai", 500)])
                .await
                .unwrap();

        assert_eq!(registry.len(), 1);
        let entity = store
            .get_entity(&EntityId::new("factory-001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.stake_balance, 100);
        assert_eq!(store.protocol_fund().await.unwrap().admin_fund_balance, 0);

        let reloaded = EntityRegistry::from_store(&store).await.unwrap();
        assert_eq!(reloaded.len(), 1);
    }
}
