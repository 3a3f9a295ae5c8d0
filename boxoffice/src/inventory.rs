//! Inventory Descriptor operations: pool definitions and their remaining capacity.

use std::sync::Arc;

use tracing::instrument;
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::InventoryStore;
use crate::descriptor::{Availability, NewPool, Pool, PoolUpdate, Remaining};
use crate::errors::{Error, Result};
use crate::types::{EventId, PoolId, abbrev_uuid};

pub struct Inventory<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for Inventory<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: InventoryStore> Inventory<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    #[instrument(skip(self, new), fields(event_id = %abbrev_uuid(&new.event_id), mode = %new.mode), err)]
    pub async fn create_pool(&self, new: NewPool) -> Result<Pool> {
        let pool = Pool::create(Uuid::new_v4(), new, self.clock.now())?;
        let pool = self.store.create_pool(&pool).await?;
        tracing::info!(pool_id = %pool.id, name = %pool.name, capacity = ?pool.capacity(), "Pool created");
        Ok(pool)
    }

    pub async fn get_pool(&self, pool_id: PoolId) -> Result<Pool> {
        self.store.get_pool(pool_id).await?.ok_or(Error::PoolNotFound { pool_id })
    }

    pub async fn list_pools(&self, event_id: EventId) -> Result<Vec<Pool>> {
        self.store.list_pools(event_id).await
    }

    /// Change a pool's name, price, layout, limit or prefix. The mode never changes.
    ///
    /// # Errors
    /// - `CapacityBelowCommitted` if the new limit is below the units already sold or held
    /// - `LayoutDropsCommittedSeat` if the new layout loses a sold or held seat
    #[instrument(skip(self, update), fields(pool_id = %abbrev_uuid(&pool_id)), err)]
    pub async fn update_pool(&self, pool_id: PoolId, update: PoolUpdate) -> Result<Pool> {
        self.store.update_pool(pool_id, &update, self.clock.now()).await
    }

    /// How many more units the pool can sell. Live holds count against it.
    pub async fn remaining_capacity(&self, pool_id: PoolId) -> Result<Remaining> {
        let pool = self.get_pool(pool_id).await?;
        let committed = self.store.committed(pool_id, self.clock.now()).await?;
        Ok(pool.remaining_capacity(&committed))
    }

    pub async fn availability(&self, pool_id: PoolId) -> Result<Availability> {
        let pool = self.get_pool(pool_id).await?;
        let committed = self.store.committed(pool_id, self.clock.now()).await?;
        Ok(pool.availability(&committed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::UnitAllocator;
    use crate::clock::ManualClock;
    use crate::config::{HoldsConfig, RetryConfig};
    use crate::db::in_memory::InMemoryStore;
    use crate::descriptor::{SeatLayout, SeatRow};
    use crate::holds::HoldManager;
    use crate::types::AllocationMode;
    use rust_decimal::Decimal;
    use std::time::Duration;

    struct Fixture {
        inventory: Inventory<InMemoryStore>,
        allocator: UnitAllocator<InMemoryStore>,
        holds: HoldManager<InMemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        Fixture {
            inventory: Inventory::new(store.clone(), clock.clone()),
            allocator: UnitAllocator::new(store.clone(), clock.clone(), RetryConfig::default()),
            holds: HoldManager::new(store, clock.clone(), HoldsConfig::default(), RetryConfig::default()),
            clock,
        }
    }

    fn hall(event_id: EventId) -> NewPool {
        NewPool {
            event_id,
            name: "Hall".into(),
            mode: AllocationMode::Seat,
            layout: Some(SeatLayout::new(vec![SeatRow::new("A", 3), SeatRow::new("B", 2)])),
            quantity: None,
            prefix: None,
            unit_price: Decimal::new(2500, 2),
        }
    }

    #[tokio::test]
    async fn test_create_and_list_pools_per_event() {
        let f = fixture();
        let (event, other_event) = (Uuid::new_v4(), Uuid::new_v4());
        let pool = f.inventory.create_pool(hall(event)).await.unwrap();
        f.inventory.create_pool(hall(other_event)).await.unwrap();

        assert_eq!(f.inventory.get_pool(pool.id).await.unwrap(), pool);
        let pools = f.inventory.list_pools(event).await.unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].id, pool.id);
    }

    #[tokio::test]
    async fn test_invalid_descriptor_is_rejected() {
        let f = fixture();
        let mut new = hall(Uuid::new_v4());
        new.layout = None;
        assert!(matches!(f.inventory.create_pool(new).await, Err(Error::InvalidInput { .. })));

        let missing = Uuid::new_v4();
        assert!(matches!(
            f.inventory.get_pool(missing).await,
            Err(Error::PoolNotFound { pool_id }) if pool_id == missing
        ));
    }

    #[tokio::test]
    async fn test_availability_counts_sold_and_live_holds() {
        let f = fixture();
        let pool = f.inventory.create_pool(hall(Uuid::new_v4())).await.unwrap();
        f.allocator.allocate(pool.id, Uuid::new_v4(), Some("A1")).await.unwrap();
        f.holds
            .acquire_holds(pool.id, &["B1".to_string(), "B2".to_string()], Uuid::new_v4(), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        let availability = f.inventory.availability(pool.id).await.unwrap();
        assert_eq!(availability.total, Some(5));
        assert_eq!(availability.sold, 1);
        assert_eq!(availability.held, 2);
        assert_eq!(availability.available, Some(2));
        assert_eq!(f.inventory.remaining_capacity(pool.id).await.unwrap(), Remaining::Finite(2));

        // Expired holds stop counting even before the sweeper runs
        f.clock.advance(chrono::Duration::seconds(10));
        assert_eq!(f.inventory.remaining_capacity(pool.id).await.unwrap(), Remaining::Finite(4));
    }

    #[tokio::test]
    async fn test_unlimited_general_pool() {
        let f = fixture();
        let pool = f
            .inventory
            .create_pool(NewPool {
                event_id: Uuid::new_v4(),
                name: "Lawn".into(),
                mode: AllocationMode::General,
                layout: None,
                quantity: None,
                prefix: Some("L".into()),
                unit_price: Decimal::ZERO,
            })
            .await
            .unwrap();
        f.allocator.allocate(pool.id, Uuid::new_v4(), None).await.unwrap();

        let availability = f.inventory.availability(pool.id).await.unwrap();
        assert_eq!(availability.total, None);
        assert_eq!(availability.available, None);
        assert_eq!(availability.sold, 1);
        assert_eq!(f.inventory.remaining_capacity(pool.id).await.unwrap(), Remaining::Unbounded);
    }

    #[tokio::test]
    async fn test_update_cannot_drop_a_sold_seat() {
        let f = fixture();
        let pool = f.inventory.create_pool(hall(Uuid::new_v4())).await.unwrap();
        f.allocator.allocate(pool.id, Uuid::new_v4(), Some("B2")).await.unwrap();

        let shrink = PoolUpdate {
            layout: Some(SeatLayout::new(vec![SeatRow::new("A", 3), SeatRow::new("B", 1)])),
            ..Default::default()
        };
        let err = f.inventory.update_pool(pool.id, shrink).await.unwrap_err();
        assert!(matches!(err, Error::LayoutDropsCommittedSeat { label } if label == "B2"));

        let rename = PoolUpdate {
            name: Some("Main hall".into()),
            ..Default::default()
        };
        let updated = f.inventory.update_pool(pool.id, rename).await.unwrap();
        assert_eq!(updated.name, "Main hall");
        assert_eq!(updated.layout, pool.layout);
    }
}
