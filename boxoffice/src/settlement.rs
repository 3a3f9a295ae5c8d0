//! Settlement Bridge: the surface the order subsystem allocates through.

use std::time::Duration;

use async_trait::async_trait;

use crate::allocator::UnitAllocator;
use crate::batch::{BatchAllocator, BatchRequest};
use crate::db::InventoryStore;
use crate::db::models::{Hold, Unit};
use crate::errors::Result;
use crate::holds::HoldManager;
use crate::types::{PoolId, UnitId, UserId};

#[async_trait]
pub trait SettlementBridge: Send + Sync {
    /// Hold `labels` for `user_id`; `ttl` falls back to the configured default.
    async fn acquire_holds(&self, pool_id: PoolId, labels: &[String], user_id: UserId, ttl: Option<Duration>) -> Result<Vec<Hold>>;

    async fn release_holds(&self, pool_id: PoolId, labels: &[String], user_id: UserId) -> Result<u64>;

    async fn allocate(&self, pool_id: PoolId, user_id: UserId, label: Option<&str>) -> Result<Unit>;

    /// All-or-nothing; a failure has already rolled back the batch's own units.
    async fn allocate_batch(&self, pool_id: PoolId, user_id: UserId, request: &BatchRequest) -> Result<Vec<Unit>>;

    /// Return units to AVAILABLE, clearing owner, order and token. Idempotent.
    async fn revert(&self, unit_ids: &[UnitId]) -> Result<u64>;
}

pub struct Settlement<S> {
    holds: HoldManager<S>,
    allocator: UnitAllocator<S>,
    batch: BatchAllocator<S>,
}

impl<S: InventoryStore> Settlement<S> {
    pub fn new(holds: HoldManager<S>, allocator: UnitAllocator<S>) -> Self {
        Self {
            holds,
            batch: BatchAllocator::new(allocator.clone()),
            allocator,
        }
    }
}

#[async_trait]
impl<S: InventoryStore> SettlementBridge for Settlement<S> {
    async fn acquire_holds(&self, pool_id: PoolId, labels: &[String], user_id: UserId, ttl: Option<Duration>) -> Result<Vec<Hold>> {
        self.holds.acquire_holds(pool_id, labels, user_id, ttl).await
    }

    async fn release_holds(&self, pool_id: PoolId, labels: &[String], user_id: UserId) -> Result<u64> {
        self.holds.release_holds(pool_id, labels, user_id).await
    }

    async fn allocate(&self, pool_id: PoolId, user_id: UserId, label: Option<&str>) -> Result<Unit> {
        self.allocator.allocate(pool_id, user_id, label).await
    }

    async fn allocate_batch(&self, pool_id: PoolId, user_id: UserId, request: &BatchRequest) -> Result<Vec<Unit>> {
        self.batch.allocate_batch(pool_id, user_id, request).await
    }

    async fn revert(&self, unit_ids: &[UnitId]) -> Result<u64> {
        if unit_ids.is_empty() {
            return Ok(0);
        }
        let reverted = self.allocator.store().revert_units(unit_ids).await?;
        tracing::info!(requested = unit_ids.len(), reverted, "Units reverted");
        Ok(reverted)
    }
}
