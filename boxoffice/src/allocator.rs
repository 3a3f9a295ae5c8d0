//! Unit Allocator: turns an allocation request into one permanently sold unit.
//!
//! SEAT pools sell the named seat through a single upsert keyed by `(pool, label)`. QUEUE and
//! GENERAL pools sell the next number in the pool's sequence through a single count-then-insert
//! step serialized on the pool. Both steps live in the store; this layer validates the request,
//! picks the branch and retries transient store failures.

use std::sync::Arc;

use tracing::instrument;

use crate::clock::Clock;
use crate::config::RetryConfig;
use crate::db::InventoryStore;
use crate::db::models::{SeatClaim, SequenceClaim, Unit};
use crate::descriptor::Pool;
use crate::errors::{Error, Result};
use crate::retry::with_retry;
use crate::types::{AllocationMode, PoolId, UserId, abbrev_uuid};

pub struct UnitAllocator<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
}

impl<S> Clone for UnitAllocator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            retry: self.retry,
        }
    }
}

impl<S: InventoryStore> UnitAllocator<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, retry: RetryConfig) -> Self {
        Self { store, clock, retry }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn pool(&self, pool_id: PoolId) -> Result<Pool> {
        self.store.get_pool(pool_id).await?.ok_or(Error::PoolNotFound { pool_id })
    }

    /// Sell one unit of `pool_id` to `requester`.
    ///
    /// SEAT pools require `label`; counting pools reject one.
    #[instrument(skip(self), fields(pool_id = %abbrev_uuid(&pool_id)), err)]
    pub async fn allocate(&self, pool_id: PoolId, requester: UserId, label: Option<&str>) -> Result<Unit> {
        let pool = self.pool(pool_id).await?;
        self.allocate_in(&pool, requester, label).await
    }

    /// [`Self::allocate`] against an already loaded pool. The store re-checks the pool inside
    /// the atomic step, so a stale copy can only cause a rejection, never a bad sale.
    pub(crate) async fn allocate_in(&self, pool: &Pool, requester: UserId, label: Option<&str>) -> Result<Unit> {
        let unit = match (pool.mode, label) {
            (AllocationMode::Seat, None) => return Err(Error::MissingLabel { pool_id: pool.id }),
            (AllocationMode::Seat, Some(label)) => {
                if !pool.is_label_valid(label) {
                    return Err(Error::InvalidLabel { label: label.to_string() });
                }
                with_retry(&self.retry, "claim_seat", || {
                    let claim = SeatClaim {
                        pool_id: pool.id,
                        label: label.to_string(),
                        requester,
                        now: self.clock.now(),
                    };
                    let store = Arc::clone(&self.store);
                    async move { store.claim_seat(&claim).await }
                })
                .await?
            }
            (AllocationMode::Queue | AllocationMode::General, Some(_)) => {
                return Err(Error::InvalidMode {
                    pool_id: pool.id,
                    mode: pool.mode,
                    operation: "choosing a label",
                });
            }
            (AllocationMode::Queue | AllocationMode::General, None) => {
                with_retry(&self.retry, "claim_next", || {
                    let claim = SequenceClaim {
                        pool_id: pool.id,
                        requester,
                        now: self.clock.now(),
                    };
                    let store = Arc::clone(&self.store);
                    async move { store.claim_next(&claim).await }
                })
                .await?
            }
        };

        tracing::debug!(unit_id = %unit.id, label = %unit.label, "Unit allocated");
        Ok(unit)
    }
}
