//! Batch Allocator: N allocations from one pool as a single all-or-nothing request.
//!
//! Each unit is sold by its own atomic step. If any step fails, every unit already sold in the
//! batch is reverted before the error is returned, so a failed batch leaves no net sales.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::instrument;

use crate::allocator::UnitAllocator;
use crate::clock::Clock;
use crate::db::InventoryStore;
use crate::db::models::{Hold, HoldRequest, Unit};
use crate::descriptor::Capacity;
use crate::errors::{Error, Result};
use crate::types::{AllocationMode, PoolId, UnitId, UserId, abbrev_uuid};

/// Upper bound on the result vector reserved ahead of selling.
const PREALLOCATE_LIMIT: usize = 256;

/// What to allocate: `labels` for SEAT pools, `count` for QUEUE/GENERAL pools.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub mode: AllocationMode,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
}

impl BatchRequest {
    pub fn seats(labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            mode: AllocationMode::Seat,
            count: None,
            labels: Some(labels.into_iter().map(Into::into).collect()),
        }
    }

    pub fn count(mode: AllocationMode, count: u32) -> Self {
        Self {
            mode,
            count: Some(count),
            labels: None,
        }
    }
}

pub struct BatchAllocator<S> {
    allocator: UnitAllocator<S>,
}

impl<S> Clone for BatchAllocator<S> {
    fn clone(&self) -> Self {
        Self {
            allocator: self.allocator.clone(),
        }
    }
}

impl<S: InventoryStore> BatchAllocator<S> {
    pub fn new(allocator: UnitAllocator<S>) -> Self {
        Self { allocator }
    }

    #[instrument(skip(self, request), fields(pool_id = %abbrev_uuid(&pool_id), mode = %request.mode), err)]
    pub async fn allocate_batch(&self, pool_id: PoolId, requester: UserId, request: &BatchRequest) -> Result<Vec<Unit>> {
        let pool = self.allocator.pool(pool_id).await?;
        if pool.mode != request.mode {
            return Err(Error::InvalidMode {
                pool_id,
                mode: pool.mode,
                operation: "a batch for a different mode",
            });
        }

        let (labels, count): (&[String], usize) = match request.mode {
            AllocationMode::Seat => {
                let labels = request.labels.as_deref().unwrap_or_default();
                if labels.is_empty() {
                    return Err(Error::MissingLabel { pool_id });
                }
                let mut seen = HashSet::with_capacity(labels.len());
                if let Some(duplicate) = labels.iter().find(|l| !seen.insert(l.as_str())) {
                    return Err(Error::InvalidInput {
                        message: format!("Seat {duplicate} is requested more than once"),
                    });
                }
                (labels, labels.len())
            }
            AllocationMode::Queue | AllocationMode::General => match request.count {
                Some(count) if count > 0 => (&[], count as usize),
                _ => {
                    return Err(Error::InvalidInput {
                        message: "Batch count must be at least 1".to_string(),
                    });
                }
            },
        };

        // More numbers than the pool will ever hold cannot succeed; fail before selling any.
        let capacity = match pool.capacity() {
            Capacity::Finite(capacity) => usize::try_from(capacity).unwrap_or(usize::MAX),
            Capacity::Unlimited => usize::MAX,
        };
        if request.mode != AllocationMode::Seat && count > capacity {
            return Err(Error::BatchFailed {
                index: capacity,
                label: None,
                rolled_back: 0,
                source: Box::new(Error::SoldOut { pool_id }),
            });
        }

        // Buying a held seat consumes the hold, so note them to put back if the batch fails.
        let prior_holds: Vec<Hold> = if request.mode == AllocationMode::Seat {
            let now = self.allocator.clock().now();
            let holds = self.allocator.store().live_holds_for_user(requester, now).await?;
            holds
                .into_iter()
                .filter(|hold| hold.pool_id == pool_id && labels.contains(&hold.label))
                .collect()
        } else {
            Vec::new()
        };

        let mut sold: Vec<Unit> = Vec::with_capacity(count.min(PREALLOCATE_LIMIT));
        for index in 0..count {
            let label = labels.get(index).map(String::as_str);
            match self.allocator.allocate_in(&pool, requester, label).await {
                Ok(unit) => sold.push(unit),
                Err(source) => {
                    let unit_ids: Vec<UnitId> = sold.iter().map(|u| u.id).collect();
                    let rolled_back = self.roll_back(pool_id, &unit_ids).await?;
                    restore_holds(self.allocator.store().as_ref(), requester, &prior_holds, &sold, self.allocator.clock().now()).await;
                    tracing::info!(index, rolled_back, error = %source, "Batch allocation failed, rolled back");
                    return Err(Error::BatchFailed {
                        index,
                        label: label.map(str::to_string),
                        rolled_back,
                        source: Box::new(source),
                    });
                }
            }
        }
        Ok(sold)
    }

    /// Compensate for a failed batch. A rollback failure leaves sold units behind and is
    /// reported as an internal error naming them.
    async fn roll_back(&self, pool_id: PoolId, unit_ids: &[UnitId]) -> Result<usize> {
        if unit_ids.is_empty() {
            return Ok(0);
        }
        match self.allocator.store().revert_units(unit_ids).await {
            Ok(_) => Ok(unit_ids.len()),
            Err(e) => {
                tracing::error!(pool_id = %pool_id, ?unit_ids, error = %e, "Batch rollback failed; units remain sold");
                Err(Error::Other(
                    anyhow::Error::new(e).context(format!("rolling back {} units of a failed batch", unit_ids.len())),
                ))
            }
        }
    }
}

/// Re-grant `requester`'s holds on units that were sold and then reverted, keeping their
/// original deadlines. A seat taken by someone else in between stays lost.
pub(crate) async fn restore_holds<S: InventoryStore>(store: &S, requester: UserId, prior_holds: &[Hold], reverted: &[Unit], now: DateTime<Utc>) {
    let mut groups: BTreeMap<(PoolId, DateTime<Utc>), Vec<String>> = BTreeMap::new();
    for hold in prior_holds {
        if hold.expires_at > now
            && reverted
                .iter()
                .any(|unit| unit.pool_id == hold.pool_id && unit.label == hold.label)
        {
            groups
                .entry((hold.pool_id, hold.expires_at))
                .or_default()
                .push(hold.label.clone());
        }
    }

    for ((pool_id, expires_at), labels) in groups {
        let request = HoldRequest {
            pool_id,
            labels,
            holder_user_id: requester,
            now,
            expires_at,
        };
        if let Err(e) = store.acquire_holds(&request).await {
            tracing::warn!(pool_id = %pool_id, labels = ?request.labels, error = %e, "Could not restore holds after rollback");
        }
    }
}
