//! In-memory allocation store.
//!
//! Each pool lives in its own shard behind a `parking_lot::Mutex`, so every atomic step for a
//! pool runs under that pool's lock while unrelated pools proceed in parallel. Operations that
//! touch several pools (revert, order creation, refund) lock the shards they need in pool id
//! order. Locks are never held across an `.await`. Everything is lost on restart.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, MutexGuard};
use uuid::Uuid;

use super::InventoryStore;
use super::models::{Hold, HoldRequest, Order, OrderRecord, SeatClaim, SequenceClaim, SweepReport, Unit, format_order_number};
use crate::descriptor::{Capacity, Committed, Pool, PoolUpdate};
use crate::errors::{Error, Result};
use crate::types::{AllocationMode, EventId, OrderId, PaymentStatus, PoolId, UnitId, UnitState, UserId};

#[derive(Debug)]
struct PoolShard {
    pool: Pool,
    units: HashMap<String, Unit>,
    labels_by_id: HashMap<UnitId, String>,
    holds: HashMap<String, Hold>,
    next_sequence: i64,
}

impl PoolShard {
    fn new(pool: Pool) -> Self {
        Self {
            pool,
            units: HashMap::new(),
            labels_by_id: HashMap::new(),
            holds: HashMap::new(),
            next_sequence: 1,
        }
    }

    fn sold(&self) -> u64 {
        self.units.values().filter(|u| u.state.is_committed()).count() as u64
    }

    fn committed(&self, now: DateTime<Utc>) -> Committed {
        let live: Vec<&Hold> = self.holds.values().filter(|h| h.is_live(now)).collect();
        let labels = if self.pool.mode == AllocationMode::Seat {
            self.units
                .values()
                .filter(|u| u.state.is_committed())
                .map(|u| u.label.clone())
                .chain(live.iter().map(|h| h.label.clone()))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        } else {
            Vec::new()
        };
        Committed {
            sold: self.sold(),
            held: live.len() as u64,
            labels,
        }
    }

    /// HELD -> AVAILABLE for the unit behind `label`, if any.
    fn unhold(&mut self, label: &str) -> bool {
        match self.units.get_mut(label) {
            Some(unit) if unit.state == UnitState::Held => {
                unit.state = UnitState::Available;
                true
            }
            _ => false,
        }
    }

    fn clear_expired(&mut self, now: DateTime<Utc>, report: &mut SweepReport) {
        let expired: Vec<String> = self.holds.values().filter(|h| !h.is_live(now)).map(|h| h.label.clone()).collect();
        for label in expired {
            self.holds.remove(&label);
            report.record(self.pool.id);
            if self.unhold(&label) {
                report.reverted_units += 1;
            }
        }
    }

    fn unit_mut(&mut self, unit_id: &UnitId) -> Option<&mut Unit> {
        let label = self.labels_by_id.get(unit_id)?;
        self.units.get_mut(label)
    }

    fn insert_unit(&mut self, unit: Unit) {
        self.labels_by_id.insert(unit.id, unit.label.clone());
        self.units.insert(unit.label.clone(), unit);
    }
}

/// In-memory implementation of [`InventoryStore`].
#[derive(Default)]
pub struct InMemoryStore {
    pools: DashMap<PoolId, Arc<Mutex<PoolShard>>>,
    unit_pools: DashMap<UnitId, PoolId>,
    orders: DashMap<OrderId, Order>,
    order_sequences: Mutex<HashMap<NaiveDate, u32>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, pool_id: PoolId) -> Result<Arc<Mutex<PoolShard>>> {
        // Clone the Arc out so the map guard is released before the shard is locked.
        self.pools
            .get(&pool_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Error::PoolNotFound { pool_id })
    }

    /// Shards owning `unit_ids`, sorted by pool id, with the units grouped per pool.
    fn shards_for_units(&self, unit_ids: &[UnitId]) -> Result<Vec<(Arc<Mutex<PoolShard>>, Vec<UnitId>)>> {
        let mut by_pool: BTreeMap<PoolId, Vec<UnitId>> = BTreeMap::new();
        for unit_id in unit_ids {
            let pool_id = self
                .unit_pools
                .get(unit_id)
                .map(|entry| *entry.value())
                .ok_or(Error::UnitNotFound { unit_id: *unit_id })?;
            by_pool.entry(pool_id).or_default().push(*unit_id);
        }
        by_pool
            .into_iter()
            .map(|(pool_id, ids)| Ok((self.shard(pool_id)?, ids)))
            .collect()
    }

    fn next_order_sequence(&self, day: NaiveDate) -> u32 {
        let mut sequences = self.order_sequences.lock();
        let counter = sequences.entry(day).or_default();
        *counter += 1;
        *counter
    }
}

fn lock_all(shards: &[(Arc<Mutex<PoolShard>>, Vec<UnitId>)]) -> Vec<(MutexGuard<'_, PoolShard>, &[UnitId])> {
    shards.iter().map(|(shard, ids)| (shard.lock(), ids.as_slice())).collect()
}

fn require_seat_pool(pool: &Pool, operation: &'static str) -> Result<()> {
    if pool.mode != AllocationMode::Seat {
        return Err(Error::InvalidMode {
            pool_id: pool.id,
            mode: pool.mode,
            operation,
        });
    }
    Ok(())
}

#[async_trait]
impl InventoryStore for InMemoryStore {
    async fn create_pool(&self, pool: &Pool) -> Result<Pool> {
        match self.pools.entry(pool.id) {
            Entry::Occupied(_) => Err(Error::InvalidInput {
                message: format!("Pool {} already exists", pool.id),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(PoolShard::new(pool.clone()))));
                Ok(pool.clone())
            }
        }
    }

    async fn get_pool(&self, pool_id: PoolId) -> Result<Option<Pool>> {
        let Some(shard) = self.pools.get(&pool_id).map(|entry| Arc::clone(entry.value())) else {
            return Ok(None);
        };
        let pool = shard.lock().pool.clone();
        Ok(Some(pool))
    }

    async fn list_pools(&self, event_id: EventId) -> Result<Vec<Pool>> {
        let shards: Vec<_> = self.pools.iter().map(|entry| Arc::clone(entry.value())).collect();
        let mut pools: Vec<Pool> = shards
            .iter()
            .map(|shard| shard.lock().pool.clone())
            .filter(|pool| pool.event_id == event_id)
            .collect();
        pools.sort_by_key(|pool| pool.created_at);
        Ok(pools)
    }

    async fn update_pool(&self, pool_id: PoolId, update: &PoolUpdate, now: DateTime<Utc>) -> Result<Pool> {
        let shard = self.shard(pool_id)?;
        let mut shard = shard.lock();
        let committed = shard.committed(now);
        let next = shard.pool.apply_update(update, &committed)?;
        shard.pool = next.clone();
        Ok(next)
    }

    async fn committed(&self, pool_id: PoolId, now: DateTime<Utc>) -> Result<Committed> {
        let shard = self.shard(pool_id)?;
        let shard = shard.lock();
        Ok(shard.committed(now))
    }

    async fn acquire_holds(&self, request: &HoldRequest) -> Result<Vec<Hold>> {
        let shard = self.shard(request.pool_id)?;
        let mut shard = shard.lock();
        require_seat_pool(&shard.pool, "holds")?;
        if let Some(label) = request.labels.iter().find(|l| !shard.pool.is_label_valid(l)) {
            return Err(Error::InvalidLabel { label: label.clone() });
        }

        let mut swept = SweepReport::default();
        shard.clear_expired(request.now, &mut swept);

        let sold: Vec<String> = request
            .labels
            .iter()
            .filter(|l| shard.units.get(*l).is_some_and(|u| u.state.is_committed()))
            .cloned()
            .collect();
        if !sold.is_empty() {
            return Err(Error::AlreadySold { labels: sold });
        }

        let held: Vec<String> = request
            .labels
            .iter()
            .filter(|l| {
                shard
                    .holds
                    .get(*l)
                    .is_some_and(|h| h.is_live(request.now) && h.holder_user_id != request.holder_user_id)
            })
            .cloned()
            .collect();
        if !held.is_empty() {
            return Err(Error::AlreadyHeld { labels: held });
        }

        let mut granted = Vec::with_capacity(request.labels.len());
        for label in &request.labels {
            let hold = shard
                .holds
                .entry(label.clone())
                .and_modify(|h| h.expires_at = request.expires_at)
                .or_insert_with(|| Hold {
                    id: Uuid::new_v4(),
                    pool_id: request.pool_id,
                    label: label.clone(),
                    holder_user_id: request.holder_user_id,
                    expires_at: request.expires_at,
                    created_at: request.now,
                })
                .clone();
            if let Some(unit) = shard.units.get_mut(label)
                && unit.state == UnitState::Available
            {
                unit.state = UnitState::Held;
            }
            granted.push(hold);
        }
        Ok(granted)
    }

    async fn release_holds(&self, pool_id: PoolId, labels: &[String], holder: UserId) -> Result<u64> {
        let shard = self.shard(pool_id)?;
        let mut shard = shard.lock();
        let mut released = 0;
        for label in labels {
            if shard.holds.get(label).is_some_and(|h| h.holder_user_id == holder) {
                shard.holds.remove(label);
                shard.unhold(label);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let shards: Vec<_> = self.pools.iter().map(|entry| Arc::clone(entry.value())).collect();
        let mut report = SweepReport::default();
        for shard in shards {
            shard.lock().clear_expired(now, &mut report);
        }
        Ok(report)
    }

    async fn live_holds_for_pool(&self, pool_id: PoolId, now: DateTime<Utc>) -> Result<Vec<Hold>> {
        let shard = self.shard(pool_id)?;
        let shard = shard.lock();
        let mut holds: Vec<Hold> = shard.holds.values().filter(|h| h.is_live(now)).cloned().collect();
        holds.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(holds)
    }

    async fn live_holds_for_user(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Vec<Hold>> {
        let shards: Vec<_> = self.pools.iter().map(|entry| Arc::clone(entry.value())).collect();
        let mut holds: Vec<Hold> = shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .holds
                    .values()
                    .filter(|h| h.holder_user_id == user_id && h.is_live(now))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        holds.sort_by_key(|h| h.expires_at);
        Ok(holds)
    }

    async fn claim_seat(&self, claim: &SeatClaim) -> Result<Unit> {
        let shard = self.shard(claim.pool_id)?;
        let mut shard = shard.lock();
        require_seat_pool(&shard.pool, "seat allocation")?;
        if !shard.pool.is_label_valid(&claim.label) {
            return Err(Error::InvalidLabel { label: claim.label.clone() });
        }
        if shard.units.get(&claim.label).is_some_and(|u| u.state.is_committed()) {
            return Err(Error::AlreadySold {
                labels: vec![claim.label.clone()],
            });
        }
        if shard
            .holds
            .get(&claim.label)
            .is_some_and(|h| h.is_live(claim.now) && h.holder_user_id != claim.requester)
        {
            return Err(Error::HeldByOther { label: claim.label.clone() });
        }

        shard.holds.remove(&claim.label);
        if let Some(unit) = shard.units.get_mut(&claim.label) {
            unit.sell(claim.requester, claim.now);
            return Ok(unit.clone());
        }

        let mut unit = new_unit(claim.pool_id, claim.label.clone(), None, claim.now);
        unit.sell(claim.requester, claim.now);
        self.unit_pools.insert(unit.id, claim.pool_id);
        shard.insert_unit(unit.clone());
        Ok(unit)
    }

    async fn claim_next(&self, claim: &SequenceClaim) -> Result<Unit> {
        let shard = self.shard(claim.pool_id)?;
        let mut shard = shard.lock();
        if !shard.pool.mode.is_counting() {
            return Err(Error::InvalidMode {
                pool_id: claim.pool_id,
                mode: shard.pool.mode,
                operation: "sequential allocation",
            });
        }
        if let Capacity::Finite(capacity) = shard.pool.capacity()
            && shard.sold() >= capacity
        {
            return Err(Error::SoldOut { pool_id: claim.pool_id });
        }

        if let Some(unit) = shard
            .units
            .values_mut()
            .filter(|u| u.state == UnitState::Available)
            .min_by_key(|u| u.sequence)
        {
            unit.sell(claim.requester, claim.now);
            return Ok(unit.clone());
        }

        let sequence = shard.next_sequence;
        shard.next_sequence += 1;
        let mut unit = new_unit(claim.pool_id, shard.pool.sequence_label(sequence), Some(sequence), claim.now);
        unit.sell(claim.requester, claim.now);
        self.unit_pools.insert(unit.id, claim.pool_id);
        shard.insert_unit(unit.clone());
        Ok(unit)
    }

    async fn revert_units(&self, unit_ids: &[UnitId]) -> Result<u64> {
        let shards = self.shards_for_units(unit_ids)?;
        let mut guards = lock_all(&shards);
        let mut reverted = 0;
        for (shard, ids) in guards.iter_mut() {
            for unit_id in ids.iter() {
                if let Some(unit) = shard.unit_mut(unit_id)
                    && unit.state != UnitState::Available
                {
                    unit.revert();
                    reverted += 1;
                }
            }
        }
        Ok(reverted)
    }

    async fn get_unit(&self, unit_id: UnitId) -> Result<Option<Unit>> {
        let Some(pool_id) = self.unit_pools.get(&unit_id).map(|entry| *entry.value()) else {
            return Ok(None);
        };
        let shard = self.shard(pool_id)?;
        let mut shard = shard.lock();
        Ok(shard.unit_mut(&unit_id).cloned())
    }

    async fn list_units(&self, pool_id: PoolId) -> Result<Vec<Unit>> {
        let shard = self.shard(pool_id)?;
        let shard = shard.lock();
        let mut units: Vec<Unit> = shard.units.values().cloned().collect();
        units.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.label.cmp(&b.label)));
        Ok(units)
    }

    async fn create_order(&self, record: OrderRecord) -> Result<Order> {
        let unit_ids: Vec<UnitId> = record.tokens.iter().map(|(id, _)| *id).collect();
        let tokens: HashMap<UnitId, String> = record.tokens.iter().cloned().collect();

        // The order slot stays locked while units are attached, so a refund cannot interleave.
        let Entry::Vacant(slot) = self.orders.entry(record.id) else {
            return Err(Error::InvalidInput {
                message: format!("Order {} already exists", record.id),
            });
        };
        let shards = self.shards_for_units(&unit_ids)?;
        let mut guards = lock_all(&shards);

        for (shard, ids) in guards.iter_mut() {
            for unit_id in ids.iter() {
                let unit = shard.unit_mut(unit_id).ok_or(Error::UnitNotFound { unit_id: *unit_id })?;
                if unit.state != UnitState::Sold {
                    return Err(Error::NotSold {
                        unit_id: *unit_id,
                        state: unit.state,
                    });
                }
            }
        }
        for (shard, ids) in guards.iter_mut() {
            for unit_id in ids.iter() {
                if let Some(unit) = shard.unit_mut(unit_id) {
                    unit.order_id = Some(record.id);
                    unit.validation_token = tokens.get(unit_id).cloned();
                }
            }
        }
        drop(guards);

        let created_at = record.created_at;
        let sequence = self.next_order_sequence(created_at.date_naive());
        let order = record.into_order(format_order_number(created_at, sequence));
        Ok(slot.insert(order).clone())
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        Ok(self.orders.get(&order_id).map(|entry| entry.value().clone()))
    }

    async fn mark_paid(&self, order_id: OrderId, now: DateTime<Utc>) -> Result<Order> {
        let mut order = self.orders.get_mut(&order_id).ok_or(Error::OrderNotFound { order_id })?;
        match order.payment_status {
            PaymentStatus::Paid => Err(Error::AlreadyPaid { order_id }),
            PaymentStatus::Refunded => Err(Error::OrderRefunded { order_id }),
            PaymentStatus::Pending => {
                order.payment_status = PaymentStatus::Paid;
                order.paid_at = Some(now);
                Ok(order.clone())
            }
        }
    }

    async fn refund_order(&self, order_id: OrderId, now: DateTime<Utc>) -> Result<Order> {
        let mut order = self.orders.get_mut(&order_id).ok_or(Error::OrderNotFound { order_id })?;
        if order.payment_status == PaymentStatus::Refunded {
            return Err(Error::OrderRefunded { order_id });
        }
        let unit_ids: Vec<UnitId> = order.unit_ids().collect();
        let shards = self.shards_for_units(&unit_ids)?;
        let mut guards = lock_all(&shards);
        for (shard, ids) in guards.iter_mut() {
            for unit_id in ids.iter() {
                // A unit already refunded and resold elsewhere belongs to its new order.
                if let Some(unit) = shard.unit_mut(unit_id)
                    && unit.order_id == Some(order_id)
                {
                    unit.revert();
                }
            }
        }
        drop(guards);

        order.payment_status = PaymentStatus::Refunded;
        order.refunded_at = Some(now);
        Ok(order.clone())
    }

    async fn mark_validated(&self, unit_id: UnitId, token: &str, validator: UserId, now: DateTime<Utc>) -> Result<Unit> {
        let pool_id = self
            .unit_pools
            .get(&unit_id)
            .map(|entry| *entry.value())
            .ok_or(Error::UnitNotFound { unit_id })?;
        let shard = self.shard(pool_id)?;
        let mut shard = shard.lock();
        let unit = shard.unit_mut(&unit_id).ok_or(Error::UnitNotFound { unit_id })?;

        if unit.validation_token.as_deref() != Some(token) {
            return Err(Error::TokenMismatch { unit_id });
        }
        match unit.state {
            UnitState::Sold => {
                unit.state = UnitState::Used;
                unit.validated_at = Some(now);
                unit.validated_by_user_id = Some(validator);
                Ok(unit.clone())
            }
            UnitState::Used => Err(Error::AlreadyValidated {
                unit_id,
                at: unit.validated_at.unwrap_or(now),
            }),
            state => Err(Error::NotSold { unit_id, state }),
        }
    }
}

fn new_unit(pool_id: PoolId, label: String, sequence: Option<i64>, now: DateTime<Utc>) -> Unit {
    Unit {
        id: Uuid::new_v4(),
        pool_id,
        label,
        sequence,
        state: UnitState::Available,
        owner_user_id: None,
        order_id: None,
        sold_at: None,
        validation_token: None,
        validated_at: None,
        validated_by_user_id: None,
        created_at: now,
    }
}
