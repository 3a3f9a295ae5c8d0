//! Allocation store: the single source of truth for pools, units, holds and orders.
//!
//! Every method on [`InventoryStore`] that changes allocation state is one atomic step. The
//! conflict checks those steps perform (already sold, held by someone else, sold out) happen
//! inside the same critical section as the write, keyed per `(pool, label)` for seats and per
//! pool for counting sequences. Callers never read-then-write across two calls.
//!
//! Two backends are provided:
//! - [`in_memory::InMemoryStore`] for tests and single-process deployments
//! - [`postgres::PgStore`] backed by PostgreSQL transactions and advisory locks

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::descriptor::{Committed, Pool, PoolUpdate};
use crate::errors::Result;
use crate::types::{EventId, OrderId, PoolId, UnitId, UserId};

pub mod errors;
pub mod in_memory;
pub mod models;
pub mod postgres;


use models::{Hold, HoldRequest, Order, OrderRecord, SeatClaim, SequenceClaim, SweepReport, Unit};

#[async_trait]
pub trait InventoryStore: Send + Sync + 'static {
    /// Persist a validated pool.
    async fn create_pool(&self, pool: &Pool) -> Result<Pool>;

    async fn get_pool(&self, pool_id: PoolId) -> Result<Option<Pool>>;

    async fn list_pools(&self, event_id: EventId) -> Result<Vec<Pool>>;

    /// Apply an update while no allocation in the pool can run, re-checking it against the
    /// units sold and holds live at `now`.
    ///
    /// # Errors
    /// - `PoolNotFound`
    /// - `CapacityBelowCommitted` / `LayoutDropsCommittedSeat`
    async fn update_pool(&self, pool_id: PoolId, update: &PoolUpdate, now: DateTime<Utc>) -> Result<Pool>;

    /// Units sold or used plus live holds at `now`.
    async fn committed(&self, pool_id: PoolId, now: DateTime<Utc>) -> Result<Committed>;

    /// Atomically grant or refresh holds on every requested label, or on none of them.
    ///
    /// Expired holds on the requested labels are cleared first. Available units for the labels
    /// move to HELD.
    ///
    /// # Errors
    /// - `PoolNotFound`, `InvalidMode`, `InvalidLabel`
    /// - `AlreadySold` listing every requested label that is sold or used
    /// - `AlreadyHeld` listing every requested label with a live hold owned by someone else
    async fn acquire_holds(&self, request: &HoldRequest) -> Result<Vec<Hold>>;

    /// Delete the requester's holds on `labels`, returning how many were deleted. HELD units for
    /// released labels revert to AVAILABLE.
    async fn release_holds(&self, pool_id: PoolId, labels: &[String], holder: UserId) -> Result<u64>;

    /// Delete every hold whose deadline is before `now`. Each hold is deleted only if it is still
    /// expired when the delete runs, so a refreshed hold survives a concurrent sweep.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport>;

    async fn live_holds_for_pool(&self, pool_id: PoolId, now: DateTime<Utc>) -> Result<Vec<Hold>>;

    async fn live_holds_for_user(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Vec<Hold>>;

    /// Sell one named seat. Creates the unit on first sale and consumes the requester's hold.
    ///
    /// # Errors
    /// - `PoolNotFound`, `InvalidMode`, `InvalidLabel`
    /// - `AlreadySold` if the seat is sold or used
    /// - `HeldByOther` if someone else holds a live hold on the seat
    async fn claim_seat(&self, claim: &SeatClaim) -> Result<Unit>;

    /// Sell the next unit of a counting pool: the lowest-numbered refunded unit if there is one,
    /// otherwise a newly minted `{prefix}{n}`.
    ///
    /// # Errors
    /// - `PoolNotFound`, `InvalidMode`
    /// - `SoldOut` once sold plus used units reach a finite capacity
    async fn claim_next(&self, claim: &SequenceClaim) -> Result<Unit>;

    /// Return units to AVAILABLE and clear owner, order and token. Returns how many rows changed;
    /// reverting an AVAILABLE unit is a no-op.
    async fn revert_units(&self, unit_ids: &[UnitId]) -> Result<u64>;

    async fn get_unit(&self, unit_id: UnitId) -> Result<Option<Unit>>;

    async fn list_units(&self, pool_id: PoolId) -> Result<Vec<Unit>>;

    /// Persist an order, assign its daily order number and attach every sold unit to it along
    /// with its validation token.
    async fn create_order(&self, record: OrderRecord) -> Result<Order>;

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>>;

    /// PENDING -> PAID.
    ///
    /// # Errors
    /// - `OrderNotFound`, `AlreadyPaid`, `OrderRefunded`
    async fn mark_paid(&self, order_id: OrderId, now: DateTime<Utc>) -> Result<Order>;

    /// Mark the order REFUNDED and revert every unit attached to it, atomically.
    ///
    /// # Errors
    /// - `OrderNotFound`, `OrderRefunded`
    async fn refund_order(&self, order_id: OrderId, now: DateTime<Utc>) -> Result<Order>;

    /// SOLD -> USED for the unit carrying exactly `token`.
    ///
    /// # Errors
    /// - `UnitNotFound`, `TokenMismatch`, `AlreadyValidated`, `NotSold`
    async fn mark_validated(&self, unit_id: UnitId, token: &str, validator: UserId, now: DateTime<Utc>) -> Result<Unit>;
}
