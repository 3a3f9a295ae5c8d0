use crate::types::{HoldId, OrderId, PaymentMethod, PaymentStatus, PoolId, UnitId, UnitState, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;

/// One ticket or seat instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub pool_id: PoolId,
    pub label: String,
    /// Position in a counting pool's sequence. `None` for seats.
    pub sequence: Option<i64>,
    pub state: UnitState,
    pub owner_user_id: Option<UserId>,
    pub order_id: Option<OrderId>,
    pub sold_at: Option<DateTime<Utc>>,
    pub validation_token: Option<String>,
    pub validated_at: Option<DateTime<Utc>>,
    pub validated_by_user_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl Unit {
    /// Return to AVAILABLE, forgetting everything about the sale.
    pub fn revert(&mut self) {
        self.state = UnitState::Available;
        self.owner_user_id = None;
        self.order_id = None;
        self.sold_at = None;
        self.validation_token = None;
        self.validated_at = None;
        self.validated_by_user_id = None;
    }

    pub fn sell(&mut self, owner: UserId, now: DateTime<Utc>) {
        self.state = UnitState::Sold;
        self.owner_user_id = Some(owner);
        self.sold_at = Some(now);
    }
}

/// Time-bounded exclusive claim on a seat label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Hold {
    pub id: HoldId,
    pub pool_id: PoolId,
    pub label: String,
    pub holder_user_id: UserId,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Hold {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at >= now
    }
}

/// Input to the atomic hold acquisition step. Labels are already deduplicated and validated.
#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub pool_id: PoolId,
    pub labels: Vec<String>,
    pub holder_user_id: UserId,
    pub now: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Input to the atomic seat sale step.
#[derive(Debug, Clone)]
pub struct SeatClaim {
    pub pool_id: PoolId,
    pub label: String,
    pub requester: UserId,
    pub now: DateTime<Utc>,
}

/// Input to the atomic next-in-sequence sale step.
#[derive(Debug, Clone)]
pub struct SequenceClaim {
    pub pool_id: PoolId,
    pub requester: UserId,
    pub now: DateTime<Utc>,
}

/// Outcome of one sweep over expired holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Hold rows deleted.
    pub released: u64,
    /// Units moved from HELD back to AVAILABLE.
    pub reverted_units: u64,
    pub by_pool: HashMap<PoolId, u64>,
}

impl SweepReport {
    pub fn record(&mut self, pool_id: PoolId) {
        self.released += 1;
        *self.by_pool.entry(pool_id).or_default() += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub pool_id: PoolId,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
    pub unit_ids: Vec<UnitId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub order_number: String,
    pub created_by: UserId,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub currency: String,
    pub total: Decimal,
    pub buyer_name: Option<String>,
    pub buyer_phone: Option<String>,
    pub buyer_email: Option<String>,
    pub notes: Option<String>,
    pub items: Vec<OrderItem>,
    pub paid_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn unit_ids(&self) -> impl Iterator<Item = UnitId> + '_ {
        self.items.iter().flat_map(|item| item.unit_ids.iter().copied())
    }
}

/// Everything needed to persist an order in one step. The store assigns `order_number`.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub id: OrderId,
    pub created_by: UserId,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub currency: String,
    pub total: Decimal,
    pub buyer_name: Option<String>,
    pub buyer_phone: Option<String>,
    pub buyer_email: Option<String>,
    pub notes: Option<String>,
    pub items: Vec<OrderItem>,
    /// Validation token for every sold unit in the order.
    pub tokens: Vec<(UnitId, String)>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OrderRecord {
    pub fn into_order(self, order_number: String) -> Order {
        Order {
            id: self.id,
            order_number,
            created_by: self.created_by,
            payment_method: self.payment_method,
            payment_status: self.payment_status,
            currency: self.currency,
            total: self.total,
            buyer_name: self.buyer_name,
            buyer_phone: self.buyer_phone,
            buyer_email: self.buyer_email,
            notes: self.notes,
            items: self.items,
            paid_at: self.paid_at,
            refunded_at: None,
            created_at: self.created_at,
        }
    }
}

/// `ORD-{year}-{daily sequence}`.
pub fn format_order_number(now: DateTime<Utc>, sequence: u32) -> String {
    format!("ORD-{}-{:04}", now.format("%Y"), sequence)
}
