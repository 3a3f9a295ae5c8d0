//! Point-of-sale orders over the Settlement Bridge.
//!
//! An order spans one or more pools. Each item is allocated as a batch; if a later item fails,
//! the units of every earlier item are reverted so the order leaves no net sales behind. Once
//! all items are allocated, every unit gets a signed ticket token and the order is persisted
//! with its number in a single store step.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;

use crate::batch::{BatchRequest, restore_holds};
use crate::clock::Clock;
use crate::db::InventoryStore;
use crate::db::models::{Hold, Order, OrderItem, OrderRecord, Unit};
use crate::descriptor::Pool;
use crate::errors::{Error, Result};
use crate::settlement::SettlementBridge;
use crate::tickets::TicketTokens;
use crate::types::{AllocationMode, OrderId, PaymentMethod, PaymentStatus, PoolId, UnitId, UserId};

#[derive(Debug, Clone, Deserialize)]
pub struct NewOrderItem {
    pub pool_id: PoolId,
    #[serde(flatten)]
    pub request: BatchRequest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub items: Vec<NewOrderItem>,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub buyer_name: Option<String>,
    #[serde(default)]
    pub buyer_phone: Option<String>,
    #[serde(default)]
    pub buyer_email: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub struct OrderService<S> {
    store: Arc<S>,
    bridge: Arc<dyn SettlementBridge>,
    clock: Arc<dyn Clock>,
    tokens: TicketTokens,
    currency: String,
}

impl<S> Clone for OrderService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            bridge: Arc::clone(&self.bridge),
            clock: Arc::clone(&self.clock),
            tokens: self.tokens.clone(),
            currency: self.currency.clone(),
        }
    }
}

impl<S: InventoryStore> OrderService<S> {
    pub fn new(store: Arc<S>, bridge: Arc<dyn SettlementBridge>, clock: Arc<dyn Clock>, tokens: TicketTokens, currency: String) -> Self {
        Self {
            store,
            bridge,
            clock,
            tokens,
            currency,
        }
    }

    /// Allocate every item and record the order. CASH orders are paid on creation.
    ///
    /// # Errors
    /// - `OrderItemFailed` naming the failing item; units of earlier items were reverted
    #[instrument(skip(self, new), fields(items = new.items.len(), payment_method = %new.payment_method), err)]
    pub async fn create_order(&self, new: NewOrder, created_by: UserId) -> Result<Order> {
        if new.items.is_empty() {
            return Err(Error::InvalidInput {
                message: "An order needs at least one item".to_string(),
            });
        }
        let mut pools = Vec::with_capacity(new.items.len());
        for item in &new.items {
            let pool = self
                .store
                .get_pool(item.pool_id)
                .await?
                .ok_or(Error::PoolNotFound { pool_id: item.pool_id })?;
            pools.push(pool);
        }

        // Seats bought under the buyer's own holds get those holds back if the order fails.
        let prior_holds = if pools.iter().any(|pool| pool.mode == AllocationMode::Seat) {
            self.store.live_holds_for_user(created_by, self.clock.now()).await?
        } else {
            Vec::new()
        };

        let mut allocated: Vec<Vec<Unit>> = Vec::with_capacity(new.items.len());
        for (index, item) in new.items.iter().enumerate() {
            match self.bridge.allocate_batch(item.pool_id, created_by, &item.request).await {
                Ok(units) => allocated.push(units),
                Err(source) => {
                    let rolled_back = self.roll_back(created_by, &allocated, &prior_holds).await?;
                    tracing::info!(item = index, rolled_back, error = %source, "Order item failed, rolled back");
                    return Err(Error::OrderItemFailed {
                        item: index,
                        pool_id: item.pool_id,
                        rolled_back,
                        source: Box::new(source),
                    });
                }
            }
        }

        let order_id = Uuid::new_v4();
        let record = match self.build_record(order_id, &new, created_by, &pools, &allocated) {
            Ok(record) => record,
            Err(e) => {
                self.roll_back(created_by, &allocated, &prior_holds).await?;
                return Err(e);
            }
        };
        let order = match self.store.create_order(record).await {
            Ok(order) => order,
            Err(e) => {
                self.roll_back(created_by, &allocated, &prior_holds).await?;
                return Err(e);
            }
        };

        tracing::info!(
            order_id = %order.id,
            order_number = %order.order_number,
            total = %order.total,
            units = order.unit_ids().count(),
            "Order created"
        );
        Ok(order)
    }

    fn build_record(&self, order_id: OrderId, new: &NewOrder, created_by: UserId, pools: &[Pool], allocated: &[Vec<Unit>]) -> Result<OrderRecord> {
        let now = self.clock.now();
        let mut items = Vec::with_capacity(allocated.len());
        let mut tokens = Vec::new();
        for (pool, units) in pools.iter().zip(allocated) {
            let quantity = units.len() as u32;
            items.push(OrderItem {
                pool_id: pool.id,
                quantity,
                unit_price: pool.unit_price,
                subtotal: pool.unit_price * Decimal::from(quantity),
                unit_ids: units.iter().map(|u| u.id).collect(),
            });
            for unit in units {
                tokens.push((unit.id, self.tokens.issue(unit, pool.event_id, order_id, now)?));
            }
        }

        let payment_status = match new.payment_method {
            PaymentMethod::Cash => PaymentStatus::Paid,
            _ => PaymentStatus::Pending,
        };
        Ok(OrderRecord {
            id: order_id,
            created_by,
            payment_method: new.payment_method,
            payment_status,
            currency: self.currency.clone(),
            total: items.iter().map(|item| item.subtotal).sum(),
            buyer_name: new.buyer_name.clone(),
            buyer_phone: new.buyer_phone.clone(),
            buyer_email: new.buyer_email.clone(),
            notes: new.notes.clone(),
            items,
            tokens,
            paid_at: (payment_status == PaymentStatus::Paid).then_some(now),
            created_at: now,
        })
    }

    pub async fn get_order(&self, order_id: OrderId) -> Result<Order> {
        self.store.get_order(order_id).await?.ok_or(Error::OrderNotFound { order_id })
    }

    /// PENDING -> PAID.
    #[instrument(skip(self), err)]
    pub async fn confirm_payment(&self, order_id: OrderId) -> Result<Order> {
        self.store.mark_paid(order_id, self.clock.now()).await
    }

    /// Mark the order REFUNDED and return every unit still attached to it to AVAILABLE.
    #[instrument(skip(self), err)]
    pub async fn refund_order(&self, order_id: OrderId) -> Result<Order> {
        let order = self.store.refund_order(order_id, self.clock.now()).await?;
        tracing::info!(order_number = %order.order_number, units = order.unit_ids().count(), "Order refunded");
        Ok(order)
    }

    async fn roll_back(&self, created_by: UserId, allocated: &[Vec<Unit>], prior_holds: &[Hold]) -> Result<usize> {
        let units: Vec<Unit> = allocated.concat();
        if units.is_empty() {
            return Ok(0);
        }
        let unit_ids: Vec<UnitId> = units.iter().map(|u| u.id).collect();
        match self.bridge.revert(&unit_ids).await {
            Ok(_) => {
                restore_holds(self.store.as_ref(), created_by, prior_holds, &units, self.clock.now()).await;
                Ok(unit_ids.len())
            }
            Err(e) => {
                tracing::error!(?unit_ids, error = %e, "Order rollback failed; units remain sold");
                Err(Error::Other(
                    anyhow::Error::new(e).context(format!("rolling back {} units of a failed order", unit_ids.len())),
                ))
            }
        }
    }
}
