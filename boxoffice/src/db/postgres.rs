//! PostgreSQL allocation store.
//!
//! Seat labels and holds are serialized with transaction-scoped advisory locks keyed by
//! `(pool, label)`, taken in sorted order. Seat sales and holds lock the pool row `FOR SHARE`
//! so a concurrent shape update (`FOR UPDATE`) cannot invalidate a label mid-sale; counting
//! pools lock their pool row `FOR UPDATE` to serialize the sequence. The `(pool_id, label)`
//! unique constraint backs all of it: the seat upsert only overwrites rows that are not sold.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use std::str::FromStr;
use tracing::instrument;
use uuid::Uuid;

use super::InventoryStore;
use super::errors::DbError;
use super::models::{Hold, HoldRequest, Order, OrderItem, OrderRecord, SeatClaim, SequenceClaim, SweepReport, Unit, format_order_number};
use crate::descriptor::{Capacity, Committed, Pool, PoolUpdate, SeatLayout};
use crate::errors::{Error, Result};
use crate::types::{AllocationMode, EventId, OrderId, ParseEnumError, PaymentStatus, PoolId, UnitId, UnitState, UserId};

const POOL_COLUMNS: &str = "id, event_id, name, mode, seat_layout, quantity, prefix, unit_price, created_at";

const UNIT_COLUMNS: &str = "id, pool_id, label, sequence, state, owner_user_id, order_id, sold_at, validation_token, \
                            validated_at, validated_by_user_id, created_at";

const HOLD_COLUMNS: &str = "id, pool_id, label, holder_user_id, expires_at, created_at";

const ORDER_COLUMNS: &str = "id, order_number, created_by, payment_method, payment_status, currency, total, buyer_name, \
                             buyer_phone, buyer_email, notes, paid_at, refunded_at, created_at";

#[derive(Debug, FromRow)]
struct PoolRow {
    id: Uuid,
    event_id: Uuid,
    name: String,
    mode: String,
    seat_layout: Option<Json<SeatLayout>>,
    quantity: Option<i32>,
    prefix: Option<String>,
    unit_price: Decimal,
    created_at: DateTime<Utc>,
}

impl TryFrom<PoolRow> for Pool {
    type Error = DbError;

    fn try_from(row: PoolRow) -> std::result::Result<Self, DbError> {
        Ok(Pool {
            id: row.id,
            event_id: row.event_id,
            name: row.name,
            mode: parse_enum(&row.mode)?,
            layout: row.seat_layout.map(|Json(layout)| layout),
            quantity: row.quantity.and_then(|q| u32::try_from(q).ok()),
            prefix: row.prefix,
            unit_price: row.unit_price,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct UnitRow {
    id: Uuid,
    pool_id: Uuid,
    label: String,
    sequence: Option<i64>,
    state: String,
    owner_user_id: Option<Uuid>,
    order_id: Option<Uuid>,
    sold_at: Option<DateTime<Utc>>,
    validation_token: Option<String>,
    validated_at: Option<DateTime<Utc>>,
    validated_by_user_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<UnitRow> for Unit {
    type Error = DbError;

    fn try_from(row: UnitRow) -> std::result::Result<Self, DbError> {
        Ok(Unit {
            id: row.id,
            pool_id: row.pool_id,
            label: row.label,
            sequence: row.sequence,
            state: parse_enum(&row.state)?,
            owner_user_id: row.owner_user_id,
            order_id: row.order_id,
            sold_at: row.sold_at,
            validation_token: row.validation_token,
            validated_at: row.validated_at,
            validated_by_user_id: row.validated_by_user_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct OrderRow {
    id: Uuid,
    order_number: String,
    created_by: Uuid,
    payment_method: String,
    payment_status: String,
    currency: String,
    total: Decimal,
    buyer_name: Option<String>,
    buyer_phone: Option<String>,
    buyer_email: Option<String>,
    notes: Option<String>,
    paid_at: Option<DateTime<Utc>>,
    refunded_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct OrderItemRow {
    pool_id: Uuid,
    quantity: i32,
    unit_price: Decimal,
    subtotal: Decimal,
    unit_ids: Vec<Uuid>,
}

fn parse_enum<T: FromStr<Err = ParseEnumError>>(value: &str) -> std::result::Result<T, DbError> {
    value.parse::<T>().map_err(|e| DbError::Other(e.into()))
}

fn quantity_column(quantity: Option<u32>) -> Result<Option<i32>> {
    quantity
        .map(|q| {
            i32::try_from(q).map_err(|_| Error::InvalidInput {
                message: format!("Quantity {q} is too large"),
            })
        })
        .transpose()
}

fn unit_from_row(row: UnitRow) -> Result<Unit> {
    Ok(Unit::try_from(row)?)
}

/// Keep `subset` in the order the caller asked for.
fn in_request_order(requested: &[String], subset: &[String]) -> Vec<String> {
    requested.iter().filter(|l| subset.contains(l)).cloned().collect()
}

/// PostgreSQL implementation of [`InventoryStore`].
#[derive(Debug, Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &PgPool {
        &self.db
    }
}

async fn lock_pool(conn: &mut PgConnection, pool_id: PoolId, exclusive: bool) -> Result<Pool> {
    let sql = format!(
        "SELECT {POOL_COLUMNS} FROM pools WHERE id = $1 {}",
        if exclusive { "FOR UPDATE" } else { "FOR SHARE" }
    );
    let row = sqlx::query_as::<_, PoolRow>(&sql)
        .bind(pool_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(Error::PoolNotFound { pool_id })?;
    Ok(Pool::try_from(row)?)
}

/// Serialize on `(pool, label)` for the rest of the transaction.
async fn lock_labels(conn: &mut PgConnection, pool_id: PoolId, labels: &[String]) -> Result<()> {
    let mut keys: Vec<String> = labels.iter().map(|label| format!("{pool_id}:{label}")).collect();
    keys.sort();
    keys.dedup();
    for key in keys {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(key)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn committed_in(conn: &mut PgConnection, pool: &Pool, now: DateTime<Utc>) -> Result<Committed> {
    let (sold, held): (i64, i64) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM units WHERE pool_id = $1 AND state IN ('SOLD', 'USED')),
            (SELECT COUNT(*) FROM holds WHERE pool_id = $1 AND expires_at >= $2)
        "#,
    )
    .bind(pool.id)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    let labels = if pool.mode == AllocationMode::Seat {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT label FROM units WHERE pool_id = $1 AND state IN ('SOLD', 'USED')
            UNION
            SELECT label FROM holds WHERE pool_id = $1 AND expires_at >= $2
            ORDER BY label
            "#,
        )
        .bind(pool.id)
        .bind(now)
        .fetch_all(&mut *conn)
        .await?
    } else {
        Vec::new()
    };

    Ok(Committed {
        sold: sold as u64,
        held: held as u64,
        labels,
    })
}

async fn load_order(conn: &mut PgConnection, order_id: OrderId) -> Result<Option<Order>> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
    let Some(row) = sqlx::query_as::<_, OrderRow>(&sql).bind(order_id).fetch_optional(&mut *conn).await? else {
        return Ok(None);
    };
    let items = sqlx::query_as::<_, OrderItemRow>(
        "SELECT pool_id, quantity, unit_price, subtotal, unit_ids FROM order_items WHERE order_id = $1 ORDER BY position",
    )
    .bind(order_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Some(Order {
        id: row.id,
        order_number: row.order_number,
        created_by: row.created_by,
        payment_method: parse_enum(&row.payment_method)?,
        payment_status: parse_enum(&row.payment_status)?,
        currency: row.currency,
        total: row.total,
        buyer_name: row.buyer_name,
        buyer_phone: row.buyer_phone,
        buyer_email: row.buyer_email,
        notes: row.notes,
        items: items
            .into_iter()
            .map(|item| OrderItem {
                pool_id: item.pool_id,
                quantity: u32::try_from(item.quantity).unwrap_or_default(),
                unit_price: item.unit_price,
                subtotal: item.subtotal,
                unit_ids: item.unit_ids,
            })
            .collect(),
        paid_at: row.paid_at,
        refunded_at: row.refunded_at,
        created_at: row.created_at,
    }))
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
impl InventoryStore for PgStore {
    #[instrument(skip(self, pool), fields(pool_id = %pool.id, mode = %pool.mode), err)]
    async fn create_pool(&self, pool: &Pool) -> Result<Pool> {
        let sql = format!(
            "INSERT INTO pools ({POOL_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {POOL_COLUMNS}"
        );
        let row = sqlx::query_as::<_, PoolRow>(&sql)
            .bind(pool.id)
            .bind(pool.event_id)
            .bind(&pool.name)
            .bind(pool.mode.as_str())
            .bind(pool.layout.as_ref().map(Json))
            .bind(quantity_column(pool.quantity)?)
            .bind(pool.prefix.as_deref())
            .bind(pool.unit_price)
            .bind(pool.created_at)
            .fetch_one(&self.db)
            .await?;
        Ok(Pool::try_from(row)?)
    }

    #[instrument(skip(self), err)]
    async fn get_pool(&self, pool_id: PoolId) -> Result<Option<Pool>> {
        let sql = format!("SELECT {POOL_COLUMNS} FROM pools WHERE id = $1");
        let row = sqlx::query_as::<_, PoolRow>(&sql).bind(pool_id).fetch_optional(&self.db).await?;
        Ok(row.map(Pool::try_from).transpose()?)
    }

    #[instrument(skip(self), err)]
    async fn list_pools(&self, event_id: EventId) -> Result<Vec<Pool>> {
        let sql = format!("SELECT {POOL_COLUMNS} FROM pools WHERE event_id = $1 ORDER BY created_at");
        let rows = sqlx::query_as::<_, PoolRow>(&sql).bind(event_id).fetch_all(&self.db).await?;
        Ok(rows.into_iter().map(Pool::try_from).collect::<std::result::Result<_, _>>()?)
    }

    #[instrument(skip(self, update), err)]
    async fn update_pool(&self, pool_id: PoolId, update: &PoolUpdate, now: DateTime<Utc>) -> Result<Pool> {
        let mut tx = self.db.begin().await?;
        let pool = lock_pool(&mut tx, pool_id, true).await?;
        let committed = committed_in(&mut tx, &pool, now).await?;
        let next = pool.apply_update(update, &committed)?;

        sqlx::query("UPDATE pools SET name = $2, seat_layout = $3, quantity = $4, prefix = $5, unit_price = $6 WHERE id = $1")
            .bind(pool_id)
            .bind(&next.name)
            .bind(next.layout.as_ref().map(Json))
            .bind(quantity_column(next.quantity)?)
            .bind(next.prefix.as_deref())
            .bind(next.unit_price)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(next)
    }

    #[instrument(skip(self), err)]
    async fn committed(&self, pool_id: PoolId, now: DateTime<Utc>) -> Result<Committed> {
        let pool = self.get_pool(pool_id).await?.ok_or(Error::PoolNotFound { pool_id })?;
        let mut conn = self.db.acquire().await?;
        committed_in(&mut conn, &pool, now).await
    }

    #[instrument(skip(self, request), fields(pool_id = %request.pool_id, count = request.labels.len()), err)]
    async fn acquire_holds(&self, request: &HoldRequest) -> Result<Vec<Hold>> {
        let mut tx = self.db.begin().await?;
        let pool = lock_pool(&mut tx, request.pool_id, false).await?;
        require_seat_pool(&pool, "holds")?;
        if let Some(label) = request.labels.iter().find(|l| !pool.is_label_valid(l)) {
            return Err(Error::InvalidLabel { label: label.clone() });
        }
        lock_labels(&mut tx, request.pool_id, &request.labels).await?;

        sqlx::query(
            r#"
            WITH expired AS (
                DELETE FROM holds
                WHERE pool_id = $1 AND label = ANY($2) AND expires_at < $3
                RETURNING label
            )
            UPDATE units SET state = 'AVAILABLE'
            FROM expired
            WHERE units.pool_id = $1 AND units.label = expired.label AND units.state = 'HELD'
            "#,
        )
        .bind(request.pool_id)
        .bind(&request.labels)
        .bind(request.now)
        .execute(&mut *tx)
        .await?;

        let sold: Vec<String> = sqlx::query_scalar(
            "SELECT label FROM units WHERE pool_id = $1 AND label = ANY($2) AND state IN ('SOLD', 'USED')",
        )
        .bind(request.pool_id)
        .bind(&request.labels)
        .fetch_all(&mut *tx)
        .await?;
        if !sold.is_empty() {
            return Err(Error::AlreadySold {
                labels: in_request_order(&request.labels, &sold),
            });
        }

        let held: Vec<String> = sqlx::query_scalar(
            "SELECT label FROM holds WHERE pool_id = $1 AND label = ANY($2) AND expires_at >= $3 AND holder_user_id <> $4",
        )
        .bind(request.pool_id)
        .bind(&request.labels)
        .bind(request.now)
        .bind(request.holder_user_id)
        .fetch_all(&mut *tx)
        .await?;
        if !held.is_empty() {
            return Err(Error::AlreadyHeld {
                labels: in_request_order(&request.labels, &held),
            });
        }

        let ids: Vec<Uuid> = request.labels.iter().map(|_| Uuid::new_v4()).collect();
        let sql = format!(
            r#"
            INSERT INTO holds ({HOLD_COLUMNS})
            SELECT hold.id, $1, hold.label, $4, $5, $6
            FROM unnest($2::uuid[], $3::text[]) AS hold(id, label)
            ON CONFLICT (pool_id, label) DO UPDATE
                SET holder_user_id = EXCLUDED.holder_user_id, expires_at = EXCLUDED.expires_at
            RETURNING {HOLD_COLUMNS}
            "#
        );
        let holds = sqlx::query_as::<_, Hold>(&sql)
            .bind(request.pool_id)
            .bind(&ids)
            .bind(&request.labels)
            .bind(request.holder_user_id)
            .bind(request.expires_at)
            .bind(request.now)
            .fetch_all(&mut *tx)
            .await?;

        sqlx::query("UPDATE units SET state = 'HELD' WHERE pool_id = $1 AND label = ANY($2) AND state = 'AVAILABLE'")
            .bind(request.pool_id)
            .bind(&request.labels)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut ordered = Vec::with_capacity(holds.len());
        for label in &request.labels {
            if let Some(hold) = holds.iter().find(|h| &h.label == label) {
                ordered.push(hold.clone());
            }
        }
        Ok(ordered)
    }

    #[instrument(skip(self, labels), fields(count = labels.len()), err)]
    async fn release_holds(&self, pool_id: PoolId, labels: &[String], holder: UserId) -> Result<u64> {
        let mut tx = self.db.begin().await?;
        lock_pool(&mut tx, pool_id, false).await?;
        lock_labels(&mut tx, pool_id, labels).await?;
        let released: i64 = sqlx::query_scalar(
            r#"
            WITH released AS (
                DELETE FROM holds
                WHERE pool_id = $1 AND label = ANY($2) AND holder_user_id = $3
                RETURNING label
            ),
            reverted AS (
                UPDATE units SET state = 'AVAILABLE'
                FROM released
                WHERE units.pool_id = $1 AND units.label = released.label AND units.state = 'HELD'
                RETURNING units.id
            )
            SELECT COUNT(*) FROM released
            "#,
        )
        .bind(pool_id)
        .bind(labels)
        .bind(holder)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(released as u64)
    }

    #[instrument(skip(self), err)]
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        // One statement: each hold is deleted only if it is still expired when its row is
        // locked, and only units whose hold was actually deleted are reverted.
        let rows: Vec<(Uuid, i64, i64)> = sqlx::query_as(
            r#"
            WITH expired AS (
                DELETE FROM holds WHERE expires_at < $1
                RETURNING pool_id, label
            ),
            reverted AS (
                UPDATE units SET state = 'AVAILABLE'
                FROM expired
                WHERE units.pool_id = expired.pool_id AND units.label = expired.label AND units.state = 'HELD'
                RETURNING units.pool_id
            )
            SELECT e.pool_id,
                   COUNT(*)::BIGINT,
                   (SELECT COUNT(*) FROM reverted r WHERE r.pool_id = e.pool_id)::BIGINT
            FROM expired e
            GROUP BY e.pool_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.db)
        .await?;

        let mut report = SweepReport::default();
        for (pool_id, released, reverted) in rows {
            report.released += released as u64;
            report.reverted_units += reverted as u64;
            report.by_pool.insert(pool_id, released as u64);
        }
        Ok(report)
    }

    #[instrument(skip(self), err)]
    async fn live_holds_for_pool(&self, pool_id: PoolId, now: DateTime<Utc>) -> Result<Vec<Hold>> {
        if self.get_pool(pool_id).await?.is_none() {
            return Err(Error::PoolNotFound { pool_id });
        }
        let sql = format!("SELECT {HOLD_COLUMNS} FROM holds WHERE pool_id = $1 AND expires_at >= $2 ORDER BY label");
        Ok(sqlx::query_as::<_, Hold>(&sql).bind(pool_id).bind(now).fetch_all(&self.db).await?)
    }

    #[instrument(skip(self), err)]
    async fn live_holds_for_user(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Vec<Hold>> {
        let sql = format!("SELECT {HOLD_COLUMNS} FROM holds WHERE holder_user_id = $1 AND expires_at >= $2 ORDER BY expires_at");
        Ok(sqlx::query_as::<_, Hold>(&sql).bind(user_id).bind(now).fetch_all(&self.db).await?)
    }

    #[instrument(skip(self, claim), fields(pool_id = %claim.pool_id, label = %claim.label), err)]
    async fn claim_seat(&self, claim: &SeatClaim) -> Result<Unit> {
        let mut tx = self.db.begin().await?;
        let pool = lock_pool(&mut tx, claim.pool_id, false).await?;
        require_seat_pool(&pool, "seat allocation")?;
        if !pool.is_label_valid(&claim.label) {
            return Err(Error::InvalidLabel { label: claim.label.clone() });
        }
        lock_labels(&mut tx, claim.pool_id, std::slice::from_ref(&claim.label)).await?;

        let state: Option<String> = sqlx::query_scalar("SELECT state FROM units WHERE pool_id = $1 AND label = $2")
            .bind(claim.pool_id)
            .bind(&claim.label)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(state) = state
            && parse_enum::<UnitState>(&state)?.is_committed()
        {
            return Err(Error::AlreadySold {
                labels: vec![claim.label.clone()],
            });
        }

        let holder: Option<Uuid> =
            sqlx::query_scalar("SELECT holder_user_id FROM holds WHERE pool_id = $1 AND label = $2 AND expires_at >= $3")
                .bind(claim.pool_id)
                .bind(&claim.label)
                .bind(claim.now)
                .fetch_optional(&mut *tx)
                .await?;
        if holder.is_some_and(|holder| holder != claim.requester) {
            return Err(Error::HeldByOther { label: claim.label.clone() });
        }

        sqlx::query("DELETE FROM holds WHERE pool_id = $1 AND label = $2")
            .bind(claim.pool_id)
            .bind(&claim.label)
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            r#"
            INSERT INTO units (id, pool_id, label, state, owner_user_id, sold_at, created_at)
            VALUES ($1, $2, $3, 'SOLD', $4, $5, $5)
            ON CONFLICT (pool_id, label) DO UPDATE
                SET state = 'SOLD',
                    owner_user_id = EXCLUDED.owner_user_id,
                    sold_at = EXCLUDED.sold_at,
                    order_id = NULL,
                    validation_token = NULL,
                    validated_at = NULL,
                    validated_by_user_id = NULL
                WHERE units.state NOT IN ('SOLD', 'USED')
            RETURNING {UNIT_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, UnitRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(claim.pool_id)
            .bind(&claim.label)
            .bind(claim.requester)
            .bind(claim.now)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::AlreadySold {
                labels: vec![claim.label.clone()],
            })?;
        tx.commit().await?;
        unit_from_row(row)
    }

    #[instrument(skip(self, claim), fields(pool_id = %claim.pool_id), err)]
    async fn claim_next(&self, claim: &SequenceClaim) -> Result<Unit> {
        let mut tx = self.db.begin().await?;
        let pool = lock_pool(&mut tx, claim.pool_id, true).await?;
        if !pool.mode.is_counting() {
            return Err(Error::InvalidMode {
                pool_id: pool.id,
                mode: pool.mode,
                operation: "sequential allocation",
            });
        }

        if let Capacity::Finite(capacity) = pool.capacity() {
            let sold: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM units WHERE pool_id = $1 AND state IN ('SOLD', 'USED')")
                .bind(pool.id)
                .fetch_one(&mut *tx)
                .await?;
            if sold as u64 >= capacity {
                return Err(Error::SoldOut { pool_id: pool.id });
            }
        }

        let reuse = format!(
            r#"
            UPDATE units SET state = 'SOLD', owner_user_id = $2, sold_at = $3
            WHERE id = (
                SELECT id FROM units
                WHERE pool_id = $1 AND state = 'AVAILABLE'
                ORDER BY sequence
                LIMIT 1
            )
            RETURNING {UNIT_COLUMNS}
            "#
        );
        let reused = sqlx::query_as::<_, UnitRow>(&reuse)
            .bind(pool.id)
            .bind(claim.requester)
            .bind(claim.now)
            .fetch_optional(&mut *tx)
            .await?;

        let row = match reused {
            Some(row) => row,
            None => {
                let last: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(sequence), 0)::BIGINT FROM units WHERE pool_id = $1")
                    .bind(pool.id)
                    .fetch_one(&mut *tx)
                    .await?;
                let sequence = last + 1;
                let insert = format!(
                    r#"
                    INSERT INTO units (id, pool_id, label, sequence, state, owner_user_id, sold_at, created_at)
                    VALUES ($1, $2, $3, $4, 'SOLD', $5, $6, $6)
                    RETURNING {UNIT_COLUMNS}
                    "#
                );
                sqlx::query_as::<_, UnitRow>(&insert)
                    .bind(Uuid::new_v4())
                    .bind(pool.id)
                    .bind(pool.sequence_label(sequence))
                    .bind(sequence)
                    .bind(claim.requester)
                    .bind(claim.now)
                    .fetch_one(&mut *tx)
                    .await?
            }
        };
        tx.commit().await?;
        unit_from_row(row)
    }

    #[instrument(skip(self, unit_ids), fields(count = unit_ids.len()), err)]
    async fn revert_units(&self, unit_ids: &[UnitId]) -> Result<u64> {
        let mut tx = self.db.begin().await?;
        let found: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM units WHERE id = ANY($1) FOR UPDATE")
            .bind(unit_ids)
            .fetch_all(&mut *tx)
            .await?;
        if let Some(missing) = unit_ids.iter().find(|id| !found.contains(id)) {
            return Err(Error::UnitNotFound { unit_id: *missing });
        }

        let reverted = sqlx::query(
            r#"
            UPDATE units
            SET state = 'AVAILABLE', owner_user_id = NULL, order_id = NULL, sold_at = NULL,
                validation_token = NULL, validated_at = NULL, validated_by_user_id = NULL
            WHERE id = ANY($1) AND state <> 'AVAILABLE'
            "#,
        )
        .bind(unit_ids)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(reverted)
    }

    #[instrument(skip(self), err)]
    async fn get_unit(&self, unit_id: UnitId) -> Result<Option<Unit>> {
        let sql = format!("SELECT {UNIT_COLUMNS} FROM units WHERE id = $1");
        let row = sqlx::query_as::<_, UnitRow>(&sql).bind(unit_id).fetch_optional(&self.db).await?;
        row.map(unit_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_units(&self, pool_id: PoolId) -> Result<Vec<Unit>> {
        let sql = format!("SELECT {UNIT_COLUMNS} FROM units WHERE pool_id = $1 ORDER BY sequence NULLS FIRST, label");
        let rows = sqlx::query_as::<_, UnitRow>(&sql).bind(pool_id).fetch_all(&self.db).await?;
        rows.into_iter().map(unit_from_row).collect()
    }

    #[instrument(skip(self, record), fields(order_id = %record.id, units = record.tokens.len()), err)]
    async fn create_order(&self, record: OrderRecord) -> Result<Order> {
        let mut tx = self.db.begin().await?;
        let day: NaiveDate = record.created_at.date_naive();
        let sequence: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO order_sequences (day, last_value) VALUES ($1, 1)
            ON CONFLICT (day) DO UPDATE SET last_value = order_sequences.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(day)
        .fetch_one(&mut *tx)
        .await?;
        let order_number = format_order_number(record.created_at, u32::try_from(sequence).unwrap_or_default());

        let sql = format!("INSERT INTO orders ({ORDER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NULL, $13)");
        sqlx::query(&sql)
            .bind(record.id)
            .bind(&order_number)
            .bind(record.created_by)
            .bind(record.payment_method.as_str())
            .bind(record.payment_status.as_str())
            .bind(&record.currency)
            .bind(record.total)
            .bind(record.buyer_name.as_deref())
            .bind(record.buyer_phone.as_deref())
            .bind(record.buyer_email.as_deref())
            .bind(record.notes.as_deref())
            .bind(record.paid_at)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await?;

        for (position, item) in record.items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, position, pool_id, quantity, unit_price, subtotal, unit_ids)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(record.id)
            .bind(position as i32)
            .bind(item.pool_id)
            .bind(quantity_column(Some(item.quantity))?)
            .bind(item.unit_price)
            .bind(item.subtotal)
            .bind(&item.unit_ids)
            .execute(&mut *tx)
            .await?;
        }

        for (unit_id, token) in &record.tokens {
            let attached = sqlx::query("UPDATE units SET order_id = $2, validation_token = $3 WHERE id = $1 AND state = 'SOLD'")
                .bind(unit_id)
                .bind(record.id)
                .bind(token)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if attached == 0 {
                let state: Option<String> = sqlx::query_scalar("SELECT state FROM units WHERE id = $1")
                    .bind(unit_id)
                    .fetch_optional(&mut *tx)
                    .await?;
                return Err(match state {
                    None => Error::UnitNotFound { unit_id: *unit_id },
                    Some(state) => Error::NotSold {
                        unit_id: *unit_id,
                        state: parse_enum(&state)?,
                    },
                });
            }
        }
        tx.commit().await?;
        Ok(record.into_order(order_number))
    }

    #[instrument(skip(self), err)]
    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        let mut conn = self.db.acquire().await?;
        load_order(&mut conn, order_id).await
    }

    #[instrument(skip(self), err)]
    async fn mark_paid(&self, order_id: OrderId, now: DateTime<Utc>) -> Result<Order> {
        let mut tx = self.db.begin().await?;
        let status: Option<String> = sqlx::query_scalar("SELECT payment_status FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order_id)
            .fetch_optional(&mut *tx)
            .await?;
        match status.as_deref().map(parse_enum::<PaymentStatus>).transpose()? {
            None => return Err(Error::OrderNotFound { order_id }),
            Some(PaymentStatus::Paid) => return Err(Error::AlreadyPaid { order_id }),
            Some(PaymentStatus::Refunded) => return Err(Error::OrderRefunded { order_id }),
            Some(PaymentStatus::Pending) => {}
        }
        sqlx::query("UPDATE orders SET payment_status = 'PAID', paid_at = $2 WHERE id = $1")
            .bind(order_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        let order = load_order(&mut tx, order_id).await?.ok_or(Error::OrderNotFound { order_id })?;
        tx.commit().await?;
        Ok(order)
    }

    #[instrument(skip(self), err)]
    async fn refund_order(&self, order_id: OrderId, now: DateTime<Utc>) -> Result<Order> {
        let mut tx = self.db.begin().await?;
        let status: Option<String> = sqlx::query_scalar("SELECT payment_status FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order_id)
            .fetch_optional(&mut *tx)
            .await?;
        match status.as_deref().map(parse_enum::<PaymentStatus>).transpose()? {
            None => return Err(Error::OrderNotFound { order_id }),
            Some(PaymentStatus::Refunded) => return Err(Error::OrderRefunded { order_id }),
            Some(PaymentStatus::Pending | PaymentStatus::Paid) => {}
        }
        sqlx::query("UPDATE orders SET payment_status = 'REFUNDED', refunded_at = $2 WHERE id = $1")
            .bind(order_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE units
            SET state = 'AVAILABLE', owner_user_id = NULL, order_id = NULL, sold_at = NULL,
                validation_token = NULL, validated_at = NULL, validated_by_user_id = NULL
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .execute(&mut *tx)
        .await?;
        let order = load_order(&mut tx, order_id).await?.ok_or(Error::OrderNotFound { order_id })?;
        tx.commit().await?;
        Ok(order)
    }

    #[instrument(skip(self, token), err)]
    async fn mark_validated(&self, unit_id: UnitId, token: &str, validator: UserId, now: DateTime<Utc>) -> Result<Unit> {
        let sql = format!(
            r#"
            UPDATE units SET state = 'USED', validated_at = $3, validated_by_user_id = $4
            WHERE id = $1 AND validation_token = $2 AND state = 'SOLD'
            RETURNING {UNIT_COLUMNS}
            "#
        );
        if let Some(row) = sqlx::query_as::<_, UnitRow>(&sql)
            .bind(unit_id)
            .bind(token)
            .bind(now)
            .bind(validator)
            .fetch_optional(&self.db)
            .await?
        {
            return unit_from_row(row);
        }

        let unit = self.get_unit(unit_id).await?.ok_or(Error::UnitNotFound { unit_id })?;
        Err(if unit.validation_token.as_deref() != Some(token) {
            Error::TokenMismatch { unit_id }
        } else if unit.state == UnitState::Used {
            Error::AlreadyValidated {
                unit_id,
                at: unit.validated_at.unwrap_or(now),
            }
        } else {
            Error::NotSold { unit_id, state: unit.state }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_request_order_preserves_caller_order() {
        let requested = vec!["A3".to_string(), "A1".to_string(), "A2".to_string()];
        let subset = vec!["A1".to_string(), "A3".to_string()];
        assert_eq!(in_request_order(&requested, &subset), vec!["A3".to_string(), "A1".to_string()]);
    }

    #[test]
    fn test_quantity_column_rejects_overflow() {
        assert_eq!(quantity_column(Some(10)).unwrap(), Some(10));
        assert_eq!(quantity_column(None).unwrap(), None);
        assert!(quantity_column(Some(u32::MAX)).is_err());
    }
}
