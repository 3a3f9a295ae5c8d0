//! Inventory descriptor: the allocation mode and capacity rules of one sellable pool.
//!
//! A pool is either a seat map ([`AllocationMode::Seat`]) whose capacity is the sum of its row
//! widths, or a counting pool ([`AllocationMode::Queue`] / [`AllocationMode::General`]) that
//! mints `{prefix}{n}` labels up to an optional limit. Everything here is pure validation;
//! persistence and locking live in [`crate::db`].
//!
//! Seat labels are `{row}{column}` with columns numbered from 1. Label checks walk the row list
//! rather than expanding every seat, so they cost O(rows).

use crate::errors::{Error, Result};
use crate::types::{AllocationMode, EventId, PoolId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const MAX_ROW_LABEL_LEN: usize = 5;
pub const MAX_COLUMNS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatRow {
    pub row: String,
    pub columns: u32,
}

impl SeatRow {
    pub fn new(row: impl Into<String>, columns: u32) -> Self {
        Self { row: row.into(), columns }
    }

    /// Column number encoded by `label` if it names a seat in this row.
    fn column_of(&self, label: &str) -> Option<u32> {
        let digits = label.strip_prefix(self.row.as_str())?;
        if digits.is_empty() || digits.starts_with('0') || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse::<u32>().ok().filter(|column| *column <= self.columns)
    }
}

/// Ordered list of rows, serialized as `[{"row": "A", "columns": 10}, ...]`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeatLayout(pub Vec<SeatRow>);

impl SeatLayout {
    pub fn new(rows: Vec<SeatRow>) -> Self {
        Self(rows)
    }

    pub fn rows(&self) -> &[SeatRow] {
        &self.0
    }

    pub fn capacity(&self) -> u64 {
        self.0.iter().map(|r| u64::from(r.columns)).sum()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.iter().any(|row| row.column_of(label).is_some())
    }

    /// Every seat label in layout order.
    pub fn labels(&self) -> impl Iterator<Item = String> + '_ {
        self.0
            .iter()
            .flat_map(|row| (1..=row.columns).map(move |column| format!("{}{}", row.row, column)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(invalid("A seat layout needs at least one row"));
        }
        let mut seen = HashSet::with_capacity(self.0.len());
        for row in &self.0 {
            let len = row.row.chars().count();
            if len == 0 || len > MAX_ROW_LABEL_LEN || row.row.trim() != row.row {
                return Err(invalid(format!("Row label '{}' must be 1-{MAX_ROW_LABEL_LEN} characters", row.row)));
            }
            // A trailing digit would make "A1" + column 1 indistinguishable from "A" + column 11.
            if row.row.ends_with(|c: char| c.is_ascii_digit()) {
                return Err(invalid(format!("Row label '{}' must not end with a digit", row.row)));
            }
            if row.columns == 0 || row.columns > MAX_COLUMNS {
                return Err(invalid(format!("Row '{}' must have 1-{MAX_COLUMNS} columns", row.row)));
            }
            if !seen.insert(row.row.as_str()) {
                return Err(invalid(format!("Row label '{}' appears more than once", row.row)));
            }
        }
        Ok(())
    }
}

/// Declared size of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Unlimited,
    Finite(u64),
}

/// What is left to sell. Unlimited pools never run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Remaining {
    Unbounded,
    Finite(u64),
}

impl Remaining {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Remaining::Finite(0))
    }
}

/// Units a pool has promised away: sold or used units plus live holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Committed {
    pub sold: u64,
    pub held: u64,
    /// Seat labels that are sold, used or held. Empty for counting pools.
    pub labels: Vec<String>,
}

impl Committed {
    pub fn total(&self) -> u64 {
        self.sold + self.held
    }
}

/// Snapshot of a pool's stock. `total` and `available` are `None` for unlimited pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub total: Option<u64>,
    pub sold: u64,
    pub held: u64,
    pub available: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPool {
    pub event_id: EventId,
    pub name: String,
    pub mode: AllocationMode,
    #[serde(default)]
    pub layout: Option<SeatLayout>,
    /// Capacity limit for counting pools; `None` or `0` means unlimited.
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub unit_price: Decimal,
}

/// Partial update. The allocation mode of a pool never changes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolUpdate {
    pub name: Option<String>,
    pub unit_price: Option<Decimal>,
    pub layout: Option<SeatLayout>,
    /// `Some(0)` switches a counting pool to unlimited.
    pub quantity: Option<u32>,
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub event_id: EventId,
    pub name: String,
    pub mode: AllocationMode,
    pub layout: Option<SeatLayout>,
    pub quantity: Option<u32>,
    pub prefix: Option<String>,
    pub unit_price: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Pool {
    pub fn create(id: PoolId, new: NewPool, now: DateTime<Utc>) -> Result<Self> {
        let pool = Self {
            id,
            event_id: new.event_id,
            name: new.name.trim().to_string(),
            mode: new.mode,
            layout: new.layout,
            quantity: new.quantity.filter(|q| *q > 0),
            prefix: new.prefix,
            unit_price: new.unit_price,
            created_at: now,
        }
        .normalized();
        pool.validate()?;
        Ok(pool)
    }

    /// Drop fields that do not apply to the pool's mode.
    fn normalized(mut self) -> Self {
        match self.mode {
            AllocationMode::Seat => {
                self.quantity = None;
                self.prefix = None;
            }
            AllocationMode::Queue | AllocationMode::General => self.layout = None,
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(invalid("Pool name is required"));
        }
        if self.unit_price.is_sign_negative() {
            return Err(invalid("Unit price cannot be negative"));
        }
        match self.mode {
            AllocationMode::Seat => match &self.layout {
                Some(layout) => layout.validate(),
                None => Err(invalid("SEAT pools require a seat layout")),
            },
            AllocationMode::Queue | AllocationMode::General => match self.prefix.as_deref().map(str::trim) {
                Some(prefix) if !prefix.is_empty() => Ok(()),
                _ => Err(invalid(format!("{} pools require a numbering prefix", self.mode))),
            },
        }
    }

    pub fn capacity(&self) -> Capacity {
        match (self.mode, &self.layout, self.quantity) {
            (AllocationMode::Seat, Some(layout), _) => Capacity::Finite(layout.capacity()),
            (AllocationMode::Seat, None, _) => Capacity::Finite(0),
            (_, _, Some(quantity)) => Capacity::Finite(u64::from(quantity)),
            (_, _, None) => Capacity::Unlimited,
        }
    }

    pub fn is_label_valid(&self, label: &str) -> bool {
        self.mode == AllocationMode::Seat && self.layout.as_ref().is_some_and(|layout| layout.contains(label))
    }

    pub fn remaining_capacity(&self, committed: &Committed) -> Remaining {
        match self.capacity() {
            Capacity::Unlimited => Remaining::Unbounded,
            Capacity::Finite(capacity) => Remaining::Finite(capacity.saturating_sub(committed.total())),
        }
    }

    pub fn availability(&self, committed: &Committed) -> Availability {
        let (total, available) = match (self.capacity(), self.remaining_capacity(committed)) {
            (Capacity::Finite(total), Remaining::Finite(left)) => (Some(total), Some(left)),
            _ => (None, None),
        };
        Availability {
            total,
            sold: committed.sold,
            held: committed.held,
            available,
        }
    }

    /// Label minted for the `sequence`-th unit of a counting pool.
    pub fn sequence_label(&self, sequence: i64) -> String {
        format!("{}{}", self.prefix.as_deref().unwrap_or_default(), sequence)
    }

    /// Apply `update`, refusing any shape change that would strand units already sold or held.
    pub fn apply_update(&self, update: &PoolUpdate, committed: &Committed) -> Result<Pool> {
        let mut next = self.clone();
        if let Some(name) = &update.name {
            next.name = name.trim().to_string();
        }
        if let Some(price) = update.unit_price {
            next.unit_price = price;
        }
        match self.mode {
            AllocationMode::Seat => {
                if update.quantity.is_some() || update.prefix.is_some() {
                    return Err(invalid("SEAT pools are sized by their layout"));
                }
                if let Some(layout) = &update.layout {
                    next.layout = Some(layout.clone());
                }
            }
            AllocationMode::Queue | AllocationMode::General => {
                if update.layout.is_some() {
                    return Err(invalid(format!("{} pools have no seat layout", self.mode)));
                }
                if let Some(quantity) = update.quantity {
                    next.quantity = Some(quantity).filter(|q| *q > 0);
                }
                if let Some(prefix) = &update.prefix {
                    next.prefix = Some(prefix.clone());
                }
            }
        }
        next.validate()?;

        if let Capacity::Finite(requested) = next.capacity()
            && requested < committed.total()
        {
            return Err(Error::CapacityBelowCommitted {
                requested,
                committed: committed.total(),
            });
        }
        if next.mode == AllocationMode::Seat
            && let Some(label) = committed.labels.iter().find(|label| !next.is_label_valid(label))
        {
            return Err(Error::LayoutDropsCommittedSeat { label: label.clone() });
        }
        Ok(next)
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidInput { message: message.into() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn seat_pool(rows: Vec<SeatRow>) -> Pool {
        Pool::create(
            Uuid::new_v4(),
            NewPool {
                event_id: Uuid::new_v4(),
                name: "Stalls".into(),
                mode: AllocationMode::Seat,
                layout: Some(SeatLayout::new(rows)),
                quantity: None,
                prefix: None,
                unit_price: Decimal::new(2500, 2),
            },
            Utc::now(),
        )
        .unwrap()
    }

    fn queue_pool(quantity: Option<u32>) -> Pool {
        Pool::create(
            Uuid::new_v4(),
            NewPool {
                event_id: Uuid::new_v4(),
                name: "Walk-in".into(),
                mode: AllocationMode::Queue,
                layout: None,
                quantity,
                prefix: Some("Q-".into()),
                unit_price: Decimal::ZERO,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_seat_capacity_is_sum_of_columns() {
        let pool = seat_pool(vec![SeatRow::new("A", 3), SeatRow::new("BB", 12)]);
        assert_eq!(pool.capacity(), Capacity::Finite(15));
        assert_eq!(pool.layout.as_ref().unwrap().labels().count(), 15);
    }

    #[test]
    fn test_label_validity() {
        let pool = seat_pool(vec![SeatRow::new("A", 3), SeatRow::new("AA", 12)]);
        assert!(pool.is_label_valid("A1"));
        assert!(pool.is_label_valid("A3"));
        assert!(pool.is_label_valid("AA12"));
        assert!(!pool.is_label_valid("A4"));
        assert!(!pool.is_label_valid("A0"));
        assert!(!pool.is_label_valid("A01"));
        assert!(!pool.is_label_valid("A"));
        assert!(!pool.is_label_valid("B1"));
        assert!(!pool.is_label_valid("A1x"));
        assert!(!pool.is_label_valid("A+1"));
    }

    #[test]
    fn test_layout_validation() {
        let cases = [
            vec![],
            vec![SeatRow::new("A", 0)],
            vec![SeatRow::new("A", 101)],
            vec![SeatRow::new("TOOLONG", 3)],
            vec![SeatRow::new("A", 3), SeatRow::new("A", 4)],
            vec![SeatRow::new("R1", 3)],
            vec![SeatRow::new("", 3)],
        ];
        for rows in cases {
            let layout = SeatLayout::new(rows.clone());
            assert!(layout.validate().is_err(), "layout {rows:?} should be rejected");
        }
        assert!(SeatLayout::new(vec![SeatRow::new("VIP", 100)]).validate().is_ok());
    }

    #[test]
    fn test_counting_pools_require_prefix() {
        let result = Pool::create(
            Uuid::new_v4(),
            NewPool {
                event_id: Uuid::new_v4(),
                name: "GA".into(),
                mode: AllocationMode::General,
                layout: None,
                quantity: Some(10),
                prefix: Some("  ".into()),
                unit_price: Decimal::ZERO,
            },
            Utc::now(),
        );
        assert!(matches!(result, Err(Error::InvalidInput { .. })));
    }

    #[test]
    fn test_zero_quantity_means_unlimited() {
        let pool = queue_pool(Some(0));
        assert_eq!(pool.capacity(), Capacity::Unlimited);
        assert_eq!(pool.remaining_capacity(&Committed::default()), Remaining::Unbounded);
        let availability = pool.availability(&Committed {
            sold: 7,
            ..Default::default()
        });
        assert_eq!(availability.total, None);
        assert_eq!(availability.sold, 7);
    }

    #[test]
    fn test_remaining_capacity_counts_holds() {
        let pool = seat_pool(vec![SeatRow::new("A", 3)]);
        let committed = Committed {
            sold: 1,
            held: 2,
            labels: vec!["A1".into(), "A2".into(), "A3".into()],
        };
        assert_eq!(pool.remaining_capacity(&committed), Remaining::Finite(0));
        assert!(pool.remaining_capacity(&committed).is_exhausted());
    }

    #[test]
    fn test_update_rejects_shrinking_below_committed() {
        let pool = queue_pool(Some(10));
        let committed = Committed {
            sold: 6,
            held: 0,
            labels: vec![],
        };
        let err = pool
            .apply_update(
                &PoolUpdate {
                    quantity: Some(5),
                    ..Default::default()
                },
                &committed,
            )
            .unwrap_err();
        assert!(matches!(err, Error::CapacityBelowCommitted { requested: 5, committed: 6 }));

        let grown = pool
            .apply_update(
                &PoolUpdate {
                    quantity: Some(6),
                    ..Default::default()
                },
                &committed,
            )
            .unwrap();
        assert_eq!(grown.capacity(), Capacity::Finite(6));
    }

    #[test]
    fn test_update_rejects_layout_dropping_sold_seat() {
        let pool = seat_pool(vec![SeatRow::new("A", 3), SeatRow::new("B", 3)]);
        let committed = Committed {
            sold: 1,
            held: 0,
            labels: vec!["B2".into()],
        };
        let update = PoolUpdate {
            layout: Some(SeatLayout::new(vec![SeatRow::new("A", 5)])),
            ..Default::default()
        };
        let err = pool.apply_update(&update, &committed).unwrap_err();
        assert!(matches!(err, Error::LayoutDropsCommittedSeat { label } if label == "B2"));
    }

    #[test]
    fn test_update_keeps_mode_specific_fields() {
        let pool = seat_pool(vec![SeatRow::new("A", 3)]);
        let update = PoolUpdate {
            quantity: Some(50),
            ..Default::default()
        };
        assert!(pool.apply_update(&update, &Committed::default()).is_err());
    }

    #[test]
    fn test_layout_serialization_shape() {
        let layout: SeatLayout = serde_json::from_str(r#"[{"row":"A","columns":3},{"row":"B","columns":2}]"#).unwrap();
        assert_eq!(layout.capacity(), 5);
        assert_eq!(layout.rows()[1], SeatRow::new("B", 2));
    }
}
