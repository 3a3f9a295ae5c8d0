//! Common type definitions shared across the allocation core.
//!
//! # ID Types
//!
//! All entity IDs are UUIDs wrapped in type aliases:
//!
//! - [`PoolId`]: sellable pool (ticket group) identifier
//! - [`UnitId`]: sold or sellable unit (ticket/seat) identifier
//! - [`HoldId`]: temporary seat hold identifier
//! - [`OrderId`]: point-of-sale order identifier
//! - [`UserId`] / [`EventId`]: identifiers owned by external collaborators
//!
//! # Enums
//!
//! The state enums are persisted as upper-case TEXT columns. [`fmt::Display`] and
//! [`FromStr`] are the single conversion points between the in-memory and stored forms.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type PoolId = Uuid;
pub type UnitId = Uuid;
pub type HoldId = Uuid;
pub type OrderId = Uuid;
pub type UserId = Uuid;
pub type EventId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// Error returned when a stored enum value is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// How units of a pool are identified and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationMode {
    /// Named seats validated against a seat layout.
    Seat,
    /// Sequentially numbered queue tickets.
    Queue,
    /// Sequentially numbered general admission.
    General,
}

impl AllocationMode {
    /// Counting modes mint labels from a per-pool sequence instead of a layout.
    pub fn is_counting(&self) -> bool {
        matches!(self, Self::Queue | Self::General)
    }
}

text_enum!(AllocationMode, "allocation mode", {
    Seat => "SEAT",
    Queue => "QUEUE",
    General => "GENERAL",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    Available,
    Held,
    Sold,
    Used,
}

impl UnitState {
    /// Sold and used units are permanently committed until refunded.
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Sold | Self::Used)
    }
}

text_enum!(UnitState, "unit state", {
    Available => "AVAILABLE",
    Held => "HELD",
    Sold => "SOLD",
    Used => "USED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Cash,
    Card,
    Online,
    Other,
}

text_enum!(PaymentMethod, "payment method", {
    Cash => "CASH",
    Card => "CARD",
    Online => "ONLINE",
    Other => "OTHER",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
}

text_enum!(PaymentStatus, "payment status", {
    Pending => "PENDING",
    Paid => "PAID",
    Refunded => "REFUNDED",
});
