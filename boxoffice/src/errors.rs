use crate::db::errors::DbError;
use crate::types::{AllocationMode, OrderId, PoolId, UnitId, UnitState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error as ThisError;

/// Coarse classification of every rejection, stable enough for a transport layer to map onto
/// status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    Conflict,
    Exhausted,
    InvalidState,
    Unauthorized,
    Internal,
}

impl ErrorKind {
    /// Conventional HTTP status for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidInput => 400,
            ErrorKind::Conflict => 409,
            ErrorKind::Exhausted => 409,
            ErrorKind::InvalidState => 422,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Internal => 500,
        }
    }
}

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("Pool {pool_id} not found")]
    PoolNotFound { pool_id: PoolId },

    /// Release matched no hold owned by the requester
    #[error("No matching holds in pool {pool_id}")]
    HoldNotFound { pool_id: PoolId },

    #[error("Unit {unit_id} not found")]
    UnitNotFound { unit_id: UnitId },

    #[error("Order {order_id} not found")]
    OrderNotFound { order_id: OrderId },

    /// A seat pool was asked to allocate without a seat label
    #[error("A seat label is required for pool {pool_id}")]
    MissingLabel { pool_id: PoolId },

    #[error("'{label}' is not a seat in this pool")]
    InvalidLabel { label: String },

    /// Malformed request data
    #[error("{message}")]
    InvalidInput { message: String },

    #[error("Already sold: {}", labels.join(", "))]
    AlreadySold { labels: Vec<String> },

    /// Allocation blocked by another user's live hold
    #[error("Seat {label} is held by another buyer")]
    HeldByOther { label: String },

    /// Hold acquisition blocked by another user's live holds
    #[error("Already held: {}", labels.join(", "))]
    AlreadyHeld { labels: Vec<String> },

    #[error("Pool {pool_id} is sold out")]
    SoldOut { pool_id: PoolId },

    #[error("Pool {pool_id} is a {mode} pool; {operation} is not supported")]
    InvalidMode {
        pool_id: PoolId,
        mode: AllocationMode,
        operation: &'static str,
    },

    #[error("Capacity {requested} is below the {committed} units already sold or held")]
    CapacityBelowCommitted { requested: u64, committed: u64 },

    #[error("New seat layout drops seat {label}, which is sold or held")]
    LayoutDropsCommittedSeat { label: String },

    /// One allocation inside a batch failed; every earlier allocation was reverted and holds the
    /// requester had on those seats were granted again
    #[error("Batch item {index} failed ({source}); {rolled_back} allocated units rolled back")]
    BatchFailed {
        index: usize,
        label: Option<String>,
        rolled_back: usize,
        #[source]
        source: Box<Error>,
    },

    /// One item of a multi-pool order failed; units from earlier items were reverted and the
    /// buyer's holds on them granted again
    #[error("Order item {item} failed ({source}); {rolled_back} allocated units rolled back")]
    OrderItemFailed {
        item: usize,
        pool_id: PoolId,
        rolled_back: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("Order {order_id} is already paid")]
    AlreadyPaid { order_id: OrderId },

    #[error("Order {order_id} has been refunded")]
    OrderRefunded { order_id: OrderId },

    #[error("Invalid ticket token: {message}")]
    InvalidToken { message: String },

    /// The token verified but is not the one currently attached to the unit
    #[error("Ticket token for unit {unit_id} has been superseded")]
    TokenMismatch { unit_id: UnitId },

    #[error("Ticket {unit_id} was already validated at {at}")]
    AlreadyValidated { unit_id: UnitId, at: DateTime<Utc> },

    #[error("Ticket {unit_id} is {state}, not SOLD")]
    NotSold { unit_id: UnitId, state: UnitState },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PoolNotFound { .. } | Error::HoldNotFound { .. } | Error::UnitNotFound { .. } | Error::OrderNotFound { .. } => {
                ErrorKind::NotFound
            }
            Error::MissingLabel { .. } | Error::InvalidLabel { .. } | Error::InvalidInput { .. } => ErrorKind::InvalidInput,
            Error::AlreadySold { .. }
            | Error::HeldByOther { .. }
            | Error::AlreadyHeld { .. }
            | Error::CapacityBelowCommitted { .. }
            | Error::LayoutDropsCommittedSeat { .. }
            | Error::AlreadyValidated { .. } => ErrorKind::Conflict,
            Error::SoldOut { .. } => ErrorKind::Exhausted,
            Error::InvalidMode { .. } | Error::AlreadyPaid { .. } | Error::OrderRefunded { .. } | Error::NotSold { .. } => {
                ErrorKind::InvalidState
            }
            Error::InvalidToken { .. } | Error::TokenMismatch { .. } => ErrorKind::Unauthorized,
            Error::BatchFailed { source, .. } | Error::OrderItemFailed { source, .. } => source.kind(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => ErrorKind::NotFound,
                DbError::UniqueViolation { .. } => ErrorKind::Conflict,
                DbError::ForeignKeyViolation { .. } | DbError::CheckViolation { .. } => ErrorKind::InvalidInput,
                DbError::Transient { .. } | DbError::Other(_) => ErrorKind::Internal,
            },
            Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same atomic store step may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Database(db_err) if db_err.is_transient())
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { .. } => "Resource already exists".to_string(),
                DbError::ForeignKeyViolation { .. } => "Invalid reference to related resource".to_string(),
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::Transient { .. } => "Service temporarily unavailable, please retry".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
            Error::Other(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// Log at a level matching the severity of the error.
    pub fn log(&self) {
        match self.kind() {
            ErrorKind::Internal => tracing::error!("Internal service error: {:#}", self),
            ErrorKind::Unauthorized => tracing::info!("Ticket token rejected: {}", self),
            ErrorKind::Conflict | ErrorKind::Exhausted => tracing::debug!("Allocation rejected: {}", self),
            ErrorKind::NotFound | ErrorKind::InvalidInput | ErrorKind::InvalidState => tracing::debug!("Client error: {}", self),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(DbError::from(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
