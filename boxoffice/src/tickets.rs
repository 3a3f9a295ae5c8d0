//! Ticket validation tokens.
//!
//! Every unit sold through an order carries an HS256 JWT naming the unit, its pool, event and
//! order. Scanning a ticket verifies the token and moves the unit SOLD -> USED exactly once.
//! The unit row keeps the token it was issued, so a token from before a refund stops working
//! once the unit is resold.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::clock::Clock;
use crate::config::TicketsConfig;
use crate::db::InventoryStore;
use crate::db::models::Unit;
use crate::errors::{Error, Result};
use crate::types::{EventId, OrderId, PoolId, UnitId, UserId};

const TOKEN_TYPE: &str = "ticket_validation";

/// JWT ticket claims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketClaims {
    pub unit_id: UnitId,
    pub pool_id: PoolId,
    pub event_id: EventId,
    pub order_id: OrderId,
    pub label: String,
    pub typ: String,
    pub iat: i64, // Issued at
    pub exp: i64, // Expiration time
}

#[derive(Clone)]
pub struct TicketTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: chrono::Duration,
}

impl TicketTokens {
    pub fn new(config: &TicketsConfig) -> Result<Self> {
        let secret_key = config.secret_key.as_ref().ok_or_else(|| Error::InvalidInput {
            message: "Ticket tokens: tickets.secret_key is required".to_string(),
        })?;
        let ttl = chrono::Duration::from_std(config.token_ttl).map_err(|e| Error::InvalidInput {
            message: format!("Ticket token lifetime out of range: {e}"),
        })?;
        Ok(Self {
            encoding: EncodingKey::from_secret(secret_key.as_bytes()),
            decoding: DecodingKey::from_secret(secret_key.as_bytes()),
            ttl,
        })
    }

    pub fn issue(&self, unit: &Unit, event_id: EventId, order_id: OrderId, now: DateTime<Utc>) -> Result<String> {
        let claims = TicketClaims {
            unit_id: unit.id,
            pool_id: unit.pool_id,
            event_id,
            order_id,
            label: unit.label.clone(),
            typ: TOKEN_TYPE.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| Error::Other(anyhow::anyhow!("create ticket token: {e}")))
    }

    /// Check signature, expiry and type tag.
    pub fn verify(&self, token: &str) -> Result<TicketClaims> {
        let token_data = decode::<TicketClaims>(token, &self.decoding, &Validation::default()).map_err(|e| match e.kind() {
            // Bad tokens from the scanner side
            jsonwebtoken::errors::ErrorKind::InvalidToken
            | jsonwebtoken::errors::ErrorKind::InvalidSignature
            | jsonwebtoken::errors::ErrorKind::ExpiredSignature
            | jsonwebtoken::errors::ErrorKind::MissingRequiredClaim(_)
            | jsonwebtoken::errors::ErrorKind::ImmatureSignature
            | jsonwebtoken::errors::ErrorKind::Base64(_)
            | jsonwebtoken::errors::ErrorKind::Json(_)
            | jsonwebtoken::errors::ErrorKind::Utf8(_)
            | jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => Error::InvalidToken { message: e.to_string() },

            _ => Error::Other(anyhow::anyhow!("ticket token verification: {e}")),
        })?;

        if token_data.claims.typ != TOKEN_TYPE {
            return Err(Error::InvalidToken {
                message: format!("unexpected token type '{}'", token_data.claims.typ),
            });
        }
        Ok(token_data.claims)
    }
}

/// Read-only view of a scanned ticket.
#[derive(Debug, Clone, Serialize)]
pub struct TicketStatus {
    pub claims: TicketClaims,
    pub unit: Unit,
    /// False once the unit has been refunded or reissued under another token
    pub is_current: bool,
}

pub struct TicketValidator<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    tokens: TicketTokens,
}

impl<S> Clone for TicketValidator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            tokens: self.tokens.clone(),
        }
    }
}

impl<S: InventoryStore> TicketValidator<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, tokens: TicketTokens) -> Self {
        Self { store, clock, tokens }
    }

    /// Admit the ticket: SOLD -> USED, recording who scanned it and when.
    ///
    /// # Errors
    /// - `InvalidToken` for a forged, expired or foreign token
    /// - `TokenMismatch` if the unit was refunded or resold since the token was issued
    /// - `AlreadyValidated` on a second scan
    #[instrument(skip(self, token), err)]
    pub async fn validate_ticket(&self, token: &str, validator: UserId) -> Result<Unit> {
        let claims = self.tokens.verify(token)?;
        let unit = self
            .store
            .mark_validated(claims.unit_id, token, validator, self.clock.now())
            .await?;
        tracing::info!(unit_id = %unit.id, label = %unit.label, "Ticket validated");
        Ok(unit)
    }

    pub async fn ticket_status(&self, token: &str) -> Result<TicketStatus> {
        let claims = self.tokens.verify(token)?;
        let unit = self
            .store
            .get_unit(claims.unit_id)
            .await?
            .ok_or(Error::UnitNotFound { unit_id: claims.unit_id })?;
        let is_current = unit.validation_token.as_deref() == Some(token);
        Ok(TicketStatus { claims, unit, is_current })
    }
}
