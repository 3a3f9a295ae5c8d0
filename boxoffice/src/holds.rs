//! Hold Manager: temporary exclusive claims on seats.
//!
//! Holds exist only in SEAT pools. A hold is a reservation of intent with a deadline; it never
//! creates a unit. It ends when its holder buys the seat, releases it, or the sweeper removes it
//! after `expires_at`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use crate::clock::Clock;
use crate::config::{HoldsConfig, RetryConfig};
use crate::db::InventoryStore;
use crate::db::models::{Hold, HoldRequest, SweepReport};
use crate::errors::{Error, Result};
use crate::retry::with_retry;
use crate::types::{AllocationMode, PoolId, UserId, abbrev_uuid};

pub struct HoldManager<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: HoldsConfig,
    retry: RetryConfig,
}

impl<S> Clone for HoldManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            retry: self.retry,
        }
    }
}

impl<S: InventoryStore> HoldManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: HoldsConfig, retry: RetryConfig) -> Self {
        Self {
            store,
            clock,
            config,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Clamp a requested TTL into the configured bounds, falling back to the default.
    pub fn effective_ttl(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.config.default_ttl)
            .max(self.config.min_ttl)
            .min(self.config.max_ttl)
    }

    /// Hold every label for `holder` until `now + ttl`, or hold none of them.
    ///
    /// Re-acquiring a label the holder already holds extends it.
    #[instrument(skip(self, labels), fields(pool_id = %abbrev_uuid(&pool_id), count = labels.len()), err)]
    pub async fn acquire_holds(&self, pool_id: PoolId, labels: &[String], holder: UserId, ttl: Option<Duration>) -> Result<Vec<Hold>> {
        let labels = dedupe(labels);
        let pool = self.store.get_pool(pool_id).await?.ok_or(Error::PoolNotFound { pool_id })?;
        if pool.mode != AllocationMode::Seat {
            return Err(Error::InvalidMode {
                pool_id,
                mode: pool.mode,
                operation: "holds",
            });
        }
        if labels.is_empty() {
            return Err(Error::MissingLabel { pool_id });
        }
        if let Some(label) = labels.iter().find(|l| !pool.is_label_valid(l)) {
            return Err(Error::InvalidLabel { label: label.clone() });
        }

        let ttl = chrono::Duration::from_std(self.effective_ttl(ttl)).map_err(|e| Error::InvalidInput {
            message: format!("Hold TTL out of range: {e}"),
        })?;
        let holds = with_retry(&self.retry, "acquire_holds", || {
            let now = self.clock.now();
            let request = HoldRequest {
                pool_id,
                labels: labels.clone(),
                holder_user_id: holder,
                now,
                expires_at: now + ttl,
            };
            let store = Arc::clone(&self.store);
            async move { store.acquire_holds(&request).await }
        })
        .await?;

        tracing::debug!(held = holds.len(), "Holds acquired");
        Ok(holds)
    }

    /// Release the requester's holds on `labels`.
    ///
    /// # Errors
    /// - `HoldNotFound` if the requester held none of them, including when they were already
    ///   released or swept
    #[instrument(skip(self, labels), fields(pool_id = %abbrev_uuid(&pool_id), count = labels.len()), err)]
    pub async fn release_holds(&self, pool_id: PoolId, labels: &[String], requester: UserId) -> Result<u64> {
        let labels = dedupe(labels);
        let released = self.store.release_holds(pool_id, &labels, requester).await?;
        if released == 0 {
            return Err(Error::HoldNotFound { pool_id });
        }
        Ok(released)
    }

    /// Remove every hold past its deadline and return HELD units to AVAILABLE.
    pub async fn sweep_expired(&self) -> Result<SweepReport> {
        self.store.sweep_expired(self.clock.now()).await
    }

    pub async fn holds_for_pool(&self, pool_id: PoolId) -> Result<Vec<Hold>> {
        self.store.live_holds_for_pool(pool_id, self.clock.now()).await
    }

    pub async fn holds_for_user(&self, user_id: UserId) -> Result<Vec<Hold>> {
        self.store.live_holds_for_user(user_id, self.clock.now()).await
    }
}

/// Drop repeated labels, keeping first occurrences in order.
fn dedupe(labels: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(labels.len());
    labels.iter().filter(|l| seen.insert(l.as_str())).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::in_memory::InMemoryStore;
    use crate::descriptor::{NewPool, Pool, SeatLayout, SeatRow};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        holds: HoldManager<InMemoryStore>,
        pool_id: PoolId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let pool = Pool::create(
            Uuid::new_v4(),
            NewPool {
                event_id: Uuid::new_v4(),
                name: "Balcony".into(),
                mode: AllocationMode::Seat,
                layout: Some(SeatLayout::new(vec![SeatRow::new("A", 3)])),
                quantity: None,
                prefix: None,
                unit_price: Decimal::ZERO,
            },
            Utc::now(),
        )
        .unwrap();
        store.create_pool(&pool).await.unwrap();
        let holds = HoldManager::new(store.clone(), clock.clone(), HoldsConfig::default(), RetryConfig::default());
        Fixture {
            store,
            clock,
            holds,
            pool_id: pool.id,
        }
    }

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_dedupe_keeps_first_occurrence() {
        assert_eq!(dedupe(&labels(&["A2", "A1", "A2"])), labels(&["A2", "A1"]));
    }

    #[tokio::test]
    async fn test_ttl_defaults_and_bounds() {
        let f = fixture().await;
        assert_eq!(f.holds.effective_ttl(None), Duration::from_secs(600));
        assert_eq!(f.holds.effective_ttl(Some(Duration::ZERO)), Duration::from_secs(1));
        assert_eq!(f.holds.effective_ttl(Some(Duration::from_secs(86_400))), Duration::from_secs(3600));
    }

    #[test]
    fn test_inverted_bounds_cap_at_max() {
        let holds = HoldManager::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(ManualClock::starting_now()),
            HoldsConfig {
                default_ttl: Duration::from_secs(30),
                min_ttl: Duration::from_secs(120),
                max_ttl: Duration::from_secs(60),
            },
            RetryConfig::default(),
        );
        assert_eq!(holds.effective_ttl(None), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_acquire_sets_deadline_from_clock() {
        let f = fixture().await;
        let user = Uuid::new_v4();
        let holds = f
            .holds
            .acquire_holds(f.pool_id, &labels(&["A1", "A2", "A1"]), user, Some(Duration::from_secs(90)))
            .await
            .unwrap();
        assert_eq!(holds.len(), 2);
        assert!(holds.iter().all(|h| h.expires_at == f.clock.now() + chrono::Duration::seconds(90)));
    }

    #[tokio::test]
    async fn test_acquire_rejects_invalid_labels_and_empty_sets() {
        let f = fixture().await;
        let user = Uuid::new_v4();
        let err = f.holds.acquire_holds(f.pool_id, &labels(&["A1", "Z9"]), user, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidLabel { label } if label == "Z9"));

        let err = f.holds.acquire_holds(f.pool_id, &[], user, None).await.unwrap_err();
        assert!(matches!(err, Error::MissingLabel { .. }));

        // Nothing partial left behind
        assert!(f.holds.holds_for_pool(f.pool_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_hold_blocks_until_expiry() {
        let f = fixture().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        f.holds
            .acquire_holds(f.pool_id, &labels(&["A1"]), alice, Some(Duration::from_secs(5)))
            .await
            .unwrap();

        let err = f.holds.acquire_holds(f.pool_id, &labels(&["A1", "A2"]), bob, None).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyHeld { labels } if labels == vec!["A1".to_string()]));

        f.clock.advance(chrono::Duration::seconds(6));
        let holds = f.holds.acquire_holds(f.pool_id, &labels(&["A1", "A2"]), bob, None).await.unwrap();
        assert!(holds.iter().all(|h| h.holder_user_id == bob));
    }

    #[tokio::test]
    async fn test_release_is_owner_only_and_not_repeatable() {
        let f = fixture().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        f.holds.acquire_holds(f.pool_id, &labels(&["A1", "A2"]), alice, None).await.unwrap();
        f.holds.acquire_holds(f.pool_id, &labels(&["A3"]), bob, None).await.unwrap();

        let err = f.holds.release_holds(f.pool_id, &labels(&["A1"]), bob).await.unwrap_err();
        assert!(matches!(err, Error::HoldNotFound { .. }));

        assert_eq!(f.holds.release_holds(f.pool_id, &labels(&["A1", "A2"]), alice).await.unwrap(), 2);
        let err = f.holds.release_holds(f.pool_id, &labels(&["A1", "A2"]), alice).await.unwrap_err();
        assert!(matches!(err, Error::HoldNotFound { .. }));

        // Bob's hold is untouched
        let remaining = f.holds.holds_for_pool(f.pool_id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].label, "A3");
        assert_eq!(f.holds.holds_for_user(bob).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_holds() {
        let f = fixture().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        f.holds
            .acquire_holds(f.pool_id, &labels(&["A1", "A2"]), alice, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        f.holds
            .acquire_holds(f.pool_id, &labels(&["A3"]), bob, Some(Duration::from_secs(60)))
            .await
            .unwrap();

        f.clock.advance(chrono::Duration::milliseconds(1100));
        let report = f.holds.sweep_expired().await.unwrap();
        assert_eq!(report.released, 2);
        assert_eq!(report.by_pool.get(&f.pool_id), Some(&2));

        // Sweeping again is a no-op
        assert_eq!(f.holds.sweep_expired().await.unwrap().released, 0);
        assert_eq!(f.store.live_holds_for_user(bob, f.clock.now()).await.unwrap().len(), 1);
    }
}
