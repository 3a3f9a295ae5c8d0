//! # boxoffice: ticket inventory allocation
//!
//! `boxoffice` sells seats and general admission tickets out of fixed or unlimited pools
//! without ever selling the same unit twice, while many buyers and point-of-sale terminals
//! compete for the same stock.
//!
//! ## Overview
//!
//! A [pool](descriptor::Pool) belongs to an event and allocates in one of three modes:
//!
//! - **SEAT**: a layout of rows and columns; each seat label (`A1`, `A2`, ...) is sold at most once.
//!   Buyers may place short-lived [holds](holds::HoldManager) on seats while they check out.
//! - **QUEUE** / **GENERAL**: numbered tickets (`Q1`, `Q2`, ...) minted in order, optionally
//!   capped by a quantity.
//!
//! ### Components
//!
//! - [`inventory::Inventory`] defines pools and reports what is left.
//! - [`holds::HoldManager`] places, releases and lists seat holds.
//! - [`allocator::UnitAllocator`] sells one unit per call through a single atomic store step.
//! - [`batch::BatchAllocator`] sells N units all-or-nothing, reverting on failure.
//! - [`sweeper::ExpirySweeper`] reclaims expired holds in the background.
//! - [`settlement::SettlementBridge`] is what the order subsystem allocates through;
//!   [`orders::OrderService`] and [`tickets::TicketValidator`] are built on it.
//!
//! Every component talks to an [`InventoryStore`](db::InventoryStore). The PostgreSQL store
//! serializes competing writers per `(pool, label)` with transaction-scoped advisory locks and
//! per pool with row locks; the in-memory store does the same with per-pool mutexes.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use boxoffice::{BoxOffice, Config, clock::SystemClock, db::postgres::PgStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let pool = boxoffice::connect(&config.database).await?;
//!     boxoffice::migrator().run(&pool).await?;
//!
//!     let boxoffice = BoxOffice::new(&config, Arc::new(PgStore::new(pool)), Arc::new(SystemClock))?;
//!     let services = boxoffice.start_background(tokio_util::sync::CancellationToken::new());
//!     // ... serve requests ...
//!     services.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod allocator;
pub mod batch;
pub mod clock;
pub mod config;
pub mod db;
pub mod descriptor;
pub mod errors;
pub mod holds;
pub mod inventory;
pub mod orders;
pub mod retry;
pub mod settlement;
pub mod sweeper;
pub mod telemetry;
pub mod tickets;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::allocator::UnitAllocator;
use crate::batch::BatchAllocator;
use crate::clock::Clock;
use crate::config::{DatabaseConfig, SweeperConfig};
use crate::db::InventoryStore;
use crate::holds::HoldManager;
use crate::inventory::Inventory;
use crate::orders::OrderService;
use crate::settlement::{Settlement, SettlementBridge};
use crate::sweeper::ExpirySweeper;
use crate::tickets::{TicketTokens, TicketValidator};

pub use config::Config;
pub use errors::{Error, ErrorKind, Result};

/// Get the boxoffice database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Open a PostgreSQL connection pool with the configured limits.
pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<PgPool> {
    let settings = &config.pool;
    let mut options = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs));
    if settings.idle_timeout_secs > 0 {
        options = options.idle_timeout(Duration::from_secs(settings.idle_timeout_secs));
    }
    if settings.max_lifetime_secs > 0 {
        options = options.max_lifetime(Duration::from_secs(settings.max_lifetime_secs));
    }

    let pool = options.connect(&config.url).await?;
    info!(max_connections = settings.max_connections, "Connected to database");
    Ok(pool)
}

/// Every component wired to one store and one clock.
pub struct BoxOffice<S> {
    pub inventory: Inventory<S>,
    pub holds: HoldManager<S>,
    pub allocator: UnitAllocator<S>,
    pub batch: BatchAllocator<S>,
    pub settlement: Arc<Settlement<S>>,
    pub orders: OrderService<S>,
    pub tickets: TicketValidator<S>,
    sweeper: SweeperConfig,
}

impl<S: InventoryStore> BoxOffice<S> {
    /// # Errors
    /// - `InvalidInput` if `tickets.secret_key` is not configured or the config fails
    ///   [`Config::validate`]
    pub fn new(config: &Config, store: Arc<S>, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let tokens = TicketTokens::new(&config.tickets)?;
        let holds = HoldManager::new(Arc::clone(&store), Arc::clone(&clock), config.holds.clone(), config.retry);
        let allocator = UnitAllocator::new(Arc::clone(&store), Arc::clone(&clock), config.retry);
        let settlement = Arc::new(Settlement::new(holds.clone(), allocator.clone()));
        let bridge: Arc<dyn SettlementBridge> = settlement.clone();

        Ok(Self {
            inventory: Inventory::new(Arc::clone(&store), Arc::clone(&clock)),
            batch: BatchAllocator::new(allocator.clone()),
            orders: OrderService::new(
                Arc::clone(&store),
                bridge,
                Arc::clone(&clock),
                tokens.clone(),
                config.tickets.currency.clone(),
            ),
            tickets: TicketValidator::new(store, clock, tokens),
            holds,
            allocator,
            settlement,
            sweeper: config.sweeper.clone(),
        })
    }

    pub fn sweeper(&self) -> ExpirySweeper<S> {
        ExpirySweeper::new(self.holds.clone(), self.sweeper.interval)
    }

    /// Spawn the background tasks enabled in configuration.
    pub fn start_background(&self, shutdown_token: CancellationToken) -> BackgroundServices {
        let mut background_tasks = Vec::new();
        if self.sweeper.enabled {
            background_tasks.push(self.sweeper().spawn(shutdown_token.clone()));
        } else {
            info!("Expiry sweeper disabled");
        }
        BackgroundServices {
            background_tasks,
            shutdown_token,
        }
    }
}

/// Handles of the running background tasks.
pub struct BackgroundServices {
    background_tasks: Vec<JoinHandle<()>>,
    shutdown_token: CancellationToken,
}

impl BackgroundServices {
    /// Signal every task to stop and wait for them.
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        for handle in self.background_tasks {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Background task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::in_memory::InMemoryStore;
    use crate::descriptor::{NewPool, SeatLayout, SeatRow};
    use crate::types::AllocationMode;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn config() -> Config {
        let mut config = Config::default();
        config.tickets.secret_key = Some("facade-test-secret-key".to_string());
        config.sweeper.interval = Duration::from_millis(10);
        config
    }

    #[test]
    fn test_requires_ticket_secret() {
        let result = BoxOffice::new(&Config::default(), Arc::new(InMemoryStore::new()), Arc::new(ManualClock::starting_now()));
        assert!(matches!(result, Err(Error::InvalidInput { .. })));
    }

    #[test]
    fn test_rejects_unvalidated_config() {
        let mut inverted = config();
        inverted.holds.min_ttl = Duration::from_secs(120);
        inverted.holds.max_ttl = Duration::from_secs(60);
        let result = BoxOffice::new(&inverted, Arc::new(InMemoryStore::new()), Arc::new(ManualClock::starting_now()));
        assert!(matches!(result, Err(Error::InvalidInput { message }) if message.contains("min_ttl")));
    }

    #[test_log::test(tokio::test)]
    async fn test_background_sweeper_reclaims_holds() {
        let clock = Arc::new(ManualClock::starting_now());
        let boxoffice = BoxOffice::new(&config(), Arc::new(InMemoryStore::new()), clock.clone()).unwrap();
        let pool = boxoffice
            .inventory
            .create_pool(NewPool {
                event_id: Uuid::new_v4(),
                name: "Loge".into(),
                mode: AllocationMode::Seat,
                layout: Some(SeatLayout::new(vec![SeatRow::new("L", 2)])),
                quantity: None,
                prefix: None,
                unit_price: Decimal::ZERO,
            })
            .await
            .unwrap();
        let before_expiry = clock.now();
        boxoffice
            .settlement
            .acquire_holds(pool.id, &["L1".to_string()], Uuid::new_v4(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(2));

        let services = boxoffice.start_background(CancellationToken::new());
        let mut remaining = 1;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remaining = boxoffice.holds.store().live_holds_for_pool(pool.id, before_expiry).await.unwrap().len();
            if remaining == 0 {
                break;
            }
        }
        services.shutdown().await;
        assert_eq!(remaining, 0);
    }
}
