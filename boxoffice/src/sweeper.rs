//! Expiry Sweeper: background reclamation of holds past their deadline.
//!
//! Runs on a fixed interval independent of request traffic. Each tick is one
//! [`InventoryStore::sweep_expired`] call, which is idempotent and safe alongside in-flight
//! allocations. A failed tick is logged and the next tick tries again.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::InventoryStore;
use crate::db::models::SweepReport;
use crate::errors::Result;
use crate::holds::HoldManager;

pub struct ExpirySweeper<S> {
    holds: HoldManager<S>,
    interval: Duration,
}

impl<S: InventoryStore> ExpirySweeper<S> {
    pub fn new(holds: HoldManager<S>, interval: Duration) -> Self {
        Self { holds, interval }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let report = self.holds.sweep_expired().await?;
        if report.released > 0 {
            tracing::info!(
                released = report.released,
                reverted_units = report.reverted_units,
                pools = report.by_pool.len(),
                "Released expired holds"
            );
        } else {
            tracing::debug!("No expired holds");
        }
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(interval = ?self.interval, "Starting expiry sweeper");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("Expiry sweeper shutting down");
                    return;
                }
            }

            if let Err(e) = self.sweep_once().await {
                tracing::error!(error = %e, "Expiry sweep failed, retrying next tick");
            }
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
