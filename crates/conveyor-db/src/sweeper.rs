// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background sweepers.
//!
//! Each sweeper performs one idempotent SQL pass per tick. The passes are
//! order-independent: multiple processes may run them concurrently and
//! interleave arbitrarily, because every transition is a single atomic
//! check-and-update statement.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::gc;
use crate::worker::WorkerRegistry;

/// Configuration shared by the background sweepers.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often to run a pass.
    pub poll_interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Drives the worker lifecycle: stalls unresponsive workers, lands workers
/// that finished landing, deletes workers that finished retiring.
pub struct WorkerLifecycleSweeper {
    registry: WorkerRegistry,
    config: SweeperConfig,
    shutdown: Arc<Notify>,
}

impl WorkerLifecycleSweeper {
    /// Create a new sweeper.
    pub fn new(pool: PgPool, config: SweeperConfig) -> Self {
        Self {
            registry: WorkerRegistry::new(pool),
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Worker lifecycle sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Worker lifecycle sweeper shutting down");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.sweep().await;
                }
            }
        }
    }

    /// One pass: each step is independent and failures do not block the
    /// others.
    pub async fn sweep(&self) {
        if let Err(e) = self.registry.stall_unresponsive_workers().await {
            error!(error = %e, "Failed to stall unresponsive workers");
        }

        if let Err(e) = self.registry.land_finished_landing_workers().await {
            error!(error = %e, "Failed to land finished landing workers");
        }

        if let Err(e) = self.registry.delete_finished_retiring_workers().await {
            error!(error = %e, "Failed to delete finished retiring workers");
        }
    }
}

/// Collects unreferenced caches and configs and marks expired containers
/// and orphaned volumes for removal.
pub struct CacheSweeper {
    pool: PgPool,
    config: SweeperConfig,
    shutdown: Arc<Notify>,
}

impl CacheSweeper {
    /// Create a new sweeper.
    pub fn new(pool: PgPool, config: SweeperConfig) -> Self {
        Self {
            pool,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Cache sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Cache sweeper shutting down");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.sweep().await;
                }
            }
        }
    }

    /// One pass over all collectable state.
    pub async fn sweep(&self) {
        if let Err(e) = gc::release_uses_for_finished_builds(&self.pool).await {
            error!(error = %e, "Failed to release uses of finished builds");
        }

        if let Err(e) = gc::collect_caches_and_configs(&self.pool).await {
            error!(error = %e, "Failed to collect caches and configs");
        }

        if let Err(e) = gc::mark_expired_containers(&self.pool).await {
            error!(error = %e, "Failed to mark expired containers");
        }

        if let Err(e) = gc::mark_orphaned_volumes(&self.pool).await {
            error!(error = %e, "Failed to mark orphaned volumes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SweeperConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
    }
}
