// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker keeping the primary's slots in line with the topology.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use super::manager::SlotManager;
use super::reconciler::{SlotReconcileOutcome, reconcile_replication_slots};
use crate::error::Result;
use crate::topology::TopologyStore;

/// Configuration for the slot replicator.
#[derive(Debug, Clone)]
pub struct SlotReplicatorConfig {
    /// Pod this worker runs on.
    pub pod_name: String,
    /// How often to reconcile.
    pub poll_interval: Duration,
}

impl Default for SlotReplicatorConfig {
    fn default() -> Self {
        Self {
            pod_name: String::new(),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Background worker that reconciles replication slots.
pub struct SlotReplicator {
    store: Arc<dyn TopologyStore>,
    manager: Arc<dyn SlotManager>,
    config: SlotReplicatorConfig,
    shutdown: Arc<Notify>,
}

impl SlotReplicator {
    /// Create a new slot replicator.
    pub fn new(
        store: Arc<dyn TopologyStore>,
        manager: Arc<dyn SlotManager>,
        config: SlotReplicatorConfig,
    ) -> Self {
        Self {
            store,
            manager,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the replicator loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            pod_name = %self.config.pod_name,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Slot replicator started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Slot replicator received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.reconcile_once().await {
                        error!(error = %e, "Failed to reconcile replication slots");
                    }
                }
            }
        }

        info!("Slot replicator stopped");
    }

    /// Run a single pass against a freshly read topology.
    pub async fn reconcile_once(&self) -> Result<SlotReconcileOutcome> {
        let topology = self.store.topology().await?;
        let outcome =
            reconcile_replication_slots(&self.config.pod_name, &topology, self.manager.as_ref())
                .await?;
        if outcome.is_noop() {
            debug!("Replication slots up to date");
        }
        Ok(outcome)
    }
}
