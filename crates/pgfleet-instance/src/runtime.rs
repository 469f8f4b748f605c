// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime wiring the supervisor and the background workers.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pgfleet_instance::instance::Instance;
//! use pgfleet_instance::postmaster::LocalPostmaster;
//! use pgfleet_instance::runtime::InstanceRuntime;
//! use pgfleet_instance::topology::FileTopologyStore;
//!
//! let runtime = InstanceRuntime::builder()
//!     .instance(Arc::new(Instance::new("/var/lib/postgresql/data", "pg-1", "pg")))
//!     .postmaster(Arc::new(LocalPostmaster::new()))
//!     .store(Arc::new(FileTopologyStore::new("/etc/pgfleet/topology.json", "/controller/status")))
//!     .build()?
//!     .start();
//!
//! runtime.wait().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::instance::Instance;
use crate::lifecycle::{LifecycleState, PostgresLifecycle};
use crate::postmaster::Postmaster;
use crate::reconciler::{InstanceReconciler, InstanceReconcilerConfig};
use crate::slots::{PostgresSlotManager, SlotManager, SlotReplicator, SlotReplicatorConfig};
use crate::topology::TopologyStore;

/// Builder for creating an [`InstanceRuntime`].
pub struct InstanceRuntimeBuilder {
    instance: Option<Arc<Instance>>,
    postmaster: Option<Arc<dyn Postmaster>>,
    store: Option<Arc<dyn TopologyStore>>,
    slot_manager: Option<Arc<dyn SlotManager>>,
    reconcile_interval: Duration,
    slot_interval: Duration,
    cancel: CancellationToken,
}

impl Default for InstanceRuntimeBuilder {
    fn default() -> Self {
        Self {
            instance: None,
            postmaster: None,
            store: None,
            slot_manager: None,
            reconcile_interval: InstanceReconcilerConfig::default().poll_interval,
            slot_interval: SlotReplicatorConfig::default().poll_interval,
            cancel: CancellationToken::new(),
        }
    }
}

impl InstanceRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the supervised instance (required).
    pub fn instance(mut self, instance: Arc<Instance>) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Set the postmaster implementation (required).
    pub fn postmaster(mut self, postmaster: Arc<dyn Postmaster>) -> Self {
        self.postmaster = Some(postmaster);
        self
    }

    /// Set the topology store (required).
    pub fn store(mut self, store: Arc<dyn TopologyStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the slot manager.
    ///
    /// Default: [`PostgresSlotManager`] over the instance's superuser pool.
    pub fn slot_manager(mut self, manager: Arc<dyn SlotManager>) -> Self {
        self.slot_manager = Some(manager);
        self
    }

    /// Set the instance reconciler interval.
    ///
    /// Default: 5 seconds
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Set the slot replicator interval.
    ///
    /// Default: 10 seconds
    pub fn slot_interval(mut self, interval: Duration) -> Self {
        self.slot_interval = interval;
        self
    }

    /// Use `cancel` as the host cancellation token.
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<InstanceRuntimeConfig> {
        let instance = self
            .instance
            .ok_or_else(|| anyhow::anyhow!("instance is required"))?;
        let postmaster = self
            .postmaster
            .ok_or_else(|| anyhow::anyhow!("postmaster is required"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let slot_manager = self
            .slot_manager
            .unwrap_or_else(|| Arc::new(PostgresSlotManager::new(instance.superuser_pool())));

        Ok(InstanceRuntimeConfig {
            instance,
            postmaster,
            store,
            slot_manager,
            reconcile_interval: self.reconcile_interval,
            slot_interval: self.slot_interval,
            cancel: self.cancel,
        })
    }
}

/// Configuration for an [`InstanceRuntime`].
pub struct InstanceRuntimeConfig {
    instance: Arc<Instance>,
    postmaster: Arc<dyn Postmaster>,
    store: Arc<dyn TopologyStore>,
    slot_manager: Arc<dyn SlotManager>,
    reconcile_interval: Duration,
    slot_interval: Duration,
    cancel: CancellationToken,
}

impl InstanceRuntimeConfig {
    /// Spawn the supervisor, the reconciler and the slot replicator.
    pub fn start(self) -> InstanceRuntime {
        let reconciler = InstanceReconciler::new(
            self.instance.clone(),
            self.postmaster.clone(),
            self.store.clone(),
            InstanceReconcilerConfig {
                poll_interval: self.reconcile_interval,
            },
        );
        let reconciler_shutdown = reconciler.shutdown_handle();
        let reconciler_handle = tokio::spawn(async move {
            reconciler.run().await;
        });

        let replicator = SlotReplicator::new(
            self.store.clone(),
            self.slot_manager.clone(),
            SlotReplicatorConfig {
                pod_name: self.instance.pod_name.clone(),
                poll_interval: self.slot_interval,
            },
        );
        let replicator_shutdown = replicator.shutdown_handle();
        let replicator_handle = tokio::spawn(async move {
            replicator.run().await;
        });

        let lifecycle = PostgresLifecycle::new(self.instance.clone(), self.postmaster.clone());
        let state = lifecycle.subscribe();
        let cancel = self.cancel.clone();
        let supervisor_handle = tokio::spawn(async move {
            let result = lifecycle.run(cancel).await;
            // workers are useless without a postmaster
            reconciler_shutdown.notify_one();
            replicator_shutdown.notify_one();
            result
        });

        info!(pod_name = %self.instance.pod_name, "InstanceRuntime started");

        InstanceRuntime {
            supervisor_handle,
            reconciler_handle,
            replicator_handle,
            cancel: self.cancel,
            state,
        }
    }
}

/// A running instance manager.
///
/// Call [`wait`](Self::wait) to block until the supervisor finishes, or
/// [`shutdown`](Self::shutdown) to stop it.
pub struct InstanceRuntime {
    supervisor_handle: JoinHandle<crate::error::Result<()>>,
    reconciler_handle: JoinHandle<()>,
    replicator_handle: JoinHandle<()>,
    cancel: CancellationToken,
    state: watch::Receiver<LifecycleState>,
}

impl InstanceRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> InstanceRuntimeBuilder {
        InstanceRuntimeBuilder::new()
    }

    /// Current supervisor state.
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Token cancelled when the supervisor stops; cancelling it stops the supervisor.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the supervisor to finish and return its result.
    pub async fn wait(self) -> Result<()> {
        let result = match self.supervisor_handle.await {
            Ok(result) => result.map_err(anyhow::Error::from),
            Err(e) => Err(anyhow::anyhow!("supervisor task panicked: {}", e)),
        };

        if let Err(e) = self.reconciler_handle.await {
            error!("Instance reconciler task panicked: {}", e);
        }
        if let Err(e) = self.replicator_handle.await {
            error!("Slot replicator task panicked: {}", e);
        }

        match &result {
            Ok(()) => info!("InstanceRuntime shutdown complete"),
            Err(e) => error!(error = %e, "InstanceRuntime stopped with error"),
        }
        result
    }

    /// Stop the postmaster and the workers, then wait for them.
    pub async fn shutdown(self) -> Result<()> {
        info!("InstanceRuntime shutting down...");
        self.cancel.cancel();
        self.wait().await
    }
}
