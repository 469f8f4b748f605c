// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker applying the declared topology to the local instance.
//!
//! Every pass reads the topology again, reports fresh status and then moves
//! the instance one step toward its declared role. Restarts and shutdowns are
//! never performed here; they are queued for the supervisor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::conninfo::build_primary_conninfo;
use crate::error::Result;
use crate::instance::{Instance, InstanceCommand};
use crate::postmaster::Postmaster;
use crate::replica_config;
use crate::slots::slot_name_for;
use crate::status::{self, StatusSnapshot};
use crate::topology::{TopologyDescriptor, TopologyStore};

/// Configuration for the instance reconciler.
#[derive(Debug, Clone)]
pub struct InstanceReconcilerConfig {
    /// Delay between passes; the first pass runs immediately.
    pub poll_interval: Duration,
}

impl Default for InstanceReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Step a pass decided to take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleAction {
    /// Primary being replaced: follow `target` and shut down for good
    Demote {
        /// New primary
        target: String,
    },
    /// Primary staying primary: converge `synchronous_standby_names`
    ConvergeSyncStandbys {
        /// Desired value, empty to disable synchronous replication
        names: String,
    },
    /// Replica chosen as the new primary
    Promote,
    /// Replica following `primary`
    Follow {
        /// Host to stream from
        primary: String,
        /// Slot to stream through, empty for none
        slot_name: String,
    },
    /// Nothing to do
    Idle,
}

/// Decide what `pod_name` should do given the topology and its own status.
pub fn plan(pod_name: &str, topology: &TopologyDescriptor, snapshot: &StatusSnapshot) -> RoleAction {
    if snapshot.is_pg_rewind_running {
        return RoleAction::Idle;
    }

    if snapshot.is_primary {
        if topology.switchover_in_progress() && topology.target_primary != pod_name {
            return RoleAction::Demote {
                target: topology.target_primary.clone(),
            };
        }
        return RoleAction::ConvergeSyncStandbys {
            names: topology.sync_standby_names(pod_name),
        };
    }

    if topology.target_primary == pod_name {
        return RoleAction::Promote;
    }
    if topology.current_primary.is_empty() || topology.current_primary == pod_name {
        return RoleAction::Idle;
    }

    let slot_name = if topology.slots_enabled() {
        slot_name_for(topology.slot_prefix(), pod_name)
    } else {
        String::new()
    };
    RoleAction::Follow {
        primary: topology.current_primary.clone(),
        slot_name,
    }
}

/// Background worker reconciling the local instance with the topology.
pub struct InstanceReconciler {
    instance: Arc<Instance>,
    postmaster: Arc<dyn Postmaster>,
    store: Arc<dyn TopologyStore>,
    config: InstanceReconcilerConfig,
    shutdown: Arc<Notify>,
}

impl InstanceReconciler {
    /// Create a new reconciler.
    pub fn new(
        instance: Arc<Instance>,
        postmaster: Arc<dyn Postmaster>,
        store: Arc<dyn TopologyStore>,
        config: InstanceReconcilerConfig,
    ) -> Self {
        Self {
            instance,
            postmaster,
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run passes until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            pod_name = %self.instance.pod_name,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Instance reconciler started"
        );

        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Instance reconciler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.reconcile_once().await {
                        error!(pod_name = %self.instance.pod_name, error = %e, "Reconciliation pass failed");
                    }
                    delay = self.config.poll_interval;
                }
            }
        }

        info!("Instance reconciler stopped");
    }

    /// Run one pass and return the step it took.
    pub async fn reconcile_once(&self) -> Result<RoleAction> {
        let topology = self.store.topology().await?;
        let snapshot = status::probe(&self.instance).await?;
        self.store.report_status(&snapshot).await?;
        self.instance.set_can_check_readiness(true);

        let action = plan(&self.instance.pod_name, &topology, &snapshot);
        self.apply(&action, &snapshot).await?;
        Ok(action)
    }

    /// Carry out `action`.
    pub async fn apply(&self, action: &RoleAction, snapshot: &StatusSnapshot) -> Result<()> {
        let pod_name = &self.instance.pod_name;
        match action {
            RoleAction::Idle => {
                debug!(pod_name = %pod_name, "Nothing to reconcile");
            }
            RoleAction::Demote { target } => {
                info!(pod_name = %pod_name, target = %target, "Switchover in progress, demoting primary");
                let conninfo = build_primary_conninfo(target, pod_name);
                replica_config::configure_replica(&self.instance.pgdata, &conninfo, "").await?;
                if !self.instance.commands().send(InstanceCommand::ShutDownFastImmediate) {
                    warn!(pod_name = %pod_name, "Shutdown request refused, supervisor already stopping");
                }
            }
            RoleAction::ConvergeSyncStandbys { names } => {
                let changed = replica_config::set_override_option(
                    &self.instance.pgdata,
                    "synchronous_standby_names",
                    names,
                )
                .await?;
                if changed {
                    info!(pod_name = %pod_name, synchronous_standby_names = %names, "Reloading configuration");
                    sqlx::query("SELECT pg_reload_conf()")
                        .execute(&self.instance.superuser_pool())
                        .await?;
                }
            }
            RoleAction::Promote => {
                info!(pod_name = %pod_name, "Promoting instance to primary");
                self.postmaster.promote(&self.instance).await?;
            }
            RoleAction::Follow { primary, slot_name } => {
                let conninfo = build_primary_conninfo(primary, pod_name);
                let changed =
                    replica_config::configure_replica(&self.instance.pgdata, &conninfo, slot_name).await?;
                if changed || snapshot.pending_restart {
                    info!(
                        pod_name = %pod_name,
                        primary = %primary,
                        changed,
                        pending_restart = snapshot.pending_restart,
                        "Requesting restart to apply replication settings"
                    );
                    self.instance.commands().send(InstanceCommand::RestartSmartFast);
                }
            }
        }
        Ok(())
    }
}
