// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Declared fleet topology and the store it is read from.
//!
//! The coordinator decides who is primary and which members exist; this
//! agent only reads that decision. Callers fetch the descriptor again at the
//! start of every pass and never keep it across passes.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::status::StatusSnapshot;

/// Prefix of the slots managed for high availability.
pub const DEFAULT_SLOT_PREFIX: &str = "_pgfleet_";

fn default_slot_prefix() -> String {
    DEFAULT_SLOT_PREFIX.to_string()
}

/// High-availability replication slot settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighAvailabilitySlots {
    /// Whether the primary keeps one slot per replica
    #[serde(default)]
    pub enabled: bool,
    /// Prefix of every managed slot name
    #[serde(default = "default_slot_prefix")]
    pub slot_prefix: String,
}

impl Default for HighAvailabilitySlots {
    fn default() -> Self {
        Self {
            enabled: false,
            slot_prefix: default_slot_prefix(),
        }
    }
}

/// Replication slot settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSlotsConfig {
    /// Slots kept for the fleet's own replicas
    #[serde(default)]
    pub high_availability: HighAvailabilitySlots,
}

/// Desired topology written by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyDescriptor {
    /// Member currently acting as primary
    #[serde(default)]
    pub current_primary: String,
    /// Member that should be primary; differs from `current_primary` during a switchover
    #[serde(default)]
    pub target_primary: String,
    /// Every member of the fleet
    #[serde(default)]
    pub instance_names: Vec<String>,
    /// Lower bound of synchronous replicas
    #[serde(default)]
    pub min_sync_replicas: u32,
    /// Upper bound of synchronous replicas
    #[serde(default)]
    pub max_sync_replicas: u32,
    /// Replication slot settings
    #[serde(default)]
    pub replication_slots: ReplicationSlotsConfig,
}

impl TopologyDescriptor {
    /// Whether `pod_name` is the current or the target primary.
    pub fn is_primary_or_target(&self, pod_name: &str) -> bool {
        !pod_name.is_empty() && (self.current_primary == pod_name || self.target_primary == pod_name)
    }

    /// Whether a switchover away from `current_primary` is in progress.
    pub fn switchover_in_progress(&self) -> bool {
        !self.target_primary.is_empty() && self.target_primary != self.current_primary
    }

    /// Whether high-availability slots are enabled.
    pub fn slots_enabled(&self) -> bool {
        self.replication_slots.high_availability.enabled
    }

    /// Prefix of the managed slots.
    pub fn slot_prefix(&self) -> &str {
        &self.replication_slots.high_availability.slot_prefix
    }

    /// `synchronous_standby_names` for `primary`: quorum over every other
    /// member. Empty when no synchronous replica is wanted.
    pub fn sync_standby_names(&self, primary: &str) -> String {
        let others: Vec<&str> = self
            .instance_names
            .iter()
            .map(String::as_str)
            .filter(|name| *name != primary)
            .collect();
        if self.max_sync_replicas == 0 || others.is_empty() {
            return String::new();
        }

        let count = (self.max_sync_replicas as usize)
            .min(others.len())
            .max(self.min_sync_replicas as usize);
        let names: Vec<String> = others.iter().map(|name| format!("\"{}\"", name)).collect();
        format!("ANY {} ({})", count, names.join(","))
    }
}

/// Where the topology comes from and where status goes to.
#[async_trait]
pub trait TopologyStore: Send + Sync {
    /// Read the current descriptor.
    async fn topology(&self) -> Result<TopologyDescriptor>;

    /// Publish the latest status of this instance.
    async fn report_status(&self, snapshot: &StatusSnapshot) -> Result<()>;
}

/// Store backed by files shared with the coordinator.
#[derive(Debug, Clone)]
pub struct FileTopologyStore {
    topology_file: PathBuf,
    status_dir: PathBuf,
}

impl FileTopologyStore {
    /// Read the descriptor from `topology_file`, write status into `status_dir`.
    pub fn new(topology_file: impl Into<PathBuf>, status_dir: impl Into<PathBuf>) -> Self {
        Self {
            topology_file: topology_file.into(),
            status_dir: status_dir.into(),
        }
    }
}

#[async_trait]
impl TopologyStore for FileTopologyStore {
    async fn topology(&self) -> Result<TopologyDescriptor> {
        let content = tokio::fs::read(&self.topology_file).await?;
        Ok(serde_json::from_slice(&content)?)
    }

    async fn report_status(&self, snapshot: &StatusSnapshot) -> Result<()> {
        tokio::fs::create_dir_all(&self.status_dir).await?;
        let target = self.status_dir.join(format!("{}.json", snapshot.pod_name));
        let temp = self.status_dir.join(format!(".{}.json.tmp", snapshot.pod_name));

        tokio::fs::write(&temp, serde_json::to_vec_pretty(snapshot)?).await?;
        tokio::fs::rename(&temp, &target).await?;
        debug!(path = %target.display(), "Status written");
        Ok(())
    }
}

/// In-memory store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryTopologyStore {
    topology: Mutex<TopologyDescriptor>,
    reports: Mutex<Vec<StatusSnapshot>>,
}

impl MemoryTopologyStore {
    /// Create a store holding `topology`.
    pub fn new(topology: TopologyDescriptor) -> Self {
        Self {
            topology: Mutex::new(topology),
            reports: Mutex::new(Vec::new()),
        }
    }

    /// Replace the descriptor.
    pub fn set_topology(&self, topology: TopologyDescriptor) {
        *self.topology.lock().unwrap_or_else(|p| p.into_inner()) = topology;
    }

    /// Every status reported so far.
    pub fn reports(&self) -> Vec<StatusSnapshot> {
        self.reports.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl TopologyStore for MemoryTopologyStore {
    async fn topology(&self) -> Result<TopologyDescriptor> {
        Ok(self.topology.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    async fn report_status(&self, snapshot: &StatusSnapshot) -> Result<()> {
        self.reports
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(snapshot.clone());
        Ok(())
    }
}
