// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Convergence of the primary's slots with the declared fleet membership.

use std::collections::BTreeSet;

use tracing::{debug, info, trace};

use super::manager::SlotManager;
use crate::error::{Error, Result};
use crate::topology::TopologyDescriptor;

/// What a reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotReconcileOutcome {
    /// Slots created
    pub created: Vec<String>,
    /// Slots dropped
    pub deleted: Vec<String>,
    /// Unexpected slots left alone because they are in use
    pub skipped_active: Vec<String>,
}

impl SlotReconcileOutcome {
    /// Whether the pass issued no create or delete.
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty()
    }
}

/// Slot name of a fleet member: the prefix followed by the lower-cased
/// instance name with anything outside `[a-z0-9_]` replaced by `_`.
pub fn slot_name_for(prefix: &str, instance_name: &str) -> String {
    let sanitized: String = instance_name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}", prefix, sanitized)
}

/// Slots the primary should hold: one per member except the current primary.
pub fn expected_slots(topology: &TopologyDescriptor) -> BTreeSet<String> {
    topology
        .instance_names
        .iter()
        .filter(|name| **name != topology.current_primary)
        .map(|name| slot_name_for(topology.slot_prefix(), name))
        .collect()
}

/// Reconcile the slots of `pod_name` against `topology`.
///
/// Does nothing unless `pod_name` is the current or target primary. Active
/// slots are never dropped; they are retried on the next pass.
pub async fn reconcile_replication_slots(
    pod_name: &str,
    topology: &TopologyDescriptor,
    manager: &dyn SlotManager,
) -> Result<SlotReconcileOutcome> {
    if !topology.is_primary_or_target(pod_name) {
        return Ok(SlotReconcileOutcome::default());
    }

    let current = manager.list(topology.slot_prefix()).await?;
    let expected = if topology.slots_enabled() {
        expected_slots(topology)
    } else {
        debug!("HA replication slots disabled, dropping inactive managed slots");
        BTreeSet::new()
    };
    trace!(?current, ?expected, "Status of primary HA replication slots");

    let mut outcome = SlotReconcileOutcome::default();

    for name in &expected {
        if current.iter().any(|slot| &slot.name == name) {
            continue;
        }
        manager.create(name).await.map_err(|e| Error::SlotCreate {
            slot: name.clone(),
            source: Box::new(e),
        })?;
        outcome.created.push(name.clone());
    }

    for slot in &current {
        if expected.contains(&slot.name) {
            continue;
        }
        if slot.active {
            trace!(slot = %slot.name, "Skipping deletion of replication slot because it is active");
            outcome.skipped_active.push(slot.name.clone());
            continue;
        }
        manager.delete(slot).await.map_err(|e| Error::SlotDelete {
            slot: slot.name.clone(),
            source: Box::new(e),
        })?;
        outcome.deleted.push(slot.name.clone());
    }

    if !outcome.is_noop() {
        info!(
            created = ?outcome.created,
            deleted = ?outcome.deleted,
            skipped_active = ?outcome.skipped_active,
            "Reconciled replication slots"
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::ReplicationSlot;
    use async_trait::async_trait;

    /// Lists one stale slot and fails every change with a pool timeout.
    struct FailingSlotManager;

    #[async_trait]
    impl SlotManager for FailingSlotManager {
        async fn list(&self, _prefix: &str) -> Result<Vec<ReplicationSlot>> {
            Ok(vec![ReplicationSlot::new("_pgfleet_gone")])
        }

        async fn create(&self, _name: &str) -> Result<()> {
            Err(Error::Database(sqlx::Error::PoolTimedOut))
        }

        async fn delete(&self, _slot: &ReplicationSlot) -> Result<()> {
            Err(Error::Database(sqlx::Error::PoolTimedOut))
        }
    }

    fn primary_topology(enabled: bool) -> TopologyDescriptor {
        let mut topology = TopologyDescriptor {
            current_primary: "p-1".to_string(),
            target_primary: "p-1".to_string(),
            instance_names: vec!["p-1".to_string(), "p-2".to_string()],
            ..Default::default()
        };
        topology.replication_slots.high_availability.enabled = enabled;
        topology
    }

    #[tokio::test]
    async fn test_create_failure_keeps_database_error() {
        let err = reconcile_replication_slots("p-1", &primary_topology(true), &FailingSlotManager)
            .await
            .unwrap_err();
        match err {
            Error::SlotCreate { slot, source } => {
                assert_eq!(slot, "_pgfleet_p_2");
                assert!(matches!(*source, Error::Database(sqlx::Error::PoolTimedOut)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_database_error() {
        let err = reconcile_replication_slots("p-1", &primary_topology(false), &FailingSlotManager)
            .await
            .unwrap_err();
        match err {
            Error::SlotDelete { slot, source } => {
                assert_eq!(slot, "_pgfleet_gone");
                assert!(matches!(*source, Error::Database(sqlx::Error::PoolTimedOut)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_slot_name_for() {
        assert_eq!(slot_name_for("_pgfleet_", "p-2"), "_pgfleet_p_2");
        assert_eq!(slot_name_for("_pgfleet_", "Cluster.Example-3"), "_pgfleet_cluster_example_3");
        assert_eq!(slot_name_for("", "ok_1"), "ok_1");
    }

    #[test]
    fn test_expected_slots_skip_current_primary() {
        let topology = TopologyDescriptor {
            current_primary: "p-1".to_string(),
            instance_names: vec!["p-1".to_string(), "p-2".to_string(), "p-3".to_string()],
            ..Default::default()
        };
        let expected: Vec<String> = expected_slots(&topology).into_iter().collect();
        assert_eq!(expected, vec!["_pgfleet_p_2", "_pgfleet_p_3"]);
    }
}
