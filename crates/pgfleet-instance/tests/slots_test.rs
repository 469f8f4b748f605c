// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the replication slot reconciler.

use pgfleet_instance::slots::{
    MemorySlotManager, PostgresSlotManager, ReplicationSlot, SlotCall, SlotManager,
    reconcile_replication_slots,
};
use pgfleet_instance::topology::TopologyDescriptor;

/// Helper macro to skip tests if database URL is not set.
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_PGFLEET_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_PGFLEET_DATABASE_URL not set");
            return;
        }
    };
}

fn fleet(current: &str, target: &str, members: &[&str], enabled: bool) -> TopologyDescriptor {
    let mut topology = TopologyDescriptor {
        current_primary: current.to_string(),
        target_primary: target.to_string(),
        instance_names: members.iter().map(|m| m.to_string()).collect(),
        ..Default::default()
    };
    topology.replication_slots.high_availability.enabled = enabled;
    topology.replication_slots.high_availability.slot_prefix = "_pgfleet_".to_string();
    topology
}

fn slot(name: &str, active: bool) -> ReplicationSlot {
    ReplicationSlot {
        name: name.to_string(),
        active,
    }
}

#[tokio::test]
async fn test_creates_one_slot_per_replica() {
    let manager = MemorySlotManager::default();
    let topology = fleet("p-1", "p-1", &["p-1", "p-2", "p-3"], true);

    let outcome = reconcile_replication_slots("p-1", &topology, &manager).await.unwrap();
    assert_eq!(outcome.created, vec!["_pgfleet_p_2", "_pgfleet_p_3"]);
    assert_eq!(manager.slot_names(), vec!["_pgfleet_p_2", "_pgfleet_p_3"]);

    manager.clear_calls();
    let outcome = reconcile_replication_slots("p-1", &topology, &manager).await.unwrap();
    assert!(outcome.is_noop());
    assert!(manager.calls().is_empty());
}

#[tokio::test]
async fn test_unexpected_inactive_slots_are_dropped() {
    let manager = MemorySlotManager::with_slots([
        slot("_pgfleet_a", true),
        slot("_pgfleet_b", false),
        slot("_pgfleet_c", false),
    ]);
    let topology = fleet("a", "a", &["a"], true);

    let outcome = reconcile_replication_slots("a", &topology, &manager).await.unwrap();
    assert!(outcome.created.is_empty());
    assert_eq!(outcome.deleted, vec!["_pgfleet_b", "_pgfleet_c"]);
    assert_eq!(outcome.skipped_active, vec!["_pgfleet_a"]);
    assert_eq!(
        manager.calls(),
        vec![
            SlotCall::Delete("_pgfleet_b".to_string()),
            SlotCall::Delete("_pgfleet_c".to_string())
        ]
    );

    manager.clear_calls();
    reconcile_replication_slots("a", &topology, &manager).await.unwrap();
    assert!(manager.calls().is_empty());
}

#[tokio::test]
async fn test_active_slot_dropped_once_released() {
    let manager = MemorySlotManager::with_slots([slot("_pgfleet_p_3", true)]);
    let topology = fleet("p-1", "p-1", &["p-1", "p-2"], true);

    let outcome = reconcile_replication_slots("p-1", &topology, &manager).await.unwrap();
    assert_eq!(outcome.skipped_active, vec!["_pgfleet_p_3"]);

    manager.set_active("_pgfleet_p_3", false);
    let outcome = reconcile_replication_slots("p-1", &topology, &manager).await.unwrap();
    assert_eq!(outcome.deleted, vec!["_pgfleet_p_3"]);
    assert_eq!(manager.slot_names(), vec!["_pgfleet_p_2"]);
}

#[tokio::test]
async fn test_switchover_moves_slots_to_new_primary() {
    // p-2 takes over from p-1: while the switchover runs the target keeps a
    // slot for every member except the current primary
    let manager = MemorySlotManager::with_slots([slot("_pgfleet_p_3", false)]);
    let topology = fleet("p-1", "p-2", &["p-1", "p-2", "p-3"], true);

    let outcome = reconcile_replication_slots("p-2", &topology, &manager).await.unwrap();
    assert_eq!(outcome.created, vec!["_pgfleet_p_2"]);
    assert!(outcome.deleted.is_empty());

    // once p-2 is current, p-1 needs a slot and p-2's own is dropped
    let topology = fleet("p-2", "p-2", &["p-1", "p-2", "p-3"], true);
    let outcome = reconcile_replication_slots("p-2", &topology, &manager).await.unwrap();
    assert_eq!(outcome.created, vec!["_pgfleet_p_1"]);
    assert_eq!(outcome.deleted, vec!["_pgfleet_p_2"]);
    assert_eq!(manager.slot_names(), vec!["_pgfleet_p_1", "_pgfleet_p_3"]);
}

#[tokio::test]
async fn test_replicas_leave_slots_alone() {
    let manager = MemorySlotManager::with_slots([slot("_pgfleet_stale", false)]);
    let topology = fleet("p-1", "p-1", &["p-1", "p-2", "p-3"], true);

    let outcome = reconcile_replication_slots("p-3", &topology, &manager).await.unwrap();
    assert!(outcome.is_noop());
    assert!(manager.calls().is_empty());
}

#[tokio::test]
async fn test_disabled_feature_drops_inactive_managed_slots() {
    let manager = MemorySlotManager::with_slots([
        slot("_pgfleet_p_2", false),
        slot("_pgfleet_p_3", true),
        slot("user_slot", false),
    ]);
    let topology = fleet("p-1", "p-1", &["p-1", "p-2", "p-3"], false);

    let outcome = reconcile_replication_slots("p-1", &topology, &manager).await.unwrap();
    assert!(outcome.created.is_empty());
    assert_eq!(outcome.deleted, vec!["_pgfleet_p_2"]);
    assert_eq!(outcome.skipped_active, vec!["_pgfleet_p_3"]);
    assert_eq!(manager.slot_names(), vec!["_pgfleet_p_3", "user_slot"]);
}

#[tokio::test]
async fn test_postgres_slot_manager() {
    skip_if_no_db!();
    let url = std::env::var("TEST_PGFLEET_DATABASE_URL").unwrap();
    let pool = sqlx::PgPool::connect(&url).await.expect("Failed to connect");
    let manager = PostgresSlotManager::new(pool);
    let prefix = format!("_pgfleet_test_{}_", std::process::id());
    let name = format!("{}p_2", prefix);

    manager.create(&name).await.unwrap();
    let slots = manager.list(&prefix).await.unwrap();
    assert_eq!(slots, vec![slot(&name, false)]);

    manager.delete(&slots[0]).await.unwrap();
    assert!(manager.list(&prefix).await.unwrap().is_empty());
}
