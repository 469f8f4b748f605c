// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! High-availability replication slots.
//!
//! The primary keeps one physical slot per other fleet member so WAL a
//! replica still needs is never recycled. [`SlotReplicator`] periodically
//! hands the latest topology to [`reconcile_replication_slots`].

mod manager;
mod reconciler;
mod replicator;

pub use manager::{MemorySlotManager, PostgresSlotManager, ReplicationSlot, SlotCall, SlotManager};
pub use reconciler::{SlotReconcileOutcome, expected_slots, reconcile_replication_slots, slot_name_for};
pub use replicator::{SlotReplicator, SlotReplicatorConfig};
