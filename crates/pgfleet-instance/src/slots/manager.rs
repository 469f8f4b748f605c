// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Access to the physical replication slots of the primary.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

use crate::error::{Error, Result};

/// A physical replication slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSlot {
    /// Slot name
    pub name: String,
    /// Whether a WAL sender is currently using the slot
    pub active: bool,
}

impl ReplicationSlot {
    /// An inactive slot called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: false,
        }
    }
}

/// Trait for listing, creating and dropping replication slots.
#[async_trait]
pub trait SlotManager: Send + Sync {
    /// Physical slots whose name starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ReplicationSlot>>;

    /// Create a physical slot reserving WAL immediately.
    async fn create(&self, name: &str) -> Result<()>;

    /// Drop a slot. Callers never pass an active slot.
    async fn delete(&self, slot: &ReplicationSlot) -> Result<()>;
}

/// Slot manager talking to the local server.
#[derive(Debug, Clone)]
pub struct PostgresSlotManager {
    pool: PgPool,
}

impl PostgresSlotManager {
    /// Create a slot manager over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SlotManager for PostgresSlotManager {
    async fn list(&self, prefix: &str) -> Result<Vec<ReplicationSlot>> {
        let rows: Vec<(String, bool)> = sqlx::query_as(
            r#"
            SELECT slot_name, active
            FROM pg_catalog.pg_replication_slots
            WHERE slot_type = 'physical' AND starts_with(slot_name, $1)
            ORDER BY slot_name
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, active)| ReplicationSlot { name, active })
            .collect())
    }

    async fn create(&self, name: &str) -> Result<()> {
        sqlx::query("SELECT pg_create_physical_replication_slot($1, true)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        info!(slot = %name, "Created replication slot");
        Ok(())
    }

    async fn delete(&self, slot: &ReplicationSlot) -> Result<()> {
        if slot.active {
            return Err(Error::Other(format!("refusing to drop active slot {}", slot.name)));
        }
        sqlx::query("SELECT pg_drop_replication_slot($1)")
            .bind(&slot.name)
            .execute(&self.pool)
            .await?;
        info!(slot = %slot.name, "Dropped replication slot");
        Ok(())
    }
}

/// Operation recorded by [`MemorySlotManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotCall {
    /// A slot was created
    Create(String),
    /// A slot was dropped
    Delete(String),
}

/// In-memory slot manager for tests.
#[derive(Debug, Default)]
pub struct MemorySlotManager {
    slots: Mutex<BTreeMap<String, bool>>,
    calls: Mutex<Vec<SlotCall>>,
}

impl MemorySlotManager {
    /// Start with `slots` already present.
    pub fn with_slots(slots: impl IntoIterator<Item = ReplicationSlot>) -> Self {
        Self {
            slots: Mutex::new(slots.into_iter().map(|s| (s.name, s.active)).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every create/delete issued so far.
    pub fn calls(&self) -> Vec<SlotCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Forget the recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    /// Names of the slots currently present.
    pub fn slot_names(&self) -> Vec<String> {
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Mark a slot active or inactive.
    pub fn set_active(&self, name: &str, active: bool) {
        if let Some(flag) = self.slots.lock().unwrap_or_else(|p| p.into_inner()).get_mut(name) {
            *flag = active;
        }
    }

    fn record(&self, call: SlotCall) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(call);
    }
}

#[async_trait]
impl SlotManager for MemorySlotManager {
    async fn list(&self, prefix: &str) -> Result<Vec<ReplicationSlot>> {
        Ok(self
            .slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, active)| ReplicationSlot {
                name: name.clone(),
                active: *active,
            })
            .collect())
    }

    async fn create(&self, name: &str) -> Result<()> {
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string(), false);
        self.record(SlotCall::Create(name.to_string()));
        Ok(())
    }

    async fn delete(&self, slot: &ReplicationSlot) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        if slots.get(&slot.name).copied().unwrap_or(false) {
            return Err(Error::Other(format!(
                "replication slot \"{}\" is active",
                slot.name
            )));
        }
        slots.remove(&slot.name);
        drop(slots);
        self.record(SlotCall::Delete(slot.name.clone()));
        Ok(())
    }
}
