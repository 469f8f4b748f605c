// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! pgfleet-instance - per-node manager of a replicated PostgreSQL fleet.
//!
//! One agent runs next to every PostgreSQL server of the fleet. It owns the
//! postmaster process, keeps the replication configuration in line with the
//! topology declared by the coordinator and reports status back.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 Coordinator (topology store)                 │
//! └──────────────────────────────────────────────────────────────┘
//!             │ topology                     ▲ status
//!             ▼                              │
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 pgfleet-instance (this crate)                │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────────┐     │
//! │  │  Instance   │   │    Slot     │   │   Lifecycle     │     │
//! │  │ Reconciler  │──▶│ Replicator  │   │  (supervisor)   │     │
//! │  └─────────────┘   └─────────────┘   └─────────────────┘     │
//! │         │ commands                            │ signals      │
//! │         └─────────────────────────────────────┘              │
//! └──────────────────────────────────────────────────────────────┘
//!                               │ spawn
//!                               ▼
//!                     ┌───────────────────┐
//!                     │    postmaster     │
//!                     └───────────────────┘
//! ```
//!
//! The reconciler never touches the process directly: restarts and
//! shutdowns go through the [`instance::CommandQueue`] to the supervisor.
//!
//! # Bootstrap
//!
//! A data directory comes from one of three workflows in [`bootstrap`]:
//! `initdb`, cloning a running server, or restoring a backup.

#![deny(missing_docs)]

/// Bootstrap workflows: initdb, join and restore
pub mod bootstrap;
/// Configuration loaded from environment variables
pub mod config;
/// Reading and editing PostgreSQL configuration files
pub mod configfile;
/// Replication connection strings
pub mod conninfo;
/// `pg_controldata` parsing
pub mod controldata;
/// Error types
pub mod error;
/// Idempotent file helpers
pub mod fileutils;
/// The supervised instance and its command queue
pub mod instance;
/// Postmaster supervision state machine
pub mod lifecycle;
/// Log sequence numbers
pub mod lsn;
/// Data directory layout
pub mod pgdata;
/// Postmaster process control
pub mod postmaster;
/// Topology-driven instance reconciliation
pub mod reconciler;
/// Standby configuration
pub mod replica_config;
/// Embeddable runtime
pub mod runtime;
/// High-availability replication slots
pub mod slots;
/// Status probe
pub mod status;
/// External tool invocation
pub mod tool;
/// Declared fleet topology
pub mod topology;

pub use error::{Error, Result};
pub use instance::{Instance, InstanceCommand};
pub use runtime::InstanceRuntime;
