// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for pgfleet-instance.

use thiserror::Error;

/// An expectable failure while acting on a database role.
///
/// Used for server-side rejections such as a role that cannot be dropped
/// because it owns objects. Lost connections and other unexpected failures
/// are reported as [`Error::Database`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not perform action '{action}' on role {role}: {cause}")]
pub struct RoleError {
    /// Name of the role.
    pub role: String,
    /// Action that was attempted.
    pub action: String,
    /// Message reported by the server.
    pub cause: String,
}

impl RoleError {
    /// Classify a failed role statement.
    ///
    /// Errors raised by the server become a [`RoleError`]; anything else
    /// (I/O, protocol, pool) is passed through untouched.
    pub fn classify(role: &str, action: &str, err: sqlx::Error) -> Error {
        match err {
            sqlx::Error::Database(db) => Error::Role(RoleError {
                role: role.to_string(),
                action: action.to_string(),
                cause: db.message().to_string(),
            }),
            other => Error::Database(other),
        }
    }
}

/// Instance manager errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Postmaster process control failed.
    #[error("Postmaster error: {0}")]
    Postmaster(#[from] crate::postmaster::PostmasterError),

    /// An external tool exited with a non-zero status.
    #[error("{tool} failed (exit code {code:?}): {stderr}")]
    ToolFailed {
        /// Name of the tool.
        tool: String,
        /// Exit code, if the tool was not killed by a signal.
        code: Option<i32>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The parent server never accepted connections during a join.
    #[error("primary server not available: {host} (after {attempts} attempts)")]
    PrimaryNotAvailable {
        /// Host that was probed.
        host: String,
        /// Number of connection attempts made.
        attempts: u32,
    },

    /// Creating a missing replication slot failed.
    #[error("updating primary HA replication slots: creating {slot:?}: {source}")]
    SlotCreate {
        /// Slot that could not be created.
        slot: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Dropping an unexpected replication slot failed.
    #[error("failure deleting replication slot {slot:?}: {source}")]
    SlotDelete {
        /// Slot that could not be dropped.
        slot: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Reading the recovery state during a restore failed.
    #[error("error while reading results of pg_is_in_recovery: {0}")]
    RecoveryCheck(#[source] sqlx::Error),

    /// Expectable role failure.
    #[error(transparent)]
    Role(#[from] RoleError),

    /// A log sequence number could not be parsed.
    #[error("Invalid LSN: {0}")]
    InvalidLsn(String),

    /// The data directory carries an unreadable PG_VERSION.
    #[error("Invalid PostgreSQL version: {0}")]
    InvalidVersion(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the instance manager [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
