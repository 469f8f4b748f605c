// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Layout of a PostgreSQL data directory.

use std::io::ErrorKind;
use std::path::Path;

use crate::error::{Error, Result};

/// Main configuration file generated by initdb.
pub const POSTGRESQL_CONF: &str = "postgresql.conf";
/// File written by `ALTER SYSTEM`.
pub const POSTGRESQL_AUTO_CONF: &str = "postgresql.auto.conf";
/// Settings generated from the fleet definition, included from `postgresql.conf`.
pub const CUSTOM_CONF: &str = "custom.conf";
/// Replication settings managed by the instance manager, included from `postgresql.conf`.
pub const OVERRIDE_CONF: &str = "override.conf";
/// Host-based access rules.
pub const PG_HBA_CONF: &str = "pg_hba.conf";
/// Replica configuration for PostgreSQL 11 and earlier.
pub const RECOVERY_CONF: &str = "recovery.conf";
/// Marker asking PostgreSQL 12+ to start as a standby.
pub const STANDBY_SIGNAL: &str = "standby.signal";
/// Marker asking PostgreSQL 12+ to run targeted recovery.
pub const RECOVERY_SIGNAL: &str = "recovery.signal";
/// File holding the major version of the data directory.
pub const PG_VERSION: &str = "PG_VERSION";
/// Directory of WAL archiving status markers.
pub const ARCHIVE_STATUS_DIR: &str = "pg_wal/archive_status";

/// First major version that configures standbys through signal files.
pub const SIGNAL_FILES_MAJOR: u32 = 12;

/// Parse the content of a `PG_VERSION` file (`"9.6"`, `"16"`) into a major number.
pub fn parse_major_version(content: &str) -> Result<u32> {
    let trimmed = content.trim();
    let major = trimmed.split('.').next().unwrap_or_default();
    major
        .parse()
        .map_err(|_| Error::InvalidVersion(trimmed.to_string()))
}

/// Read the major version of the data directory.
pub async fn get_major_version(pgdata: &Path) -> Result<u32> {
    let content = tokio::fs::read_to_string(pgdata.join(PG_VERSION)).await?;
    parse_major_version(&content)
}

/// Count the WAL segments waiting to be archived.
///
/// Returns `(ready, done)`. A missing status directory counts as empty.
pub async fn wal_archive_counters(pgdata: &Path) -> Result<(usize, usize)> {
    let mut entries = match tokio::fs::read_dir(pgdata.join(ARCHIVE_STATUS_DIR)).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((0, 0)),
        Err(e) => return Err(e.into()),
    };

    let (mut ready, mut done) = (0, 0);
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".ready") {
            ready += 1;
        } else if name.ends_with(".done") {
            done += 1;
        }
    }
    Ok((ready, done))
}
