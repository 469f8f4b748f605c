// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replication topology written into the data directory.
//!
//! PostgreSQL 11 and earlier read standby settings from `recovery.conf`.
//! From 12 on, `standby.signal` marks a standby and the settings live in the
//! regular configuration, here in `override.conf`. Every writer reports
//! whether the content on disk changed so callers only restart when needed.

use std::path::Path;

use tracing::info;

use crate::configfile::{self, Options};
use crate::error::Result;
use crate::fileutils;
use crate::pgdata::{self, SIGNAL_FILES_MAJOR};

/// Command PostgreSQL runs to fetch archived WAL segments.
pub const RESTORE_COMMAND: &str =
    "/controller/manager wal-restore --log-destination /controller/log/postgres.json %f %p";

/// Replication keys historically written into `postgresql.auto.conf`.
const MIGRATED_KEYS: [&str; 4] = [
    "primary_slot_name",
    "primary_conninfo",
    "recovery_target_timeline",
    "restore_command",
];

/// How a given major version expresses "I am a standby of X".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaConfigGeneration {
    /// Everything in `recovery.conf`, including `standby_mode = on`.
    RecoveryConf,
    /// `standby.signal` marker plus settings in `override.conf`.
    StandbySignal,
}

impl ReplicaConfigGeneration {
    /// Generation used by a PostgreSQL major version.
    pub fn for_major(major: u32) -> Self {
        if major < SIGNAL_FILES_MAJOR {
            Self::RecoveryConf
        } else {
            Self::StandbySignal
        }
    }

    /// Generation used by the data directory at `pgdata`.
    pub async fn detect(pgdata: &Path) -> Result<Self> {
        Ok(Self::for_major(pgdata::get_major_version(pgdata).await?))
    }

    /// Mark the data directory as a standby.
    pub async fn create_standby_marker(self, pgdata: &Path) -> Result<()> {
        match self {
            // recovery.conf itself carries standby_mode
            Self::RecoveryConf => Ok(()),
            Self::StandbySignal => create_standby_signal(pgdata).await,
        }
    }

    /// Write the standby settings. Returns `true` when the file changed.
    pub async fn configure_replica(
        self,
        pgdata: &Path,
        primary_conninfo: &str,
        slot_name: &str,
    ) -> Result<bool> {
        match self {
            Self::RecoveryConf => configure_recovery_conf(pgdata, primary_conninfo, slot_name).await,
            Self::StandbySignal => {
                self.create_standby_marker(pgdata).await?;
                configure_override_conf(pgdata, primary_conninfo, slot_name).await
            }
        }
    }
}

/// Point the data directory at a primary. An empty `primary_conninfo` leaves
/// the standby fed from the archive only; an empty `slot_name` streams
/// without a slot.
///
/// Returns `true` when the configuration on disk changed.
pub async fn configure_replica(pgdata: &Path, primary_conninfo: &str, slot_name: &str) -> Result<bool> {
    ReplicaConfigGeneration::detect(pgdata)
        .await?
        .configure_replica(pgdata, primary_conninfo, slot_name)
        .await
}

fn base_options() -> Options {
    let mut options = Options::new();
    options.insert("restore_command".to_string(), RESTORE_COMMAND.to_string());
    options.insert("recovery_target_timeline".to_string(), "latest".to_string());
    options
}

async fn configure_recovery_conf(pgdata: &Path, primary_conninfo: &str, slot_name: &str) -> Result<bool> {
    let mut options = base_options();
    options.insert("standby_mode".to_string(), "on".to_string());
    if !slot_name.is_empty() {
        options.insert("primary_slot_name".to_string(), slot_name.to_string());
    }
    if !primary_conninfo.is_empty() {
        options.insert("primary_conninfo".to_string(), primary_conninfo.to_string());
    }

    let changed = configfile::update_postgres_configuration_file(
        &pgdata.join(pgdata::RECOVERY_CONF),
        &options,
        &["primary_slot_name", "primary_conninfo"],
    )
    .await?;
    if changed {
        info!(pgdata = %pgdata.display(), filename = pgdata::RECOVERY_CONF, "Updated replication settings");
    }
    Ok(changed)
}

async fn configure_override_conf(pgdata: &Path, primary_conninfo: &str, slot_name: &str) -> Result<bool> {
    let mut options = base_options();
    // written even when empty so a previous slot name is cleared
    options.insert("primary_slot_name".to_string(), slot_name.to_string());
    if !primary_conninfo.is_empty() {
        options.insert("primary_conninfo".to_string(), primary_conninfo.to_string());
    }

    let changed = configfile::update_postgres_configuration_file(
        &pgdata.join(pgdata::OVERRIDE_CONF),
        &options,
        &[],
    )
    .await?;
    if changed {
        info!(pgdata = %pgdata.display(), filename = pgdata::OVERRIDE_CONF, "Updated replication settings");
    }
    Ok(changed)
}

/// Write the standby settings into `override.conf` without creating the
/// standby marker. They stay inert on a primary and take effect if it is
/// ever demoted.
pub async fn write_standing_replica_config(pgdata: &Path, primary_conninfo: &str) -> Result<bool> {
    configure_override_conf(pgdata, primary_conninfo, "").await
}

/// Create the empty `standby.signal` marker.
pub async fn create_standby_signal(pgdata: &Path) -> Result<()> {
    fileutils::ensure_file_exists(&pgdata.join(pgdata::STANDBY_SIGNAL)).await?;
    Ok(())
}

/// Set a single setting in `override.conf`. Returns `true` when it changed.
pub async fn set_override_option(pgdata: &Path, key: &str, value: &str) -> Result<bool> {
    let mut options = Options::new();
    options.insert(key.to_string(), value.to_string());
    Ok(configfile::update_postgres_configuration_file(&pgdata.join(pgdata::OVERRIDE_CONF), &options, &[]).await?)
}

async fn clean_auto_conf(pgdata: &Path) -> Result<bool> {
    let path = pgdata.join(pgdata::POSTGRESQL_AUTO_CONF);
    let current = fileutils::read_file_or_empty(&path).await?;

    let mut keys = vec!["archive_mode"];
    keys.extend(MIGRATED_KEYS);
    let updated = configfile::remove_options_from_contents(&current, &keys);

    let changed = fileutils::write_string_to_file(&path, &updated).await?;
    if changed {
        info!(pgdata = %pgdata.display(), filename = pgdata::POSTGRESQL_AUTO_CONF, "Migrated replication settings");
    }
    Ok(changed)
}

/// Move replication keys out of `postgresql.auto.conf` into `override.conf`.
///
/// No-op when `postgresql.auto.conf` holds none of them. When `add_include`
/// is set, an `include` of `override.conf` is appended to `postgresql.conf`
/// after a migration. Returns `true` when anything was migrated.
pub async fn migrate_auto_conf(pgdata: &Path, add_include: bool) -> Result<bool> {
    let auto_conf = fileutils::read_file_or_empty(&pgdata.join(pgdata::POSTGRESQL_AUTO_CONF)).await?;
    let options = configfile::read_options_from_contents(&auto_conf, &MIGRATED_KEYS);
    if options.is_empty() {
        return Ok(false);
    }

    // values are copied verbatim, quoting included
    let content: String = options
        .iter()
        .map(|(key, value)| format!("{}={}\n", key, value))
        .collect();

    let changed = fileutils::write_string_to_file(&pgdata.join(pgdata::OVERRIDE_CONF), &content).await?;
    if changed {
        info!(pgdata = %pgdata.display(), filename = pgdata::OVERRIDE_CONF, "Migrated replication settings");
        clean_auto_conf(pgdata).await?;

        if add_include {
            fileutils::append_string_to_file(
                &pgdata.join(pgdata::POSTGRESQL_CONF),
                &format!(
                    "# load pgfleet override configuration\ninclude '{}'\n",
                    pgdata::OVERRIDE_CONF
                ),
            )
            .await?;
        }
    }
    Ok(changed)
}
