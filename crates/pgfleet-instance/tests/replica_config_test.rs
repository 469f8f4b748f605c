// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for writing standby configuration into a data directory.

use std::path::Path;

use pgfleet_instance::conninfo::build_primary_conninfo;
use pgfleet_instance::pgdata;
use pgfleet_instance::replica_config::{
    configure_replica, migrate_auto_conf, set_override_option, write_standing_replica_config,
};
use tempfile::TempDir;

async fn data_dir(major: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    tokio::fs::write(dir.path().join(pgdata::PG_VERSION), format!("{}\n", major))
        .await
        .unwrap();
    tokio::fs::write(dir.path().join(pgdata::POSTGRESQL_CONF), "shared_buffers = '128MB'\n")
        .await
        .unwrap();
    dir
}

async fn read(dir: &Path, name: &str) -> String {
    tokio::fs::read_to_string(dir.join(name)).await.unwrap_or_default()
}

#[tokio::test]
async fn test_modern_replica_config_is_idempotent() {
    let dir = data_dir("16").await;
    let conninfo = build_primary_conninfo("pg-1", "pg-2");

    assert!(configure_replica(dir.path(), &conninfo, "_pgfleet_pg_2").await.unwrap());
    let first = read(dir.path(), pgdata::OVERRIDE_CONF).await;
    assert!(dir.path().join(pgdata::STANDBY_SIGNAL).exists());
    assert!(first.contains("primary_slot_name = '_pgfleet_pg_2'"));
    assert!(first.contains("recovery_target_timeline = 'latest'"));
    assert!(!dir.path().join(pgdata::RECOVERY_CONF).exists());

    assert!(!configure_replica(dir.path(), &conninfo, "_pgfleet_pg_2").await.unwrap());
    assert_eq!(read(dir.path(), pgdata::OVERRIDE_CONF).await, first);
}

#[tokio::test]
async fn test_modern_replica_config_clears_slot() {
    let dir = data_dir("14").await;
    let conninfo = build_primary_conninfo("pg-1", "pg-2");

    configure_replica(dir.path(), &conninfo, "_pgfleet_pg_2").await.unwrap();
    assert!(configure_replica(dir.path(), &conninfo, "").await.unwrap());
    let content = read(dir.path(), pgdata::OVERRIDE_CONF).await;
    assert!(content.contains("primary_slot_name = ''"));
}

#[tokio::test]
async fn test_new_primary_changes_conninfo() {
    let dir = data_dir("16").await;

    configure_replica(dir.path(), &build_primary_conninfo("pg-1", "pg-3"), "")
        .await
        .unwrap();
    assert!(
        configure_replica(dir.path(), &build_primary_conninfo("pg-2", "pg-3"), "")
            .await
            .unwrap()
    );
    let content = read(dir.path(), pgdata::OVERRIDE_CONF).await;
    assert!(content.contains("host=pg-2"));
    assert!(!content.contains("host=pg-1"));
}

#[tokio::test]
async fn test_legacy_replica_config_uses_recovery_conf() {
    let dir = data_dir("11").await;
    let conninfo = build_primary_conninfo("pg-1", "pg-2");

    assert!(configure_replica(dir.path(), &conninfo, "slot").await.unwrap());
    let content = read(dir.path(), pgdata::RECOVERY_CONF).await;
    assert!(content.contains("standby_mode = 'on'"));
    assert!(content.contains("primary_slot_name = 'slot'"));
    assert!(!dir.path().join(pgdata::STANDBY_SIGNAL).exists());

    // dropping the slot removes the key instead of leaving it empty
    assert!(configure_replica(dir.path(), &conninfo, "").await.unwrap());
    let content = read(dir.path(), pgdata::RECOVERY_CONF).await;
    assert!(!content.contains("primary_slot_name"));
    assert!(!configure_replica(dir.path(), &conninfo, "").await.unwrap());
}

#[tokio::test]
async fn test_standing_config_has_no_marker() {
    let dir = data_dir("16").await;

    assert!(
        write_standing_replica_config(dir.path(), &build_primary_conninfo("pg-rw", "pg-1"))
            .await
            .unwrap()
    );
    assert!(!dir.path().join(pgdata::STANDBY_SIGNAL).exists());
    assert!(read(dir.path(), pgdata::OVERRIDE_CONF).await.contains("host=pg-rw"));
}

#[tokio::test]
async fn test_set_override_option_reports_change() {
    let dir = data_dir("16").await;

    assert!(set_override_option(dir.path(), "synchronous_standby_names", "ANY 1 (\"pg-2\")").await.unwrap());
    assert!(!set_override_option(dir.path(), "synchronous_standby_names", "ANY 1 (\"pg-2\")").await.unwrap());
    assert!(set_override_option(dir.path(), "synchronous_standby_names", "").await.unwrap());
}

#[tokio::test]
async fn test_migrate_auto_conf() {
    let dir = data_dir("13").await;
    tokio::fs::write(
        dir.path().join(pgdata::POSTGRESQL_AUTO_CONF),
        "# Do not edit this file manually!\n\
         archive_mode = 'on'\n\
         primary_conninfo = 'host=pg-1'\n\
         primary_slot_name = 'slot'\n\
         work_mem = '8MB'\n",
    )
    .await
    .unwrap();

    assert!(migrate_auto_conf(dir.path(), true).await.unwrap());

    let auto_conf = read(dir.path(), pgdata::POSTGRESQL_AUTO_CONF).await;
    assert!(auto_conf.contains("work_mem"));
    assert!(!auto_conf.contains("primary_conninfo"));
    assert!(!auto_conf.contains("archive_mode"));

    let override_conf = read(dir.path(), pgdata::OVERRIDE_CONF).await;
    assert!(override_conf.contains("primary_conninfo='host=pg-1'"));
    assert!(override_conf.contains("primary_slot_name='slot'"));

    let postgresql_conf = read(dir.path(), pgdata::POSTGRESQL_CONF).await;
    assert!(postgresql_conf.contains("include 'override.conf'"));

    // nothing left to move
    assert!(!migrate_auto_conf(dir.path(), true).await.unwrap());
}
