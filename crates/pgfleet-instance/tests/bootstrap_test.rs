// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the bootstrap workflows using fake PostgreSQL tools.
//!
//! The restricted-server tests need real binaries: set `TEST_PGFLEET_PG_BIN`
//! to the directory holding `initdb` and `postgres`, and run as a user
//! PostgreSQL accepts (not root).

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pgfleet_instance::bootstrap::{BackupCoordinates, InitInfo, RestoreInfo, with_active_instance};
use pgfleet_instance::error::Error;
use pgfleet_instance::instance::{Instance, PgBinaries};
use pgfleet_instance::pgdata;
use pgfleet_instance::postmaster::LocalPostmaster;
use tempfile::TempDir;

/// Helper macro to skip tests if PostgreSQL binaries are not available.
macro_rules! skip_if_no_pg_bin {
    () => {
        if std::env::var("TEST_PGFLEET_PG_BIN").is_err() {
            eprintln!("Skipping test: TEST_PGFLEET_PG_BIN not set");
            return;
        }
    };
}

/// Write an executable shell script called `name` into `dir`.
fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn init_info(dir: &TempDir, bin_dir: &Path) -> InitInfo {
    InitInfo {
        pgdata: dir.path().join("data"),
        cluster_name: "pg".to_string(),
        pod_name: "pg-1".to_string(),
        password_file: dir.path().join("superuser"),
        app_database: Some("app".to_string()),
        app_user: "app".to_string(),
        app_password_file: None,
        parent_node: "pg-rw".to_string(),
        no_sync: true,
        initdb_options: Vec::new(),
        binaries: PgBinaries::new(Some(bin_dir.to_path_buf())),
    }
}

#[tokio::test]
async fn test_initdb_failure_is_reported() {
    let dir = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    fake_tool(bin.path(), "initdb", "echo 'initdb: error: invalid locale' >&2\nexit 1");

    let err = init_info(&dir, bin.path())
        .create_data_directory()
        .await
        .unwrap_err();
    match err {
        Error::ToolFailed { code, stderr, .. } => {
            assert_eq!(code, Some(1));
            assert!(stderr.contains("invalid locale"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_initdb_hooks_managed_files() {
    let dir = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    // -D <dir> is the third and fourth argument
    fake_tool(
        bin.path(),
        "initdb",
        "mkdir -p \"$4\"\necho 16 > \"$4/PG_VERSION\"\necho \"max_connections = 100\" > \"$4/postgresql.conf\"",
    );
    let info = init_info(&dir, bin.path());

    info.create_data_directory().await.unwrap();

    let conf = tokio::fs::read_to_string(info.pgdata.join(pgdata::POSTGRESQL_CONF))
        .await
        .unwrap();
    assert!(conf.starts_with("max_connections = 100\n"));
    assert!(conf.contains("include 'custom.conf'\ninclude 'override.conf'\n"));
    assert!(info.pgdata.join(pgdata::CUSTOM_CONF).exists());
    assert!(info.pgdata.join(pgdata::OVERRIDE_CONF).exists());
}

fn restore_info(dir: &TempDir, tool: PathBuf) -> RestoreInfo {
    RestoreInfo {
        pgdata: dir.path().join("data"),
        cluster_name: "pg".to_string(),
        pod_name: "pg-1".to_string(),
        password_file: dir.path().join("superuser"),
        parent_node: "pg-rw".to_string(),
        backup: BackupCoordinates {
            destination: "s3://backups/pg".to_string(),
            server: "pg".to_string(),
            backup_id: "20250101T000000".to_string(),
            endpoint_url: None,
            encryption: Some("AES256".to_string()),
        },
        restore_tool: tool,
    }
}

/// Fake restore tool materializing a data directory of the given major version
/// in its last argument.
fn fake_restore_tool(dir: &Path, major: u32) -> PathBuf {
    fake_tool(
        dir,
        "barman-cloud-restore",
        &format!(
            "for last; do :; done\nmkdir -p \"$last\"\necho {} > \"$last/PG_VERSION\"\necho restored",
            major
        ),
    )
}

#[tokio::test]
async fn test_restore_prepares_modern_data_dir() {
    let dir = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    let info = restore_info(&dir, fake_restore_tool(bin.path(), 16));

    info.prepare_data_dir().await.unwrap();

    let hba = tokio::fs::read_to_string(info.pgdata.join(pgdata::PG_HBA_CONF))
        .await
        .unwrap();
    assert!(hba.lines().any(|line| line == "local all all trust"));
    let custom = tokio::fs::read_to_string(info.pgdata.join(pgdata::CUSTOM_CONF))
        .await
        .unwrap();
    assert!(custom.contains("recovery_target_action = promote"));
    assert!(custom.contains("barman-cloud-wal-restore -e AES256 s3://backups/pg pg %f %p"));
    assert!(info.pgdata.join(pgdata::RECOVERY_SIGNAL).exists());
    assert!(!info.pgdata.join(pgdata::RECOVERY_CONF).exists());
}

#[tokio::test]
async fn test_restore_prepares_legacy_data_dir() {
    let dir = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    let info = restore_info(&dir, fake_restore_tool(bin.path(), 11));

    info.prepare_data_dir().await.unwrap();

    let recovery = tokio::fs::read_to_string(info.pgdata.join(pgdata::RECOVERY_CONF))
        .await
        .unwrap();
    assert!(recovery.contains("recovery_target_action = promote"));
    assert!(!info.pgdata.join(pgdata::RECOVERY_SIGNAL).exists());
}

#[tokio::test]
async fn test_restore_tool_failure_is_reported() {
    let dir = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    let tool = fake_tool(bin.path(), "barman-cloud-restore", "echo 'backup not found' >&2\nexit 2");

    let err = restore_info(&dir, tool).prepare_data_dir().await.unwrap_err();
    assert!(matches!(err, Error::ToolFailed { code: Some(2), .. }));
}

/// Restore tool running the real `initdb` into its last argument. The WAL
/// archive is replaced by `false`, so recovery ends at the local WAL.
fn initdb_restore_tool(dir: &Path, pg_bin: &str) -> PathBuf {
    fake_tool(
        dir,
        "barman-cloud-restore",
        &format!(
            "for last; do :; done\n\
             \"{pg_bin}/initdb\" -D \"$last\" -U postgres --no-sync >/dev/null || exit 1\n\
             printf \"include 'custom.conf'\\nrestore_command = 'false'\\n\" >> \"$last/postgresql.conf\"\n\
             touch \"$last/custom.conf\""
        ),
    )
}

fn restricted_instance(dir: &TempDir, info: &RestoreInfo, pg_bin: &str) -> Instance {
    Instance::new(&info.pgdata, "pg-1", "pg")
        .with_socket_dir(dir.path())
        .with_binaries(PgBinaries::new(Some(PathBuf::from(pg_bin))))
}

#[tokio::test]
async fn test_restore_connects_to_restricted_server() {
    skip_if_no_pg_bin!();
    let pg_bin = std::env::var("TEST_PGFLEET_PG_BIN").unwrap();
    let dir = TempDir::new().unwrap();
    let tools = TempDir::new().unwrap();
    let info = restore_info(&dir, initdb_restore_tool(tools.path(), &pg_bin));
    tokio::fs::write(&info.password_file, "s3cret\n").await.unwrap();
    let instance = restricted_instance(&dir, &info, &pg_bin);

    tokio::time::timeout(
        Duration::from_secs(120),
        info.restore(&LocalPostmaster::new(), &instance),
    )
    .await
    .expect("restore did not finish")
    .unwrap();

    assert!(!info.pgdata.join(pgdata::RECOVERY_SIGNAL).exists());
    let standing = tokio::fs::read_to_string(info.pgdata.join(pgdata::OVERRIDE_CONF))
        .await
        .unwrap();
    assert!(standing.contains("host=pg-rw"));
}

#[tokio::test]
async fn test_refused_login_fails_instead_of_waiting() {
    skip_if_no_pg_bin!();
    let pg_bin = std::env::var("TEST_PGFLEET_PG_BIN").unwrap();
    let dir = TempDir::new().unwrap();
    let tools = TempDir::new().unwrap();
    let info = restore_info(&dir, initdb_restore_tool(tools.path(), &pg_bin));
    info.prepare_data_dir().await.unwrap();
    tokio::fs::write(info.pgdata.join(pgdata::PG_HBA_CONF), "local all all reject\n")
        .await
        .unwrap();
    let instance = restricted_instance(&dir, &info, &pg_bin);

    let result = tokio::time::timeout(
        Duration::from_secs(60),
        with_active_instance(&LocalPostmaster::new(), &instance, |_pool| async { Ok(()) }),
    )
    .await
    .expect("login rejection was retried");

    match result {
        Err(Error::Database(e)) => {
            let code = e.as_database_error().and_then(|db| db.code().map(|c| c.into_owned()));
            assert_eq!(code.as_deref(), Some("28000"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}
