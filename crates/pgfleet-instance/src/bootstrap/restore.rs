// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bootstrap from a backup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::PgPool;
use tracing::{error, info};

use super::{quote_literal, read_password_file, with_active_instance};
use crate::conninfo;
use crate::error::{Error, Result};
use crate::fileutils;
use crate::instance::Instance;
use crate::pgdata::{self, SIGNAL_FILES_MAJOR};
use crate::postmaster::Postmaster;
use crate::replica_config;
use crate::tool;

/// Temporary access rules letting the restore set credentials. The restricted
/// server only listens on its unix socket.
pub const RESTORE_HBA_RULES: &str = "local all all trust\nhost all all 127.0.0.1/32 trust\n";

/// Interval between checks for the end of recovery.
pub const RECOVERY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Where a backup lives in the object store.
#[derive(Debug, Clone, Default)]
pub struct BackupCoordinates {
    /// Destination path of the backup store
    pub destination: String,
    /// Server name the backup was taken from
    pub server: String,
    /// Backup identifier
    pub backup_id: String,
    /// Object store endpoint URL
    pub endpoint_url: Option<String>,
    /// Encryption used for the backup
    pub encryption: Option<String>,
}

impl BackupCoordinates {
    /// Arguments for the base restore tool, ending with the target directory.
    pub fn restore_args(&self, pgdata: &Path) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(endpoint) = &self.endpoint_url {
            args.push("--endpoint-url".to_string());
            args.push(endpoint.clone());
        }
        if let Some(encryption) = &self.encryption {
            args.push("-e".to_string());
            args.push(encryption.clone());
        }
        args.push(self.destination.clone());
        args.push(self.server.clone());
        args.push(self.backup_id.clone());
        args.push(pgdata.display().to_string());
        args
    }

    /// `restore_command` fetching WAL segments from the same store.
    pub fn wal_restore_command(&self) -> String {
        let mut cmd = vec!["barman-cloud-wal-restore".to_string()];
        if let Some(encryption) = &self.encryption {
            cmd.push("-e".to_string());
            cmd.push(encryption.clone());
        }
        if let Some(endpoint) = &self.endpoint_url {
            cmd.push("--endpoint-url".to_string());
            cmd.push(endpoint.clone());
        }
        cmd.push(self.destination.clone());
        cmd.push(self.server.clone());
        cmd.push("%f".to_string());
        cmd.push("%p".to_string());
        cmd.join(" ")
    }
}

/// Inputs for restoring a backup into a fresh data directory.
#[derive(Debug, Clone)]
pub struct RestoreInfo {
    /// Target data directory
    pub pgdata: PathBuf,
    /// Fleet name
    pub cluster_name: String,
    /// This pod's name
    pub pod_name: String,
    /// File with the superuser password to force after recovery
    pub password_file: PathBuf,
    /// Host a demoted instance should follow
    pub parent_node: String,
    /// Backup to restore
    pub backup: BackupCoordinates,
    /// Base restore tool
    pub restore_tool: PathBuf,
}

impl RestoreInfo {
    /// Materialize the data directory and write the recovery configuration.
    ///
    /// Runs before the server is started for the first time.
    pub async fn prepare_data_dir(&self) -> Result<()> {
        let args = self.backup.restore_args(&self.pgdata);
        info!(pod_name = %self.pod_name, options = ?args, "Starting backup restore");
        let output = tool::run_tool(&self.restore_tool, &args).await.inspect_err(|e| {
            error!(pod_name = %self.pod_name, error = %e, "Can't restore backup");
        })?;
        info!(pod_name = %self.pod_name, stdout = %output.stdout, "Restore completed");

        tokio::fs::write(self.pgdata.join(pgdata::PG_HBA_CONF), RESTORE_HBA_RULES).await?;
        self.write_recovery_config().await
    }

    async fn write_recovery_config(&self) -> Result<()> {
        let major = pgdata::get_major_version(&self.pgdata).await?;
        let contents = format!(
            "recovery_target_action = promote\nrestore_command = '{}'\n",
            self.backup.wal_restore_command()
        );

        if major >= SIGNAL_FILES_MAJOR {
            fileutils::append_string_to_file(&self.pgdata.join(pgdata::CUSTOM_CONF), &contents).await?;
            tokio::fs::write(self.pgdata.join(pgdata::POSTGRESQL_AUTO_CONF), "").await?;
            tokio::fs::write(self.pgdata.join(pgdata::RECOVERY_SIGNAL), "").await?;
        } else {
            tokio::fs::write(self.pgdata.join(pgdata::RECOVERY_CONF), contents).await?;
        }
        Ok(())
    }

    /// Run the whole restore: materialize, recover until promotion, then set
    /// the superuser password.
    pub async fn restore(&self, postmaster: &dyn Postmaster, instance: &Instance) -> Result<()> {
        self.prepare_data_dir().await?;

        let password = read_password_file(&self.password_file).await?;
        let major = pgdata::get_major_version(&self.pgdata).await?;
        let standing_conninfo = conninfo::build_primary_conninfo(&self.parent_node, &self.pod_name);
        let pgdata = self.pgdata.clone();

        with_active_instance(postmaster, instance, |pool| async move {
            wait_until_recovery_finishes(&pool, RECOVERY_POLL_INTERVAL).await?;

            sqlx::query(&format!("ALTER USER postgres PASSWORD {}", quote_literal(&password)))
                .execute(&pool)
                .await
                .map_err(|e| crate::error::RoleError::classify("postgres", "ALTER", e))?;

            if major >= SIGNAL_FILES_MAJOR {
                replica_config::write_standing_replica_config(&pgdata, &standing_conninfo).await?;
            }
            Ok(())
        })
        .await
        .inspect_err(|e| error!(pod_name = %self.pod_name, error = %e, "Restore failed"))?;

        info!(pod_name = %self.pod_name, "Restore finished");
        Ok(())
    }
}

/// Poll `pg_is_in_recovery()` until it turns false. There is no attempt
/// ceiling; a query failure aborts the wait.
pub async fn wait_until_recovery_finishes(pool: &PgPool, interval: Duration) -> Result<()> {
    loop {
        let (in_recovery,): (bool,) = sqlx::query_as("SELECT pg_is_in_recovery()")
            .fetch_one(pool)
            .await
            .map_err(Error::RecoveryCheck)?;

        info!(recovery = in_recovery, "Checking if the server is still in recovery");
        if !in_recovery {
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinates() -> BackupCoordinates {
        BackupCoordinates {
            destination: "s3://backups/pg".to_string(),
            server: "pg".to_string(),
            backup_id: "20240101T000000".to_string(),
            endpoint_url: Some("https://minio:9000".to_string()),
            encryption: Some("AES256".to_string()),
        }
    }

    #[test]
    fn test_restore_args_order() {
        assert_eq!(
            coordinates().restore_args(Path::new("/var/lib/postgresql/data")),
            vec![
                "--endpoint-url",
                "https://minio:9000",
                "-e",
                "AES256",
                "s3://backups/pg",
                "pg",
                "20240101T000000",
                "/var/lib/postgresql/data",
            ]
        );
    }

    #[test]
    fn test_wal_restore_command() {
        assert_eq!(
            coordinates().wal_restore_command(),
            "barman-cloud-wal-restore -e AES256 --endpoint-url https://minio:9000 s3://backups/pg pg %f %p"
        );

        let plain = BackupCoordinates {
            destination: "/backups".to_string(),
            server: "pg".to_string(),
            ..Default::default()
        };
        assert_eq!(plain.wal_restore_command(), "barman-cloud-wal-restore /backups pg %f %p");
    }
}
