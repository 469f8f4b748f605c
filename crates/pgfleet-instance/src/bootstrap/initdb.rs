// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bootstrap an empty instance with `initdb`.

use std::path::PathBuf;

use sqlx::PgPool;
use tracing::{error, info};

use super::{quote_identifier, quote_literal, read_password_file, with_active_instance};
use crate::conninfo::{self, STREAMING_REPLICATION_USER};
use crate::error::{Error, Result, RoleError};
use crate::fileutils;
use crate::instance::{Instance, PgBinaries, SUPERUSER};
use crate::pgdata::{self, SIGNAL_FILES_MAJOR};
use crate::postmaster::Postmaster;
use crate::replica_config;
use crate::tool;

/// Inputs for creating a brand new data directory.
#[derive(Debug, Clone)]
pub struct InitInfo {
    /// Data directory to create
    pub pgdata: PathBuf,
    /// Fleet name, stored as `cluster_name`
    pub cluster_name: String,
    /// This pod's name
    pub pod_name: String,
    /// Superuser password file
    pub password_file: PathBuf,
    /// Application database, created when set
    pub app_database: Option<String>,
    /// Application role
    pub app_user: String,
    /// Application role password file, optional
    pub app_password_file: Option<PathBuf>,
    /// Host a demoted instance should follow
    pub parent_node: String,
    /// Pass `--no-sync` to initdb
    pub no_sync: bool,
    /// Extra initdb options
    pub initdb_options: Vec<String>,
    /// Location of `initdb`
    pub binaries: PgBinaries,
}

impl InitInfo {
    /// Check the inputs before touching the filesystem.
    pub async fn verify(&self) -> Result<()> {
        if !tokio::fs::try_exists(&self.password_file).await? {
            return Err(Error::Other(format!(
                "superuser password file doesn't exist ({})",
                self.password_file.display()
            )));
        }
        if let Some(app_password_file) = &self.app_password_file
            && !tokio::fs::try_exists(app_password_file).await?
        {
            return Err(Error::Other(format!(
                "application user's password file doesn't exist ({})",
                app_password_file.display()
            )));
        }
        if tokio::fs::try_exists(&self.pgdata).await? {
            return Err(Error::Other(format!(
                "data directory already exists ({})",
                self.pgdata.display()
            )));
        }
        Ok(())
    }

    /// initdb arguments.
    pub fn initdb_args(&self) -> Vec<String> {
        let mut args = vec![
            "--username".to_string(),
            SUPERUSER.to_string(),
            "-D".to_string(),
            self.pgdata.display().to_string(),
        ];
        if self.no_sync {
            args.push("--no-sync".to_string());
        }
        args.extend(self.initdb_options.iter().cloned());
        args.push("--pwfile".to_string());
        args.push(self.password_file.display().to_string());
        args
    }

    /// Run initdb and hook the managed configuration files into `postgresql.conf`.
    pub async fn create_data_directory(&self) -> Result<()> {
        let args = self.initdb_args();
        info!(pgdata = %self.pgdata.display(), options = ?args, "Creating new data directory");
        tool::run_tool(&self.binaries.path("initdb"), &args).await?;

        fileutils::append_string_to_file(
            &self.pgdata.join(pgdata::POSTGRESQL_CONF),
            &format!(
                "# load pgfleet managed configuration\ninclude '{}'\ninclude '{}'\n",
                pgdata::CUSTOM_CONF,
                pgdata::OVERRIDE_CONF
            ),
        )
        .await?;
        fileutils::ensure_file_exists(&self.pgdata.join(pgdata::CUSTOM_CONF)).await?;
        fileutils::ensure_file_exists(&self.pgdata.join(pgdata::OVERRIDE_CONF)).await?;
        Ok(())
    }

    /// Create the roles, the application database and set `cluster_name`.
    async fn configure_new_instance(&self, pool: &PgPool, app_password: Option<String>) -> Result<()> {
        let app_user = quote_identifier(&self.app_user);

        sqlx::query(&format!("CREATE USER {}", app_user))
            .execute(pool)
            .await
            .map_err(|e| RoleError::classify(&self.app_user, "CREATE", e))?;

        sqlx::query(&format!(
            "CREATE USER {} REPLICATION",
            quote_identifier(STREAMING_REPLICATION_USER)
        ))
        .execute(pool)
        .await
        .map_err(|e| RoleError::classify(STREAMING_REPLICATION_USER, "CREATE", e))?;

        if let Some(password) = app_password {
            sqlx::query(&format!("ALTER USER {} PASSWORD {}", app_user, quote_literal(&password)))
                .execute(pool)
                .await
                .map_err(|e| RoleError::classify(&self.app_user, "ALTER", e))?;
        }

        if let Some(database) = &self.app_database {
            sqlx::query(&format!(
                "CREATE DATABASE {} OWNER {}",
                quote_identifier(database),
                app_user
            ))
            .execute(pool)
            .await?;
        }

        sqlx::query(&format!(
            "ALTER SYSTEM SET cluster_name TO {}",
            quote_literal(&self.cluster_name)
        ))
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Create and configure a fresh instance.
    pub async fn bootstrap(&self, postmaster: &dyn Postmaster, instance: &Instance) -> Result<()> {
        self.verify().await?;
        self.create_data_directory().await?;

        let major = pgdata::get_major_version(&self.pgdata).await?;
        let app_password = match &self.app_password_file {
            Some(path) => Some(read_password_file(path).await?),
            None => None,
        };
        let standing_conninfo = conninfo::build_primary_conninfo(&self.parent_node, &self.pod_name);

        with_active_instance(postmaster, instance, |pool| async move {
            self.configure_new_instance(&pool, app_password).await?;
            if major >= SIGNAL_FILES_MAJOR {
                replica_config::write_standing_replica_config(&self.pgdata, &standing_conninfo).await?;
            }
            Ok(())
        })
        .await
        .inspect_err(|e| error!(pod_name = %self.pod_name, error = %e, "Bootstrap failed"))?;

        info!(pod_name = %self.pod_name, pgdata = %self.pgdata.display(), "Instance bootstrapped");
        Ok(())
    }
}
