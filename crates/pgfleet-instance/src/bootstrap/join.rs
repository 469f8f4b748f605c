// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Join an existing fleet by cloning a running server.

use std::path::PathBuf;
use std::time::Duration;

use sqlx::{Connection, PgConnection};
use tracing::{error, info, warn};

use crate::conninfo::PrimaryConnInfo;
use crate::error::{Error, Result};
use crate::instance::PgBinaries;
use crate::replica_config;
use crate::tool;

/// Inputs for cloning a parent server into a fresh data directory.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    /// Target data directory
    pub pgdata: PathBuf,
    /// This pod's name, used as `application_name`
    pub pod_name: String,
    /// Host to clone from and follow afterwards
    pub parent_node: String,
    /// Replication slot to stream from, empty for none
    pub slot_name: String,
    /// Connection attempts before giving up on the parent
    pub attempts: u32,
    /// Delay between connection attempts
    pub retry_delay: Duration,
    /// Location of `pg_basebackup`
    pub binaries: PgBinaries,
}

impl JoinInfo {
    /// Join `parent_node` as `pod_name`, with default retry settings.
    pub fn new(
        pgdata: impl Into<PathBuf>,
        pod_name: impl Into<String>,
        parent_node: impl Into<String>,
    ) -> Self {
        Self {
            pgdata: pgdata.into(),
            pod_name: pod_name.into(),
            parent_node: parent_node.into(),
            slot_name: String::new(),
            attempts: 60,
            retry_delay: Duration::from_secs(5),
            binaries: PgBinaries::default(),
        }
    }

    /// Wait for the parent, clone it and configure this instance to follow it.
    pub async fn join(&self) -> Result<()> {
        let probe_conninfo = PrimaryConnInfo::new(&self.parent_node, &self.pod_name)
            .with_dbname("postgres")
            .with_connect_timeout(Duration::from_secs(5));

        self.wait_for_parent(&probe_conninfo).await?;
        self.clone_pgdata(&probe_conninfo).await?;

        let follow = PrimaryConnInfo::new(&self.parent_node, &self.pod_name).to_string();
        replica_config::configure_replica(&self.pgdata, &follow, &self.slot_name).await?;
        info!(pod_name = %self.pod_name, parent_node = %self.parent_node, "Joined fleet");
        Ok(())
    }

    async fn wait_for_parent(&self, conninfo: &PrimaryConnInfo) -> Result<()> {
        info!(parent_node = %self.parent_node, "Waiting for server to be available");
        let options = conninfo.to_connect_options();

        for attempt in 1..=self.attempts {
            match PgConnection::connect_with(&options).await {
                Ok(mut conn) => {
                    let ping = conn.ping().await;
                    let _ = conn.close().await;
                    if ping.is_ok() {
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(
                        parent_node = %self.parent_node,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Parent server not available yet"
                    );
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        error!(pod_name = %self.pod_name, parent_node = %self.parent_node, "Primary server not available");
        Err(Error::PrimaryNotAvailable {
            host: self.parent_node.clone(),
            attempts: self.attempts,
        })
    }

    async fn clone_pgdata(&self, conninfo: &PrimaryConnInfo) -> Result<()> {
        let pgdata = self.pgdata.display().to_string();
        let conninfo = conninfo.to_string();
        info!(pod_name = %self.pod_name, pgdata = %pgdata, "Cloning data directory with pg_basebackup");
        tool::run_tool(
            &self.binaries.path("pg_basebackup"),
            ["-D", pgdata.as_str(), "-v", "-w", "-d", conninfo.as_str()],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_parent_never_available() {
        let mut info = JoinInfo::new("/tmp/pgfleet-join", "pg-2", "pgfleet-parent.invalid");
        info.attempts = 2;
        info.retry_delay = Duration::from_millis(10);

        let err = info.join().await.unwrap_err();
        match err {
            Error::PrimaryNotAvailable { host, attempts } => {
                assert_eq!(host, "pgfleet-parent.invalid");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
