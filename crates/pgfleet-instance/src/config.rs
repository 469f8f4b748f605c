// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for pgfleet-instance.

use std::path::PathBuf;
use std::time::Duration;

/// Instance manager configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory of the supervised PostgreSQL instance
    pub pgdata: PathBuf,
    /// Name of this pod, matched against the topology descriptor
    pub pod_name: String,
    /// Name of the fleet this instance belongs to
    pub cluster_name: String,
    /// Namespace of the fleet
    pub namespace: String,
    /// Budget for shutting down on host cancellation (halved on SIGTERM)
    pub max_stop_delay: Duration,
    /// Budget for the smart shutdown stage of a coordinator-issued restart
    pub max_switchover_delay: Duration,
    /// Directory holding the postmaster unix socket
    pub socket_dir: PathBuf,
    /// Directory of the PostgreSQL binaries; `None` means `PATH` lookup
    pub pg_bin_dir: Option<PathBuf>,
    /// File containing the topology descriptor written by the coordinator
    pub topology_file: PathBuf,
    /// Directory where status snapshots are written back
    pub status_dir: PathBuf,
    /// Interval between instance reconciliation passes
    pub reconcile_interval: Duration,
    /// Interval between replication slot reconciliation passes
    pub slot_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let pgdata = PathBuf::from(required("PGDATA")?);
        let pod_name = required("POD_NAME")?;
        let cluster_name = required("CLUSTER_NAME")?;
        let namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());

        let max_stop_delay = seconds("PGFLEET_MAX_STOP_DELAY", 1800)?;
        let max_switchover_delay = seconds("PGFLEET_MAX_SWITCHOVER_DELAY", 3600)?;

        let socket_dir = PathBuf::from(
            std::env::var("PGFLEET_SOCKET_DIR").unwrap_or_else(|_| "/controller/run".to_string()),
        );
        let pg_bin_dir = std::env::var("PGFLEET_PG_BIN_DIR").ok().map(PathBuf::from);

        let topology_file = PathBuf::from(
            std::env::var("PGFLEET_TOPOLOGY_FILE")
                .unwrap_or_else(|_| "/etc/pgfleet/topology.json".to_string()),
        );
        let status_dir = PathBuf::from(
            std::env::var("PGFLEET_STATUS_DIR")
                .unwrap_or_else(|_| "/controller/status".to_string()),
        );

        let reconcile_interval = seconds("PGFLEET_RECONCILE_INTERVAL", 10)?;
        let slot_interval = seconds("PGFLEET_SLOT_INTERVAL", 10)?;

        Ok(Self {
            pgdata,
            pod_name,
            cluster_name,
            namespace,
            max_stop_delay,
            max_switchover_delay,
            socket_dir,
            pg_bin_dir,
            topology_file,
            status_dir,
            reconcile_interval,
            slot_interval,
        })
    }
}

/// Inputs for the bootstrap workflows (`init`, `join`, `restore`).
#[derive(Debug, Clone, Default)]
pub struct BootstrapConfig {
    /// Host name of the server to clone from or to follow
    pub parent_node: Option<String>,
    /// File containing the superuser password
    pub password_file: Option<PathBuf>,
    /// Application database to create on `init`
    pub app_database: Option<String>,
    /// Application role to create on `init`
    pub app_user: Option<String>,
    /// File containing the application role password
    pub app_password_file: Option<PathBuf>,
    /// Backup destination path understood by the restore tool
    pub backup_destination: Option<String>,
    /// Server name the backup was taken from
    pub backup_server: Option<String>,
    /// Backup identifier
    pub backup_id: Option<String>,
    /// Object store endpoint URL
    pub backup_endpoint: Option<String>,
    /// Encryption used for the backup
    pub backup_encryption: Option<String>,
    /// Base backup restore tool; `barman-cloud-restore` from `PATH` when unset
    pub restore_tool: Option<PathBuf>,
}

impl BootstrapConfig {
    /// Load bootstrap inputs from environment variables. All are optional here;
    /// each workflow checks for the ones it needs.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            parent_node: var("PGFLEET_PARENT_NODE"),
            password_file: var("PGFLEET_PASSWORD_FILE").map(PathBuf::from),
            app_database: var("PGFLEET_APP_DATABASE"),
            app_user: var("PGFLEET_APP_USER"),
            app_password_file: var("PGFLEET_APP_PASSWORD_FILE").map(PathBuf::from),
            backup_destination: var("PGFLEET_BACKUP_DESTINATION"),
            backup_server: var("PGFLEET_BACKUP_SERVER"),
            backup_id: var("PGFLEET_BACKUP_ID"),
            backup_endpoint: var("PGFLEET_BACKUP_ENDPOINT"),
            backup_encryption: var("PGFLEET_BACKUP_ENCRYPTION"),
            restore_tool: var("PGFLEET_RESTORE_TOOL").map(PathBuf::from),
        }
    }

    /// Return a required field or a [`ConfigError::MissingEnvVar`].
    pub fn require<'a>(
        value: &'a Option<String>,
        var: &'static str,
    ) -> Result<&'a str, ConfigError> {
        value.as_deref().ok_or(ConfigError::MissingEnvVar(var))
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::MissingEnvVar(var))
}

fn seconds(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => parse_seconds(&raw)
            .map(Duration::from_secs)
            .ok_or(ConfigError::InvalidDuration(var)),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

fn parse_seconds(raw: &str) -> Option<u64> {
    raw.trim().parse().ok()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A duration variable is not a whole number of seconds.
    #[error("Invalid duration in {0}: expected a number of seconds")]
    InvalidDuration(&'static str),
}
