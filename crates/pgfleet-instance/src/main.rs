// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! pgfleet-instance - per-node instance manager
//!
//! Subcommands (first argument):
//! - `run` (default): supervise the postmaster and reconcile with the topology
//! - `init`: create a new data directory with initdb
//! - `join`: clone the parent server with pg_basebackup
//! - `restore`: restore a backup and recover until promotion

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use pgfleet_instance::bootstrap::{BackupCoordinates, InitInfo, JoinInfo, RestoreInfo};
use pgfleet_instance::config::{BootstrapConfig, Config};
use pgfleet_instance::instance::{Instance, PgBinaries};
use pgfleet_instance::pgdata;
use pgfleet_instance::postmaster::LocalPostmaster;
use pgfleet_instance::replica_config;
use pgfleet_instance::runtime::InstanceRuntime;
use pgfleet_instance::slots::slot_name_for;
use pgfleet_instance::topology::{FileTopologyStore, TopologyStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pgfleet_instance=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;
    let command = std::env::args().nth(1).unwrap_or_else(|| "run".to_string());

    info!(
        command = %command,
        pod_name = %config.pod_name,
        cluster_name = %config.cluster_name,
        pgdata = %config.pgdata.display(),
        "Starting pgfleet-instance"
    );

    match command.as_str() {
        "run" => run(config).await,
        "init" => init(config, BootstrapConfig::from_env()).await,
        "join" => join(config, BootstrapConfig::from_env()).await,
        "restore" => restore(config, BootstrapConfig::from_env()).await,
        other => anyhow::bail!("unknown command: {} (expected run, init, join or restore)", other),
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let major = pgdata::get_major_version(&config.pgdata)
        .await
        .context("data directory is not initialized")?;
    if major >= pgdata::SIGNAL_FILES_MAJOR {
        let postgresql_conf = tokio::fs::read_to_string(config.pgdata.join(pgdata::POSTGRESQL_CONF)).await?;
        let has_include = postgresql_conf.contains(&format!("include '{}'", pgdata::OVERRIDE_CONF));
        replica_config::migrate_auto_conf(&config.pgdata, !has_include).await?;
    }

    let instance = Arc::new(Instance::from_config(&config));
    let store = Arc::new(FileTopologyStore::new(&config.topology_file, &config.status_dir));

    let runtime = InstanceRuntime::builder()
        .instance(instance)
        .postmaster(Arc::new(LocalPostmaster::new()))
        .store(store)
        .reconcile_interval(config.reconcile_interval)
        .slot_interval(config.slot_interval)
        .build()?
        .start();

    info!(pod_name = %config.pod_name, "Instance manager ready");

    runtime.wait().await?;
    info!("pgfleet-instance shut down");
    Ok(())
}

async fn init(config: Config, bootstrap: BootstrapConfig) -> anyhow::Result<()> {
    let info = InitInfo {
        pgdata: config.pgdata.clone(),
        cluster_name: config.cluster_name.clone(),
        pod_name: config.pod_name.clone(),
        password_file: required_path(&bootstrap.password_file, "PGFLEET_PASSWORD_FILE")?,
        app_database: bootstrap.app_database.clone(),
        app_user: bootstrap.app_user.clone().unwrap_or_else(|| "app".to_string()),
        app_password_file: bootstrap.app_password_file.clone(),
        parent_node: BootstrapConfig::require(&bootstrap.parent_node, "PGFLEET_PARENT_NODE")?.to_string(),
        no_sync: false,
        initdb_options: Vec::new(),
        binaries: PgBinaries::new(config.pg_bin_dir.clone()),
    };
    let instance = Instance::from_config(&config);

    with_host_cancellation(info.bootstrap(&LocalPostmaster::new(), &instance)).await
}

async fn join(config: Config, bootstrap: BootstrapConfig) -> anyhow::Result<()> {
    let parent_node = BootstrapConfig::require(&bootstrap.parent_node, "PGFLEET_PARENT_NODE")?;
    let mut info = JoinInfo::new(&config.pgdata, &config.pod_name, parent_node);
    info.binaries = PgBinaries::new(config.pg_bin_dir.clone());

    // the topology may not be published yet; stream without a slot then
    let store = FileTopologyStore::new(&config.topology_file, &config.status_dir);
    match store.topology().await {
        Ok(topology) if topology.slots_enabled() => {
            info.slot_name = slot_name_for(topology.slot_prefix(), &config.pod_name);
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Topology not readable, joining without a replication slot"),
    }

    with_host_cancellation(info.join()).await
}

async fn restore(config: Config, bootstrap: BootstrapConfig) -> anyhow::Result<()> {
    let backup = BackupCoordinates {
        destination: BootstrapConfig::require(&bootstrap.backup_destination, "PGFLEET_BACKUP_DESTINATION")?
            .to_string(),
        server: BootstrapConfig::require(&bootstrap.backup_server, "PGFLEET_BACKUP_SERVER")?.to_string(),
        backup_id: BootstrapConfig::require(&bootstrap.backup_id, "PGFLEET_BACKUP_ID")?.to_string(),
        endpoint_url: bootstrap.backup_endpoint.clone(),
        encryption: bootstrap.backup_encryption.clone(),
    };
    let info = RestoreInfo {
        pgdata: config.pgdata.clone(),
        cluster_name: config.cluster_name.clone(),
        pod_name: config.pod_name.clone(),
        password_file: required_path(&bootstrap.password_file, "PGFLEET_PASSWORD_FILE")?,
        parent_node: BootstrapConfig::require(&bootstrap.parent_node, "PGFLEET_PARENT_NODE")?.to_string(),
        backup,
        restore_tool: bootstrap
            .restore_tool
            .clone()
            .unwrap_or_else(|| PathBuf::from("barman-cloud-restore")),
    };
    let instance = Instance::from_config(&config);

    with_host_cancellation(info.restore(&LocalPostmaster::new(), &instance)).await
}

fn required_path(value: &Option<PathBuf>, var: &'static str) -> anyhow::Result<PathBuf> {
    value
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Missing required environment variable: {}", var))
}

/// Run a bootstrap workflow until it finishes or the process is interrupted.
async fn with_host_cancellation<F>(workflow: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = pgfleet_instance::Result<()>>,
{
    tokio::select! {
        result = workflow => {
            result?;
            info!("Bootstrap completed");
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            anyhow::bail!("interrupted")
        }
    }
}
