// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The local PostgreSQL instance and the command queue feeding its supervisor.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Connection, PgConnection};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::conninfo::POSTGRES_PORT;
use crate::error::{Error, Result};

/// Superuser the instance manager connects as.
pub const SUPERUSER: &str = "postgres";

/// Directive from the coordinator-facing reconciler to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceCommand {
    /// Restart the postmaster, trying a smart shutdown before a fast one.
    RestartSmartFast,
    /// Shut down with a fast shutdown (immediate on timeout) and do not restart.
    ShutDownFastImmediate,
}

impl fmt::Display for InstanceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestartSmartFast => f.write_str("restart-smart-fast"),
            Self::ShutDownFastImmediate => f.write_str("shutdown-fast-immediate"),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: Option<InstanceCommand>,
    closed: bool,
}

/// Single-slot command queue with coalescing.
///
/// At most one command is pending. A restart queued on top of a restart is
/// merged into it; a shutdown replaces a pending restart; a restart never
/// replaces a pending shutdown. Once closed, every send is refused.
#[derive(Debug, Default)]
pub struct CommandQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl CommandQueue {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a command. Returns `false` when the command was dropped, either
    /// because the queue is closed or because a shutdown is already pending.
    pub fn send(&self, command: InstanceCommand) -> bool {
        let mut state = self.lock();
        if state.closed {
            warn!(%command, "Command queue closed, ignoring command");
            return false;
        }

        let accepted = match (state.pending, command) {
            (Some(InstanceCommand::ShutDownFastImmediate), InstanceCommand::RestartSmartFast) => {
                debug!("Shutdown already pending, dropping restart");
                false
            }
            (Some(InstanceCommand::RestartSmartFast), InstanceCommand::RestartSmartFast) => {
                debug!("Restart already pending, coalescing");
                true
            }
            _ => {
                state.pending = Some(command);
                true
            }
        };
        drop(state);

        if accepted {
            self.notify.notify_one();
        }
        accepted
    }

    /// Wait for the next command. Never resolves once the queue is closed.
    pub async fn recv(&self) -> InstanceCommand {
        loop {
            {
                let mut state = self.lock();
                if !state.closed
                    && let Some(command) = state.pending.take()
                {
                    return command;
                }
            }
            self.notify.notified().await;
        }
    }

    /// The pending command, if any, without consuming it.
    pub fn pending(&self) -> Option<InstanceCommand> {
        self.lock().pending
    }

    /// Drop a pending restart. Called when a fresh postmaster has just been
    /// started, which already satisfies it.
    pub fn discard_pending_restart(&self) -> bool {
        let mut state = self.lock();
        if state.pending == Some(InstanceCommand::RestartSmartFast) {
            state.pending = None;
            true
        } else {
            false
        }
    }

    /// Refuse every further command and forget the pending one.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        if let Some(command) = state.pending.take() {
            info!(%command, "Discarding pending command, terminal shutdown in progress");
        }
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Location of the PostgreSQL executables.
#[derive(Debug, Clone, Default)]
pub struct PgBinaries {
    dir: Option<PathBuf>,
}

impl PgBinaries {
    /// Binaries found in `dir`, or through `PATH` when `None`.
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    /// Path of the executable `name`.
    pub fn path(&self, name: &str) -> PathBuf {
        match &self.dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }
}

/// Whole milliseconds in `delay`, capped at `u64::MAX`.
fn saturating_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

/// Handle to the PostgreSQL instance supervised by this agent.
#[derive(Debug)]
pub struct Instance {
    /// Data directory
    pub pgdata: PathBuf,
    /// Pod name, also used as `application_name` when streaming
    pub pod_name: String,
    /// Fleet name
    pub cluster_name: String,
    /// Fleet namespace
    pub namespace: String,
    socket_dir: PathBuf,
    binaries: PgBinaries,
    max_stop_delay_ms: AtomicU64,
    max_switchover_delay_ms: AtomicU64,
    can_check_readiness: AtomicBool,
    pg_rewind_running: AtomicBool,
    commands: CommandQueue,
    pool: OnceLock<PgPool>,
}

impl Instance {
    /// Create a new instance handle.
    pub fn new(
        pgdata: impl Into<PathBuf>,
        pod_name: impl Into<String>,
        cluster_name: impl Into<String>,
    ) -> Self {
        Self {
            pgdata: pgdata.into(),
            pod_name: pod_name.into(),
            cluster_name: cluster_name.into(),
            namespace: "default".to_string(),
            socket_dir: PathBuf::from("/controller/run"),
            binaries: PgBinaries::default(),
            max_stop_delay_ms: AtomicU64::new(1_800_000),
            max_switchover_delay_ms: AtomicU64::new(3_600_000),
            can_check_readiness: AtomicBool::new(false),
            pg_rewind_running: AtomicBool::new(false),
            commands: CommandQueue::new(),
            pool: OnceLock::new(),
        }
    }

    /// Create an instance handle from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        let instance = Self::new(&config.pgdata, &config.pod_name, &config.cluster_name)
            .with_namespace(&config.namespace)
            .with_socket_dir(&config.socket_dir)
            .with_binaries(PgBinaries::new(config.pg_bin_dir.clone()));
        instance.set_max_stop_delay(config.max_stop_delay);
        instance.set_max_switchover_delay(config.max_switchover_delay);
        instance
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the directory holding the postmaster unix socket.
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    /// Set the location of the PostgreSQL executables.
    pub fn with_binaries(mut self, binaries: PgBinaries) -> Self {
        self.binaries = binaries;
        self
    }

    /// Directory holding the postmaster unix socket.
    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Location of the PostgreSQL executables.
    pub fn binaries(&self) -> &PgBinaries {
        &self.binaries
    }

    /// Budget for a full shutdown on host cancellation.
    pub fn max_stop_delay(&self) -> Duration {
        Duration::from_millis(self.max_stop_delay_ms.load(Ordering::SeqCst))
    }

    /// Update the stop budget.
    pub fn set_max_stop_delay(&self, delay: Duration) {
        self.max_stop_delay_ms.store(saturating_millis(delay), Ordering::SeqCst);
    }

    /// Budget for the smart stage of a coordinator-issued restart.
    pub fn max_switchover_delay(&self) -> Duration {
        Duration::from_millis(self.max_switchover_delay_ms.load(Ordering::SeqCst))
    }

    /// Update the switchover budget.
    pub fn set_max_switchover_delay(&self, delay: Duration) {
        self.max_switchover_delay_ms.store(saturating_millis(delay), Ordering::SeqCst);
    }

    /// Whether readiness checks may report success.
    pub fn can_check_readiness(&self) -> bool {
        self.can_check_readiness.load(Ordering::SeqCst)
    }

    /// Open or close the readiness gate.
    pub fn set_can_check_readiness(&self, value: bool) {
        self.can_check_readiness.store(value, Ordering::SeqCst);
    }

    /// Whether a pg_rewind is currently repairing the data directory.
    pub fn is_pg_rewind_running(&self) -> bool {
        self.pg_rewind_running.load(Ordering::SeqCst)
    }

    /// Flag a pg_rewind as running or finished.
    pub fn set_pg_rewind_running(&self, value: bool) {
        self.pg_rewind_running.store(value, Ordering::SeqCst);
    }

    /// Queue of commands for the supervisor.
    pub fn commands(&self) -> &CommandQueue {
        &self.commands
    }

    /// Connection options for the local superuser over the unix socket.
    pub fn superuser_connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .socket(&self.socket_dir)
            .port(POSTGRES_PORT)
            .username(SUPERUSER)
            .database("postgres")
            .application_name("pgfleet-instance")
    }

    /// Open a short-lived superuser connection.
    pub async fn connect(&self) -> Result<PgConnection> {
        Ok(PgConnection::connect_with(&self.superuser_connect_options()).await?)
    }

    /// Shared superuser pool, created lazily on first use.
    ///
    /// Connections are validated on acquire, so the pool survives postmaster
    /// restarts.
    pub fn superuser_pool(&self) -> PgPool {
        self.pool
            .get_or_init(|| {
                PgPoolOptions::new()
                    .max_connections(2)
                    .idle_timeout(Duration::from_secs(30))
                    .connect_lazy_with(self.superuser_connect_options())
            })
            .clone()
    }

    /// Succeeds when the instance is allowed to report readiness and accepts
    /// connections.
    pub async fn is_ready(&self) -> Result<()> {
        if !self.can_check_readiness() {
            return Err(Error::Other("instance is not ready yet".to_string()));
        }
        let mut conn = self.connect().await?;
        conn.ping().await?;
        conn.close().await?;
        Ok(())
    }
}
