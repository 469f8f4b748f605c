// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervision of the postmaster across the whole pod lifetime.
//!
//! Each cycle spawns one postmaster and waits for the first of four events:
//!
//! - the postmaster exits on its own: the supervisor stops with the exit as error
//! - the host token is cancelled: smart then fast shutdown within the stop delay
//! - SIGTERM/SIGINT: the same sequence within half the stop delay
//! - an [`InstanceCommand`]: restart (smart then fast within the switchover
//!   delay, then a new cycle) or shut down for good (fast then immediate)
//!
//! Only a restart command starts a new cycle. The supervisor is the only
//! task that starts or stops the postmaster.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::instance::{Instance, InstanceCommand};
use crate::postmaster::{
    self, IMMEDIATE_SHUTDOWN_TIMEOUT, Postmaster, PostmasterError, PostmasterExit,
    PostmasterHandle, ShutdownMode, StartOptions,
};

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Spawning a postmaster
    Starting,
    /// Postmaster running, waiting for an event
    Running,
    /// Smart shutdown in progress
    ShuttingDownSmart,
    /// Fast shutdown in progress
    ShuttingDownFast,
    /// Immediate shutdown in progress
    ShuttingDownImmediate,
    /// Supervisor finished
    Terminated,
}

impl LifecycleState {
    fn shutting_down(mode: ShutdownMode) -> Self {
        match mode {
            ShutdownMode::Smart => Self::ShuttingDownSmart,
            ShutdownMode::Fast => Self::ShuttingDownFast,
            ShutdownMode::Immediate => Self::ShuttingDownImmediate,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDownSmart => "shutting-down-smart",
            Self::ShuttingDownFast => "shutting-down-fast",
            Self::ShuttingDownImmediate => "shutting-down-immediate",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

enum Trigger {
    Exited(PostmasterExit),
    Cancelled,
    Signal(String),
    Command(InstanceCommand),
}

/// Owns the postmaster process of one instance.
pub struct PostgresLifecycle {
    instance: Arc<Instance>,
    postmaster: Arc<dyn Postmaster>,
    state: watch::Sender<LifecycleState>,
}

impl PostgresLifecycle {
    /// Create a supervisor for `instance`.
    pub fn new(instance: Arc<Instance>, postmaster: Arc<dyn Postmaster>) -> Self {
        Self {
            instance,
            postmaster,
            state: watch::Sender::new(LifecycleState::Starting),
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.send_replace(state);
        info!(pod_name = %self.instance.pod_name, %state, "Lifecycle state changed");
    }

    /// Supervise the postmaster, listening to SIGTERM and SIGINT.
    ///
    /// `cancel` is cancelled when the supervisor returns.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let (tx, rx) = mpsc::channel(1);

        let forwarder = tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    _ = sigterm.recv() => "SIGTERM",
                    _ = sigint.recv() => "SIGINT",
                };
                if tx.send(name.to_string()).await.is_err() {
                    break;
                }
            }
        });

        let result = self.run_with_signals(cancel, rx).await;
        forwarder.abort();
        result
    }

    /// Supervise the postmaster, treating every message on `signals` as a
    /// termination signal.
    ///
    /// `cancel` is cancelled when the supervisor returns.
    pub async fn run_with_signals(
        &self,
        cancel: CancellationToken,
        mut signals: mpsc::Receiver<String>,
    ) -> Result<()> {
        let _cancel_on_exit = cancel.clone().drop_guard();
        let commands = self.instance.commands();

        loop {
            self.set_state(LifecycleState::Starting);
            let handle = match self.postmaster.start(&self.instance, &StartOptions::normal()).await {
                Ok(handle) => handle,
                Err(e) => {
                    error!(pod_name = %self.instance.pod_name, error = %e, "Failed to start postgres");
                    self.terminate();
                    return Err(e.into());
                }
            };
            // the new process satisfies any restart queued during the last cycle
            if commands.discard_pending_restart() {
                info!(pod_name = %self.instance.pod_name, "Discarded restart request satisfied by the new postmaster");
            }
            self.set_state(LifecycleState::Running);

            let trigger = tokio::select! {
                exit = handle.wait() => Trigger::Exited(exit),
                _ = cancel.cancelled() => Trigger::Cancelled,
                Some(signal) = signals.recv() => Trigger::Signal(signal),
                command = commands.recv() => Trigger::Command(command),
            };

            match trigger {
                Trigger::Exited(exit) => {
                    error!(pod_name = %self.instance.pod_name, exit = %exit, "PostgreSQL process exited unexpectedly");
                    self.terminate();
                    return Err(PostmasterError::UnexpectedExit(exit).into());
                }
                Trigger::Cancelled => {
                    info!(pod_name = %self.instance.pod_name, "Context has been cancelled, shutting down and exiting");
                    commands.close();
                    self.full_shutdown(&handle, ShutdownMode::Smart, ShutdownMode::Fast, self.instance.max_stop_delay())
                        .await;
                    self.terminate();
                    return Ok(());
                }
                Trigger::Signal(signal) => {
                    info!(pod_name = %self.instance.pod_name, %signal, "Received termination signal");
                    commands.close();
                    self.full_shutdown(
                        &handle,
                        ShutdownMode::Smart,
                        ShutdownMode::Fast,
                        self.instance.max_stop_delay() / 2,
                    )
                    .await;
                    self.terminate();
                    return Ok(());
                }
                Trigger::Command(command) => {
                    info!(pod_name = %self.instance.pod_name, %command, "Received request for postgres");
                    if !self.handle_command(&handle, command).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Carry out a command. Returns `true` when a new cycle must start.
    async fn handle_command(&self, handle: &PostmasterHandle, command: InstanceCommand) -> Result<bool> {
        match command {
            InstanceCommand::RestartSmartFast => {
                let budget = self.instance.max_switchover_delay();
                if let Err(e) = self
                    .shutdown_sequence(handle, ShutdownMode::Smart, ShutdownMode::Fast, budget)
                    .await
                {
                    warn!(pod_name = %self.instance.pod_name, error = %e, "Restart shutdown failed, escalating to immediate");
                    // never respawn next to a live postmaster
                    if let Err(e) = self
                        .shutdown_stage(handle, ShutdownMode::Immediate, IMMEDIATE_SHUTDOWN_TIMEOUT)
                        .await
                    {
                        error!(pod_name = %self.instance.pod_name, error = %e, "Cannot stop postgres for restart");
                        self.instance.commands().close();
                        self.terminate();
                        return Err(Error::from(e));
                    }
                }
                Ok(true)
            }
            InstanceCommand::ShutDownFastImmediate => {
                self.instance.commands().close();
                self.full_shutdown(
                    handle,
                    ShutdownMode::Fast,
                    ShutdownMode::Immediate,
                    self.instance.max_stop_delay(),
                )
                .await;
                self.terminate();
                Ok(false)
            }
        }
    }

    async fn shutdown_stage(
        &self,
        handle: &PostmasterHandle,
        mode: ShutdownMode,
        timeout: Duration,
    ) -> std::result::Result<PostmasterExit, PostmasterError> {
        self.set_state(LifecycleState::shutting_down(mode));
        postmaster::stop(self.postmaster.as_ref(), handle, mode, timeout).await
    }

    /// Try `first`, escalating to `second` when it fails. Each stage gets
    /// `timeout`.
    async fn shutdown_sequence(
        &self,
        handle: &PostmasterHandle,
        first: ShutdownMode,
        second: ShutdownMode,
        timeout: Duration,
    ) -> std::result::Result<PostmasterExit, PostmasterError> {
        match self.shutdown_stage(handle, first, timeout).await {
            Ok(exit) => Ok(exit),
            Err(e) => {
                warn!(pod_name = %self.instance.pod_name, error = %e, next = %second, "Shutdown stage failed, escalating");
                self.shutdown_stage(handle, second, timeout).await
            }
        }
    }

    /// Shutdown sequence of the terminal paths; ends with an immediate
    /// shutdown when the sequence did not stop the postmaster.
    async fn full_shutdown(
        &self,
        handle: &PostmasterHandle,
        first: ShutdownMode,
        second: ShutdownMode,
        timeout: Duration,
    ) {
        match self.shutdown_sequence(handle, first, second, timeout).await {
            Ok(exit) => info!(pod_name = %self.instance.pod_name, exit = %exit, "PostgreSQL stopped"),
            Err(e) if second != ShutdownMode::Immediate => {
                warn!(pod_name = %self.instance.pod_name, error = %e, "Shutdown failed, trying immediate");
                if let Err(e) = self
                    .shutdown_stage(handle, ShutdownMode::Immediate, IMMEDIATE_SHUTDOWN_TIMEOUT)
                    .await
                {
                    error!(pod_name = %self.instance.pod_name, error = %e, "Immediate shutdown failed");
                }
            }
            Err(e) => error!(pod_name = %self.instance.pod_name, error = %e, "Immediate shutdown failed"),
        }
    }

    fn terminate(&self) {
        self.set_state(LifecycleState::Terminated);
    }
}
