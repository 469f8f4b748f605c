// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Postmaster trait definitions.
//!
//! Defines the abstract interface used to start, signal and promote the
//! PostgreSQL server process.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use thiserror::Error;
use tokio::sync::watch;

use crate::instance::Instance;

/// Errors from postmaster operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PostmasterError {
    /// The server process could not be spawned.
    #[error("Postmaster start failed: {0}")]
    StartFailed(String),

    /// Delivering a signal to the server failed.
    #[error("Failed to signal postmaster: {0}")]
    Signal(#[from] nix::errno::Errno),

    /// The server exited without being asked to.
    #[error("Postmaster exited unexpectedly: {0}")]
    UnexpectedExit(PostmasterExit),

    /// The server did not exit within the shutdown budget.
    #[error("Postmaster did not complete {mode} shutdown within {timeout:?}")]
    ShutdownTimeout {
        /// Shutdown mode that was requested.
        mode: ShutdownMode,
        /// Budget that elapsed.
        timeout: Duration,
    },

    /// The operation requires a running server.
    #[error("Postmaster is not running")]
    NotRunning,

    /// Promotion was refused.
    #[error("Promotion failed: {0}")]
    PromoteFailed(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for postmaster operations.
pub type Result<T> = std::result::Result<T, PostmasterError>;

/// PostgreSQL shutdown modes, in escalating order of strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownMode {
    /// Wait for every client to disconnect.
    Smart,
    /// Terminate sessions and checkpoint.
    Fast,
    /// Exit without a checkpoint; crash recovery runs on next start.
    Immediate,
}

impl ShutdownMode {
    /// Signal the postmaster interprets as this mode.
    pub fn signal(self) -> Signal {
        match self {
            Self::Smart => Signal::SIGTERM,
            Self::Fast => Signal::SIGINT,
            Self::Immediate => Signal::SIGQUIT,
        }
    }

    /// Name used by `pg_ctl stop -m`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Smart => "smart",
            Self::Fast => "fast",
            Self::Immediate => "immediate",
        }
    }
}

impl fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the postmaster process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostmasterExit {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Signal number, when the process was killed.
    pub signal: Option<i32>,
}

impl PostmasterExit {
    /// Whether the process exited with status 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for PostmasterExit {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for PostmasterExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Options for starting the postmaster.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Listen only on the unix socket. Used by the bootstrap workflows so no
    /// client can reach the server while credentials are being set.
    pub restricted: bool,
}

impl StartOptions {
    /// Options for a regular start.
    pub fn normal() -> Self {
        Self { restricted: false }
    }

    /// Options for a socket-only start.
    pub fn restricted() -> Self {
        Self { restricted: true }
    }
}

/// Handle to one spawned postmaster process.
#[derive(Debug, Clone)]
pub struct PostmasterHandle {
    /// Process ID, when known.
    pub pid: Option<u32>,
    /// When the process was started.
    pub started_at: DateTime<Utc>,
    exit: watch::Receiver<Option<PostmasterExit>>,
}

impl PostmasterHandle {
    /// Create a handle whose exit is published on `exit`.
    pub fn new(pid: Option<u32>, exit: watch::Receiver<Option<PostmasterExit>>) -> Self {
        Self {
            pid,
            started_at: Utc::now(),
            exit,
        }
    }

    /// The exit status, if the process already ended.
    pub fn exit_status(&self) -> Option<PostmasterExit> {
        *self.exit.borrow()
    }

    /// Wait until the process ends.
    ///
    /// If the waiter goes away without publishing a status the exit is
    /// reported as unknown.
    pub async fn wait(&self) -> PostmasterExit {
        let mut exit = self.exit.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(status) => {
                let status: Option<PostmasterExit> = *status;
                status.unwrap_or_default()
            }
            Err(_) => self.exit_status().unwrap_or_default(),
        }
    }
}

/// Trait for controlling the PostgreSQL server process.
#[async_trait]
pub trait Postmaster: Send + Sync {
    /// Spawn the server against the instance's data directory. Returns as soon
    /// as the process exists; readiness is checked separately.
    async fn start(&self, instance: &Instance, options: &StartOptions) -> Result<PostmasterHandle>;

    /// Ask the server to shut down in `mode`. Does not wait for the exit.
    async fn signal(&self, handle: &PostmasterHandle, mode: ShutdownMode) -> Result<()>;

    /// Promote a standby to primary and wait for the promotion to finish.
    async fn promote(&self, instance: &Instance) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_mode_signals() {
        assert_eq!(ShutdownMode::Smart.signal(), Signal::SIGTERM);
        assert_eq!(ShutdownMode::Fast.signal(), Signal::SIGINT);
        assert_eq!(ShutdownMode::Immediate.signal(), Signal::SIGQUIT);
    }

    #[test]
    fn test_exit_display() {
        let exited = PostmasterExit {
            code: Some(1),
            signal: None,
        };
        assert_eq!(exited.to_string(), "exit code 1");
        assert!(!exited.success());

        let killed = PostmasterExit {
            code: None,
            signal: Some(9),
        };
        assert_eq!(killed.to_string(), "killed by signal 9");
    }

    #[tokio::test]
    async fn test_handle_wait_sees_published_exit() {
        let (tx, rx) = watch::channel(None);
        let handle = PostmasterHandle::new(Some(42), rx);
        assert_eq!(handle.exit_status(), None);

        tx.send_replace(Some(PostmasterExit {
            code: Some(0),
            signal: None,
        }));
        assert!(handle.wait().await.success());
    }

    #[tokio::test]
    async fn test_handle_wait_when_waiter_vanishes() {
        let (tx, rx) = watch::channel(None);
        let handle = PostmasterHandle::new(None, rx);
        drop(tx);
        assert_eq!(handle.wait().await, PostmasterExit::default());
    }
}
