// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Postmaster backed by a local `postgres` child process.

use std::process::Stdio;

use async_trait::async_trait;
use nix::sys::signal;
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::traits::*;
use crate::instance::Instance;
use crate::tool;

/// Spawns `postgres` directly and supervises it as a child process.
#[derive(Debug, Clone, Default)]
pub struct LocalPostmaster;

impl LocalPostmaster {
    /// Create a new local postmaster controller.
    pub fn new() -> Self {
        Self
    }
}

/// Forward every line of a child stream to tracing.
fn forward_output<R>(stream: R, pod_name: String)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(pod_name = %pod_name, source = "postgres", "{}", line),
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Stopped reading postgres output");
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl Postmaster for LocalPostmaster {
    async fn start(&self, instance: &Instance, options: &StartOptions) -> Result<PostmasterHandle> {
        let program = instance.binaries().path("postgres");
        let socket_dir = instance.socket_dir().display().to_string();

        let mut command = Command::new(&program);
        command
            .arg("-D")
            .arg(&instance.pgdata)
            .arg("-c")
            .arg(format!("unix_socket_directories={}", socket_dir));
        if options.restricted {
            command.arg("-c").arg("listen_addresses=");
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            error!(pod_name = %instance.pod_name, program = %program.display(), error = %e, "Failed to spawn postgres");
            PostmasterError::StartFailed(e.to_string())
        })?;

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, instance.pod_name.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, instance.pod_name.clone());
        }

        let (tx, rx) = watch::channel(None);
        let pod_name = instance.pod_name.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => PostmasterExit::from(status),
                Err(e) => {
                    error!(pod_name = %pod_name, error = %e, "Error waiting on postgres process");
                    PostmasterExit::default()
                }
            };
            info!(pod_name = %pod_name, exit = %exit, "Postgres process exited");
            tx.send_replace(Some(exit));
        });

        info!(
            pod_name = %instance.pod_name,
            pid = ?pid,
            restricted = options.restricted,
            "Postgres process started"
        );
        Ok(PostmasterHandle::new(pid, rx))
    }

    async fn signal(&self, handle: &PostmasterHandle, mode: ShutdownMode) -> Result<()> {
        if handle.exit_status().is_some() {
            return Ok(());
        }
        let pid = handle.pid.ok_or(PostmasterError::NotRunning)?;
        let pid = i32::try_from(pid).map_err(|_| PostmasterError::NotRunning)?;

        debug!(pid, %mode, "Signalling postmaster");
        match signal::kill(Pid::from_raw(pid), mode.signal()) {
            Ok(()) => Ok(()),
            // raced with the exit
            Err(nix::errno::Errno::ESRCH) => {
                warn!(pid, %mode, "Postmaster already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn promote(&self, instance: &Instance) -> Result<()> {
        let pg_ctl = instance.binaries().path("pg_ctl");
        let pgdata = instance.pgdata.display().to_string();
        info!(pod_name = %instance.pod_name, "Promoting instance");
        tool::run_tool(&pg_ctl, ["promote", "-w", "-D", pgdata.as_str()])
            .await
            .map(|_| ())
            .map_err(|e| PostmasterError::PromoteFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fake_postgres(dir: &TempDir, script: &str) -> Instance {
        use std::os::unix::fs::PermissionsExt;

        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let path = bin.join("postgres");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        Instance::new(dir.path().join("data"), "pg-1", "pg")
            .with_binaries(crate::instance::PgBinaries::new(Some(bin)))
    }

    #[tokio::test]
    async fn test_start_and_observe_exit() {
        let dir = TempDir::new().unwrap();
        let instance = fake_postgres(&dir, "exit 7");

        let handle = LocalPostmaster::new()
            .start(&instance, &StartOptions::normal())
            .await
            .unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert_eq!(exit.code, Some(7));
    }

    #[tokio::test]
    async fn test_signal_terminates_process() {
        let dir = TempDir::new().unwrap();
        let instance = fake_postgres(&dir, "exec sleep 30");
        let postmaster = LocalPostmaster::new();

        let handle = postmaster
            .start(&instance, &StartOptions::restricted())
            .await
            .unwrap();
        postmaster
            .signal(&handle, ShutdownMode::Smart)
            .await
            .unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert_eq!(exit.signal, Some(signal::Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_start_missing_binary() {
        let instance = Instance::new("/nonexistent", "pg-1", "pg").with_binaries(
            crate::instance::PgBinaries::new(Some("/nonexistent/bin".into())),
        );
        let err = LocalPostmaster::new()
            .start(&instance, &StartOptions::normal())
            .await
            .unwrap_err();
        assert!(matches!(err, PostmasterError::StartFailed(_)));
    }
}
