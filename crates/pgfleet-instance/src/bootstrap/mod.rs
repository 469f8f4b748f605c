// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bootstrap workflows - the ways a fresh instance gets its first data.
//!
//! - [`InitInfo`] creates an empty data directory with `initdb`
//! - [`JoinInfo`] clones a running server with `pg_basebackup`
//! - [`RestoreInfo`] materializes a backup and replays WAL until promotion
//!
//! Steps needing SQL run inside [`with_active_instance`], which starts the
//! server in socket-only mode and always stops it again.

mod initdb;
mod join;
mod restore;

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Connection, PgConnection};
use tracing::{debug, error, info, warn};

pub use initdb::InitInfo;
pub use join::JoinInfo;
pub use restore::{BackupCoordinates, RECOVERY_POLL_INTERVAL, RestoreInfo, wait_until_recovery_finishes};

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::postmaster::{
    self, IMMEDIATE_SHUTDOWN_TIMEOUT, Postmaster, PostmasterError, PostmasterHandle, ShutdownMode,
    StartOptions,
};

/// Interval between connection attempts while the server starts.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Quote a string as an SQL literal.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

/// Quote a string as an SQL identifier.
pub fn quote_identifier(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Read a password file, dropping one trailing newline.
pub async fn read_password_file(path: &Path) -> Result<String> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        error!(path = %path.display(), error = %e, "Cannot read password file");
        Error::Io(e)
    })?;
    Ok(content
        .strip_suffix('\n')
        .map(|s| s.strip_suffix('\r').unwrap_or(s))
        .unwrap_or(&content)
        .to_string())
}

/// SQLSTATEs of a refused login: no matching pg_hba.conf entry or a rejected
/// credential. Retrying will not help.
const LOGIN_REJECTED_CODES: [&str; 2] = ["28000", "28P01"];

/// Whether `err` is the server refusing the login rather than not being ready.
fn is_login_rejected(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| LOGIN_REJECTED_CODES.iter().any(|rejected| code == *rejected))
}

/// Wait until the local server accepts superuser connections. Fails when it
/// exits first or refuses the login.
async fn wait_until_accepting(instance: &Instance, handle: &PostmasterHandle) -> Result<()> {
    let options = instance.superuser_connect_options();
    loop {
        if let Some(exit) = handle.exit_status() {
            error!(pod_name = %instance.pod_name, exit = %exit, "Server exited while starting");
            return Err(PostmasterError::UnexpectedExit(exit).into());
        }

        match PgConnection::connect_with(&options).await {
            Ok(conn) => {
                let _ = conn.close().await;
                return Ok(());
            }
            Err(e) if is_login_rejected(&e) => {
                error!(pod_name = %instance.pod_name, error = %e, "Server refused the superuser login");
                return Err(e.into());
            }
            Err(e) => {
                debug!(pod_name = %instance.pod_name, error = %e, "Server not accepting connections yet");
            }
        }

        tokio::select! {
            _ = handle.wait() => {}
            _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
        }
    }
}

/// Stop a server started for a bootstrap scope: fast, then immediate.
pub async fn stop_restricted(
    postmaster: &dyn Postmaster,
    instance: &Instance,
    handle: &PostmasterHandle,
) -> Result<()> {
    match postmaster::stop(postmaster, handle, ShutdownMode::Fast, instance.max_stop_delay()).await {
        Ok(_) => Ok(()),
        Err(e) => {
            warn!(pod_name = %instance.pod_name, error = %e, "Fast shutdown failed, trying immediate");
            postmaster::stop(postmaster, handle, ShutdownMode::Immediate, IMMEDIATE_SHUTDOWN_TIMEOUT)
                .await
                .map(|_| ())
                .map_err(Error::from)
        }
    }
}

/// Run `body` against a socket-only server started for the occasion.
///
/// The server is stopped afterwards whatever `body` returned, so the data
/// directory is free for the next phase. An error from `body` wins over an
/// error from stopping.
pub async fn with_active_instance<T, F, Fut>(
    postmaster: &dyn Postmaster,
    instance: &Instance,
    body: F,
) -> Result<T>
where
    F: FnOnce(PgPool) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let handle = postmaster.start(instance, &StartOptions::restricted()).await?;
    info!(pod_name = %instance.pod_name, pgdata = %instance.pgdata.display(), "Started instance in restricted mode");

    let result = async {
        wait_until_accepting(instance, &handle).await?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(instance.superuser_connect_options())
            .await?;
        let outcome = body(pool.clone()).await;
        pool.close().await;
        outcome
    }
    .await;

    let stopped = stop_restricted(postmaster, instance, &handle).await;
    if let Err(e) = &stopped {
        error!(pod_name = %instance.pod_name, error = %e, "Failed to stop restricted instance");
    }
    let value = result?;
    stopped?;
    Ok(value)
}
