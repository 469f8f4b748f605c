// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Postmaster module - control of the PostgreSQL server process.

mod local;
pub mod mock;
mod traits;

use std::time::Duration;

use tracing::{info, warn};

pub use local::LocalPostmaster;
pub use mock::MockPostmaster;
pub use traits::*;

/// Grace period granted to an immediate shutdown before giving up.
pub const IMMEDIATE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Request a shutdown in `mode` and wait up to `timeout` for the process to end.
pub async fn stop(
    postmaster: &dyn Postmaster,
    handle: &PostmasterHandle,
    mode: ShutdownMode,
    timeout: Duration,
) -> Result<PostmasterExit> {
    if let Some(exit) = handle.exit_status() {
        return Ok(exit);
    }

    info!(%mode, timeout_secs = timeout.as_secs(), "Requesting postmaster shutdown");
    postmaster.signal(handle, mode).await?;

    match tokio::time::timeout(timeout, handle.wait()).await {
        Ok(exit) => Ok(exit),
        Err(_) => {
            warn!(%mode, timeout_secs = timeout.as_secs(), "Postmaster shutdown timed out");
            Err(PostmasterError::ShutdownTimeout { mode, timeout })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;

    #[tokio::test]
    async fn test_stop_times_out_on_ignored_mode() {
        let mock = MockPostmaster::new().ignoring(ShutdownMode::Smart);
        let instance = Instance::new("/tmp/pgdata", "pg-1", "pg");
        let handle = mock.start(&instance, &StartOptions::normal()).await.unwrap();

        let err = stop(&mock, &handle, ShutdownMode::Smart, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PostmasterError::ShutdownTimeout {
                mode: ShutdownMode::Smart,
                ..
            }
        ));

        let exit = stop(&mock, &handle, ShutdownMode::Fast, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(exit.success());
    }

    #[tokio::test]
    async fn test_stop_already_exited_sends_nothing() {
        let mock = MockPostmaster::new();
        let instance = Instance::new("/tmp/pgdata", "pg-1", "pg");
        let handle = mock.start(&instance, &StartOptions::normal()).await.unwrap();
        mock.crash(1);

        let exit = stop(&mock, &handle, ShutdownMode::Fast, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(exit.code, Some(1));
        assert!(mock.signals().is_empty());
    }
}
