// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock postmaster for testing.
//!
//! Simulates a server process without spawning anything. Shutdown signals
//! make the simulated process exit unless the mode is configured to be
//! ignored, which lets tests exercise timeout escalation.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::traits::*;
use crate::instance::Instance;

#[derive(Debug, Default)]
struct MockState {
    signals: Vec<ShutdownMode>,
    promotions: usize,
    current: Option<watch::Sender<Option<PostmasterExit>>>,
    restricted_starts: usize,
}

/// Mock postmaster for testing.
#[derive(Debug)]
pub struct MockPostmaster {
    state: Mutex<MockState>,
    starts: watch::Sender<usize>,
    ignored: HashSet<ShutdownMode>,
    /// If true, every start fails
    pub fail_start: bool,
    /// If true, promotion fails
    pub fail_promote: bool,
}

impl Default for MockPostmaster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPostmaster {
    /// Create a mock whose process honours every shutdown mode.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            starts: watch::Sender::new(0),
            ignored: HashSet::new(),
            fail_start: false,
            fail_promote: false,
        }
    }

    /// Make the simulated process ignore `mode`, as a server with connected
    /// clients ignores a smart shutdown.
    pub fn ignoring(mut self, mode: ShutdownMode) -> Self {
        self.ignored.insert(mode);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of processes started so far.
    pub fn start_count(&self) -> usize {
        *self.starts.borrow()
    }

    /// Number of starts done in restricted mode.
    pub fn restricted_start_count(&self) -> usize {
        self.lock().restricted_starts
    }

    /// Every shutdown mode requested, in order.
    pub fn signals(&self) -> Vec<ShutdownMode> {
        self.lock().signals.clone()
    }

    /// Number of promotions requested.
    pub fn promotions(&self) -> usize {
        self.lock().promotions
    }

    /// Wait until at least `count` processes have been started.
    pub async fn wait_for_starts(&self, count: usize, timeout: Duration) -> bool {
        let mut starts = self.starts.subscribe();
        tokio::time::timeout(timeout, starts.wait_for(|n| *n >= count))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Make the current process exit on its own with `code`.
    pub fn crash(&self, code: i32) {
        if let Some(tx) = &self.lock().current {
            tx.send_replace(Some(PostmasterExit {
                code: Some(code),
                signal: None,
            }));
        }
    }
}

#[async_trait]
impl Postmaster for MockPostmaster {
    async fn start(&self, _instance: &Instance, options: &StartOptions) -> Result<PostmasterHandle> {
        if self.fail_start {
            return Err(PostmasterError::StartFailed("mock start failure".to_string()));
        }

        let (tx, rx) = watch::channel(None);
        {
            let mut state = self.lock();
            state.current = Some(tx);
            if options.restricted {
                state.restricted_starts += 1;
            }
        }
        let mut pid = 0;
        self.starts.send_modify(|n| {
            *n += 1;
            pid = 1000 + *n as u32;
        });
        Ok(PostmasterHandle::new(Some(pid), rx))
    }

    async fn signal(&self, handle: &PostmasterHandle, mode: ShutdownMode) -> Result<()> {
        let mut state = self.lock();
        state.signals.push(mode);
        if handle.exit_status().is_some() || self.ignored.contains(&mode) {
            return Ok(());
        }
        if let Some(tx) = &state.current {
            tx.send_replace(Some(PostmasterExit {
                code: Some(0),
                signal: None,
            }));
        }
        Ok(())
    }

    async fn promote(&self, _instance: &Instance) -> Result<()> {
        self.lock().promotions += 1;
        if self.fail_promote {
            return Err(PostmasterError::PromoteFailed("mock promote failure".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ignored_mode_keeps_process_alive() {
        let mock = MockPostmaster::new().ignoring(ShutdownMode::Smart);
        let instance = Instance::new("/tmp/pgdata", "pg-1", "pg");
        let handle = mock.start(&instance, &StartOptions::normal()).await.unwrap();

        mock.signal(&handle, ShutdownMode::Smart).await.unwrap();
        assert_eq!(handle.exit_status(), None);

        mock.signal(&handle, ShutdownMode::Fast).await.unwrap();
        assert!(handle.exit_status().is_some());
        assert_eq!(mock.signals(), vec![ShutdownMode::Smart, ShutdownMode::Fast]);
    }

    #[tokio::test]
    async fn test_crash_publishes_exit_code() {
        let mock = MockPostmaster::new();
        let instance = Instance::new("/tmp/pgdata", "pg-1", "pg");
        let handle = mock.start(&instance, &StartOptions::normal()).await.unwrap();

        mock.crash(2);
        assert_eq!(handle.wait().await.code, Some(2));
        assert_eq!(mock.start_count(), 1);
    }
}
