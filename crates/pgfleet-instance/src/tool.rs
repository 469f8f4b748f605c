// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution of external command-line tools with captured output.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{error, info};

use crate::error::{Error, Result};

/// Captured output of a successful tool run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

fn tool_name(program: &Path) -> String {
    program
        .file_name()
        .unwrap_or(program.as_os_str())
        .to_string_lossy()
        .into_owned()
}

/// Run `program` to completion and capture its output.
///
/// Every output line is re-emitted through tracing. A non-zero exit is
/// reported as [`Error::ToolFailed`] carrying both streams.
pub async fn run_tool<I, S>(program: &Path, args: I) -> Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_tool_with_env(program, args, &[]).await
}

/// Like [`run_tool`], with `env` added to the inherited environment.
pub async fn run_tool_with_env<I, S>(program: &Path, args: I, env: &[(&str, &str)]) -> Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let tool = tool_name(program);
    let output = Command::new(program)
        .args(args)
        .envs(env.iter().copied())
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            error!(tool = %tool, error = %e, "Failed to launch tool");
            Error::Io(e)
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    for line in stdout.lines().chain(stderr.lines()) {
        info!(tool = %tool, "{}", line);
    }

    if !output.status.success() {
        error!(
            tool = %tool,
            code = ?output.status.code(),
            stdout = %stdout,
            stderr = %stderr,
            "Tool exited with errors"
        );
        return Err(Error::ToolFailed {
            tool,
            code: output.status.code(),
            stdout,
            stderr,
        });
    }

    Ok(ToolOutput { stdout, stderr })
}
