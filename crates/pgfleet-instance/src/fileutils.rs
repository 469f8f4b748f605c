// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Small filesystem helpers used by the configuration writers.

use std::io::ErrorKind;
use std::path::Path;

/// Write `content` to `path` unless the file already holds exactly that content.
///
/// Returns `true` when the file was written.
pub async fn write_string_to_file(path: &Path, content: &str) -> std::io::Result<bool> {
    match tokio::fs::read(path).await {
        Ok(existing) if existing == content.as_bytes() => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    Ok(true)
}

/// Read a file as a string, treating a missing file as empty.
pub async fn read_file_or_empty(path: &Path) -> std::io::Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

/// Append `content` to `path`, creating the file if needed.
pub async fn append_string_to_file(path: &Path, content: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(content.as_bytes()).await?;
    file.flush().await
}

/// Create `path` as an empty file if it does not exist. Existing content is kept.
pub async fn ensure_file_exists(path: &Path) -> std::io::Result<()> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map(|_| ())
}
