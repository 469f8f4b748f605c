// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Line-oriented editing of PostgreSQL configuration files.
//!
//! Only `key = value` lines whose key is managed by the caller are touched.
//! Comments, blank lines and unrelated settings keep their position and text,
//! so re-applying the same options produces byte-identical output.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::fileutils;

/// Options to write, keyed by setting name. Ordered so that appended keys
/// always land in the same order.
pub type Options = BTreeMap<String, String>;

/// Extract the setting name of a configuration line, if it is an assignment.
fn line_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    let end = trimmed
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
        .unwrap_or(trimmed.len());
    if end == 0 {
        return None;
    }

    // `include 'file'` style lines carry a value without `=` and still count
    Some(&trimmed[..end])
}

/// Extract the raw value text of an assignment line.
fn line_value(line: &str) -> &str {
    let trimmed = line.trim_start();
    let end = trimmed
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
        .unwrap_or(trimmed.len());
    let rest = trimmed[end..].trim_start();
    rest.strip_prefix('=').unwrap_or(rest).trim()
}

/// Quote a value the way PostgreSQL expects inside configuration files.
pub fn quote_value(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render one assignment line.
fn render(key: &str, value: &str) -> String {
    format!("{} = {}", key, quote_value(value))
}

/// Apply `options` to the text of a configuration file.
///
/// The first occurrence of each managed key is rewritten in place and later
/// occurrences are dropped. Keys listed in `keys_to_remove` that are absent
/// from `options` are deleted. Keys never seen in the file are appended in
/// name order.
pub fn update_configuration_contents(
    content: &str,
    options: &Options,
    keys_to_remove: &[&str],
) -> String {
    let mut written: BTreeSet<&str> = BTreeSet::new();
    let mut lines: Vec<String> = Vec::new();

    for line in content.lines() {
        match line_key(line) {
            Some(key) if options.contains_key(key) => {
                if let Some((k, v)) = options.get_key_value(key)
                    && written.insert(k.as_str())
                {
                    lines.push(render(k, v));
                }
            }
            Some(key) if keys_to_remove.contains(&key) => {}
            _ => lines.push(line.to_string()),
        }
    }

    for (key, value) in options {
        if !written.contains(key.as_str()) {
            lines.push(render(key, value));
        }
    }

    let mut result = lines.join("\n");
    if !result.is_empty() {
        result.push('\n');
    }
    result
}

/// Remove every assignment of any key in `keys` from the configuration text.
pub fn remove_options_from_contents(content: &str, keys: &[&str]) -> String {
    let mut result = String::with_capacity(content.len());
    for line in content.lines() {
        if line_key(line).is_some_and(|key| keys.contains(&key)) {
            continue;
        }
        result.push_str(line);
        result.push('\n');
    }
    result
}

/// Read the raw values of the given keys. When a key is assigned more than
/// once the last assignment wins, matching how PostgreSQL reads the file.
pub fn read_options_from_contents(content: &str, keys: &[&str]) -> Options {
    let mut options = Options::new();
    for line in content.lines() {
        if let Some(key) = line_key(line)
            && keys.contains(&key)
        {
            options.insert(key.to_string(), line_value(line).to_string());
        }
    }
    options
}

/// Apply `options` to the configuration file at `path`.
///
/// A missing file is treated as empty. Returns `true` when the file content
/// changed on disk.
pub async fn update_postgres_configuration_file(
    path: &Path,
    options: &Options,
    keys_to_remove: &[&str],
) -> std::io::Result<bool> {
    let current = fileutils::read_file_or_empty(path).await?;
    let updated = update_configuration_contents(&current, options, keys_to_remove);
    fileutils::write_string_to_file(path, &updated).await
}
