// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Settings enforced through the control file, as reported by `pg_controldata`.

use std::collections::HashMap;

use crate::error::Result;
use crate::instance::PgBinaries;
use crate::tool;

/// Settings a hot standby requires to be at least as large as on the primary.
pub const HOT_STANDBY_SENSITIVE_SETTINGS: [&str; 5] = [
    "max_connections",
    "max_prepared_transactions",
    "max_wal_senders",
    "max_worker_processes",
    "max_locks_per_transaction",
];

/// Map a `pg_controldata` label to the setting it records.
fn setting_for_label(label: &str) -> Option<&'static str> {
    match label {
        "max_connections setting" => Some("max_connections"),
        "max_prepared_xacts setting" => Some("max_prepared_transactions"),
        "max_wal_senders setting" => Some("max_wal_senders"),
        "max_worker_processes setting" => Some("max_worker_processes"),
        "max_locks_per_xact setting" => Some("max_locks_per_transaction"),
        _ => None,
    }
}

/// Extract the hot-standby-sensitive settings from `pg_controldata` output.
pub fn parse_enforced_parameters(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (label, value) = line.split_once(':')?;
            let setting = setting_for_label(label.trim())?;
            Some((setting.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Run `pg_controldata` against `pgdata` and return the enforced settings.
///
/// The labels are only stable untranslated, so the tool runs in the C locale.
pub async fn enforced_parameters(
    binaries: &PgBinaries,
    pgdata: &std::path::Path,
) -> Result<HashMap<String, String>> {
    let output = tool::run_tool_with_env(
        &binaries.path("pg_controldata"),
        [pgdata.as_os_str()],
        &[("LC_ALL", "C")],
    )
    .await?;
    Ok(parse_enforced_parameters(&output.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\
pg_control version number:            1300
Database cluster state:               in archive recovery
wal_level setting:                    logical
max_connections setting:              100
max_worker_processes setting:         8
max_wal_senders setting:              10
max_prepared_xacts setting:           0
max_locks_per_xact setting:           64
track_commit_timestamp setting:       off
";

    #[test]
    fn test_parse_enforced_parameters() {
        let params = parse_enforced_parameters(OUTPUT);
        assert_eq!(params.len(), 5);
        assert_eq!(params["max_connections"], "100");
        assert_eq!(params["max_prepared_transactions"], "0");
        assert_eq!(params["max_locks_per_transaction"], "64");
        assert!(!params.contains_key("wal_level"));
    }

    #[test]
    fn test_every_sensitive_setting_has_a_label() {
        let params = parse_enforced_parameters(OUTPUT);
        for setting in HOT_STANDBY_SENSITIVE_SETTINGS {
            assert!(params.contains_key(setting), "{setting} missing");
        }
    }

    #[tokio::test]
    async fn test_enforced_parameters_run_untranslated() {
        use std::os::unix::fs::PermissionsExt;

        let bin = tempfile::TempDir::new().unwrap();
        let tool = bin.path().join("pg_controldata");
        // answers in German unless forced into the C locale
        std::fs::write(
            &tool,
            "#!/bin/sh\n\
             if [ \"$LC_ALL\" = C ]; then\n\
             echo 'max_connections setting:              100'\n\
             else\n\
             echo 'max_connections-Einstellung:          100'\n\
             fi\n",
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let binaries = PgBinaries::new(Some(bin.path().to_path_buf()));
        let params = enforced_parameters(&binaries, bin.path()).await.unwrap();
        assert_eq!(params.get("max_connections").map(String::as_str), Some("100"));
    }
}
