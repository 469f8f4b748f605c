// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status probe of the live PostgreSQL instance.
//!
//! Every call opens a fresh connection, asks the server for its role and
//! replication state, and closes the connection again. Nothing is cached
//! between calls; any failing query aborts the whole probe.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgConnection};
use tracing::{debug, warn};

use crate::conninfo::STREAMING_REPLICATION_USER;
use crate::controldata;
use crate::error::Result;
use crate::instance::Instance;
use crate::lsn::{self, Lsn};
use crate::pgdata;

/// One row of `pg_stat_replication` for a fleet member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationInfo {
    /// Name the follower connected with
    pub application_name: String,
    /// WAL sender state (`streaming`, `catchup`, ...)
    pub state: String,
    /// Last WAL position sent
    pub sent_lsn: Option<Lsn>,
    /// Last WAL position written by the follower
    pub write_lsn: Option<Lsn>,
    /// Last WAL position flushed by the follower
    pub flush_lsn: Option<Lsn>,
    /// Last WAL position replayed by the follower
    pub replay_lsn: Option<Lsn>,
    /// Write lag in seconds
    pub write_lag_secs: f64,
    /// Flush lag in seconds
    pub flush_lag_secs: f64,
    /// Replay lag in seconds
    pub replay_lag_secs: f64,
    /// `async`, `potential`, `sync` or `quorum`
    pub sync_state: String,
    /// Priority for synchronous standby selection
    pub sync_priority: i32,
}

/// Point-in-time status of the instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// Pod the snapshot was taken on
    pub pod_name: String,
    /// Database system identifier
    pub system_id: String,
    /// Whether the server is out of recovery
    pub is_primary: bool,
    /// Whether a restart is needed to apply settings
    pub pending_restart: bool,
    /// The pending restart is caused by a decreased hot-standby-sensitive setting
    pub pending_restart_for_decrease: bool,
    /// Size of all databases, human readable
    pub total_instance_size: String,
    /// A pg_rewind is repairing the data directory; nothing else was queried
    pub is_pg_rewind_running: bool,

    /// Current WAL insert position (primary)
    pub current_lsn: Option<Lsn>,
    /// Current WAL segment name (primary)
    pub current_wal: String,
    /// Timeline of the last checkpoint (primary)
    pub timeline_id: Option<i32>,
    /// Last segment archived (primary)
    pub last_archived_wal: String,
    /// When the last segment was archived (primary)
    pub last_archived_wal_time: Option<DateTime<Utc>>,
    /// Last segment that failed to archive (primary)
    pub last_failed_wal: String,
    /// When archiving last failed (primary)
    pub last_failed_wal_time: Option<DateTime<Utc>>,
    /// Last archive success is newer than the last failure (primary)
    pub is_archiving_wal: bool,

    /// Last WAL position received (replica)
    pub received_lsn: Option<Lsn>,
    /// Last WAL position replayed (replica)
    pub replay_lsn: Option<Lsn>,
    /// Replay is paused (replica)
    pub replay_paused: bool,
    /// A WAL receiver process is streaming (replica)
    pub is_wal_receiver_active: bool,

    /// Followers streaming from this instance
    pub replication_info: Vec<ReplicationInfo>,
    /// WAL segments waiting to be archived
    pub ready_wal_files: usize,
}

/// Report `replayed` as the received position when the two independent
/// reads came back out of order.
pub fn clamp_received(received: Option<Lsn>, replayed: Option<Lsn>) -> Option<Lsn> {
    match (received, replayed) {
        (Some(received), Some(replayed)) if received < replayed => Some(replayed),
        _ => received,
    }
}

/// Whether every decreased setting already carries its new value in the
/// control data.
pub fn all_decreased_settings_applied(
    decreased: &HashMap<String, String>,
    enforced: &HashMap<String, String>,
) -> bool {
    decreased
        .iter()
        .all(|(setting, value)| enforced.get(setting) == Some(value))
}

const DECREASED_SETTINGS_QUERY: &str = r#"
    SELECT name, setting
    FROM (
        SELECT name, setting, rank() OVER (PARTITION BY name ORDER BY seqno DESC) AS rank
        FROM pg_file_settings
        WHERE name = ANY($1) AND NOT applied
    ) a
    WHERE CAST(current_setting(name) AS INTEGER) > CAST(setting AS INTEGER) AND rank = 1
"#;

/// Hot-standby-sensitive settings whose not-yet-applied file value is lower
/// than the running one, with their new value.
async fn decreased_sensitive_settings(conn: &mut PgConnection) -> Result<HashMap<String, String>> {
    let settings: Vec<String> = controldata::HOT_STANDBY_SENSITIVE_SETTINGS
        .iter()
        .map(|s| s.to_string())
        .collect();
    let rows: Vec<(String, String)> = sqlx::query_as(DECREASED_SETTINGS_QUERY)
        .bind(&settings)
        .fetch_all(conn)
        .await?;
    Ok(rows.into_iter().collect())
}

async fn fill_from_primary(conn: &mut PgConnection, snapshot: &mut StatusSnapshot) -> Result<()> {
    let row: (
        String,
        Option<DateTime<Utc>>,
        String,
        Option<DateTime<Utc>>,
        bool,
        String,
        String,
        i32,
    ) = sqlx::query_as(
        r#"
        SELECT
            COALESCE(last_archived_wal, ''),
            last_archived_time,
            COALESCE(last_failed_wal, ''),
            last_failed_time,
            COALESCE(last_archived_time, '-infinity') > COALESCE(last_failed_time, '-infinity'),
            pg_walfile_name(pg_current_wal_lsn()),
            pg_current_wal_lsn()::text,
            (SELECT timeline_id FROM pg_control_checkpoint())
        FROM pg_catalog.pg_stat_archiver
        "#,
    )
    .fetch_one(conn)
    .await?;

    snapshot.last_archived_wal = row.0;
    snapshot.last_archived_wal_time = row.1;
    snapshot.last_failed_wal = row.2;
    snapshot.last_failed_wal_time = row.3;
    snapshot.is_archiving_wal = row.4;
    snapshot.current_wal = row.5;
    snapshot.current_lsn = lsn::parse_optional(&row.6)?;
    snapshot.timeline_id = Some(row.7);
    Ok(())
}

async fn fill_from_replica(conn: &mut PgConnection, snapshot: &mut StatusSnapshot) -> Result<()> {
    // pg_last_wal_receive_lsn is NULL on replicas fed only from the archive
    let (received, replayed, paused): (String, String, bool) = sqlx::query_as(
        r#"
        SELECT
            COALESCE(pg_last_wal_receive_lsn()::text, ''),
            COALESCE(pg_last_wal_replay_lsn()::text, ''),
            pg_is_wal_replay_paused()
        "#,
    )
    .fetch_one(&mut *conn)
    .await?;

    let received = lsn::parse_optional(&received)?;
    let replayed = lsn::parse_optional(&replayed)?;
    snapshot.received_lsn = clamp_received(received, replayed);
    snapshot.replay_lsn = replayed;
    snapshot.replay_paused = paused;

    let (active,): (bool,) = sqlx::query_as("SELECT COUNT(*) > 0 FROM pg_stat_wal_receiver")
        .fetch_one(conn)
        .await?;
    snapshot.is_wal_receiver_active = active;
    Ok(())
}

type ReplicationRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    f64,
    f64,
    f64,
    String,
    i32,
);

async fn fill_wal_status(
    instance: &Instance,
    conn: &mut PgConnection,
    snapshot: &mut StatusSnapshot,
) -> Result<()> {
    let rows: Vec<ReplicationRow> = sqlx::query_as(
        r#"
        SELECT
            application_name,
            COALESCE(state, ''),
            COALESCE(sent_lsn::text, ''),
            COALESCE(write_lsn::text, ''),
            COALESCE(flush_lsn::text, ''),
            COALESCE(replay_lsn::text, ''),
            EXTRACT(EPOCH FROM COALESCE(write_lag, '0'::interval))::float8,
            EXTRACT(EPOCH FROM COALESCE(flush_lag, '0'::interval))::float8,
            EXTRACT(EPOCH FROM COALESCE(replay_lag, '0'::interval))::float8,
            COALESCE(sync_state, ''),
            COALESCE(sync_priority, 0)
        FROM pg_catalog.pg_stat_replication
        WHERE application_name LIKE $1 AND usename = $2
        "#,
    )
    .bind(format!("{}-%", instance.cluster_name))
    .bind(STREAMING_REPLICATION_USER)
    .fetch_all(conn)
    .await?;

    snapshot.replication_info = rows
        .into_iter()
        .map(|row| -> Result<ReplicationInfo> {
            Ok(ReplicationInfo {
                application_name: row.0,
                state: row.1,
                sent_lsn: lsn::parse_optional(&row.2)?,
                write_lsn: lsn::parse_optional(&row.3)?,
                flush_lsn: lsn::parse_optional(&row.4)?,
                replay_lsn: lsn::parse_optional(&row.5)?,
                write_lag_secs: row.6,
                flush_lag_secs: row.7,
                replay_lag_secs: row.8,
                sync_state: row.9,
                sync_priority: row.10,
            })
        })
        .collect::<Result<_>>()?;

    let (ready, _done) = pgdata::wal_archive_counters(&instance.pgdata).await?;
    snapshot.ready_wal_files = ready;
    Ok(())
}

/// Probe the instance and return its current status.
pub async fn probe(instance: &Instance) -> Result<StatusSnapshot> {
    let mut snapshot = StatusSnapshot {
        pod_name: instance.pod_name.clone(),
        ..Default::default()
    };

    if instance.is_pg_rewind_running() {
        debug!(pod_name = %instance.pod_name, "pg_rewind running, skipping status queries");
        snapshot.is_pg_rewind_running = true;
        return Ok(snapshot);
    }

    let mut conn = instance.connect().await?;
    let result = probe_with(instance, &mut conn, &mut snapshot).await;
    if let Err(e) = conn.close().await {
        warn!(pod_name = %instance.pod_name, error = %e, "Failed to close status connection");
    }
    result.map(|_| snapshot)
}

async fn probe_with(
    instance: &Instance,
    conn: &mut PgConnection,
    snapshot: &mut StatusSnapshot,
) -> Result<()> {
    let (system_id, is_primary, pending_restart, size): (i64, bool, bool, Option<String>) =
        sqlx::query_as(
            r#"
            SELECT
                (pg_control_system()).system_identifier,
                NOT pg_is_in_recovery(),
                EXISTS(SELECT 1 FROM pg_settings WHERE pending_restart),
                (SELECT pg_size_pretty(SUM(pg_database_size(oid))) FROM pg_database)
            "#,
        )
        .fetch_one(&mut *conn)
        .await?;

    snapshot.system_id = system_id.to_string();
    snapshot.is_primary = is_primary;
    snapshot.pending_restart = pending_restart;
    snapshot.total_instance_size = size.unwrap_or_default();

    if snapshot.pending_restart {
        let decreased = decreased_sensitive_settings(conn).await?;
        if !decreased.is_empty() {
            snapshot.pending_restart_for_decrease = true;
            // a replica may only restart once the lower values reached its control file
            if !snapshot.is_primary {
                let enforced =
                    controldata::enforced_parameters(instance.binaries(), &instance.pgdata).await?;
                snapshot.pending_restart = all_decreased_settings_applied(&decreased, &enforced);
            }
        }
    }

    if snapshot.is_primary {
        fill_from_primary(conn, snapshot).await?;
    } else {
        fill_from_replica(conn, snapshot).await?;
    }
    fill_wal_status(instance, conn, snapshot).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_clamp_received() {
        let low = Some(Lsn::new(0x10));
        let high = Some(Lsn::new(0x20));
        assert_eq!(clamp_received(low, high), high);
        assert_eq!(clamp_received(high, low), high);
        assert_eq!(clamp_received(None, high), None);
        assert_eq!(clamp_received(high, None), high);
    }

    #[test]
    fn test_pending_restart_masked_until_control_data_matches() {
        let decreased = map(&[("max_connections", "50")]);

        let stale = map(&[("max_connections", "100"), ("max_wal_senders", "10")]);
        assert!(!all_decreased_settings_applied(&decreased, &stale));

        let fresh = map(&[("max_connections", "50"), ("max_wal_senders", "10")]);
        assert!(all_decreased_settings_applied(&decreased, &fresh));
    }

    #[test]
    fn test_all_settings_must_match() {
        let decreased = map(&[("max_connections", "50"), ("max_worker_processes", "4")]);
        let partial = map(&[("max_connections", "50"), ("max_worker_processes", "8")]);
        assert!(!all_decreased_settings_applied(&decreased, &partial));
        assert!(all_decreased_settings_applied(&HashMap::new(), &partial));
    }

    #[tokio::test]
    async fn test_probe_short_circuits_while_rewinding() {
        let instance = Instance::new("/nonexistent", "pg-2", "pg");
        instance.set_pg_rewind_running(true);

        let snapshot = probe(&instance).await.unwrap();
        assert!(snapshot.is_pg_rewind_running);
        assert_eq!(snapshot.pod_name, "pg-2");
        assert!(!snapshot.is_primary);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let snapshot = StatusSnapshot {
            pod_name: "pg-1".to_string(),
            is_primary: true,
            current_lsn: Some(Lsn::new(0x1_0000_0060)),
            ..Default::default()
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["podName"], "pg-1");
        assert_eq!(json["isPrimary"], true);
        assert_eq!(json["currentLsn"], "1/60");
    }
}
