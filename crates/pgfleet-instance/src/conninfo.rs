// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Streaming replication connection descriptors.

use std::fmt;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgSslMode};

/// Role used by replicas to stream WAL from the primary.
pub const STREAMING_REPLICATION_USER: &str = "streaming_replica";

/// Port every fleet member listens on.
pub const POSTGRES_PORT: u16 = 5432;

/// Client key presented by replicas.
pub const STREAMING_REPLICA_KEY_LOCATION: &str = "/controller/certificates/streaming_replica.key";

/// Client certificate presented by replicas.
pub const STREAMING_REPLICA_CERTIFICATE_LOCATION: &str =
    "/controller/certificates/streaming_replica.crt";

/// CA used to verify the primary's server certificate.
pub const CA_CERTIFICATE_LOCATION: &str = "/controller/certificates/client-ca.crt";

/// Connection descriptor a replica uses to reach its primary.
///
/// Rendered with [`fmt::Display`] as a libpq key/value string, suitable for
/// `primary_conninfo` and for `pg_basebackup -d`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryConnInfo {
    /// Host name of the primary
    pub host: String,
    /// Port of the primary
    pub port: u16,
    /// Replication role
    pub user: String,
    /// Name reported in `pg_stat_replication.application_name`
    pub application_name: String,
    /// Client key path
    pub sslkey: String,
    /// Client certificate path
    pub sslcert: String,
    /// CA certificate path
    pub sslrootcert: String,
    /// Database to connect to (only needed for non-replication sessions)
    pub dbname: Option<String>,
    /// Connection timeout
    pub connect_timeout: Option<Duration>,
}

impl PrimaryConnInfo {
    /// Build the descriptor `application_name` uses to reach `primary_host`.
    pub fn new(primary_host: impl Into<String>, application_name: impl Into<String>) -> Self {
        Self {
            host: primary_host.into(),
            port: POSTGRES_PORT,
            user: STREAMING_REPLICATION_USER.to_string(),
            application_name: application_name.into(),
            sslkey: STREAMING_REPLICA_KEY_LOCATION.to_string(),
            sslcert: STREAMING_REPLICA_CERTIFICATE_LOCATION.to_string(),
            sslrootcert: CA_CERTIFICATE_LOCATION.to_string(),
            dbname: None,
            connect_timeout: None,
        }
    }

    /// Add a database name.
    pub fn with_dbname(mut self, dbname: impl Into<String>) -> Self {
        self.dbname = Some(dbname.into());
        self
    }

    /// Add a connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Options for connecting to the same server through sqlx.
    pub fn to_connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(self.dbname.as_deref().unwrap_or("postgres"))
            .application_name(&self.application_name)
            .ssl_mode(PgSslMode::Require)
            .ssl_root_cert(&self.sslrootcert)
            .ssl_client_cert(&self.sslcert)
            .ssl_client_key(&self.sslkey)
    }
}

/// Quote a libpq connection string value when it needs it.
fn quote_conninfo_value(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\'', '\\']) {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

impl fmt::Display for PrimaryConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host={} user={} port={} sslkey={} sslcert={} sslrootcert={} application_name={} \
             sslmode=require keepalives_idle=5 keepalives_interval=2 keepalives_count=5",
            quote_conninfo_value(&self.host),
            quote_conninfo_value(&self.user),
            self.port,
            quote_conninfo_value(&self.sslkey),
            quote_conninfo_value(&self.sslcert),
            quote_conninfo_value(&self.sslrootcert),
            quote_conninfo_value(&self.application_name),
        )?;
        if let Some(dbname) = &self.dbname {
            write!(f, " dbname={}", quote_conninfo_value(dbname))?;
        }
        if let Some(timeout) = self.connect_timeout {
            write!(f, " connect_timeout={}", timeout.as_secs().max(1))?;
        }
        Ok(())
    }
}

/// Build the `primary_conninfo` string `application_name` uses to follow `primary_host`.
pub fn build_primary_conninfo(primary_host: &str, application_name: &str) -> String {
    PrimaryConnInfo::new(primary_host, application_name).to_string()
}
