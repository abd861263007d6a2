//! Configuration type definitions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::GitlabSchema;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Target database connection.
    pub database: DatabaseConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// gitlab_schema layout.
    #[serde(default)]
    pub schemas: SchemasConfig,
}

/// PostgreSQL connection configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Physical database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password. Never written back out.
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Default PostgreSQL schema for unqualified tables (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode: disable, require, verify-ca, verify-full (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,

    /// Logical database name used for gitlab_schema resolution (default: "main").
    #[serde(default = "default_logical_name")]
    pub name: String,

    /// Maximum pooled connections (default: 2).
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("name", &self.name)
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

/// One tier of the lock-retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingEntry {
    /// `lock_timeout` for the attempt, in milliseconds.
    pub lock_timeout_ms: u64,

    /// Sleep after a failed attempt, in milliseconds.
    pub sleep_ms: u64,
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Lock-retry timing tiers. The built-in production table is used if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_retry_timings: Option<Vec<TimingEntry>>,

    /// Run lock-retry blocks once without a lock timeout.
    #[serde(default)]
    pub disable_lock_retries: bool,

    /// Do not install write-lock triggers on tables of foreign schemas.
    #[serde(default)]
    pub skip_automatic_lock_on_writes: bool,

    /// Skip the anti-wraparound autovacuum check.
    #[serde(default)]
    pub disable_wraparound_check: bool,

    /// Rows per batch when backfilling renamed columns (default: 10000).
    #[serde(default = "default_batch_size")]
    pub backfill_batch_size: usize,

    /// Ledger table recording applied versions (default: "schema_migrations").
    #[serde(default = "default_migrations_table")]
    pub migrations_table: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            lock_retry_timings: None,
            disable_lock_retries: false,
            skip_automatic_lock_on_writes: false,
            disable_wraparound_check: false,
            backfill_batch_size: default_batch_size(),
            migrations_table: default_migrations_table(),
        }
    }
}

/// gitlab_schema layout: which schemas each logical database serves, and
/// which schema each table belongs to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemasConfig {
    /// Logical database -> served schemas. Replaces the built-in entry per key.
    #[serde(default)]
    pub databases: BTreeMap<String, Vec<GitlabSchema>>,

    /// Table -> owning schema.
    #[serde(default)]
    pub tables: BTreeMap<String, GitlabSchema>,
}

// Default value functions for serde
fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_logical_name() -> String {
    "main".to_string()
}

fn default_pool_size() -> usize {
    2
}

fn default_batch_size() -> usize {
    10_000
}

fn default_migrations_table() -> String {
    "schema_migrations".to_string()
}
