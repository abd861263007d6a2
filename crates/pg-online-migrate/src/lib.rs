//! # pg-online-migrate
//!
//! Zero-downtime schema migrations for PostgreSQL.
//!
//! This library runs versioned migrations against a live database with:
//!
//! - **Lock retries** that take DDL locks with short `lock_timeout`s and back off
//! - **A lock-acquisition monitor** rejecting transactional migrations that
//!   lock several tables in separate statements
//! - **gitlab_schema restrictions** for multi-database deployments
//! - **Online helpers** for column renames, bigint conversions, concurrent
//!   indexes and foreign keys, and column/index/foreign-key swaps
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use pg_online_migrate::{
//!     Config, Migration, MigrationContext, MigrationRunner, MigrationSettings, PgPool, SqlFileMigration,
//! };
//!
//! #[tokio::main]
//! async fn main() -> pg_online_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let pool = PgPool::connect(&config.database).await?;
//!     let mut ctx = MigrationContext::new(
//!         Box::new(pool.connection().await?),
//!         MigrationSettings::from_config(&config),
//!     );
//!     let migrations: Vec<Arc<dyn Migration>> = SqlFileMigration::load_dir(Path::new("db/migrate"))?
//!         .into_iter()
//!         .map(|m| Arc::new(m) as Arc<dyn Migration>)
//!         .collect();
//!     let summary = MigrationRunner::new(config.schema_registry())
//!         .migrate(&mut ctx, &migrations)
//!         .await?;
//!     println!("Applied {} migrations", summary.applied);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod helpers;
pub mod locking;
pub mod migration;
pub mod schema;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenient access
pub use config::{Config, DatabaseConfig, MigrationConfig};
pub use core::{Connection, Record};
pub use drivers::{PgConnection, PgPool, SslMode};
pub use error::{MigrateError, Result};
pub use locking::{LockMonitor, TimingConfiguration, WithLockRetries};
pub use migration::{
    Migration, MigrationContext, MigrationOutcome, MigrationRunner, MigrationSettings, RunSummary,
    SqlFileMigration,
};
pub use schema::{GitlabSchema, SchemaRegistry};
