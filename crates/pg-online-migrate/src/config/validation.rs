//! Configuration validation.

use super::Config;
use crate::core::identifier::validate_identifier;
use crate::drivers::SslMode;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    let db = &config.database;
    if db.host.is_empty() {
        return Err(MigrateError::Config("database.host is required".into()));
    }
    if db.database.is_empty() {
        return Err(MigrateError::Config("database.database is required".into()));
    }
    if db.user.is_empty() {
        return Err(MigrateError::Config("database.user is required".into()));
    }
    if db.name.is_empty() {
        return Err(MigrateError::Config("database.name is required".into()));
    }
    if db.pool_size == 0 {
        return Err(MigrateError::Config(
            "database.pool_size must be at least 1".into(),
        ));
    }
    validate_identifier(&db.schema)?;
    SslMode::parse(&db.ssl_mode)?;

    let migration = &config.migration;
    if let Some(timings) = &migration.lock_retry_timings {
        if timings.is_empty() {
            return Err(MigrateError::Config(
                "migration.lock_retry_timings must contain at least one entry".into(),
            ));
        }
        if let Some(pos) = timings.iter().position(|t| t.lock_timeout_ms == 0) {
            return Err(MigrateError::Config(format!(
                "migration.lock_retry_timings[{}].lock_timeout_ms must be greater than 0",
                pos
            )));
        }
    }
    if migration.backfill_batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.backfill_batch_size must be at least 1".into(),
        ));
    }
    validate_identifier(&migration.migrations_table)?;

    for (database, schemas) in &config.schemas.databases {
        if schemas.is_empty() {
            return Err(MigrateError::Config(format!(
                "schemas.databases.{} must list at least one gitlab_schema",
                database
            )));
        }
    }

    Ok(())
}
