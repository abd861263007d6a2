//! Zero-downtime schema change helpers.
//!
//! Every helper takes the [`MigrationContext`] of the running migration and
//! table arguments as `table` or `schema.table`. Unqualified tables resolve
//! through the session's `search_path` for DDL and through the configured
//! default schema for catalog lookups.

pub mod bigint;
pub mod foreign_keys;
pub mod indexes;
pub mod lock_writes;
pub mod rename;
pub mod settings;
pub mod swapping;
pub mod triggers;
pub mod wraparound;

use crate::core::identifier::QualifiedTable;
use crate::error::{MigrateError, Result};
use crate::migration::MigrationContext;

/// A table argument resolved for catalog lookups and DDL.
#[derive(Debug, Clone)]
pub(crate) struct TableRef {
    pub table: QualifiedTable,
    /// Schema used for catalog lookups.
    pub schema: String,
    /// Quoted (possibly schema-qualified) name for DDL.
    pub quoted: String,
}

impl TableRef {
    pub fn resolve(ctx: &MigrationContext, table: &str) -> Result<Self> {
        let table = QualifiedTable::parse(table);
        let schema = table.schema_or(ctx.default_schema()).to_string();
        let quoted = table.quoted()?;
        Ok(Self { table, schema, quoted })
    }

    pub fn name(&self) -> &str {
        &self.table.name
    }
}

/// Fail when a helper that manages its own transactions is called inside one.
pub(crate) fn require_no_transaction(ctx: &MigrationContext, helper: &str) -> Result<()> {
    if ctx.transaction_open() {
        return Err(MigrateError::usage(format!(
            "{} can not be run inside a transaction, \
             you can disable transactions by calling disable_ddl_transaction \
             in the body of your migration class",
            helper
        )));
    }
    Ok(())
}

/// Run `statements` with `statement_timeout` disabled for the session,
/// resetting it afterwards even when a statement fails.
pub(crate) async fn without_statement_timeout(ctx: &mut MigrationContext, statements: &[String]) -> Result<()> {
    ctx.execute("SET statement_timeout TO 0").await?;
    let mut result = Ok(());
    for sql in statements {
        result = ctx.execute(sql).await;
        if result.is_err() {
            break;
        }
    }
    let reset = ctx.execute("RESET statement_timeout").await;
    result?;
    reset
}
