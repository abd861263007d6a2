//! Foreign keys added without blocking writes.
//!
//! The constraint is first added `NOT VALID` (a short lock, taken under lock
//! retries), then validated in a separate statement that only needs a
//! `SHARE UPDATE EXCLUSIVE` lock while it scans the table.

use tracing::{info, warn};

use super::{require_no_transaction, without_statement_timeout, TableRef};
use crate::core::catalog;
use crate::core::identifier::{concurrent_foreign_key_name, quote_ident};
use crate::error::{MigrateError, Result};
use crate::migration::MigrationContext;

const ON_DELETE_ACTIONS: [&str; 5] = ["CASCADE", "SET NULL", "RESTRICT", "SET DEFAULT", "NO ACTION"];

/// Options for [`add_concurrent_foreign_key`].
#[derive(Debug, Clone)]
pub struct ForeignKeyOptions {
    /// Constraint name, derived from table and column when `None`.
    pub name: Option<String>,
    /// Referenced column.
    pub target_column: String,
    pub on_delete: String,
    /// Validate existing rows after adding the constraint.
    pub validate: bool,
}

impl Default for ForeignKeyOptions {
    fn default() -> Self {
        Self {
            name: None,
            target_column: "id".to_string(),
            on_delete: "CASCADE".to_string(),
            validate: true,
        }
    }
}

/// Add a foreign key from `source.column` to `target`. Returns the constraint
/// name.
pub async fn add_concurrent_foreign_key(
    ctx: &mut MigrationContext,
    source: &str,
    target: &str,
    column: &str,
    options: &ForeignKeyOptions,
) -> Result<String> {
    require_no_transaction(ctx, "add_concurrent_foreign_key")?;

    let on_delete = options.on_delete.to_ascii_uppercase();
    if !ON_DELETE_ACTIONS.contains(&on_delete.as_str()) {
        return Err(MigrateError::usage(format!(
            "Unsupported on_delete action '{}', expected one of {}",
            options.on_delete,
            ON_DELETE_ACTIONS.join(", ")
        )));
    }

    let from = TableRef::resolve(ctx, source)?;
    let to = TableRef::resolve(ctx, target)?;
    let name = options
        .name
        .clone()
        .unwrap_or_else(|| concurrent_foreign_key_name(from.name(), column));
    let quoted_name = quote_ident(&name)?;

    let existing = catalog::foreign_keys(ctx.connection(), &from.schema, from.name()).await?;
    if existing.iter().any(|fk| fk.name == name) {
        warn!(
            "Foreign key not created because it exists already (this may be due to an aborted migration or similar): source: {}, target: {}, column: {}, name: {}",
            from.table, to.table, column, name
        );
    } else {
        info!("Adding foreign key {} on {}.{} -> {}", name, from.table, column, to.table);
        ctx.execute_with_lock_retries(vec![format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} NOT VALID",
            from.quoted,
            quoted_name,
            quote_ident(column)?,
            to.quoted,
            quote_ident(&options.target_column)?,
            on_delete
        )])
        .await?;
    }

    if options.validate {
        without_statement_timeout(
            ctx,
            &[format!("ALTER TABLE {} VALIDATE CONSTRAINT {}", from.quoted, quoted_name)],
        )
        .await?;
    }
    Ok(name)
}
