//! Zero-downtime column renames.
//!
//! A rename happens across two releases:
//!
//! 1. `rename_column_concurrently` adds the new column with the same type,
//!    default and nullability, keeps both columns in sync with bidirectional
//!    triggers, backfills existing rows and copies indexes and foreign keys.
//! 2. Once no code reads the old column, `cleanup_concurrent_column_rename`
//!    drops the triggers and the old column.
//!
//! Both steps have an undo counterpart for rollbacks.

use tracing::info;

use super::foreign_keys::{add_concurrent_foreign_key, ForeignKeyOptions};
use super::{bigint, indexes, require_no_transaction, triggers, TableRef};
use crate::core::catalog;
use crate::core::identifier::{hashed_name, quote_ident, MAX_IDENTIFIER_LENGTH};
use crate::core::schema::{ColumnInfo, IndexDefinition};
use crate::error::{MigrateError, Result};
use crate::migration::MigrationContext;

/// Start renaming `old_column` to `new_column` on `table`.
pub async fn rename_column_concurrently(
    ctx: &mut MigrationContext,
    table: &str,
    old_column: &str,
    new_column: &str,
) -> Result<()> {
    require_no_transaction(ctx, "rename_column_concurrently")?;
    setup_renamed_column(ctx, table, old_column, new_column, (old_column, new_column)).await
}

/// Revert [`rename_column_concurrently`]: drop the triggers and the new column.
pub async fn undo_rename_column_concurrently(
    ctx: &mut MigrationContext,
    table: &str,
    old_column: &str,
    new_column: &str,
) -> Result<()> {
    require_no_transaction(ctx, "undo_rename_column_concurrently")?;
    drop_renamed_column(ctx, table, old_column, new_column, new_column).await
}

/// Finish a rename: drop the triggers and the old column.
pub async fn cleanup_concurrent_column_rename(
    ctx: &mut MigrationContext,
    table: &str,
    old_column: &str,
    new_column: &str,
) -> Result<()> {
    require_no_transaction(ctx, "cleanup_concurrent_column_rename")?;
    drop_renamed_column(ctx, table, old_column, new_column, old_column).await
}

/// Revert [`cleanup_concurrent_column_rename`]: re-create the old column from
/// the new one and restore the triggers.
pub async fn undo_cleanup_concurrent_column_rename(
    ctx: &mut MigrationContext,
    table: &str,
    old_column: &str,
    new_column: &str,
) -> Result<()> {
    require_no_transaction(ctx, "undo_cleanup_concurrent_column_rename")?;
    setup_renamed_column(ctx, table, new_column, old_column, (old_column, new_column)).await
}

/// Add `target` as a copy of `source`. Triggers are always named after the
/// original `(old, new)` pair so the cleanup step finds them.
async fn setup_renamed_column(
    ctx: &mut MigrationContext,
    table: &str,
    source: &str,
    target: &str,
    trigger_pair: (&str, &str),
) -> Result<()> {
    let table_ref = TableRef::resolve(ctx, table)?;
    let source_info = catalog::require_column(ctx.connection(), &table_ref.schema, table_ref.name(), source).await?;
    if catalog::column_exists(ctx.connection(), &table_ref.schema, table_ref.name(), target).await? {
        return Err(MigrateError::usage(format!(
            "Column {} already exists on {}",
            target, table_ref.table
        )));
    }

    info!("Copying {}.{} into new column {}", table_ref.table, source, target);
    let add_column = add_column_sql(&table_ref.quoted, &source_info, target)?;
    let (table_arg, old, new) = (table.to_string(), trigger_pair.0.to_string(), trigger_pair.1.to_string());
    ctx.with_lock_retries(move |ctx| {
        let (add_column, table, old, new) = (add_column.clone(), table_arg.clone(), old.clone(), new.clone());
        Box::pin(async move {
            ctx.execute(&add_column).await?;
            triggers::install_bidirectional_triggers(ctx, &table, &old, &new).await
        })
    })
    .await?;

    backfill(ctx, &table_ref, source, target).await?;

    if !source_info.is_nullable {
        ctx.execute_with_lock_retries(vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
            table_ref.quoted,
            quote_ident(target)?
        )])
        .await?;
    }

    copy_indexes(ctx, table, &table_ref, source, target).await?;
    copy_foreign_keys(ctx, table, &table_ref, source, target).await
}

async fn drop_renamed_column(
    ctx: &mut MigrationContext,
    table: &str,
    old_column: &str,
    new_column: &str,
    dropped: &str,
) -> Result<()> {
    let table_ref = TableRef::resolve(ctx, table)?;
    let drop_sql = format!(
        "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
        table_ref.quoted,
        quote_ident(dropped)?
    );
    info!("Dropping column {} of {}", dropped, table_ref.table);
    let (table, old, new) = (table.to_string(), old_column.to_string(), new_column.to_string());
    ctx.with_lock_retries(move |ctx| {
        let (drop_sql, table, old, new) = (drop_sql.clone(), table.clone(), old.clone(), new.clone());
        Box::pin(async move {
            triggers::remove_bidirectional_triggers(ctx, &table, &old, &new).await?;
            ctx.execute(&drop_sql).await
        })
    })
    .await
}

fn add_column_sql(quoted_table: &str, source: &ColumnInfo, target: &str) -> Result<String> {
    let mut sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quoted_table,
        quote_ident(target)?,
        source.data_type
    );
    if let Some(default) = &source.default_expr {
        sql.push_str(&format!(" DEFAULT {}", default));
    }
    Ok(sql)
}

/// Copy `source` into `target` in `id` ranges of `backfill_batch_size` rows.
async fn backfill(ctx: &mut MigrationContext, table: &TableRef, source: &str, target: &str) -> Result<()> {
    ctx.suppress_schema_restriction(true);
    let result = backfill_batches(ctx, table, source, target).await;
    ctx.suppress_schema_restriction(false);
    result
}

async fn backfill_batches(ctx: &mut MigrationContext, table: &TableRef, source: &str, target: &str) -> Result<()> {
    let batch_size = ctx.settings().backfill_batch_size.max(1);
    let update = format!(
        "UPDATE {} SET {} = {}",
        table.quoted,
        quote_ident(target)?,
        quote_ident(source)?
    );

    let mut start = match ctx.select_value(&format!("SELECT min(id)::text FROM {}", table.quoted), &[]).await? {
        Some(value) => parse_id(&value)?,
        None => return Ok(()),
    };
    let mut batches = 0usize;
    loop {
        let stop = ctx
            .select_value(
                &format!(
                    "SELECT id::text FROM {} WHERE id >= {} ORDER BY id OFFSET {} LIMIT 1",
                    table.quoted, start, batch_size
                ),
                &[],
            )
            .await?
            .map(|v| parse_id(&v))
            .transpose()?;
        batches += 1;
        match stop {
            Some(stop) => {
                ctx.execute(&format!("{} WHERE id >= {} AND id < {}", update, start, stop)).await?;
                start = stop;
            }
            None => {
                ctx.execute(&format!("{} WHERE id >= {}", update, start)).await?;
                break;
            }
        }
    }
    info!("Backfilled {}.{} in {} batch(es)", table.table, target, batches);
    Ok(())
}

fn parse_id(value: &str) -> Result<i64> {
    value
        .parse()
        .map_err(|_| MigrateError::usage(format!("Batched backfill needs an integer id column, got '{}'", value)))
}

/// Name of an index copied from `source` to `target`.
pub fn copied_index_name(index_name: &str, source: &str, target: &str) -> String {
    let name = if index_name.contains(source) {
        index_name.replacen(source, target, 1)
    } else {
        format!("{}_{}", index_name, target)
    };
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return hashed_name("idx_copy_", &name, 20);
    }
    name
}

fn copied_index(index: &IndexDefinition, source: &str, target: &str) -> IndexDefinition {
    let mut copy = bigint::bigint_index_definition(index, source, target);
    copy.name = copied_index_name(&index.name, source, target);
    copy
}

async fn copy_indexes(
    ctx: &mut MigrationContext,
    table: &str,
    table_ref: &TableRef,
    source: &str,
    target: &str,
) -> Result<()> {
    let sources = catalog::indexes_for(ctx.connection(), &table_ref.schema, table_ref.name(), source).await?;
    for index in &sources {
        indexes::add_concurrent_index(ctx, table, &copied_index(index, source, target)).await?;
    }
    Ok(())
}

async fn copy_foreign_keys(
    ctx: &mut MigrationContext,
    table: &str,
    table_ref: &TableRef,
    source: &str,
    target: &str,
) -> Result<()> {
    let keys = catalog::foreign_keys_for(ctx.connection(), &table_ref.schema, table_ref.name(), source).await?;
    for fk in keys {
        let options = ForeignKeyOptions {
            name: None,
            target_column: fk.primary_key,
            on_delete: fk.on_delete,
            validate: true,
        };
        add_concurrent_foreign_key(ctx, table, &fk.to_table, target, &options).await?;
    }
    Ok(())
}
