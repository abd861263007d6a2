//! Column synchronisation triggers.
//!
//! Two flavours keep columns in step while application code moves from one
//! to the other:
//!
//! - Bidirectional triggers (column renames): an insert trigger fills
//!   whichever column was left at its default from the other one, and two
//!   update triggers mirror every write of one column into its twin.
//! - Copy triggers (bigint conversion, legacy renames): a single
//!   `BEFORE INSERT OR UPDATE` trigger copying a list of columns one way.
//!
//! All trigger and function names are derived from the table and column
//! names, so removal recomputes them instead of looking them up.

use tracing::info;

use super::TableRef;
use crate::core::catalog;
use crate::core::identifier::{
    bidirectional_trigger_names, function_name_for_trigger, quote_ident, rename_trigger_name,
};
use crate::core::schema::ColumnInfo;
use crate::error::{MigrateError, Result};
use crate::migration::MigrationContext;

fn create_function_sql(function: &str, body: &str) -> Result<String> {
    Ok(format!(
        "CREATE OR REPLACE FUNCTION {}()\nRETURNS TRIGGER AS\n$$\nBEGIN\n{}  RETURN NEW;\nEND\n$$ LANGUAGE PLPGSQL",
        quote_ident(function)?,
        body
    ))
}

fn create_trigger_sql(trigger: &str, timing: &str, table: &str, function: &str) -> Result<Vec<String>> {
    let trigger = quote_ident(trigger)?;
    Ok(vec![
        format!("DROP TRIGGER IF EXISTS {} ON {}", trigger, table),
        format!(
            "CREATE TRIGGER {}\n{} ON {}\nFOR EACH ROW\nEXECUTE FUNCTION {}()",
            trigger,
            timing,
            table,
            quote_ident(function)?
        ),
    ])
}

fn drop_trigger_sql(trigger: &str, table: &str) -> Result<Vec<String>> {
    Ok(vec![
        format!("DROP TRIGGER IF EXISTS {} ON {}", quote_ident(trigger)?, table),
        format!(
            "DROP FUNCTION IF EXISTS {}()",
            quote_ident(&function_name_for_trigger(trigger))?
        ),
    ])
}

/// Statements installing the insert, update-old and update-new triggers.
///
/// The insert trigger compares each column with its own default using
/// `IS NOT DISTINCT FROM`, so NULL defaults need no special case.
pub fn bidirectional_trigger_sql(
    table: &str,
    quoted_table: &str,
    old: &ColumnInfo,
    new: &ColumnInfo,
) -> Result<Vec<String>> {
    let [insert, update_old, update_new] = bidirectional_trigger_names(table, &old.name, &new.name);
    let old_col = quote_ident(&old.name)?;
    let new_col = quote_ident(&new.name)?;
    let old_default = old.quoted_default();
    let new_default = new.quoted_default();

    let insert_body = format!(
        "  IF NEW.{old} IS NOT DISTINCT FROM {old_default} AND NEW.{new} IS DISTINCT FROM {new_default} THEN\n    NEW.{old} := NEW.{new};\n  END IF;\n\n  IF NEW.{new} IS NOT DISTINCT FROM {new_default} AND NEW.{old} IS DISTINCT FROM {old_default} THEN\n    NEW.{new} := NEW.{old};\n  END IF;\n\n",
        old = old_col,
        new = new_col,
        old_default = old_default,
        new_default = new_default,
    );

    let mut statements = vec![create_function_sql(&function_name_for_trigger(&insert), &insert_body)?];
    statements.extend(create_trigger_sql(
        &insert,
        "BEFORE INSERT",
        quoted_table,
        &function_name_for_trigger(&insert),
    )?);

    for (trigger, from, to) in [(&update_old, &old_col, &new_col), (&update_new, &new_col, &old_col)] {
        let function = function_name_for_trigger(trigger);
        statements.push(create_function_sql(&function, &format!("  NEW.{} := NEW.{};\n", to, from))?);
        statements.extend(create_trigger_sql(
            trigger,
            &format!("BEFORE UPDATE OF {}", from),
            quoted_table,
            &function,
        )?);
    }
    Ok(statements)
}

/// Install triggers keeping `old_column` and `new_column` of `table` in sync.
///
/// Both columns must exist. Run this inside lock retries: creating a trigger
/// takes a `SHARE ROW EXCLUSIVE` lock on the table.
pub async fn install_bidirectional_triggers(
    ctx: &mut MigrationContext,
    table: &str,
    old_column: &str,
    new_column: &str,
) -> Result<()> {
    let target = TableRef::resolve(ctx, table)?;
    let old = catalog::require_column(ctx.connection(), &target.schema, target.name(), old_column).await?;
    let new = catalog::require_column(ctx.connection(), &target.schema, target.name(), new_column).await?;

    info!(
        "Installing bidirectional triggers on {} for {} <-> {}",
        target.table, old_column, new_column
    );
    for sql in bidirectional_trigger_sql(target.name(), &target.quoted, &old, &new)? {
        ctx.execute(&sql).await?;
    }
    Ok(())
}

/// Drop the triggers and functions created by [`install_bidirectional_triggers`].
pub async fn remove_bidirectional_triggers(
    ctx: &mut MigrationContext,
    table: &str,
    old_column: &str,
    new_column: &str,
) -> Result<()> {
    let target = TableRef::resolve(ctx, table)?;
    for trigger in bidirectional_trigger_names(target.name(), old_column, new_column) {
        for sql in drop_trigger_sql(&trigger, &target.quoted)? {
            ctx.execute(&sql).await?;
        }
    }
    Ok(())
}

/// Name of the copy trigger for `from -> to` column lists.
pub fn copy_trigger_name(table: &str, from: &[&str], to: &[&str]) -> String {
    rename_trigger_name(table, &from.join("_"), &to.join("_"))
}

/// Statements installing a trigger that copies `from[i]` into `to[i]` on
/// every insert and update.
pub fn copy_trigger_sql(table: &str, quoted_table: &str, from: &[&str], to: &[&str]) -> Result<Vec<String>> {
    if from.is_empty() || from.len() != to.len() {
        return Err(MigrateError::usage(format!(
            "Copy trigger on {} needs the same number of source and target columns ({} vs {})",
            table,
            from.len(),
            to.len()
        )));
    }

    let trigger = copy_trigger_name(table, from, to);
    let function = function_name_for_trigger(&trigger);
    let mut body = String::new();
    for (source, target) in from.iter().zip(to) {
        body.push_str(&format!("  NEW.{} := NEW.{};\n", quote_ident(target)?, quote_ident(source)?));
    }

    let mut statements = vec![create_function_sql(&function, &body)?];
    statements.extend(create_trigger_sql(&trigger, "BEFORE INSERT OR UPDATE", quoted_table, &function)?);
    Ok(statements)
}

/// Install a one-way copy trigger.
pub async fn install_copy_trigger(ctx: &mut MigrationContext, table: &str, from: &[&str], to: &[&str]) -> Result<()> {
    let target = TableRef::resolve(ctx, table)?;
    for sql in copy_trigger_sql(target.name(), &target.quoted, from, to)? {
        ctx.execute(&sql).await?;
    }
    Ok(())
}

pub async fn remove_copy_trigger(ctx: &mut MigrationContext, table: &str, from: &[&str], to: &[&str]) -> Result<()> {
    let target = TableRef::resolve(ctx, table)?;
    for sql in drop_trigger_sql(&copy_trigger_name(target.name(), from, to), &target.quoted)? {
        ctx.execute(&sql).await?;
    }
    Ok(())
}

/// Install a trigger copying `old_column` into `new_column`.
pub async fn install_rename_triggers(
    ctx: &mut MigrationContext,
    table: &str,
    old_column: &str,
    new_column: &str,
) -> Result<()> {
    install_copy_trigger(ctx, table, &[old_column], &[new_column]).await
}

pub async fn remove_rename_triggers(
    ctx: &mut MigrationContext,
    table: &str,
    old_column: &str,
    new_column: &str,
) -> Result<()> {
    remove_copy_trigger(ctx, table, &[old_column], &[new_column]).await
}
