//! Identity swaps for columns, indexes and foreign keys.
//!
//! Each swap is three renames through a temporary name
//! (`a -> temp`, `b -> a`, `temp -> b`). A failure halfway leaves the objects
//! renamed, so run swaps inside `with_lock_retries` (or a transaction) to
//! make them atomic.

use tracing::info;

use super::TableRef;
use crate::core::catalog;
use crate::core::identifier::{qualify, quote_ident, temp_index_name, TEMP_RENAME_NAME};
use crate::error::{MigrateError, Result};
use crate::migration::MigrationContext;

/// Statements swapping the names of two columns.
pub fn swap_columns_sql(quoted_table: &str, column1: &str, column2: &str) -> Result<Vec<String>> {
    let (c1, c2, temp) = (quote_ident(column1)?, quote_ident(column2)?, quote_ident(TEMP_RENAME_NAME)?);
    Ok(vec![
        format!("ALTER TABLE {} RENAME COLUMN {} TO {}", quoted_table, c1, temp),
        format!("ALTER TABLE {} RENAME COLUMN {} TO {}", quoted_table, c2, c1),
        format!("ALTER TABLE {} RENAME COLUMN {} TO {}", quoted_table, temp, c2),
    ])
}

/// Swap the names of two columns of `table`.
pub async fn swap_columns(ctx: &mut MigrationContext, table: &str, column1: &str, column2: &str) -> Result<()> {
    ensure_distinct("column", column1, column2)?;
    let target = TableRef::resolve(ctx, table)?;
    info!("Swapping columns {} and {} on {}", column1, column2, target.table);
    for sql in swap_columns_sql(&target.quoted, column1, column2)? {
        ctx.execute(&sql).await?;
    }
    Ok(())
}

/// Swap the defaults of two columns of `table`.
pub async fn swap_columns_default(ctx: &mut MigrationContext, table: &str, column1: &str, column2: &str) -> Result<()> {
    let target = TableRef::resolve(ctx, table)?;
    let first = catalog::require_column(ctx.connection(), &target.schema, target.name(), column1).await?;
    let second = catalog::require_column(ctx.connection(), &target.schema, target.name(), column2).await?;

    for (column, default) in [(column1, &second.default_expr), (column2, &first.default_expr)] {
        let action = match default {
            Some(expr) => format!("SET DEFAULT {}", expr),
            None => "DROP DEFAULT".to_string(),
        };
        ctx.execute(&format!(
            "ALTER TABLE {} ALTER COLUMN {} {}",
            target.quoted,
            quote_ident(column)?,
            action
        ))
        .await?;
    }
    Ok(())
}

/// Swap the names of two foreign keys of `table`.
pub async fn swap_foreign_keys(ctx: &mut MigrationContext, table: &str, fk1: &str, fk2: &str) -> Result<()> {
    ensure_distinct("foreign key", fk1, fk2)?;
    let target = TableRef::resolve(ctx, table)?;
    let (a, b, temp) = (quote_ident(fk1)?, quote_ident(fk2)?, quote_ident(TEMP_RENAME_NAME)?);
    info!("Swapping foreign keys {} and {} on {}", fk1, fk2, target.table);
    for (from, to) in [(&a, &temp), (&b, &a), (&temp, &b)] {
        ctx.execute(&format!("ALTER TABLE {} RENAME CONSTRAINT {} TO {}", target.quoted, from, to))
            .await?;
    }
    Ok(())
}

/// Statements swapping the names of two indexes living in `schema`.
pub fn swap_indexes_sql(schema: &str, table: &str, index1: &str, index2: &str) -> Result<Vec<String>> {
    let temp = temp_index_name(table, index1);
    let rename = |from: &str, to: &str| -> Result<String> {
        Ok(format!("ALTER INDEX {} RENAME TO {}", qualify(schema, from)?, quote_ident(to)?))
    };
    Ok(vec![rename(index1, &temp)?, rename(index2, index1)?, rename(&temp, index2)?])
}

/// Swap the names of two indexes of `table`.
///
/// The indexes live in `schema` when given, otherwise in the table's schema
/// (`schema.table`), otherwise in the default schema.
pub async fn swap_indexes(
    ctx: &mut MigrationContext,
    table: &str,
    index1: &str,
    index2: &str,
    schema: Option<&str>,
) -> Result<()> {
    ensure_distinct("index", index1, index2)?;
    let target = TableRef::resolve(ctx, table)?;
    let schema = schema.unwrap_or(&target.schema).to_string();
    info!("Swapping indexes {} and {} in schema {}", index1, index2, schema);
    for sql in swap_indexes_sql(&schema, target.name(), index1, index2)? {
        ctx.execute(&sql).await?;
    }
    Ok(())
}

/// Force PostgreSQL to re-plan a trigger function, e.g. after the columns
/// it references were swapped.
pub async fn reset_trigger_function(ctx: &mut MigrationContext, function_name: &str) -> Result<()> {
    ctx.execute(&format!("ALTER FUNCTION {} RESET ALL", quote_ident(function_name)?))
        .await
}

/// Reset the functions of every user trigger on `table`.
pub async fn reset_all_trigger_functions(ctx: &mut MigrationContext, table: &str) -> Result<usize> {
    let target = TableRef::resolve(ctx, table)?;
    let triggers = catalog::triggers(ctx.connection(), &target.schema, target.name()).await?;
    let mut functions: Vec<String> = triggers.into_iter().map(|t| t.function_name).collect();
    functions.sort();
    functions.dedup();
    for function in &functions {
        reset_trigger_function(ctx, function).await?;
    }
    Ok(functions.len())
}

/// Reject swapping an object with itself.
pub(crate) fn ensure_distinct(kind: &str, first: &str, second: &str) -> Result<()> {
    if first == second {
        return Err(MigrateError::usage(format!("Cannot swap {} '{}' with itself", kind, first)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::Record;
    use crate::migration::MigrationSettings;
    use crate::testing::FakeConnection;

    fn context(conn: &FakeConnection) -> MigrationContext {
        MigrationContext::new(Box::new(conn.clone()), MigrationSettings::default())
    }

    /// Apply column renames to a list of names.
    fn apply_renames(mut columns: Vec<String>, statements: &[String]) -> Vec<String> {
        for sql in statements {
            let parts: Vec<&str> = sql.split(" RENAME COLUMN ").collect();
            let (from, to) = parts[1].split_once(" TO ").unwrap();
            let (from, to) = (from.trim_matches('"'), to.trim_matches('"'));
            for column in columns.iter_mut() {
                if column.as_str() == from {
                    *column = to.to_string();
                }
            }
        }
        columns
    }

    #[test]
    fn test_swap_columns_twice_restores_identity() {
        let original = vec!["id".to_string(), "id_convert_to_bigint".to_string()];
        let statements = swap_columns_sql("\"events\"", "id", "id_convert_to_bigint").unwrap();

        let swapped = apply_renames(original.clone(), &statements);
        assert_eq!(swapped, vec!["id_convert_to_bigint", "id"]);
        assert_eq!(apply_renames(swapped, &statements), original);
    }

    #[test]
    fn test_swap_indexes_sql_uses_temp_name() {
        let statements = swap_indexes_sql("gitlab_partitions_dynamic", "events", "index_a", "index_b").unwrap();
        let temp = temp_index_name("events", "index_a");
        assert!(temp.starts_with("temp_") && temp.len() == "temp_".len() + 10);
        assert_eq!(
            statements,
            vec![
                format!("ALTER INDEX \"gitlab_partitions_dynamic\".\"index_a\" RENAME TO \"{}\"", temp),
                "ALTER INDEX \"gitlab_partitions_dynamic\".\"index_b\" RENAME TO \"index_a\"".to_string(),
                format!("ALTER INDEX \"gitlab_partitions_dynamic\".\"{}\" RENAME TO \"index_b\"", temp),
            ]
        );
    }

    #[tokio::test]
    async fn test_swap_indexes_infers_schema_from_table() {
        let conn = FakeConnection::new();
        let mut ctx = context(&conn);
        swap_indexes(&mut ctx, "archive.events", "index_a", "index_b", None).await.unwrap();
        swap_indexes(&mut ctx, "events", "index_a", "index_b", None).await.unwrap();
        swap_indexes(&mut ctx, "events", "index_a", "index_b", Some("other")).await.unwrap();

        let statements = conn.statements();
        assert!(statements[0].starts_with("ALTER INDEX \"archive\".\"index_a\""));
        assert!(statements[3].starts_with("ALTER INDEX \"public\".\"index_a\""));
        assert!(statements[6].starts_with("ALTER INDEX \"other\".\"index_a\""));
    }

    #[tokio::test]
    async fn test_swap_columns_default() {
        let conn = FakeConnection::new();
        conn.respond(
            "pg_attribute",
            vec![
                Record::from_pairs(&[("name", Some("id")), ("data_type", Some("integer")), ("nullable", Some("false")), ("default_expr", Some("nextval('events_id_seq'::regclass)"))]),
                Record::from_pairs(&[("name", Some("id_convert_to_bigint")), ("data_type", Some("bigint")), ("nullable", Some("false")), ("default_expr", None)]),
            ],
        );
        let mut ctx = context(&conn);

        swap_columns_default(&mut ctx, "events", "id", "id_convert_to_bigint").await.unwrap();
        assert_eq!(
            conn.statements_matching("ALTER TABLE"),
            vec![
                "ALTER TABLE \"events\" ALTER COLUMN \"id\" DROP DEFAULT",
                "ALTER TABLE \"events\" ALTER COLUMN \"id_convert_to_bigint\" SET DEFAULT nextval('events_id_seq'::regclass)",
            ]
        );
    }

    #[tokio::test]
    async fn test_swap_foreign_keys_and_reset_functions() {
        let conn = FakeConnection::new();
        conn.respond(
            "pg_trigger",
            vec![
                Record::from_pairs(&[("name", Some("t1")), ("function_name", Some("function_for_t1"))]),
                Record::from_pairs(&[("name", Some("t2")), ("function_name", Some("function_for_t1"))]),
            ],
        );
        let mut ctx = context(&conn);

        swap_foreign_keys(&mut ctx, "events", "fk_a", "fk_b").await.unwrap();
        assert_eq!(conn.statements_matching("RENAME CONSTRAINT").len(), 3);
        assert!(conn.statements_matching("RENAME CONSTRAINT")[1].contains("\"fk_b\" TO \"fk_a\""));

        assert_eq!(reset_all_trigger_functions(&mut ctx, "events").await.unwrap(), 1);
        assert_eq!(
            conn.statements_matching("RESET ALL"),
            vec!["ALTER FUNCTION \"function_for_t1\" RESET ALL"]
        );
    }

    #[test]
    fn test_ensure_distinct() {
        assert!(ensure_distinct("column", "a", "b").is_ok());
        assert!(ensure_distinct("column", "a", "a").is_err());
    }
}
