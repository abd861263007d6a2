//! Integer to bigint conversion.
//!
//! The conversion adds a `<column>_convert_to_bigint` shadow column kept in
//! sync by a copy trigger. Once the shadow column is backfilled, every index
//! on the integer column is mirrored onto it before the columns are swapped.

use tracing::info;

use super::{indexes, triggers, TableRef};
use crate::core::catalog;
use crate::core::identifier::{bigint_index_name, convert_to_bigint_column, quote_ident, quote_literal};
use crate::core::schema::{substitute_word, IndexDefinition};
use crate::error::{MigrateError, Result};
use crate::migration::MigrationContext;

/// The definition of `index` rewritten from `int_column` to `bigint_column`.
///
/// Column lists, the partial-index predicate and per-column order/opclass
/// settings are rewritten by whole word; the name is a hash of the original
/// index name.
pub fn bigint_index_definition(index: &IndexDefinition, int_column: &str, bigint_column: &str) -> IndexDefinition {
    IndexDefinition {
        table: index.table.clone(),
        name: bigint_index_name(&index.name),
        columns: index.columns.substitute(int_column, bigint_column),
        unique: index.unique,
        order: index.order.as_ref().map(|o| o.rename_column(int_column, bigint_column)),
        opclass: index.opclass.as_ref().map(|o| o.rename_column(int_column, bigint_column)),
        where_clause: index
            .where_clause
            .as_ref()
            .map(|w| substitute_word(w, int_column, bigint_column)),
        index_type: index.index_type.clone(),
        using: index.using.clone(),
        include: index
            .include
            .iter()
            .map(|c| if c == int_column { bigint_column.to_string() } else { c.clone() })
            .collect(),
        comment: index.comment.clone(),
    }
}

/// Create the bigint twin of one index concurrently.
pub async fn create_bigint_index(
    ctx: &mut MigrationContext,
    table: &str,
    index: &IndexDefinition,
    int_column: &str,
    bigint_column: &str,
) -> Result<IndexDefinition> {
    let mirrored = bigint_index_definition(index, int_column, bigint_column);
    indexes::add_concurrent_index(ctx, table, &mirrored).await?;
    Ok(mirrored)
}

/// Mirror every index referencing `int_column` onto its bigint shadow column.
///
/// Fails with [`MigrateError::MissingColumn`] when the shadow column does not
/// exist. Returns the names of the mirrored indexes.
pub async fn add_bigint_column_indexes(ctx: &mut MigrationContext, table: &str, int_column: &str) -> Result<Vec<String>> {
    let target = TableRef::resolve(ctx, table)?;
    let bigint_column = convert_to_bigint_column(int_column);
    catalog::require_column(ctx.connection(), &target.schema, target.name(), &bigint_column).await?;

    let sources = catalog::indexes_for(ctx.connection(), &target.schema, target.name(), int_column).await?;
    info!(
        "Mirroring {} index(es) of {}.{} onto {}",
        sources.len(),
        target.table,
        int_column,
        bigint_column
    );

    let mut created = Vec::with_capacity(sources.len());
    for index in &sources {
        let mirrored = create_bigint_index(ctx, table, index, int_column, &bigint_column).await?;
        created.push(mirrored.name);
    }
    Ok(created)
}

/// Add `<column>_convert_to_bigint` shadow columns and the trigger copying
/// each column into its shadow.
///
/// A shadow column keeps the original default and gets `NOT NULL DEFAULT 0`
/// when the original is `NOT NULL`, so inserts succeed before the trigger
/// has ever run on old rows.
pub async fn initialize_conversion_of_integer_to_bigint(
    ctx: &mut MigrationContext,
    table: &str,
    columns: &[&str],
) -> Result<()> {
    let target = TableRef::resolve(ctx, table)?;
    if columns.is_empty() {
        return Err(MigrateError::usage(format!("No columns given to convert on {}", target.table)));
    }

    let all_columns = catalog::columns(ctx.connection(), &target.schema, target.name()).await?;
    let mut shadows = Vec::with_capacity(columns.len());
    let mut statements = Vec::with_capacity(columns.len());

    for column in columns {
        let info = all_columns
            .iter()
            .find(|c| c.name == *column)
            .ok_or_else(|| MigrateError::MissingColumn {
                table: target.table.to_string(),
                column: column.to_string(),
            })?;
        let shadow = convert_to_bigint_column(column);

        let mut definition = format!("ADD COLUMN IF NOT EXISTS {} bigint", quote_ident(&shadow)?);
        if !info.is_nullable {
            let default = info.default_value().unwrap_or_else(|| "0".to_string());
            definition.push_str(&format!(" DEFAULT {} NOT NULL", quote_literal(Some(&default))));
        } else if let Some(default) = info.default_value() {
            definition.push_str(&format!(" DEFAULT {}", quote_literal(Some(&default))));
        }
        statements.push(format!("ALTER TABLE {} {}", target.quoted, definition));
        shadows.push(shadow);
    }

    info!("Initializing bigint conversion of {} on {}", columns.join(", "), target.table);
    for sql in &statements {
        ctx.execute(sql).await?;
    }
    let shadow_refs: Vec<&str> = shadows.iter().map(String::as_str).collect();
    triggers::install_copy_trigger(ctx, table, columns, &shadow_refs).await
}

/// Drop the copy trigger and the shadow columns.
pub async fn revert_initialize_conversion_of_integer_to_bigint(
    ctx: &mut MigrationContext,
    table: &str,
    columns: &[&str],
) -> Result<()> {
    let target = TableRef::resolve(ctx, table)?;
    let shadows: Vec<String> = columns.iter().map(|c| convert_to_bigint_column(c)).collect();
    let shadow_refs: Vec<&str> = shadows.iter().map(String::as_str).collect();

    triggers::remove_copy_trigger(ctx, table, columns, &shadow_refs).await?;
    for shadow in &shadows {
        ctx.execute(&format!(
            "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
            target.quoted,
            quote_ident(shadow)?
        ))
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::connection::Record;
    use crate::core::schema::{IndexColumns, PerColumnOption};
    use crate::migration::MigrationSettings;
    use crate::testing::FakeConnection;

    fn context(conn: &FakeConnection) -> MigrationContext {
        MigrationContext::new(Box::new(conn.clone()), MigrationSettings::default())
    }

    #[test]
    fn test_partial_index_is_rewritten() {
        let mut index = IndexDefinition::new("events", "idx_on_int_col", &["int_col"]);
        index.where_clause = Some("int_col > 0".to_string());

        let mirrored = bigint_index_definition(&index, "int_col", "bigint_col");
        assert_eq!(mirrored.columns, IndexColumns::Names(vec!["bigint_col".to_string()]));
        assert_eq!(mirrored.where_clause.as_deref(), Some("bigint_col > 0"));
        assert_eq!(mirrored.name, bigint_index_name("idx_on_int_col"));
        assert!(mirrored.name.starts_with("bigint_idx_"));
        assert_eq!(mirrored.name.len(), "bigint_idx_".len() + 20);

        // independent of the table
        let mut other = index.clone();
        other.table = "other_events".to_string();
        assert_eq!(bigint_index_definition(&other, "int_col", "bigint_col").name, mirrored.name);
    }

    #[test]
    fn test_per_column_order_follows_the_column() {
        let mut index = IndexDefinition::new("events", "idx", &["project_id", "id"]);
        index.order = Some(PerColumnOption::PerColumn(BTreeMap::from([
            ("id".to_string(), "DESC".to_string()),
            ("project_id".to_string(), "ASC".to_string()),
        ])));

        let mirrored = bigint_index_definition(&index, "id", "id_convert_to_bigint");
        assert_eq!(
            mirrored.columns,
            IndexColumns::Names(vec!["project_id".to_string(), "id_convert_to_bigint".to_string()])
        );
        assert_eq!(
            mirrored.order,
            Some(PerColumnOption::PerColumn(BTreeMap::from([
                ("id_convert_to_bigint".to_string(), "DESC".to_string()),
                ("project_id".to_string(), "ASC".to_string()),
            ])))
        );
    }

    #[tokio::test]
    async fn test_missing_shadow_column_fails_fast() {
        let conn = FakeConnection::new();
        conn.respond(
            "pg_attribute",
            vec![Record::from_pairs(&[("name", Some("id")), ("data_type", Some("integer")), ("nullable", Some("false"))])],
        );
        let mut ctx = context(&conn);

        let err = add_bigint_column_indexes(&mut ctx, "events", "id").await.unwrap_err();
        assert!(matches!(err, MigrateError::MissingColumn { ref column, .. } if column == "id_convert_to_bigint"));
        assert!(conn.statements_matching("pg_get_indexdef").is_empty());
    }

    #[tokio::test]
    async fn test_add_bigint_column_indexes() {
        let conn = FakeConnection::new();
        conn.respond(
            "pg_attribute",
            vec![Record::from_pairs(&[
                ("name", Some("id_convert_to_bigint")),
                ("data_type", Some("bigint")),
                ("nullable", Some("false")),
            ])],
        );
        conn.respond(
            "pg_get_indexdef",
            vec![
                Record::from_pairs(&[
                    ("name", Some("index_events_on_id_where_positive")),
                    ("definition", Some("CREATE INDEX index_events_on_id_where_positive ON public.events USING btree (id DESC) WHERE (id > 0)")),
                    ("predicate", Some("(id > 0)")),
                ]),
                Record::from_pairs(&[
                    ("name", Some("index_events_on_identifier")),
                    ("definition", Some("CREATE INDEX index_events_on_identifier ON public.events USING btree (identifier)")),
                ]),
            ],
        );
        let mut ctx = context(&conn);

        let created = add_bigint_column_indexes(&mut ctx, "events", "id").await.unwrap();
        assert_eq!(created, vec![bigint_index_name("index_events_on_id_where_positive")]);

        let create = conn.statements_matching("CREATE INDEX CONCURRENTLY");
        assert_eq!(create.len(), 1);
        assert!(create[0].contains("USING btree (\"id_convert_to_bigint\" DESC) WHERE (id_convert_to_bigint > 0)"));
    }

    #[tokio::test]
    async fn test_initialize_and_revert_conversion() {
        let conn = FakeConnection::new();
        conn.respond(
            "pg_attribute",
            vec![
                Record::from_pairs(&[("name", Some("id")), ("data_type", Some("integer")), ("nullable", Some("false")), ("default_expr", Some("nextval('events_id_seq'::regclass)"))]),
                Record::from_pairs(&[("name", Some("project_id")), ("data_type", Some("integer")), ("nullable", Some("true"))]),
            ],
        );
        let mut ctx = context(&conn);

        initialize_conversion_of_integer_to_bigint(&mut ctx, "events", &["id", "project_id"]).await.unwrap();
        let added = conn.statements_matching("ADD COLUMN");
        assert_eq!(
            added,
            vec![
                "ALTER TABLE \"events\" ADD COLUMN IF NOT EXISTS \"id_convert_to_bigint\" bigint DEFAULT '0' NOT NULL",
                "ALTER TABLE \"events\" ADD COLUMN IF NOT EXISTS \"project_id_convert_to_bigint\" bigint",
            ]
        );
        assert_eq!(conn.statements_matching("BEFORE INSERT OR UPDATE").len(), 1);

        revert_initialize_conversion_of_integer_to_bigint(&mut ctx, "events", &["id", "project_id"]).await.unwrap();
        assert_eq!(conn.statements_matching("DROP COLUMN IF EXISTS").len(), 2);
        assert_eq!(conn.statements_matching("DROP FUNCTION IF EXISTS").len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_requires_columns() {
        let conn = FakeConnection::new();
        let mut ctx = context(&conn);
        let err = initialize_conversion_of_integer_to_bigint(&mut ctx, "events", &["id"]).await.unwrap_err();
        assert!(matches!(err, MigrateError::MissingColumn { .. }));
    }
}
