//! Catalog introspection queries.
//!
//! All lookups go through `pg_catalog` with text parameters and cast their
//! output columns to `text`, so they work over any [`Connection`].

use crate::core::connection::Connection;
use crate::core::schema::{
    parse_index_definition, referential_action, ColumnInfo, ForeignKeyInfo, IndexDefinition,
    TriggerInfo,
};
use crate::error::{MigrateError, Result};

const COLUMNS_SQL: &str = "\
SELECT a.attname::text AS name,
       format_type(a.atttypid, a.atttypmod)::text AS data_type,
       (NOT a.attnotnull)::text AS nullable,
       pg_get_expr(d.adbin, d.adrelid)::text AS default_expr
FROM pg_attribute a
JOIN pg_class c ON c.oid = a.attrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped
ORDER BY a.attnum";

const INDEXES_SQL: &str = "\
SELECT i.relname::text AS name,
       pg_get_indexdef(ix.indexrelid)::text AS definition,
       pg_get_expr(ix.indpred, ix.indrelid)::text AS predicate,
       obj_description(i.oid, 'pg_class')::text AS comment
FROM pg_index ix
JOIN pg_class i ON i.oid = ix.indexrelid
JOIN pg_class t ON t.oid = ix.indrelid
JOIN pg_namespace n ON n.oid = t.relnamespace
WHERE n.nspname = $1 AND t.relname = $2 AND NOT ix.indisprimary
ORDER BY i.relname";

const INDEX_EXISTS_SQL: &str = "\
SELECT 1
FROM pg_class i
JOIN pg_namespace n ON n.oid = i.relnamespace
WHERE i.relkind IN ('i', 'I') AND n.nspname = $1 AND i.relname = $2";

const FOREIGN_KEYS_SQL: &str = "\
SELECT con.conname::text AS name,
       att.attname::text AS column_name,
       ref.relname::text AS to_table,
       refatt.attname::text AS primary_key,
       con.confdeltype::text AS on_delete
FROM pg_constraint con
JOIN pg_class c ON c.oid = con.conrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
JOIN pg_class ref ON ref.oid = con.confrelid
JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = con.conkey[1]
JOIN pg_attribute refatt ON refatt.attrelid = con.confrelid AND refatt.attnum = con.confkey[1]
WHERE con.contype = 'f' AND n.nspname = $1 AND c.relname = $2
  AND array_length(con.conkey, 1) = 1
ORDER BY con.conname";

const TRIGGERS_SQL: &str = "\
SELECT t.tgname::text AS name, p.proname::text AS function_name
FROM pg_trigger t
JOIN pg_class c ON c.oid = t.tgrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
JOIN pg_proc p ON p.oid = t.tgfoid
WHERE n.nspname = $1 AND c.relname = $2 AND NOT t.tgisinternal
ORDER BY t.tgname";

const FUNCTION_EXISTS_SQL: &str = "SELECT 1 FROM pg_proc WHERE proname = $1";

const TABLES_SQL: &str = "\
SELECT c.relname::text AS name
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1 AND c.relkind IN ('r', 'p')
ORDER BY c.relname";

/// All columns of a table in ordinal order.
pub async fn columns(conn: &mut dyn Connection, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
    let rows = conn.query(COLUMNS_SQL, &[schema, table]).await?;
    rows.iter()
        .map(|row| {
            Ok(ColumnInfo {
                name: row.require("name")?.to_string(),
                data_type: row.require("data_type")?.to_string(),
                is_nullable: row.get_bool("nullable"),
                default_expr: row.get("default_expr").map(str::to_string),
            })
        })
        .collect()
}

/// A single column, if it exists.
pub async fn column(
    conn: &mut dyn Connection,
    schema: &str,
    table: &str,
    column: &str,
) -> Result<Option<ColumnInfo>> {
    Ok(columns(conn, schema, table)
        .await?
        .into_iter()
        .find(|c| c.name == column))
}

/// Whether `table.column` exists.
pub async fn column_exists(
    conn: &mut dyn Connection,
    schema: &str,
    table: &str,
    column_name: &str,
) -> Result<bool> {
    Ok(column(conn, schema, table, column_name).await?.is_some())
}

/// A column that must exist, else [`MigrateError::MissingColumn`].
pub async fn require_column(
    conn: &mut dyn Connection,
    schema: &str,
    table: &str,
    column_name: &str,
) -> Result<ColumnInfo> {
    column(conn, schema, table, column_name)
        .await?
        .ok_or_else(|| MigrateError::MissingColumn {
            table: table.to_string(),
            column: column_name.to_string(),
        })
}

/// Non-primary-key indexes of a table.
pub async fn indexes(conn: &mut dyn Connection, schema: &str, table: &str) -> Result<Vec<IndexDefinition>> {
    let rows = conn.query(INDEXES_SQL, &[schema, table]).await?;
    let mut result = Vec::with_capacity(rows.len());
    for row in &rows {
        let name = row.require("name")?;
        let definition = row.require("definition")?;
        match parse_index_definition(table, name, definition, row.get("predicate"), row.get("comment")) {
            Some(index) => result.push(index),
            None => tracing::warn!("Skipping index {} with unrecognised definition: {}", name, definition),
        }
    }
    Ok(result)
}

/// Indexes whose key references `column` as a whole word.
pub async fn indexes_for(
    conn: &mut dyn Connection,
    schema: &str,
    table: &str,
    column: &str,
) -> Result<Vec<IndexDefinition>> {
    Ok(indexes(conn, schema, table)
        .await?
        .into_iter()
        .filter(|idx| idx.columns.references(column))
        .collect())
}

/// Whether an index with this name exists in `schema`.
pub async fn index_exists_by_name(conn: &mut dyn Connection, schema: &str, name: &str) -> Result<bool> {
    Ok(!conn.query(INDEX_EXISTS_SQL, &[schema, name]).await?.is_empty())
}

/// Single-column foreign keys defined on a table.
pub async fn foreign_keys(conn: &mut dyn Connection, schema: &str, table: &str) -> Result<Vec<ForeignKeyInfo>> {
    let rows = conn.query(FOREIGN_KEYS_SQL, &[schema, table]).await?;
    rows.iter()
        .map(|row| {
            Ok(ForeignKeyInfo {
                name: row.require("name")?.to_string(),
                from_table: table.to_string(),
                column: row.require("column_name")?.to_string(),
                to_table: row.require("to_table")?.to_string(),
                primary_key: row.require("primary_key")?.to_string(),
                on_delete: referential_action(row.get("on_delete").unwrap_or("a")).to_string(),
            })
        })
        .collect()
}

/// Foreign keys whose source column is `column`.
pub async fn foreign_keys_for(
    conn: &mut dyn Connection,
    schema: &str,
    table: &str,
    column: &str,
) -> Result<Vec<ForeignKeyInfo>> {
    Ok(foreign_keys(conn, schema, table)
        .await?
        .into_iter()
        .filter(|fk| fk.column == column)
        .collect())
}

/// User-defined triggers on a table.
pub async fn triggers(conn: &mut dyn Connection, schema: &str, table: &str) -> Result<Vec<TriggerInfo>> {
    let rows = conn.query(TRIGGERS_SQL, &[schema, table]).await?;
    rows.iter()
        .map(|row| {
            Ok(TriggerInfo {
                name: row.require("name")?.to_string(),
                function_name: row.require("function_name")?.to_string(),
            })
        })
        .collect()
}

/// Whether a trigger with this name exists on the table.
pub async fn trigger_exists(conn: &mut dyn Connection, schema: &str, table: &str, name: &str) -> Result<bool> {
    Ok(triggers(conn, schema, table).await?.iter().any(|t| t.name == name))
}

/// Whether any function with this name exists.
pub async fn function_exists(conn: &mut dyn Connection, name: &str) -> Result<bool> {
    Ok(!conn.query(FUNCTION_EXISTS_SQL, &[name]).await?.is_empty())
}

/// Ordinary and partitioned tables in a schema.
pub async fn table_names(conn: &mut dyn Connection, schema: &str) -> Result<Vec<String>> {
    let rows = conn.query(TABLES_SQL, &[schema]).await?;
    Ok(rows.iter().filter_map(|r| r.first().map(str::to_string)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::Record;
    use crate::core::schema::IndexColumns;
    use crate::testing::FakeConnection;

    #[tokio::test]
    async fn test_indexes_for_filters_by_word() {
        let mut conn = FakeConnection::new();
        conn.respond(
            "pg_get_indexdef",
            vec![
                Record::from_pairs(&[
                    ("name", Some("index_events_on_project_id")),
                    ("definition", Some("CREATE INDEX index_events_on_project_id ON public.events USING btree (project_id)")),
                ]),
                Record::from_pairs(&[
                    ("name", Some("index_events_on_id_and_state")),
                    ("definition", Some("CREATE INDEX index_events_on_id_and_state ON public.events USING btree (id, state)")),
                ]),
            ],
        );

        let found = indexes_for(&mut conn, "public", "events", "id").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "index_events_on_id_and_state");
        assert_eq!(
            found[0].columns,
            IndexColumns::Names(vec!["id".into(), "state".into()])
        );
    }

    #[tokio::test]
    async fn test_require_column_reports_missing() {
        let mut conn = FakeConnection::new();
        conn.respond(
            "pg_attribute",
            vec![Record::from_pairs(&[
                ("name", Some("id")),
                ("data_type", Some("integer")),
                ("nullable", Some("false")),
            ])],
        );

        let id = require_column(&mut conn, "public", "events", "id").await.unwrap();
        assert!(!id.is_nullable);
        let err = require_column(&mut conn, "public", "events", "id_convert_to_bigint")
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::MissingColumn { .. }));
    }

    #[tokio::test]
    async fn test_foreign_keys_for_maps_actions() {
        let mut conn = FakeConnection::new();
        conn.respond(
            "pg_constraint",
            vec![Record::from_pairs(&[
                ("name", Some("fk_rails_1")),
                ("column_name", Some("project_id")),
                ("to_table", Some("projects")),
                ("primary_key", Some("id")),
                ("on_delete", Some("c")),
            ])],
        );
        let fks = foreign_keys_for(&mut conn, "public", "issues", "project_id").await.unwrap();
        assert_eq!(fks.len(), 1);
        assert_eq!(fks[0].on_delete, "CASCADE");
        assert_eq!(fks[0].from_table, "issues");
    }
}
