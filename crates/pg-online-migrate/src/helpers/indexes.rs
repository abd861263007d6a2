//! Concurrent index creation and removal.

use tracing::{info, warn};

use super::{require_no_transaction, without_statement_timeout, wraparound, TableRef};
use crate::core::catalog;
use crate::core::identifier::quote_ident;
use crate::core::schema::IndexDefinition;
use crate::error::Result;
use crate::migration::MigrationContext;

/// Create `index` on `table` with `CREATE INDEX CONCURRENTLY`.
///
/// Returns false when an index with the same name already exists, which
/// usually means an earlier run of the migration was interrupted.
pub async fn add_concurrent_index(ctx: &mut MigrationContext, table: &str, index: &IndexDefinition) -> Result<bool> {
    require_no_transaction(ctx, "add_concurrent_index")?;
    let target = TableRef::resolve(ctx, table)?;

    if catalog::index_exists_by_name(ctx.connection(), &target.schema, &index.name).await? {
        warn!(
            "Index not created because it already exists (this may be due to an aborted migration or similar): table_name: {}, index_name: {}",
            target.table, index.name
        );
        return Ok(false);
    }

    wraparound::check_if_wraparound_in_progress(ctx, table).await?;

    let mut statements = vec![index.create_sql(&target.table, true)?];
    if let Some(comment) = index.comment_sql(&target.table)? {
        statements.push(comment);
    }
    info!("Creating index {} on {}", index.name, target.table);
    without_statement_timeout(ctx, &statements).await?;
    Ok(true)
}

/// Drop an index with `DROP INDEX CONCURRENTLY`. Returns false when the
/// index does not exist.
pub async fn remove_concurrent_index_by_name(ctx: &mut MigrationContext, table: &str, index_name: &str) -> Result<bool> {
    require_no_transaction(ctx, "remove_concurrent_index_by_name")?;
    let target = TableRef::resolve(ctx, table)?;

    if !catalog::index_exists_by_name(ctx.connection(), &target.schema, index_name).await? {
        warn!(
            "Index not removed because it does not exist (this may be due to an aborted migration or similar): table_name: {}, index_name: {}",
            target.table, index_name
        );
        return Ok(false);
    }

    let sql = format!(
        "DROP INDEX CONCURRENTLY IF EXISTS {}.{}",
        quote_ident(&target.schema)?,
        quote_ident(index_name)?
    );
    info!("Removing index {} from {}", index_name, target.table);
    without_statement_timeout(ctx, &[sql]).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MigrateError;
    use crate::migration::MigrationSettings;
    use crate::testing::{rows, FakeConnection};

    fn context(conn: &FakeConnection) -> MigrationContext {
        MigrationContext::new(Box::new(conn.clone()), MigrationSettings::default())
    }

    #[tokio::test]
    async fn test_add_concurrent_index_disables_statement_timeout() {
        let conn = FakeConnection::new();
        let mut ctx = context(&conn);
        let mut index = IndexDefinition::new("events", "index_events_on_author_id", &["author_id"]);
        index.where_clause = Some("author_id IS NOT NULL".to_string());

        assert!(add_concurrent_index(&mut ctx, "events", &index).await.unwrap());

        let statements = conn.statements();
        let create = statements
            .iter()
            .position(|s| s.starts_with("CREATE INDEX CONCURRENTLY"))
            .unwrap();
        assert_eq!(statements[create - 1], "SET statement_timeout TO 0");
        assert_eq!(statements[create + 1], "RESET statement_timeout");
        assert_eq!(
            statements[create],
            "CREATE INDEX CONCURRENTLY \"index_events_on_author_id\" ON \"events\" (\"author_id\") WHERE author_id IS NOT NULL"
        );
    }

    #[tokio::test]
    async fn test_existing_index_is_skipped() {
        let conn = FakeConnection::new();
        conn.respond("relkind IN ('i', 'I')", rows("?column?", &["1"]));
        let mut ctx = context(&conn);
        let index = IndexDefinition::new("events", "index_events_on_author_id", &["author_id"]);

        assert!(!add_concurrent_index(&mut ctx, "events", &index).await.unwrap());
        assert!(conn.statements_matching("CREATE INDEX").is_empty());

        assert!(remove_concurrent_index_by_name(&mut ctx, "events", "index_events_on_author_id")
            .await
            .unwrap());
        assert_eq!(
            conn.statements_matching("DROP INDEX CONCURRENTLY"),
            vec!["DROP INDEX CONCURRENTLY IF EXISTS \"public\".\"index_events_on_author_id\""]
        );
    }

    #[tokio::test]
    async fn test_refuses_open_transaction() {
        let conn = FakeConnection::new();
        let mut ctx = context(&conn);
        ctx.begin().await.unwrap();
        let index = IndexDefinition::new("events", "index_events_on_author_id", &["author_id"]);

        let err = add_concurrent_index(&mut ctx, "events", &index).await.unwrap_err();
        assert!(matches!(err, MigrateError::InvalidUsage(_)));
    }

    #[tokio::test]
    async fn test_statement_timeout_reset_after_failure() {
        let conn = FakeConnection::new();
        conn.fail_with_lock_timeout("CREATE INDEX", 1);
        let mut ctx = context(&conn);
        let index = IndexDefinition::new("events", "index_events_on_author_id", &["author_id"]);

        assert!(add_concurrent_index(&mut ctx, "events", &index).await.is_err());
        assert_eq!(conn.statements().last().map(String::as_str), Some("RESET statement_timeout"));
    }
}
