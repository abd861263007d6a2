//! Write locks for tables owned by another database.
//!
//! In a multi-database deployment every database carries the full schema,
//! but a table may only be written on the database serving its
//! gitlab_schema. Elsewhere a statement-level trigger rejects writes.

use tracing::{debug, info};

use super::TableRef;
use crate::core::catalog;
use crate::core::identifier::{hashed_name, quote_ident, MAX_IDENTIFIER_LENGTH};
use crate::error::Result;
use crate::migration::MigrationContext;

/// Function raising on every write to a locked table.
pub const PREVENT_WRITE_FUNCTION: &str = "gitlab_schema_prevent_write";

const PREVENT_WRITE_SQL: &str = "\
CREATE OR REPLACE FUNCTION gitlab_schema_prevent_write()
RETURNS TRIGGER AS
$$
BEGIN
  RAISE EXCEPTION 'Table: \"%\" is write protected within this Gitlab database.', TG_TABLE_NAME
    USING ERRCODE = 'modifying_sql_data_not_permitted',
    HINT = 'Make sure you are using the right database connection';
END
$$ LANGUAGE PLPGSQL";

const WRITE_TRIGGER_PREFIX: &str = "gitlab_schema_write_trigger_for_";

/// Name of the write-lock trigger on `table`.
///
/// Long table names get a hashed suffix so the name stays a valid identifier.
pub fn write_trigger_name(table: &str) -> String {
    let name = format!("{}{}", WRITE_TRIGGER_PREFIX, table);
    if name.len() <= MAX_IDENTIFIER_LENGTH {
        return name;
    }
    hashed_name(WRITE_TRIGGER_PREFIX, table, 20)
}

/// Statements creating the write-lock trigger on `table`.
pub fn lock_writes_sql(table: &str, quoted_table: &str) -> Result<Vec<String>> {
    Ok(vec![
        PREVENT_WRITE_SQL.to_string(),
        format!(
            "CREATE TRIGGER {}\nBEFORE INSERT OR UPDATE OR DELETE OR TRUNCATE\nON {}\nFOR EACH STATEMENT EXECUTE FUNCTION {}()",
            quote_ident(&write_trigger_name(table))?,
            quoted_table,
            PREVENT_WRITE_FUNCTION
        ),
    ])
}

/// Whether writes to `table` are currently locked.
pub async fn is_write_locked(ctx: &mut MigrationContext, table: &str) -> Result<bool> {
    let target = TableRef::resolve(ctx, table)?;
    catalog::trigger_exists(
        ctx.connection(),
        &target.schema,
        target.name(),
        &write_trigger_name(target.name()),
    )
    .await
}

/// Lock writes on `table`. Returns false when it was already locked.
pub async fn lock_writes(ctx: &mut MigrationContext, table: &str) -> Result<bool> {
    if is_write_locked(ctx, table).await? {
        debug!("Writes on {} are already locked", table);
        return Ok(false);
    }
    let target = TableRef::resolve(ctx, table)?;
    info!("Locking writes on table {}", target.table);
    ctx.execute_with_lock_retries(lock_writes_sql(target.name(), &target.quoted)?)
        .await?;
    Ok(true)
}

/// Remove the write-lock trigger from `table`.
pub async fn unlock_writes(ctx: &mut MigrationContext, table: &str) -> Result<()> {
    let target = TableRef::resolve(ctx, table)?;
    info!("Unlocking writes on table {}", target.table);
    ctx.execute_with_lock_retries(vec![format!(
        "DROP TRIGGER IF EXISTS {} ON {}",
        quote_ident(&write_trigger_name(target.name()))?,
        target.quoted
    )])
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::Record;
    use crate::migration::MigrationSettings;
    use crate::testing::FakeConnection;

    #[tokio::test]
    async fn test_lock_writes_installs_statement_trigger() {
        let conn = FakeConnection::new();
        let mut ctx = MigrationContext::new(Box::new(conn.clone()), MigrationSettings::default());

        assert!(lock_writes(&mut ctx, "ci_builds").await.unwrap());

        let created = conn.statements_matching("CREATE TRIGGER");
        assert_eq!(created.len(), 1);
        assert!(created[0].contains("\"gitlab_schema_write_trigger_for_ci_builds\""));
        assert!(created[0].contains("FOR EACH STATEMENT EXECUTE FUNCTION gitlab_schema_prevent_write()"));
        assert_eq!(conn.statements_matching("SET LOCAL lock_timeout").len(), 1);
    }

    #[tokio::test]
    async fn test_lock_writes_is_idempotent() {
        let conn = FakeConnection::new();
        conn.respond(
            "pg_trigger",
            vec![Record::from_pairs(&[
                ("name", Some("gitlab_schema_write_trigger_for_ci_builds")),
                ("function_name", Some("gitlab_schema_prevent_write")),
            ])],
        );
        let mut ctx = MigrationContext::new(Box::new(conn.clone()), MigrationSettings::default());

        assert!(!lock_writes(&mut ctx, "ci_builds").await.unwrap());
        assert!(conn.statements_matching("CREATE TRIGGER").is_empty());

        unlock_writes(&mut ctx, "ci_builds").await.unwrap();
        assert_eq!(conn.statements_matching("DROP TRIGGER IF EXISTS").len(), 1);
    }

    #[test]
    fn test_long_table_name_gets_hashed_trigger_name() {
        let table = "security_vulnerability_occurrences";
        let name = write_trigger_name(table);
        assert!(name.starts_with("gitlab_schema_write_trigger_for_"));
        assert!(name.len() <= MAX_IDENTIFIER_LENGTH);
        assert_eq!(name, write_trigger_name(table));

        let sql = lock_writes_sql(table, "\"security_vulnerability_occurrences\"").unwrap();
        assert!(sql[1].contains(&format!("CREATE TRIGGER \"{}\"", name)));
    }

    #[tokio::test]
    async fn test_unlock_long_table_uses_same_trigger_name() {
        let conn = FakeConnection::new();
        let mut ctx = MigrationContext::new(Box::new(conn.clone()), MigrationSettings::default());
        let table = "security_vulnerability_occurrences";

        assert!(lock_writes(&mut ctx, table).await.unwrap());
        unlock_writes(&mut ctx, table).await.unwrap();

        let name = write_trigger_name(table);
        assert_eq!(conn.statements_matching(&format!("CREATE TRIGGER \"{}\"", name)).len(), 1);
        assert_eq!(conn.statements_matching(&format!("DROP TRIGGER IF EXISTS \"{}\"", name)).len(), 1);
    }
}
