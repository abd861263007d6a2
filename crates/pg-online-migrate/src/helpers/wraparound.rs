//! Anti-wraparound autovacuum detection.
//!
//! An autovacuum run to prevent transaction ID wraparound does not yield its
//! lock to DDL, so a migration touching the table would queue behind it for
//! as long as the vacuum takes. The check only warns.

use tracing::warn;

use super::TableRef;
use crate::error::Result;
use crate::migration::MigrationContext;

const WRAPAROUND_SQL: &str = "\
SELECT pid::text AS pid, query
FROM pg_stat_activity
WHERE datname = current_database()
  AND state = 'active'
  AND backend_type = 'autovacuum worker'
  AND position(' ' || $1 || ' (to prevent wraparound)' IN query) > 0";

/// Warn when an anti-wraparound autovacuum is running on `table`.
///
/// Returns whether one was found. Skipped when the check is disabled
/// (`GITLAB_MIGRATIONS_DISABLE_WRAPAROUND_CHECK`) or a transaction is open.
pub async fn check_if_wraparound_in_progress(ctx: &mut MigrationContext, table: &str) -> Result<bool> {
    if ctx.settings().disable_wraparound_check || ctx.transaction_open() {
        return Ok(false);
    }
    let target = TableRef::resolve(ctx, table)?;
    // autovacuum reports `VACUUM [ANALYZE] <schema>.<table> (to prevent wraparound)`
    let relation = format!("{}.{}", target.schema, target.name());
    let rows = ctx.connection().query(WRAPAROUND_SQL, &[relation.as_str()]).await?;

    let Some(row) = rows.first() else {
        return Ok(false);
    };
    warn!(
        "Autovacuum with wraparound prevention mode is running on `{}`. This process prevents the migration \
         from acquiring the necessary locks and may block it for a long time (pid {}, query: {}). \
         Consider running the migration after the autovacuum finishes or ask a database administrator to \
         reschedule it.",
        target.table,
        row.get("pid").unwrap_or("?"),
        row.get("query").unwrap_or("")
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::Record;
    use crate::migration::MigrationSettings;
    use crate::testing::FakeConnection;

    fn vacuum_running(conn: &FakeConnection) {
        conn.respond(
            "pg_stat_activity",
            vec![Record::from_pairs(&[
                ("pid", Some("4242")),
                ("query", Some("autovacuum: VACUUM public.events (to prevent wraparound)")),
            ])],
        );
    }

    #[tokio::test]
    async fn test_detects_wraparound_vacuum() {
        let conn = FakeConnection::new();
        vacuum_running(&conn);
        let mut ctx = MigrationContext::new(Box::new(conn.clone()), MigrationSettings::default());

        assert!(check_if_wraparound_in_progress(&mut ctx, "events").await.unwrap());
        assert_eq!(conn.statements_matching("pg_stat_activity").len(), 1);
    }

    #[tokio::test]
    async fn test_table_name_prefix_does_not_match() {
        let conn = FakeConnection::new();
        conn.respond(
            "[public.issues_labels]",
            vec![Record::from_pairs(&[
                ("pid", Some("4242")),
                ("query", Some("autovacuum: VACUUM public.issues_labels (to prevent wraparound)")),
            ])],
        );
        let mut ctx = MigrationContext::new(Box::new(conn.clone()), MigrationSettings::default());

        assert!(!check_if_wraparound_in_progress(&mut ctx, "issues").await.unwrap());
        assert!(check_if_wraparound_in_progress(&mut ctx, "issues_labels").await.unwrap());
        assert!(conn.statements()[0].contains("' (to prevent wraparound)' IN query"));
    }

    #[tokio::test]
    async fn test_disabled_check_never_queries() {
        let conn = FakeConnection::new();
        vacuum_running(&conn);
        let settings = MigrationSettings {
            disable_wraparound_check: true,
            ..MigrationSettings::default()
        };
        let mut ctx = MigrationContext::new(Box::new(conn.clone()), settings);

        assert!(!check_if_wraparound_in_progress(&mut ctx, "events").await.unwrap());
        assert!(conn.statements().is_empty());
    }

    #[tokio::test]
    async fn test_skipped_inside_transaction() {
        let conn = FakeConnection::new();
        vacuum_running(&conn);
        let mut ctx = MigrationContext::new(Box::new(conn.clone()), MigrationSettings::default());
        ctx.begin().await.unwrap();

        assert!(!check_if_wraparound_in_progress(&mut ctx, "events").await.unwrap());
        assert!(conn.statements_matching("pg_stat_activity").is_empty());
    }
}
