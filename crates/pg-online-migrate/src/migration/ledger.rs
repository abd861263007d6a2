//! The `schema_migrations` table.
//!
//! One row per applied migration version. The version column is text so the
//! table stays compatible with ledgers created by other migration tools.
//! Ledger statements go straight to the session: they are bookkeeping, not
//! part of the migration, and must not be seen by the statement observers.

use std::collections::BTreeSet;

use tracing::debug;

use crate::core::connection::Connection;
use crate::core::identifier::qualify;
use crate::error::{MigrateError, Result};

/// Applied-version bookkeeping for one schema.
#[derive(Debug, Clone)]
pub struct Ledger {
    qualified: String,
}

impl Ledger {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        Ok(Self {
            qualified: qualify(&schema.into(), &table.into())?,
        })
    }

    fn qualified(&self) -> &str {
        &self.qualified
    }

    /// Create the table if it does not exist yet.
    pub async fn ensure_table(&self, conn: &mut dyn Connection) -> Result<()> {
        conn.execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (version character varying NOT NULL PRIMARY KEY)",
            self.qualified()
        ))
        .await
    }

    /// Every recorded version, ascending.
    pub async fn applied_versions(&self, conn: &mut dyn Connection) -> Result<BTreeSet<i64>> {
        let rows = conn
            .query(&format!("SELECT version::text AS version FROM {}", self.qualified()), &[])
            .await?;

        let mut versions = BTreeSet::new();
        for row in &rows {
            let raw = row.require("version")?;
            let version = raw.trim().parse::<i64>().map_err(|_| {
                MigrateError::Config(format!(
                    "{} contains a non-numeric version '{}'",
                    self.qualified(),
                    raw
                ))
            })?;
            versions.insert(version);
        }
        Ok(versions)
    }

    pub async fn is_applied(&self, conn: &mut dyn Connection, version: i64) -> Result<bool> {
        let rows = conn
            .query(
                &format!("SELECT 1 FROM {} WHERE version = $1", self.qualified()),
                &[version.to_string().as_str()],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Mark `version` as applied. Recording twice is a no-op.
    pub async fn record(&self, conn: &mut dyn Connection, version: i64) -> Result<()> {
        debug!(version, "Recording migration version");
        conn.query(
            &format!(
                "INSERT INTO {} (version) VALUES ($1) ON CONFLICT (version) DO NOTHING",
                self.qualified()
            ),
            &[version.to_string().as_str()],
        )
        .await?;
        Ok(())
    }

    pub async fn remove(&self, conn: &mut dyn Connection, version: i64) -> Result<()> {
        debug!(version, "Removing migration version");
        conn.query(
            &format!("DELETE FROM {} WHERE version = $1", self.qualified()),
            &[version.to_string().as_str()],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{rows, FakeConnection};

    #[tokio::test]
    async fn test_applied_versions() {
        let mut conn = FakeConnection::new();
        conn.respond("SELECT version::text", rows("version", &["20240102000000", "20240101000000"]));
        let ledger = Ledger::new("public", "schema_migrations").unwrap();

        ledger.ensure_table(&mut conn).await.unwrap();
        let versions = ledger.applied_versions(&mut conn).await.unwrap();

        assert_eq!(
            versions.into_iter().collect::<Vec<_>>(),
            vec![20240101000000, 20240102000000]
        );
        assert!(conn.statements()[0].starts_with(
            "CREATE TABLE IF NOT EXISTS \"public\".\"schema_migrations\""
        ));
    }

    #[tokio::test]
    async fn test_garbage_version_is_reported() {
        let mut conn = FakeConnection::new();
        conn.respond("SELECT version::text", rows("version", &["abc"]));
        let ledger = Ledger::new("public", "schema_migrations").unwrap();

        let err = ledger.applied_versions(&mut conn).await.unwrap_err();
        assert!(err.to_string().contains("non-numeric version 'abc'"));
    }

    #[tokio::test]
    async fn test_record_and_remove() {
        let mut conn = FakeConnection::new();
        conn.respond("SELECT 1 FROM", rows("?column?", &["1"]));
        let ledger = Ledger::new("public", "schema_migrations").unwrap();

        ledger.record(&mut conn, 7).await.unwrap();
        ledger.remove(&mut conn, 7).await.unwrap();
        assert!(ledger.is_applied(&mut conn, 7).await.unwrap());

        assert!(conn.statements_matching("INSERT INTO")[0].contains("ON CONFLICT (version) DO NOTHING"));
        assert_eq!(conn.statements_matching("DELETE FROM").len(), 1);
    }

    #[test]
    fn test_rejects_bad_table_name() {
        assert!(Ledger::new("public", "").is_err());
    }
}
