//! Database session abstraction.
//!
//! Every helper in this crate talks to PostgreSQL through [`Connection`]. The
//! trait is intentionally narrow: run a (possibly multi-statement) SQL batch,
//! run a parameterized query returning text rows, and manage nested
//! transactions. Nested transactions map to savepoints, so a lock-retry attempt
//! inside an already-open migration transaction can roll back on its own.

use async_trait::async_trait;

use crate::error::{MigrateError, Result};

/// A result row with every value rendered as text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    columns: Vec<String>,
    values: Vec<Option<String>>,
}

impl Record {
    /// Create a record from parallel column/value vectors.
    pub fn new(columns: Vec<String>, values: Vec<Option<String>>) -> Self {
        Self { columns, values }
    }

    /// Build a record from `(column, value)` pairs.
    pub fn from_pairs(pairs: &[(&str, Option<&str>)]) -> Self {
        Self {
            columns: pairs.iter().map(|(c, _)| c.to_string()).collect(),
            values: pairs.iter().map(|(_, v)| v.map(str::to_string)).collect(),
        }
    }

    /// Value of a column, `None` for SQL NULL or an unknown column.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values[i].as_deref())
    }

    /// Value of a column that must be present and non-null.
    pub fn require(&self, column: &str) -> Result<&str> {
        self.get(column).ok_or_else(|| {
            MigrateError::Config(format!("expected column '{}' in catalog row", column))
        })
    }

    /// Interpret a column as a PostgreSQL boolean (`t` / `true`).
    pub fn get_bool(&self, column: &str) -> bool {
        matches!(self.get(column), Some("t") | Some("true"))
    }

    /// First column of the row.
    pub fn first(&self) -> Option<&str> {
        self.values.first().and_then(|v| v.as_deref())
    }
}

/// A single database session.
///
/// Implementations must keep `transaction_depth` accurate: `0` means no
/// transaction is open, `1` a top-level transaction, and anything higher a
/// savepoint nested inside it.
#[async_trait]
pub trait Connection: Send {
    /// Execute one or more statements, discarding results.
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Run a query with text parameters (`$1`, `$2`, ...) and return text rows.
    async fn query(&mut self, sql: &str, params: &[&str]) -> Result<Vec<Record>>;

    /// Current nesting depth of transactions/savepoints.
    fn transaction_depth(&self) -> usize;

    /// Record a new depth after BEGIN/SAVEPOINT/COMMIT/ROLLBACK.
    fn set_transaction_depth(&mut self, depth: usize);

    /// Whether a transaction is currently open on this session.
    fn transaction_open(&self) -> bool {
        self.transaction_depth() > 0
    }

    /// Open a transaction, or a savepoint when one is already open.
    async fn begin(&mut self) -> Result<()> {
        let depth = self.transaction_depth();
        self.execute(&begin_sql(depth)).await?;
        self.set_transaction_depth(depth + 1);
        Ok(())
    }

    /// Commit the innermost transaction or release the innermost savepoint.
    async fn commit(&mut self) -> Result<()> {
        let depth = self.transaction_depth();
        if depth == 0 {
            return Err(MigrateError::usage("commit called without an open transaction"));
        }
        let result = self.execute(&commit_sql(depth)).await;
        self.set_transaction_depth(depth - 1);
        result
    }

    /// Roll back the innermost transaction or savepoint.
    async fn rollback(&mut self) -> Result<()> {
        let depth = self.transaction_depth();
        if depth == 0 {
            return Err(MigrateError::usage("rollback called without an open transaction"));
        }
        let result = self.execute(&rollback_sql(depth)).await;
        self.set_transaction_depth(depth - 1);
        result
    }
}

fn savepoint_name(level: usize) -> String {
    format!("online_migrate_sp_{}", level)
}

/// SQL that opens a transaction at `depth` (0 = top level).
pub fn begin_sql(depth: usize) -> String {
    if depth == 0 {
        "BEGIN".to_string()
    } else {
        format!("SAVEPOINT {}", savepoint_name(depth))
    }
}

/// SQL that commits the transaction currently at `depth` (1 = top level).
pub fn commit_sql(depth: usize) -> String {
    if depth <= 1 {
        "COMMIT".to_string()
    } else {
        format!("RELEASE SAVEPOINT {}", savepoint_name(depth - 1))
    }
}

/// SQL that rolls back the transaction currently at `depth` (1 = top level).
pub fn rollback_sql(depth: usize) -> String {
    if depth <= 1 {
        "ROLLBACK".to_string()
    } else {
        format!("ROLLBACK TO SAVEPOINT {}", savepoint_name(depth - 1))
    }
}
