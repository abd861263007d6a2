//! Migrations and the machinery that runs them.
//!
//! - [`Migration`]: a versioned schema change with `up`/`down`
//! - [`context`]: [`MigrationContext`], the session plus run-scoped state
//! - [`events`]: numbered statement events and their observers
//! - [`runner`]: applies pending migrations with the lock and schema checks
//! - [`ledger`]: the `schema_migrations` table
//! - [`sql_file`]: migrations written as annotated `.sql` files

pub mod context;
pub mod events;
pub mod ledger;
pub mod runner;
pub mod sql_file;

use async_trait::async_trait;

use crate::error::Result;
use crate::schema::GitlabSchema;

pub use context::{MigrationContext, MigrationSettings};
pub use events::{EventBus, StatementEvent, StatementObserver};
pub use ledger::Ledger;
pub use runner::{MigrationOutcome, MigrationRunner, RunSummary};
pub use sql_file::SqlFileMigration;

/// A versioned schema change.
///
/// By default a migration runs inside a single transaction, is checked by the
/// lock monitor, and is not restricted to a gitlab_schema.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Unique, ordered version (usually a timestamp such as `20240115093000`).
    fn version(&self) -> i64;

    fn name(&self) -> &str;

    /// Run outside of a transaction. Required for `CREATE INDEX CONCURRENTLY`
    /// and for helpers that manage their own transactions.
    fn disable_ddl_transaction(&self) -> bool {
        false
    }

    /// Wrap the whole transactional body in the lock-retry runner.
    fn enable_lock_retries(&self) -> bool {
        false
    }

    /// The only gitlab_schema this migration may touch. `None` means the
    /// migration is a DDL migration and must not modify data.
    fn restrict_gitlab_migration(&self) -> Option<GitlabSchema> {
        None
    }

    /// Opt out of the multiple-table lock check.
    fn skip_multiple_table_lock_check(&self) -> bool {
        false
    }

    async fn up(&self, ctx: &mut MigrationContext) -> Result<()>;

    /// Revert `up`. Irreversible migrations keep the default.
    async fn down(&self, _ctx: &mut MigrationContext) -> Result<()> {
        Err(crate::error::MigrateError::migration(
            self.version(),
            format!("{} is irreversible", self.name()),
        ))
    }
}
