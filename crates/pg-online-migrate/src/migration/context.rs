//! Run-scoped migration context.
//!
//! A [`MigrationContext`] owns the session a migration runs on, the settings
//! that shape helper behaviour, the statement event bus, and the
//! `lock_retries_active` flag that tells nested `with_lock_retries` calls
//! whether the enclosing transaction was opened by the lock-retry runner.

use futures::future::BoxFuture;

use crate::config::Config;
use crate::core::connection::{Connection, Record};
use crate::error::{MigrateError, Result};
use crate::locking::retries::{TimingConfiguration, WithLockRetries};
use crate::migration::events::{EventBus, StatementObserver};

/// Settings shared by every helper during a run.
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    /// Logical database name (`main`, `ci`, ...).
    pub database_name: String,
    /// PostgreSQL schema for unqualified tables.
    pub default_schema: String,
    pub timing: TimingConfiguration,
    pub disable_lock_retries: bool,
    pub skip_automatic_lock_on_writes: bool,
    pub disable_wraparound_check: bool,
    pub backfill_batch_size: usize,
    pub migrations_table: String,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            database_name: "main".to_string(),
            default_schema: "public".to_string(),
            timing: TimingConfiguration::default(),
            disable_lock_retries: false,
            skip_automatic_lock_on_writes: false,
            disable_wraparound_check: false,
            backfill_batch_size: 10_000,
            migrations_table: "schema_migrations".to_string(),
        }
    }
}

impl MigrationSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            database_name: config.database.name.clone(),
            default_schema: config.database.schema.clone(),
            timing: config.timing_configuration(),
            disable_lock_retries: config.migration.disable_lock_retries,
            skip_automatic_lock_on_writes: config.migration.skip_automatic_lock_on_writes,
            disable_wraparound_check: config.migration.disable_wraparound_check,
            backfill_batch_size: config.migration.backfill_batch_size,
            migrations_table: config.migration.migrations_table.clone(),
        }
    }
}

/// Session plus run-scoped state handed to every migration and helper.
pub struct MigrationContext {
    conn: Box<dyn Connection>,
    settings: MigrationSettings,
    events: EventBus,
    lock_retries_active: bool,
}

impl MigrationContext {
    pub fn new(conn: Box<dyn Connection>, settings: MigrationSettings) -> Self {
        Self {
            conn,
            settings,
            events: EventBus::new(),
            lock_retries_active: false,
        }
    }

    pub fn settings(&self) -> &MigrationSettings {
        &self.settings
    }

    pub fn default_schema(&self) -> &str {
        &self.settings.default_schema
    }

    /// The raw session. Statements sent here bypass the observers, which is
    /// what catalog introspection wants.
    pub fn connection(&mut self) -> &mut dyn Connection {
        self.conn.as_mut()
    }

    pub fn transaction_open(&self) -> bool {
        self.conn.transaction_open()
    }

    pub fn subscribe(&mut self, observer: Box<dyn StatementObserver>) {
        self.events.subscribe(observer);
    }

    pub(crate) fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    /// Exempt following statements from the gitlab_schema restriction, for
    /// helpers whose DML is part of a schema change (backfills, settings).
    pub fn suppress_schema_restriction(&mut self, suppressed: bool) {
        self.events.set_restriction_suppressed(suppressed);
    }

    /// Execute a statement batch through the observers.
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        let event = self.events.next_event(sql);
        self.events.before(&event)?;
        self.conn.execute(sql).await?;
        self.events.after(&event, self.conn.as_mut()).await
    }

    /// Run a parameterized query through the observers.
    pub async fn select_rows(&mut self, sql: &str, params: &[&str]) -> Result<Vec<Record>> {
        let event = self.events.next_event(sql);
        self.events.before(&event)?;
        let rows = self.conn.query(sql, params).await?;
        self.events.after(&event, self.conn.as_mut()).await?;
        Ok(rows)
    }

    /// First column of the first row, if any.
    pub async fn select_value(&mut self, sql: &str, params: &[&str]) -> Result<Option<String>> {
        let rows = self.select_rows(sql, params).await?;
        Ok(rows.first().and_then(|r| r.first()).map(str::to_string))
    }

    pub async fn begin(&mut self) -> Result<()> {
        self.conn.begin().await
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.conn.commit().await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.conn.rollback().await
    }

    /// Run `block` in a (nested) transaction, committing on success.
    pub async fn transaction<T, F>(&mut self, mut block: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut MigrationContext) -> BoxFuture<'c, Result<T>> + Send,
    {
        self.begin().await?;
        match block(&mut *self).await {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback().await {
                    tracing::warn!("Rollback failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    /// Whether the open transaction belongs to a lock-retry runner.
    pub fn lock_retries_active(&self) -> bool {
        self.lock_retries_active
    }

    pub(crate) fn set_lock_retries_active(&mut self, active: bool) {
        self.lock_retries_active = active;
    }

    /// Run `block` under the lock-retry policy.
    ///
    /// Inside a transaction opened by a lock-retry runner (including
    /// migration-level lock retries) the block simply runs in that
    /// transaction. Inside any other open transaction this is an error: the
    /// retries could only cover a savepoint, while the locks taken earlier in
    /// the transaction would still be held across the sleeps.
    pub async fn with_lock_retries<T, F>(&mut self, block: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut MigrationContext) -> BoxFuture<'c, Result<T>> + Send,
    {
        self.run_with_lock_retries(false, block).await
    }

    /// Like [`with_lock_retries`](Self::with_lock_retries), but fail with
    /// [`MigrateError::AttemptsExhausted`] instead of making a final attempt
    /// without `lock_timeout`.
    pub async fn with_lock_retries_or_raise<T, F>(&mut self, block: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut MigrationContext) -> BoxFuture<'c, Result<T>> + Send,
    {
        self.run_with_lock_retries(true, block).await
    }

    /// Execute statements, in order, as one lock-retried transaction.
    pub async fn execute_with_lock_retries(&mut self, statements: Vec<String>) -> Result<()> {
        self.with_lock_retries(move |ctx| {
            let statements = statements.clone();
            Box::pin(async move {
                for sql in &statements {
                    ctx.execute(sql).await?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn run_with_lock_retries<T, F>(&mut self, raise_on_exhaustion: bool, mut block: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut MigrationContext) -> BoxFuture<'c, Result<T>> + Send,
    {
        if self.transaction_open() {
            if self.lock_retries_active {
                return block(&mut *self).await;
            }
            return Err(MigrateError::usage(
                "with_lock_retries can not be run inside an already open transaction. \
                 Use migration-level lock retries instead (enable_lock_retries), \
                 or disable the DDL transaction of the migration",
            ));
        }

        let mut retries = WithLockRetries::new(self.settings.timing.clone())
            .disabled(self.settings.disable_lock_retries);
        self.lock_retries_active = true;
        let result = retries.run(self, raise_on_exhaustion, block).await;
        self.lock_retries_active = false;
        result
    }

    /// Give the session back, e.g. to run the next migration on it.
    pub fn into_connection(self) -> Box<dyn Connection> {
        self.conn
    }
}
