//! Migration runner - applies pending migrations one by one.
//!
//! For every migration the runner:
//! 1. Skips versions already present in the ledger
//! 2. Skips migrations whose gitlab_schema is not served by this database
//! 3. Subscribes the schema-restriction analyzer and, for transactional
//!    migrations that did not opt out, the lock-acquisition monitor
//! 4. Runs the body (in a transaction, under lock retries, or bare)
//! 5. Verifies the observers and records the version in the same transaction
//! 6. Locks writes on new tables that belong to another database

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{Ledger, Migration, MigrationContext};
use crate::core::catalog;
use crate::error::{MigrateError, Result};
use crate::helpers::lock_writes;
use crate::locking::LockMonitor;
use crate::schema::{RestrictAllowedSchemas, SchemaRegistry};

/// What happened to one migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOutcome {
    Applied,
    AlreadyApplied,
    /// Its gitlab_schema is not served by this database. The version is
    /// still recorded so the migration is not considered pending.
    Skipped,
    RolledBack,
}

/// One line of a [`RunSummary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    pub version: i64,
    pub name: String,
    pub outcome: MigrationOutcome,
    pub duration_seconds: f64,
    /// Tables whose writes were locked after the migration created them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locked_tables: Vec<String>,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique run identifier.
    pub run_id: String,

    /// Logical database the run targeted.
    pub database: String,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,

    pub applied: usize,
    pub skipped: usize,
    pub already_applied: usize,

    pub migrations: Vec<MigrationReport>,
}

impl RunSummary {
    fn new(database: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            database: database.to_string(),
            started_at: now,
            completed_at: now,
            duration_seconds: 0.0,
            applied: 0,
            skipped: 0,
            already_applied: 0,
            migrations: Vec::new(),
        }
    }

    fn push(&mut self, report: MigrationReport) {
        match report.outcome {
            MigrationOutcome::Applied | MigrationOutcome::RolledBack => self.applied += 1,
            MigrationOutcome::Skipped => self.skipped += 1,
            MigrationOutcome::AlreadyApplied => self.already_applied += 1,
        }
        self.migrations.push(report);
    }

    fn complete(mut self, started: Instant) -> Self {
        self.completed_at = Utc::now();
        self.duration_seconds = started.elapsed().as_secs_f64();
        self
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Applied/pending state of a known migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub version: i64,
    pub name: String,
    pub applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

/// Applies and reverts migrations against one database.
pub struct MigrationRunner {
    registry: Arc<SchemaRegistry>,
}

impl MigrationRunner {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    fn ledger(ctx: &MigrationContext) -> Result<Ledger> {
        Ledger::new(ctx.default_schema(), &ctx.settings().migrations_table)
    }

    /// Apply every pending migration, in version order.
    pub async fn migrate(
        &self,
        ctx: &mut MigrationContext,
        migrations: &[Arc<dyn Migration>],
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let database = ctx.settings().database_name.clone();
        let mut summary = RunSummary::new(&database);
        info!("Starting migration run {} on database {}", summary.run_id, database);

        let ledger = Self::ledger(ctx)?;
        ledger.ensure_table(ctx.connection()).await?;
        let applied = ledger.applied_versions(ctx.connection()).await?;

        let mut ordered: Vec<&Arc<dyn Migration>> = migrations.iter().collect();
        ordered.sort_by_key(|m| m.version());

        for migration in ordered {
            let started = Instant::now();
            let mut report = MigrationReport {
                version: migration.version(),
                name: migration.name().to_string(),
                outcome: MigrationOutcome::Applied,
                duration_seconds: 0.0,
                locked_tables: Vec::new(),
            };

            if applied.contains(&migration.version()) {
                debug!("{} is already applied", label(migration.as_ref()));
                report.outcome = MigrationOutcome::AlreadyApplied;
                summary.push(report);
                continue;
            }

            if !self.runs_on_this_database(ctx, migration.as_ref())? {
                ledger.record(ctx.connection(), migration.version()).await?;
                report.outcome = MigrationOutcome::Skipped;
                summary.push(report);
                continue;
            }

            info!("== {}: migrating", label(migration.as_ref()));
            let tables_before = self.tables_for_write_locks(ctx).await?;

            if let Err(err) = self.execute(ctx, migration, &ledger, Direction::Up).await {
                error!("{} failed: {}", label(migration.as_ref()), err);
                return Err(err);
            }

            if let Some(before) = tables_before {
                report.locked_tables = self.lock_writes_on_new_tables(ctx, &before).await?;
            }

            report.duration_seconds = started.elapsed().as_secs_f64();
            info!(
                "== {}: migrated ({:.4}s)",
                label(migration.as_ref()),
                report.duration_seconds
            );
            summary.push(report);
        }

        let summary = summary.complete(started);
        info!(
            "Migration run complete: {} applied, {} skipped, {} already applied",
            summary.applied, summary.skipped, summary.already_applied
        );
        Ok(summary)
    }

    /// Revert one applied migration and remove its version.
    pub async fn rollback(
        &self,
        ctx: &mut MigrationContext,
        migration: &Arc<dyn Migration>,
    ) -> Result<MigrationReport> {
        let started = Instant::now();
        let ledger = Self::ledger(ctx)?;
        ledger.ensure_table(ctx.connection()).await?;

        if !ledger.is_applied(ctx.connection(), migration.version()).await? {
            return Err(MigrateError::migration(
                migration.version(),
                format!("{} is not applied, nothing to roll back", migration.name()),
            ));
        }

        let mut outcome = MigrationOutcome::RolledBack;
        if self.runs_on_this_database(ctx, migration.as_ref())? {
            info!("== {}: reverting", label(migration.as_ref()));
            self.execute(ctx, migration, &ledger, Direction::Down).await?;
        } else {
            ledger.remove(ctx.connection(), migration.version()).await?;
            outcome = MigrationOutcome::Skipped;
        }

        Ok(MigrationReport {
            version: migration.version(),
            name: migration.name().to_string(),
            outcome,
            duration_seconds: started.elapsed().as_secs_f64(),
            locked_tables: Vec::new(),
        })
    }

    /// Applied/pending state of `migrations`, in version order.
    pub async fn status(
        &self,
        ctx: &mut MigrationContext,
        migrations: &[Arc<dyn Migration>],
    ) -> Result<Vec<MigrationStatus>> {
        let ledger = Self::ledger(ctx)?;
        ledger.ensure_table(ctx.connection()).await?;
        let applied = ledger.applied_versions(ctx.connection()).await?;

        let mut statuses: Vec<MigrationStatus> = migrations
            .iter()
            .map(|m| MigrationStatus {
                version: m.version(),
                name: m.name().to_string(),
                applied: applied.contains(&m.version()),
            })
            .collect();
        statuses.sort_by_key(|s| s.version);
        Ok(statuses)
    }

    /// Schema-restriction skip: a migration restricted to a gitlab_schema
    /// only runs on databases serving that schema.
    fn runs_on_this_database(&self, ctx: &MigrationContext, migration: &dyn Migration) -> Result<bool> {
        let Some(schema) = migration.restrict_gitlab_migration() else {
            return Ok(true);
        };
        let database = &ctx.settings().database_name;
        if self.registry.database_allows(database, schema)? {
            return Ok(true);
        }
        info!(
            "Skipping {}: restricted to {} which is not served by database {}",
            label(migration),
            schema,
            database
        );
        Ok(false)
    }

    async fn execute(
        &self,
        ctx: &mut MigrationContext,
        migration: &Arc<dyn Migration>,
        ledger: &Ledger,
        direction: Direction,
    ) -> Result<()> {
        let name = label(migration.as_ref());
        ctx.subscribe(Box::new(RestrictAllowedSchemas::new(
            self.registry.clone(),
            migration.restrict_gitlab_migration(),
            name.clone(),
        )));
        let transactional = !migration.disable_ddl_transaction();
        if transactional && !migration.skip_multiple_table_lock_check() {
            ctx.subscribe(Box::new(LockMonitor::new(name)));
        }

        let result = if !transactional {
            run_body(ctx, migration.clone(), ledger.clone(), direction).await
        } else if migration.enable_lock_retries() && !ctx.settings().disable_lock_retries {
            let (migration, ledger) = (migration.clone(), ledger.clone());
            ctx.with_lock_retries(move |ctx| {
                let (migration, ledger) = (migration.clone(), ledger.clone());
                Box::pin(run_body(ctx, migration, ledger, direction))
            })
            .await
        } else {
            // Nested with_lock_retries calls run inline in the DDL transaction
            // when the migration asked for lock retries.
            ctx.set_lock_retries_active(migration.enable_lock_retries());
            let (migration, ledger) = (migration.clone(), ledger.clone());
            let result = ctx
                .transaction(move |ctx| {
                    let (migration, ledger) = (migration.clone(), ledger.clone());
                    Box::pin(run_body(ctx, migration, ledger, direction))
                })
                .await;
            ctx.set_lock_retries_active(false);
            result
        };

        ctx.events_mut().clear();
        ctx.suppress_schema_restriction(false);
        result
    }

    /// Tables present before the migration, when automatic write locks apply.
    async fn tables_for_write_locks(&self, ctx: &mut MigrationContext) -> Result<Option<BTreeSet<String>>> {
        if ctx.settings().skip_automatic_lock_on_writes {
            return Ok(None);
        }
        let schema = ctx.default_schema().to_string();
        let tables = catalog::table_names(ctx.connection(), &schema).await?;
        Ok(Some(tables.into_iter().collect()))
    }

    /// Lock writes on tables created by the migration whose gitlab_schema
    /// lives in another database.
    async fn lock_writes_on_new_tables(
        &self,
        ctx: &mut MigrationContext,
        before: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let schema = ctx.default_schema().to_string();
        let database = ctx.settings().database_name.clone();
        let mut locked = Vec::new();

        for table in catalog::table_names(ctx.connection(), &schema).await? {
            if before.contains(&table) {
                continue;
            }
            let table_schema = match self.registry.table_schema(&table) {
                Ok(s) => s,
                Err(_) => {
                    warn!("New table {} has no gitlab_schema, not locking writes", table);
                    continue;
                }
            };
            if table_schema.is_ignored_for_restriction()
                || self.registry.database_allows(&database, table_schema)?
            {
                continue;
            }
            info!(
                "Locking writes on {} ({} is not served by database {})",
                table, table_schema, database
            );
            lock_writes::lock_writes(ctx, &table).await?;
            locked.push(table);
        }
        Ok(locked)
    }
}

fn label(migration: &dyn Migration) -> String {
    format!("{} {}", migration.version(), migration.name())
}

/// The body plus its verification and bookkeeping. Inside a transaction an
/// observer failure rolls the migration back together with its version.
async fn run_body(
    ctx: &mut MigrationContext,
    migration: Arc<dyn Migration>,
    ledger: Ledger,
    direction: Direction,
) -> Result<()> {
    match direction {
        Direction::Up => migration.up(ctx).await?,
        Direction::Down => migration.down(ctx).await?,
    }
    ctx.events_mut().finish()?;
    match direction {
        Direction::Up => ledger.record(ctx.connection(), migration.version()).await,
        Direction::Down => ledger.remove(ctx.connection(), migration.version()).await,
    }
}
