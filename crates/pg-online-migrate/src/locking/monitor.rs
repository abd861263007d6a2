//! Lock-acquisition monitor.
//!
//! Subscribed to a transactional migration's statement events. After every
//! statement that is likely to take locks it reads the session's relation
//! locks from `pg_locks` and remembers which tables were newly locked by that
//! statement. When the migration body completes, heavy locks that were taken
//! on tables in more than one statement fail the migration: every lock is held
//! until COMMIT, so the later statements wait on other sessions while the
//! earlier tables stay blocked.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::core::connection::Connection;
use crate::error::{MigrateError, Result};
use crate::migration::events::{StatementEvent, StatementObserver};

/// Lock modes that do not block writers and are ignored by the check.
///
/// Policy constant: every other mode, including `RowExclusiveLock` taken by
/// plain DML, counts as a high-severity lock.
pub const LOW_SEVERITY_LOCK_MODES: [&str; 2] = ["RowShareLock", "AccessShareLock"];

/// First keywords of statements that take relation locks.
const LOCKING_KEYWORDS: [&str; 8] = [
    "ALTER", "CREATE", "DROP", "TRUNCATE", "LOCK", "UPDATE", "DELETE", "INSERT",
];

/// Transaction and session control statements, never checked.
const CONTROL_KEYWORDS: [&str; 8] = [
    "SET", "RESET", "BEGIN", "START", "COMMIT", "ROLLBACK", "SAVEPOINT", "RELEASE",
];

fn row_lock_clause() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bFOR\s+(NO\s+KEY\s+)?UPDATE\b|\bFOR\s+(KEY\s+)?SHARE\b")
            .expect("static pattern")
    })
}

fn create_trigger() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*CREATE\s+(OR\s+REPLACE\s+)?(CONSTRAINT\s+)?TRIGGER\b")
            .expect("static pattern")
    })
}

fn data_modifying_cte() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(INSERT\s+INTO|UPDATE|DELETE\s+FROM)\b").expect("static pattern"))
}

/// Whether the monitor should inspect locks after `sql`.
pub fn likely_acquires_locks(sql: &str) -> bool {
    let Some(keyword) = crate::migration::events::leading_keyword(sql) else {
        return false;
    };
    if CONTROL_KEYWORDS.contains(&keyword.as_str()) {
        return false;
    }
    if sql.to_ascii_lowercase().contains("pg_locks") {
        return false;
    }
    if keyword == "SELECT" {
        return row_lock_clause().is_match(sql);
    }
    LOCKING_KEYWORDS.contains(&keyword.as_str())
        || row_lock_clause().is_match(sql)
        || create_trigger().is_match(sql)
        || (keyword == "WITH" && data_modifying_cte().is_match(sql))
}

/// Query listing tables the current backend holds heavy locks on.
pub fn locked_tables_sql() -> String {
    let excluded = LOW_SEVERITY_LOCK_MODES
        .iter()
        .map(|m| format!("'{}'", m))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT DISTINCT (n.nspname || '.' || c.relname)::text AS table_name \
         FROM pg_locks l \
         JOIN pg_class c ON c.oid = l.relation \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE l.pid = pg_backend_pid() \
           AND l.locktype = 'relation' \
           AND n.nspname NOT IN ('pg_catalog', 'information_schema') \
           AND c.relkind IN ('r', 'p') \
           AND l.mode NOT IN ({}) \
         ORDER BY 1",
        excluded
    )
}

/// Tables newly locked by one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementLockRecord {
    pub sequence: usize,
    pub sql: String,
    pub tables: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorState {
    Tracking,
    Verified,
}

/// After-statement observer implementing the multiple-table lock check.
#[derive(Debug)]
pub struct LockMonitor {
    migration: String,
    state: MonitorState,
    locked: BTreeSet<String>,
    records: Vec<StatementLockRecord>,
}

impl LockMonitor {
    /// Monitor for the migration named in diagnostics.
    pub fn new(migration: impl Into<String>) -> Self {
        Self {
            migration: migration.into(),
            state: MonitorState::Tracking,
            locked: BTreeSet::new(),
            records: Vec::new(),
        }
    }

    /// Statements that locked new tables so far.
    pub fn records(&self) -> &[StatementLockRecord] {
        &self.records
    }

    /// Record the locks held after `event`, keeping only tables not seen before.
    pub fn record_locks(&mut self, event: &StatementEvent, held: impl IntoIterator<Item = String>) {
        let new_tables: BTreeSet<String> = held
            .into_iter()
            .filter(|table| !self.locked.contains(table))
            .collect();
        if new_tables.is_empty() {
            return;
        }
        debug!(
            statement = event.sequence,
            tables = ?new_tables,
            "Statement acquired new table locks"
        );
        self.locked.extend(new_tables.iter().cloned());
        self.records.push(StatementLockRecord {
            sequence: event.sequence,
            sql: event.sql.clone(),
            tables: new_tables,
        });
    }

    /// Fail when more than one statement locked new tables.
    pub fn verify(&mut self) -> Result<()> {
        self.state = MonitorState::Verified;
        if self.records.len() <= 1 {
            return Ok(());
        }

        let mut message = format!(
            "Migration {} acquired table locks in multiple statements within one transaction:\n",
            self.migration
        );
        for record in &self.records {
            message.push_str(&format!(
                "\n  Statement #{}: {}\n    Locked tables: {}\n",
                record.sequence,
                record.sql.trim(),
                record.tables.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }
        message.push_str(
            "\nEach lock is held until the transaction commits, which blocks concurrent \
             sessions on the earlier tables while later statements wait for theirs.\n\
             Split the migration so that each migration locks one table, \
             or use disable_ddl_transaction with with_lock_retries around each step. \
             If the locks are known to be harmless, opt out with skip_multiple_table_lock_check.",
        );
        Err(MigrateError::MultipleTableLocks(message))
    }
}

#[async_trait]
impl StatementObserver for LockMonitor {
    fn name(&self) -> &'static str {
        "lock_monitor"
    }

    async fn after_statement(&mut self, event: &StatementEvent, conn: &mut dyn Connection) -> Result<()> {
        if self.state != MonitorState::Tracking || !likely_acquires_locks(&event.sql) {
            return Ok(());
        }
        let rows = conn.query(&locked_tables_sql(), &[]).await?;
        let held = rows
            .iter()
            .filter_map(|r| r.get("table_name").map(str::to_string))
            .collect::<Vec<_>>();
        self.record_locks(event, held);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.verify()
    }
}
