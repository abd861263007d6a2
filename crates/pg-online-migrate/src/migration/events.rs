//! Statement event stream.
//!
//! Every statement a migration issues through its
//! [`MigrationContext`](super::MigrationContext) becomes a numbered
//! [`StatementEvent`]. Observers see it before it runs (and may veto it) and
//! after it succeeded (with access to the session, e.g. to inspect `pg_locks`).
//! When the migration body is done each observer gets a final verdict through
//! [`StatementObserver::finish`].

use async_trait::async_trait;

use crate::core::connection::Connection;
use crate::error::Result;

/// A statement issued by a migration, numbered from 1 in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementEvent {
    pub sequence: usize,
    pub sql: String,
    /// Issued by a helper that is allowed to cross gitlab_schema boundaries.
    pub restriction_suppressed: bool,
}

impl StatementEvent {
    pub fn new(sequence: usize, sql: impl Into<String>) -> Self {
        Self {
            sequence,
            sql: sql.into(),
            restriction_suppressed: false,
        }
    }

    /// Upper-cased first keyword, see [`leading_keyword`].
    pub fn keyword(&self) -> Option<String> {
        leading_keyword(&self.sql)
    }
}

/// Upper-cased first keyword of a statement, skipping whitespace, `--` line
/// comments, `/* */` block comments and opening parentheses.
pub fn leading_keyword(sql: &str) -> Option<String> {
    let mut rest = sql;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            break;
        }
    }
    let word: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphabetic() || *c == '_')
        .collect();
    (!word.is_empty()).then(|| word.to_ascii_uppercase())
}

#[async_trait]
pub trait StatementObserver: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Called before the statement is sent. An error aborts the statement.
    fn before_statement(&mut self, _event: &StatementEvent) -> Result<()> {
        Ok(())
    }

    /// Called after the statement succeeded.
    async fn after_statement(
        &mut self,
        _event: &StatementEvent,
        _conn: &mut dyn Connection,
    ) -> Result<()> {
        Ok(())
    }

    /// Called once after the migration body returned successfully.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Ordered set of observers plus the statement counter.
#[derive(Default)]
pub struct EventBus {
    observers: Vec<Box<dyn StatementObserver>>,
    sequence: usize,
    restriction_suppressed: bool,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Box<dyn StatementObserver>) {
        tracing::debug!("Subscribing statement observer {}", observer.name());
        self.observers.push(observer);
    }

    /// Number the next statement.
    pub fn next_event(&mut self, sql: &str) -> StatementEvent {
        self.sequence += 1;
        StatementEvent {
            sequence: self.sequence,
            sql: sql.to_string(),
            restriction_suppressed: self.restriction_suppressed,
        }
    }

    /// Mark following events as exempt from gitlab_schema restriction.
    pub fn set_restriction_suppressed(&mut self, suppressed: bool) {
        self.restriction_suppressed = suppressed;
    }

    pub fn before(&mut self, event: &StatementEvent) -> Result<()> {
        for observer in &mut self.observers {
            observer.before_statement(event)?;
        }
        Ok(())
    }

    pub async fn after(&mut self, event: &StatementEvent, conn: &mut dyn Connection) -> Result<()> {
        for observer in &mut self.observers {
            observer.after_statement(event, conn).await?;
        }
        Ok(())
    }

    /// Run every observer's final check, returning the first failure.
    pub fn finish(&mut self) -> Result<()> {
        for observer in &mut self.observers {
            observer.finish()?;
        }
        Ok(())
    }

    /// Drop all observers and reset numbering.
    pub fn clear(&mut self) {
        self.observers.clear();
        self.sequence = 0;
    }

    pub fn statement_count(&self) -> usize {
        self.sequence
    }
}
