//! Recording connection used by unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::core::connection::{Connection, Record};
use crate::error::{MigrateError, Result};

#[derive(Default)]
struct Script {
    statements: Vec<String>,
    responses: Vec<(String, Vec<Record>)>,
    queued: Vec<(String, VecDeque<Vec<Record>>)>,
    lock_timeouts: Vec<(String, usize)>,
}

/// A [`Connection`] that records every statement and answers queries from
/// scripted responses matched by substring.
///
/// Query patterns are matched against `"<sql> [<param1>, <param2>]"`, so a
/// response can target a specific table or column lookup.
///
/// Clones share the same script, so a test can keep a handle for assertions
/// after moving the connection into a context.
#[derive(Clone, Default)]
pub struct FakeConnection {
    script: Arc<Mutex<Script>>,
    depth: usize,
}

impl FakeConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every query containing `pattern` with `rows`.
    pub fn respond(&self, pattern: &str, rows: Vec<Record>) -> &Self {
        self.script
            .lock()
            .unwrap()
            .responses
            .push((pattern.to_string(), rows));
        self
    }

    /// Answer the next query containing `pattern` with `rows` (FIFO per pattern).
    pub fn respond_once(&self, pattern: &str, rows: Vec<Record>) -> &Self {
        let mut script = self.script.lock().unwrap();
        if let Some((_, queue)) = script.queued.iter_mut().find(|(p, _)| p == pattern) {
            queue.push_back(rows);
        } else {
            script
                .queued
                .push((pattern.to_string(), VecDeque::from([rows])));
        }
        self
    }

    /// Fail the next `times` statements containing `pattern` with a lock timeout.
    pub fn fail_with_lock_timeout(&self, pattern: &str, times: usize) -> &Self {
        self.script
            .lock()
            .unwrap()
            .lock_timeouts
            .push((pattern.to_string(), times));
        self
    }

    /// Every statement seen so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.script.lock().unwrap().statements.clone()
    }

    /// Statements containing `pattern`.
    pub fn statements_matching(&self, pattern: &str) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| s.contains(pattern))
            .collect()
    }

    fn record(&self, sql: &str) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        script.statements.push(sql.to_string());
        for (pattern, remaining) in script.lock_timeouts.iter_mut() {
            if *remaining > 0 && sql.contains(pattern.as_str()) {
                *remaining -= 1;
                return Err(MigrateError::LockTimeout(
                    "canceling statement due to lock timeout".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn answer(&self, sql: &str) -> Vec<Record> {
        let mut script = self.script.lock().unwrap();
        for (pattern, queue) in script.queued.iter_mut() {
            if sql.contains(pattern.as_str()) {
                if let Some(rows) = queue.pop_front() {
                    return rows;
                }
            }
        }
        script
            .responses
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.record(sql)
    }

    async fn query(&mut self, sql: &str, params: &[&str]) -> Result<Vec<Record>> {
        self.record(sql)?;
        Ok(self.answer(&format!("{} [{}]", sql, params.join(", "))))
    }

    fn transaction_depth(&self) -> usize {
        self.depth
    }

    fn set_transaction_depth(&mut self, depth: usize) {
        self.depth = depth;
    }
}

/// Single-column rows, e.g. `rows("relname", &["a", "b"])`.
pub fn rows(column: &str, values: &[&str]) -> Vec<Record> {
    values
        .iter()
        .map(|v| Record::from_pairs(&[(column, Some(v))]))
        .collect()
}
