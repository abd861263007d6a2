//! Statement analyzer keeping migrations inside their gitlab_schema.
//!
//! A migration that declares a schema (`restrict_gitlab_migration`) is a data
//! migration: it may not change the schema, and every table its statements
//! read or write must belong to the declared schema (shared and internal
//! tables are always allowed). A migration without a declaration is a schema
//! migration and may not touch application data.

use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::Arc;

use sqlparser::ast::{visit_relations, ObjectName, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use super::{GitlabSchema, SchemaRegistry};
use crate::error::{MigrateError, Result};
use crate::migration::events::{leading_keyword, StatementEvent, StatementObserver};

/// Session and transaction control, never analyzed.
const IGNORED_KEYWORDS: [&str; 10] = [
    "SET", "RESET", "SHOW", "BEGIN", "START", "COMMIT", "ROLLBACK", "SAVEPOINT", "RELEASE", "END",
];

/// Keywords classified as data access when the parser gives up.
const DML_KEYWORDS: [&str; 7] = ["SELECT", "INSERT", "UPDATE", "DELETE", "WITH", "COPY", "MERGE"];

/// What a statement does, as far as the restriction is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    /// Not subject to the restriction.
    Ignored,
    /// Schema change.
    Ddl,
    /// Data access over the listed tables.
    Dml(BTreeSet<String>),
}

/// Classify `sql`, resolving the relations of data-access statements.
pub fn classify(sql: &str) -> StatementKind {
    let Some(keyword) = leading_keyword(sql) else {
        return StatementKind::Ignored;
    };
    if IGNORED_KEYWORDS.contains(&keyword.as_str()) {
        return StatementKind::Ignored;
    }

    match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
        Ok(statements) => {
            let mut tables = BTreeSet::new();
            let mut any_dml = false;
            for statement in &statements {
                if !is_dml(statement) {
                    return StatementKind::Ddl;
                }
                any_dml = true;
                tables.extend(relations(statement));
            }
            if any_dml {
                StatementKind::Dml(tables)
            } else {
                StatementKind::Ignored
            }
        }
        Err(err) => {
            debug!("Falling back to keyword classification for unparsable statement: {}", err);
            if DML_KEYWORDS.contains(&keyword.as_str()) {
                StatementKind::Dml(BTreeSet::new())
            } else {
                StatementKind::Ddl
            }
        }
    }
}

fn is_dml(statement: &Statement) -> bool {
    matches!(
        statement,
        Statement::Query(_) | Statement::Insert(_) | Statement::Update { .. } | Statement::Delete(_)
    )
}

/// Relations referenced by a statement, minus names of its CTEs.
fn relations(statement: &Statement) -> BTreeSet<String> {
    let mut ctes = BTreeSet::new();
    if let Statement::Query(query) = statement {
        if let Some(with) = &query.with {
            ctes.extend(with.cte_tables.iter().map(|cte| cte.alias.name.value.clone()));
        }
    }

    let mut tables = BTreeSet::new();
    let _ = visit_relations(statement, |name: &ObjectName| {
        let joined = name
            .0
            .iter()
            .map(|ident| ident.value.clone())
            .collect::<Vec<_>>()
            .join(".");
        if !ctes.contains(&joined) {
            tables.insert(joined);
        }
        ControlFlow::<()>::Continue(())
    });
    tables
}

/// Before-statement observer enforcing the gitlab_schema restriction.
pub struct RestrictAllowedSchemas {
    registry: Arc<SchemaRegistry>,
    declared: Option<GitlabSchema>,
    migration: String,
}

impl RestrictAllowedSchemas {
    /// Analyzer for a migration that declared `declared` (or nothing).
    pub fn new(registry: Arc<SchemaRegistry>, declared: Option<GitlabSchema>, migration: impl Into<String>) -> Self {
        Self {
            registry,
            declared,
            migration: migration.into(),
        }
    }

    /// Check one statement.
    pub fn check(&self, sql: &str) -> Result<()> {
        match (classify(sql), self.declared) {
            (StatementKind::Ignored, _) => Ok(()),
            (StatementKind::Ddl, None) => Ok(()),
            (StatementKind::Ddl, Some(schema)) => Err(MigrateError::SchemaViolation(format!(
                "Migration {} is restricted to {} and may only modify data, but it runs DDL: {}. \
                 Move the schema change into a migration without restrict_gitlab_migration",
                self.migration,
                schema,
                sql.trim()
            ))),
            (StatementKind::Dml(tables), declared) => self.check_dml(&tables, declared, sql),
        }
    }

    fn check_dml(&self, tables: &BTreeSet<String>, declared: Option<GitlabSchema>, sql: &str) -> Result<()> {
        let mut schemas = BTreeSet::new();
        for table in tables {
            schemas.insert((self.registry.table_schema(table)?, table.as_str()));
        }
        let offending: Vec<String> = schemas
            .iter()
            .filter(|(schema, _)| !schema.is_ignored_for_restriction())
            .filter(|(schema, _)| Some(*schema) != declared)
            .map(|(schema, table)| format!("{} ({})", table, schema))
            .collect();
        if offending.is_empty() {
            return Ok(());
        }

        let message = match declared {
            Some(schema) => format!(
                "Migration {} is restricted to {} but accesses {}: {}",
                self.migration,
                schema,
                offending.join(", "),
                sql.trim()
            ),
            None => format!(
                "Migration {} is a schema migration and may not modify data of {}: {}. \
                 Declare restrict_gitlab_migration for data migrations",
                self.migration,
                offending.join(", "),
                sql.trim()
            ),
        };
        Err(MigrateError::SchemaViolation(message))
    }
}

impl StatementObserver for RestrictAllowedSchemas {
    fn name(&self) -> &'static str {
        "restrict_allowed_schemas"
    }

    fn before_statement(&mut self, event: &StatementEvent) -> Result<()> {
        if event.restriction_suppressed {
            return Ok(());
        }
        self.check(&event.sql)
    }
}
