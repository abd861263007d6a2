//! gitlab_schema classification of tables and databases.
//!
//! Every table belongs to exactly one [`GitlabSchema`]. A logical database
//! (`main`, `ci`, ...) serves a set of schemas; a migration that declares a
//! schema only runs on databases serving it, and the
//! [`RestrictAllowedSchemas`](analyzer::RestrictAllowedSchemas) analyzer keeps
//! each statement inside that boundary.

pub mod analyzer;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::identifier::QualifiedTable;
use crate::error::{MigrateError, Result};

pub use analyzer::RestrictAllowedSchemas;

/// Logical partition a table belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitlabSchema {
    GitlabMain,
    GitlabMainCell,
    GitlabMainClusterwide,
    GitlabCi,
    GitlabSec,
    GitlabPm,
    GitlabShared,
    GitlabInternal,
    GitlabGeo,
    GitlabEmbedding,
}

impl GitlabSchema {
    pub const ALL: [GitlabSchema; 10] = [
        GitlabSchema::GitlabMain,
        GitlabSchema::GitlabMainCell,
        GitlabSchema::GitlabMainClusterwide,
        GitlabSchema::GitlabCi,
        GitlabSchema::GitlabSec,
        GitlabSchema::GitlabPm,
        GitlabSchema::GitlabShared,
        GitlabSchema::GitlabInternal,
        GitlabSchema::GitlabGeo,
        GitlabSchema::GitlabEmbedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GitlabSchema::GitlabMain => "gitlab_main",
            GitlabSchema::GitlabMainCell => "gitlab_main_cell",
            GitlabSchema::GitlabMainClusterwide => "gitlab_main_clusterwide",
            GitlabSchema::GitlabCi => "gitlab_ci",
            GitlabSchema::GitlabSec => "gitlab_sec",
            GitlabSchema::GitlabPm => "gitlab_pm",
            GitlabSchema::GitlabShared => "gitlab_shared",
            GitlabSchema::GitlabInternal => "gitlab_internal",
            GitlabSchema::GitlabGeo => "gitlab_geo",
            GitlabSchema::GitlabEmbedding => "gitlab_embedding",
        }
    }

    /// Schemas every database may read and write regardless of restriction.
    pub fn is_ignored_for_restriction(&self) -> bool {
        matches!(self, GitlabSchema::GitlabShared | GitlabSchema::GitlabInternal)
    }
}

impl fmt::Display for GitlabSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GitlabSchema {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().trim_start_matches(':');
        GitlabSchema::ALL
            .iter()
            .copied()
            .find(|schema| schema.as_str() == wanted)
            .ok_or_else(|| MigrateError::Config(format!("Unknown gitlab_schema '{}'", s)))
    }
}

/// PostgreSQL schemas whose relations are always `gitlab_internal`.
const INTERNAL_NAMESPACES: [&str; 2] = ["pg_catalog", "information_schema"];

/// Bookkeeping tables owned by the migration machinery.
const INTERNAL_TABLES: [&str; 2] = ["schema_migrations", "ar_internal_metadata"];

/// Resolves database -> allowed schemas and table -> schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaRegistry {
    databases: BTreeMap<String, BTreeSet<GitlabSchema>>,
    tables: BTreeMap<String, GitlabSchema>,
}

impl SchemaRegistry {
    /// Registry with the standard database layout and no table assignments.
    pub fn with_defaults() -> Self {
        use GitlabSchema::*;

        let mut registry = Self::default();
        registry.set_database(
            "main",
            [GitlabMain, GitlabMainCell, GitlabMainClusterwide, GitlabPm, GitlabSec, GitlabShared, GitlabInternal],
        );
        registry.set_database("ci", [GitlabCi, GitlabShared, GitlabInternal]);
        registry.set_database("sec", [GitlabSec, GitlabShared, GitlabInternal]);
        registry.set_database("embedding", [GitlabEmbedding, GitlabShared, GitlabInternal]);
        registry.set_database("geo", [GitlabGeo, GitlabShared, GitlabInternal]);
        registry
    }

    /// Replace the schemas served by `database`.
    pub fn set_database(&mut self, database: &str, schemas: impl IntoIterator<Item = GitlabSchema>) {
        self.databases
            .insert(database.to_string(), schemas.into_iter().collect());
    }

    /// Assign a table to a schema.
    pub fn assign_table(&mut self, table: &str, schema: GitlabSchema) {
        self.tables.insert(table.to_string(), schema);
    }

    /// Schemas served by `database`.
    pub fn allowed_schemas(&self, database: &str) -> Result<&BTreeSet<GitlabSchema>> {
        self.databases.get(database).ok_or_else(|| {
            MigrateError::Config(format!(
                "Database '{}' has no gitlab_schema configuration (known: {})",
                database,
                self.databases.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    /// Whether a migration declaring `schema` should run on `database`.
    pub fn database_allows(&self, database: &str, schema: GitlabSchema) -> Result<bool> {
        Ok(self.allowed_schemas(database)?.contains(&schema))
    }

    /// Schema owning `table` (`name` or `namespace.name`).
    pub fn table_schema(&self, table: &str) -> Result<GitlabSchema> {
        let qualified = QualifiedTable::parse(table);
        if let Some(namespace) = qualified.schema.as_deref() {
            if INTERNAL_NAMESPACES.contains(&namespace) {
                return Ok(GitlabSchema::GitlabInternal);
            }
        }
        if let Some(schema) = self
            .tables
            .get(table)
            .or_else(|| self.tables.get(&qualified.name))
        {
            return Ok(*schema);
        }
        if qualified.name.starts_with("pg_") || INTERNAL_TABLES.contains(&qualified.name.as_str()) {
            return Ok(GitlabSchema::GitlabInternal);
        }
        Err(MigrateError::SchemaViolation(format!(
            "Table '{}' is not assigned to any gitlab_schema. Add it to the schemas.tables configuration",
            table
        )))
    }

    /// Number of tables with an explicit assignment.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schema_names() {
        assert_eq!("gitlab_ci".parse::<GitlabSchema>().unwrap(), GitlabSchema::GitlabCi);
        assert_eq!(":gitlab_main".parse::<GitlabSchema>().unwrap(), GitlabSchema::GitlabMain);
        assert!("gitlab_nope".parse::<GitlabSchema>().is_err());
        for schema in GitlabSchema::ALL {
            assert_eq!(schema.as_str().parse::<GitlabSchema>().unwrap(), schema);
        }
    }

    #[test]
    fn test_default_databases() {
        let registry = SchemaRegistry::with_defaults();
        assert!(registry.database_allows("main", GitlabSchema::GitlabMain).unwrap());
        assert!(!registry.database_allows("main", GitlabSchema::GitlabCi).unwrap());
        assert!(registry.database_allows("ci", GitlabSchema::GitlabCi).unwrap());
        assert!(registry.database_allows("ci", GitlabSchema::GitlabShared).unwrap());
        assert!(registry.allowed_schemas("warehouse").is_err());
    }

    #[test]
    fn test_table_schema_resolution() {
        let mut registry = SchemaRegistry::with_defaults();
        registry.assign_table("projects", GitlabSchema::GitlabMain);
        registry.assign_table("ci_builds", GitlabSchema::GitlabCi);

        assert_eq!(registry.table_schema("projects").unwrap(), GitlabSchema::GitlabMain);
        assert_eq!(registry.table_schema("public.ci_builds").unwrap(), GitlabSchema::GitlabCi);
        assert_eq!(registry.table_schema("pg_class").unwrap(), GitlabSchema::GitlabInternal);
        assert_eq!(
            registry.table_schema("information_schema.tables").unwrap(),
            GitlabSchema::GitlabInternal
        );
        assert_eq!(registry.table_schema("schema_migrations").unwrap(), GitlabSchema::GitlabInternal);
        assert!(matches!(
            registry.table_schema("mystery"),
            Err(MigrateError::SchemaViolation(_))
        ));
    }
}
