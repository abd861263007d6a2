//! Centralized identifier validation, quoting and deterministic name derivation.
//!
//! SQL identifiers (table, column, index, trigger names) cannot be passed as
//! statement parameters, so every DDL helper in this crate builds its SQL
//! through the functions below:
//!
//! 1. Validate identifiers (empty, null bytes, PostgreSQL's 63-byte limit)
//! 2. Quote with double quotes, doubling embedded quotes
//!
//! Generated object names (triggers, functions, temporary and bigint indexes,
//! foreign keys) are derived from a SHA-256 digest of their inputs so that an
//! install step and a later teardown step can recompute the same name without
//! any bookkeeping table.

use sha2::{Digest, Sha256};

use crate::error::{MigrateError, Result};

/// PostgreSQL's `NAMEDATALEN - 1`.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Validate an identifier for security issues and length.
///
/// Rejects:
/// - Empty identifiers
/// - Identifiers containing null bytes (injection vector)
/// - Identifiers exceeding 63 bytes (PostgreSQL would silently truncate them)
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::IdentifierTooLong {
            name: name.to_string(),
            len: name.len(),
            max: MAX_IDENTIFIER_LENGTH,
        });
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
///
/// ```ignore
/// assert_eq!(quote_ident("users")?, "\"users\"");
/// assert_eq!(quote_ident("table\"name")?, "\"table\"\"name\"");
/// ```
pub fn quote_ident(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Qualify a table name with its schema: `"schema"."table"`.
pub fn qualify(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(table)?))
}

/// Quote a value as a SQL string literal (`'it''s'`), or `NULL`.
pub fn quote_literal(value: Option<&str>) -> String {
    match value {
        Some(v) => format!("'{}'", v.replace('\'', "''")),
        None => "NULL".to_string(),
    }
}

/// A table reference that may carry an explicit schema (`schema.table`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedTable {
    pub schema: Option<String>,
    pub name: String,
}

impl QualifiedTable {
    /// Split `schema.table` on the first dot. A bare name has no schema.
    pub fn parse(identifier: &str) -> Self {
        match identifier.split_once('.') {
            Some((schema, name)) if !schema.is_empty() && !name.is_empty() => Self {
                schema: Some(schema.to_string()),
                name: name.to_string(),
            },
            _ => Self {
                schema: None,
                name: identifier.to_string(),
            },
        }
    }

    /// Quoted form, schema-qualified only if a schema was given.
    pub fn quoted(&self) -> Result<String> {
        match &self.schema {
            Some(schema) => qualify(schema, &self.name),
            None => quote_ident(&self.name),
        }
    }

    /// Schema to use for catalog lookups.
    pub fn schema_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.schema.as_deref().unwrap_or(default)
    }
}

impl std::fmt::Display for QualifiedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// `prefix` followed by the first `hex_len` hex chars of SHA-256(`input`).
pub fn hashed_name(prefix: &str, input: &str, hex_len: usize) -> String {
    let digest = hex::encode(Sha256::digest(input.as_bytes()));
    format!("{}{}", prefix, &digest[..hex_len.min(digest.len())])
}

/// Trigger name used by rename and copy triggers over column lists.
pub fn rename_trigger_name(table: &str, old: &str, new: &str) -> String {
    hashed_name("trigger_", &format!("{}_{}_{}", table, old, new), 12)
}

/// Operations that get their own trigger in a bidirectional pair.
pub const BIDIRECTIONAL_OPERATIONS: [&str; 3] = ["insert", "update_old", "update_new"];

/// Names of the insert, update-old and update-new triggers for a column rename.
pub fn bidirectional_trigger_names(table: &str, old: &str, new: &str) -> [String; 3] {
    BIDIRECTIONAL_OPERATIONS
        .map(|op| hashed_name("trigger_", &format!("{}_{}_{}_{}", table, old, new, op), 12))
}

/// Function backing a generated trigger.
pub fn function_name_for_trigger(trigger_name: &str) -> String {
    format!("function_for_{}", trigger_name)
}

/// Name of the bigint twin of an integer column index.
///
/// Only the original index name is hashed, so the result does not depend on
/// the table and is stable across runs.
pub fn bigint_index_name(int_column_index_name: &str) -> String {
    hashed_name("bigint_idx_", int_column_index_name, 20)
}

/// Temporary name used while swapping two indexes.
pub fn temp_index_name(table: &str, index: &str) -> String {
    hashed_name("temp_", &format!("index_{}_on_{}", index, table), 10)
}

/// Temporary name used while swapping columns or constraints.
pub const TEMP_RENAME_NAME: &str = "temp_name_for_renaming";

/// Deterministic foreign key name for `table.column`.
pub fn concurrent_foreign_key_name(table: &str, column: &str) -> String {
    hashed_name("fk_", &format!("{}_{}_fk", table, column), 10)
}

/// Shadow column used while widening an integer column to bigint.
pub fn convert_to_bigint_column(column: &str) -> String {
    format!("{}_convert_to_bigint", column)
}
