//! Migrations written as plain SQL files.
//!
//! A file named `<version>_<name>.sql` holds the `up` statements, optionally
//! followed by a `-- migrate:down` line and the `down` statements. Whole-line
//! comments configure the migration:
//!
//! ```sql
//! -- gitlab_schema: gitlab_main
//! -- disable_ddl_transaction
//! -- enable_lock_retries
//! -- skip_multiple_table_lock_check
//! UPDATE projects SET archived = false WHERE archived IS NULL;
//!
//! -- migrate:down
//! SELECT 1;
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use tracing::debug;

use super::{Migration, MigrationContext};
use crate::error::{MigrateError, Result};
use crate::migration::events::leading_keyword;
use crate::schema::GitlabSchema;

const DOWN_SEPARATOR: &str = "migrate:down";

/// A migration loaded from a `.sql` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlFileMigration {
    version: i64,
    name: String,
    path: PathBuf,
    up: Vec<String>,
    down: Option<Vec<String>>,
    gitlab_schema: Option<GitlabSchema>,
    disable_ddl_transaction: bool,
    enable_lock_retries: bool,
    skip_multiple_table_lock_check: bool,
}

impl SqlFileMigration {
    /// Load one migration file.
    pub fn load(path: &Path) -> Result<Self> {
        let (version, name) = parse_file_name(path)?;
        let content = fs::read_to_string(path)?;
        Self::parse(version, name, path.to_path_buf(), &content)
    }

    /// Build a migration from file content.
    pub fn parse(version: i64, name: impl Into<String>, path: PathBuf, content: &str) -> Result<Self> {
        let mut migration = Self {
            version,
            name: name.into(),
            path,
            up: Vec::new(),
            down: None,
            gitlab_schema: None,
            disable_ddl_transaction: false,
            enable_lock_retries: false,
            skip_multiple_table_lock_check: false,
        };

        let mut up = String::new();
        let mut down: Option<String> = None;
        for line in content.lines() {
            let directive = line.trim().strip_prefix("--").map(str::trim);
            match directive {
                Some(DOWN_SEPARATOR) => {
                    if down.is_some() {
                        return Err(migration.invalid("more than one '-- migrate:down' separator"));
                    }
                    down = Some(String::new());
                    continue;
                }
                Some(text) if down.is_none() => {
                    if migration.apply_directive(text)? {
                        continue;
                    }
                }
                _ => {}
            }
            let target = down.as_mut().unwrap_or(&mut up);
            target.push_str(line);
            target.push('\n');
        }

        migration.up = split_statements(&up);
        migration.down = down.map(|sql| split_statements(&sql));
        if migration.up.is_empty() {
            return Err(migration.invalid("no statements before '-- migrate:down'"));
        }
        if migration.disable_ddl_transaction && migration.enable_lock_retries {
            return Err(migration.invalid(
                "enable_lock_retries requires the DDL transaction, remove disable_ddl_transaction",
            ));
        }
        Ok(migration)
    }

    /// Load every `.sql` migration in `dir`, ordered by version.
    pub fn load_dir(dir: &Path) -> Result<Vec<Self>> {
        let mut migrations = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            debug!("Loading migration file {}", path.display());
            migrations.push(Self::load(&path)?);
        }
        migrations.sort_by_key(|m| m.version);

        for pair in migrations.windows(2) {
            if pair[0].version == pair[1].version {
                return Err(MigrateError::Config(format!(
                    "Duplicate migration version {} in {} and {}",
                    pair[0].version,
                    pair[0].path.display(),
                    pair[1].path.display()
                )));
            }
        }
        Ok(migrations)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn up_statements(&self) -> &[String] {
        &self.up
    }

    pub fn down_statements(&self) -> Option<&[String]> {
        self.down.as_deref()
    }

    /// Returns true when `text` was a directive.
    fn apply_directive(&mut self, text: &str) -> Result<bool> {
        if let Some(schema) = text.strip_prefix("gitlab_schema:") {
            self.gitlab_schema = Some(GitlabSchema::from_str(schema)?);
            return Ok(true);
        }
        match text {
            "disable_ddl_transaction" => self.disable_ddl_transaction = true,
            "enable_lock_retries" => self.enable_lock_retries = true,
            "skip_multiple_table_lock_check" => self.skip_multiple_table_lock_check = true,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn invalid(&self, message: &str) -> MigrateError {
        MigrateError::Config(format!("{}: {}", self.path.display(), message))
    }
}

fn parse_file_name(path: &Path) -> Result<(i64, String)> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| MigrateError::Config(format!("Invalid migration file name: {}", path.display())))?;
    let (version, name) = stem.split_once('_').unwrap_or((stem, ""));
    let version = version.parse::<i64>().map_err(|_| {
        MigrateError::Config(format!(
            "Migration file {} must be named <version>_<name>.sql",
            path.display()
        ))
    })?;
    if name.is_empty() {
        return Err(MigrateError::Config(format!(
            "Migration file {} has no name after the version",
            path.display()
        )));
    }
    Ok((version, name.to_string()))
}

/// Split a SQL script on `;`, ignoring semicolons inside quotes, comments
/// and dollar-quoted bodies. Chunks without any statement are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut i = 0;

    let mut push = |chunk: &str| {
        let chunk = chunk.trim();
        if leading_keyword(chunk).is_some() {
            statements.push(chunk.to_string());
        }
    };

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => i = skip_quoted(bytes, i, quote),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = sql[i..].find('\n').map(|n| i + n + 1).unwrap_or(bytes.len());
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b'$' => match dollar_tag(bytes, i) {
                Some(tag_end) => {
                    let tag = &sql[i..=tag_end];
                    i = sql[tag_end + 1..]
                        .find(tag)
                        .map(|n| tag_end + 1 + n + tag.len())
                        .unwrap_or(bytes.len());
                }
                None => i += 1,
            },
            b';' => {
                push(&sql[start..i]);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    push(&sql[start..]);
    statements
}

/// Index just past the closing quote; doubled quotes are escapes.
fn skip_quoted(bytes: &[u8], open: usize, quote: u8) -> usize {
    let mut i = open + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Block comments nest in PostgreSQL.
fn skip_block_comment(bytes: &[u8], open: usize) -> usize {
    let mut depth = 0;
    let mut i = open;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// End index of a `$tag$` opener at `start`, if there is one. `$1` style
/// parameters are not tags.
fn dollar_tag(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    match bytes.get(i) {
        Some(b'$') => return Some(i),
        Some(c) if c.is_ascii_alphabetic() || *c == b'_' => {}
        _ => return None,
    }
    while let Some(c) = bytes.get(i) {
        match c {
            b'$' => return Some(i),
            c if c.is_ascii_alphanumeric() || *c == b'_' => i += 1,
            _ => return None,
        }
    }
    None
}

#[async_trait]
impl Migration for SqlFileMigration {
    fn version(&self) -> i64 {
        self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn disable_ddl_transaction(&self) -> bool {
        self.disable_ddl_transaction
    }

    fn enable_lock_retries(&self) -> bool {
        self.enable_lock_retries
    }

    fn restrict_gitlab_migration(&self) -> Option<GitlabSchema> {
        self.gitlab_schema
    }

    fn skip_multiple_table_lock_check(&self) -> bool {
        self.skip_multiple_table_lock_check
    }

    async fn up(&self, ctx: &mut MigrationContext) -> Result<()> {
        for sql in &self.up {
            ctx.execute(sql).await?;
        }
        Ok(())
    }

    async fn down(&self, ctx: &mut MigrationContext) -> Result<()> {
        let Some(statements) = &self.down else {
            return Err(MigrateError::migration(
                self.version,
                format!("{} has no '-- migrate:down' section and is irreversible", self.name),
            ));
        };
        for sql in statements {
            ctx.execute(sql).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_split_statements() {
        let sql = "
            -- leading comment; with a semicolon
            INSERT INTO a (v) VALUES ('x;y'), ('it''s');
            CREATE FUNCTION f() RETURNS trigger AS $body$
            BEGIN
              NEW.a := 1; RETURN NEW;
            END
            $body$ LANGUAGE plpgsql;
            /* outer /* nested; */ still comment; */ SELECT \"odd;name\" FROM b WHERE c = $1;
            -- trailing comment only
        ";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 3);
        assert!(statements[0].ends_with("('it''s')"));
        assert!(statements[1].contains("NEW.a := 1; RETURN NEW;"));
        assert!(statements[1].ends_with("LANGUAGE plpgsql"));
        assert!(statements[2].ends_with("WHERE c = $1"));
    }

    #[test]
    fn test_parse_directives_and_down_section() {
        let content = "-- gitlab_schema: gitlab_ci\n\
                       -- skip_multiple_table_lock_check\n\
                       UPDATE ci_builds SET status = 'failed' WHERE status IS NULL;\n\
                       -- migrate:down\n\
                       -- gitlab_schema: gitlab_main\n\
                       SELECT 1;\n";
        let migration = SqlFileMigration::parse(1, "fix_builds", PathBuf::from("1_fix_builds.sql"), content).unwrap();

        assert_eq!(migration.restrict_gitlab_migration(), Some(GitlabSchema::GitlabCi));
        assert!(migration.skip_multiple_table_lock_check());
        assert!(!migration.disable_ddl_transaction());
        assert_eq!(migration.up_statements().len(), 1);
        // directives are only read from the up section
        assert_eq!(migration.down_statements().unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_conflicting_directives() {
        let content = "-- disable_ddl_transaction\n-- enable_lock_retries\nSELECT 1;";
        let err = SqlFileMigration::parse(1, "x", PathBuf::from("1_x.sql"), content).unwrap_err();
        assert!(err.to_string().contains("enable_lock_retries requires the DDL transaction"));
    }

    #[test]
    fn test_rejects_unknown_schema() {
        let content = "-- gitlab_schema: gitlab_nope\nSELECT 1;";
        assert!(SqlFileMigration::parse(1, "x", PathBuf::from("1_x.sql"), content).is_err());
    }

    #[test]
    fn test_load_dir() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("20240102000000_second.sql"), "ALTER TABLE a ADD COLUMN b int;").unwrap();
        fs::write(dir.path().join("20240101000000_first.sql"), "CREATE TABLE a (id bigint);").unwrap();
        fs::write(dir.path().join("README.md"), "not a migration").unwrap();

        let migrations = SqlFileMigration::load_dir(dir.path()).unwrap();
        assert_eq!(
            migrations.iter().map(|m| (m.version(), m.name().to_string())).collect::<Vec<_>>(),
            vec![(20240101000000, "first".to_string()), (20240102000000, "second".to_string())]
        );
    }

    #[test]
    fn test_load_dir_rejects_bad_names_and_duplicates() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("first.sql"), "SELECT 1;").unwrap();
        assert!(SqlFileMigration::load_dir(dir.path()).is_err());

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("1_a.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("1_b.sql"), "SELECT 2;").unwrap();
        let err = SqlFileMigration::load_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Duplicate migration version 1"));
    }
}
