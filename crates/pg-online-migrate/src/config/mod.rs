//! Configuration loading, environment overrides and validation.

mod types;
mod validation;

pub use types::*;

use std::path::Path;
use std::time::Duration;

use tracing::info;

use crate::error::Result;
use crate::locking::retries::TimingConfiguration;
use crate::schema::SchemaRegistry;

/// Forces lock-retry blocks to run once, without a lock timeout.
pub const ENV_DISABLE_LOCK_RETRIES: &str = "DISABLE_LOCK_RETRIES";
/// Disables write-lock triggers on newly created tables of foreign schemas.
pub const ENV_SKIP_AUTOMATIC_LOCK_ON_WRITES: &str = "SKIP_AUTOMATIC_LOCK_ON_WRITES";
/// Skips the anti-wraparound autovacuum check.
pub const ENV_DISABLE_WRAPAROUND_CHECK: &str = "GITLAB_MIGRATIONS_DISABLE_WRAPAROUND_CHECK";

/// Whether an environment value means "enabled" (`1`, `t`, `true`, `y`, `yes`, `on`).
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "t" | "true" | "y" | "yes" | "on"
    )
}

/// Whether the environment variable `name` is set to a truthy value.
pub fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| is_truthy(&v)).unwrap_or(false)
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Variables only ever switch a flag on; an unset or falsy variable keeps
    /// the file value.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |name: &str| lookup(name).map(|v| is_truthy(&v)).unwrap_or(false);

        if flag(ENV_DISABLE_LOCK_RETRIES) {
            info!("{} is set, lock retries are disabled", ENV_DISABLE_LOCK_RETRIES);
            self.migration.disable_lock_retries = true;
        }
        if flag(ENV_SKIP_AUTOMATIC_LOCK_ON_WRITES) {
            info!("{} is set, write locks will not be installed", ENV_SKIP_AUTOMATIC_LOCK_ON_WRITES);
            self.migration.skip_automatic_lock_on_writes = true;
        }
        if flag(ENV_DISABLE_WRAPAROUND_CHECK) {
            self.migration.disable_wraparound_check = true;
        }
    }

    /// Lock-retry timing tiers in effect.
    pub fn timing_configuration(&self) -> TimingConfiguration {
        match &self.migration.lock_retry_timings {
            Some(entries) => TimingConfiguration::new(
                entries
                    .iter()
                    .map(|e| {
                        (
                            Duration::from_millis(e.lock_timeout_ms),
                            Duration::from_millis(e.sleep_ms),
                        )
                    })
                    .collect(),
            ),
            None => TimingConfiguration::default(),
        }
    }

    /// Built-in layout overlaid with the `schemas` section.
    pub fn schema_registry(&self) -> SchemaRegistry {
        let mut registry = SchemaRegistry::with_defaults();
        for (database, schemas) in &self.schemas.databases {
            registry.set_database(database, schemas.iter().copied());
        }
        for (table, schema) in &self.schemas.tables {
            registry.assign_table(table, *schema);
        }
        registry
    }
}

impl DatabaseConfig {
    /// Connection string for logs, without the password.
    pub fn display_target(&self) -> String {
        format!(
            "{}@{}:{}/{} (sslmode={})",
            self.user, self.host, self.port, self.database, self.ssl_mode
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::GitlabSchema;

    const YAML: &str = r#"
database:
  host: db.internal
  database: gitlabhq_production
  user: gitlab
  password: secret
  ssl_mode: disable
  name: ci
migration:
  lock_retry_timings:
    - { lock_timeout_ms: 100, sleep_ms: 50 }
    - { lock_timeout_ms: 500, sleep_ms: 2000 }
schemas:
  databases:
    ci: [gitlab_ci, gitlab_shared, gitlab_internal, gitlab_main]
  tables:
    ci_builds: gitlab_ci
"#;

    #[test]
    fn test_from_yaml_with_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.database.schema, "public");
        assert_eq!(config.migration.migrations_table, "schema_migrations");
        assert_eq!(config.timing_configuration().len(), 2);

        let registry = config.schema_registry();
        assert!(registry.database_allows("ci", GitlabSchema::GitlabMain).unwrap());
        assert_eq!(registry.table_schema("ci_builds").unwrap(), GitlabSchema::GitlabCi);
    }

    #[test]
    fn test_password_not_serialized() {
        let config = Config::from_yaml(YAML).unwrap();
        let out = serde_yaml::to_string(&config).unwrap();
        assert!(!out.contains("secret"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::from_yaml(YAML).unwrap();
        config.apply_overrides_from(|name| match name {
            ENV_DISABLE_LOCK_RETRIES => Some("Yes".to_string()),
            ENV_SKIP_AUTOMATIC_LOCK_ON_WRITES => Some("0".to_string()),
            ENV_DISABLE_WRAPAROUND_CHECK => Some("on".to_string()),
            _ => None,
        });
        assert!(config.migration.disable_lock_retries);
        assert!(!config.migration.skip_automatic_lock_on_writes);
        assert!(config.migration.disable_wraparound_check);
    }

    #[test]
    fn test_truthy_values() {
        for v in ["1", "t", "TRUE", "y", "yes", "On"] {
            assert!(is_truthy(v), "{} should be truthy", v);
        }
        for v in ["0", "false", "no", "off", ""] {
            assert!(!is_truthy(v), "{} should be falsy", v);
        }
    }

    #[test]
    fn test_display_target_omits_password() {
        let config = Config::from_yaml(YAML).unwrap();
        let target = config.database.display_target();
        assert!(target.contains("db.internal:5432/gitlabhq_production"));
        assert!(!target.contains("secret"));
    }
}
