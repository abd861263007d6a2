//! Application and namespace setting helpers.

use std::sync::OnceLock;

use regex::Regex;
use tracing::info;

use super::TableRef;
use crate::core::catalog;
use crate::core::identifier::{quote_ident, quote_literal};
use crate::error::{MigrateError, Result};
use crate::migration::MigrationContext;

const NAMESPACE_SETTINGS: &str = "namespace_settings";
const APPLICATION_SETTINGS: &str = "application_settings";

/// Type names such as `boolean`, `character varying(255)`, `numeric(10, 2)`
/// or `text[]`.
fn data_type_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^[a-z_][a-z0-9_]*( [a-z_][a-z0-9_]*)*(\(\s*\d+\s*(,\s*\d+\s*)?\))?(\[\])?$")
            .expect("static pattern")
    })
}

fn validate_data_type(data_type: &str) -> Result<()> {
    if data_type_pattern().is_match(data_type) {
        return Ok(());
    }
    Err(MigrateError::usage(format!("Invalid column type for setting: {:?}", data_type)))
}

/// Add a setting that cascades from application to namespace level.
///
/// Creates `<setting>` and `lock_<setting>` on both `namespace_settings` and
/// `application_settings`. Namespace values are nullable so they inherit the
/// parent value; the application column gets `default` and `null`.
pub async fn add_cascading_namespace_setting(
    ctx: &mut MigrationContext,
    setting: &str,
    data_type: &str,
    default: Option<&str>,
    null: bool,
) -> Result<()> {
    validate_data_type(data_type)?;
    let lock_column = format!("lock_{}", setting);
    let mut existing = Vec::new();
    for table in [NAMESPACE_SETTINGS, APPLICATION_SETTINGS] {
        let target = TableRef::resolve(ctx, table)?;
        for column in [setting, lock_column.as_str()] {
            if catalog::column_exists(ctx.connection(), &target.schema, table, column).await? {
                existing.push(format!("{}.{}", table, column));
            }
        }
    }
    if !existing.is_empty() {
        return Err(MigrateError::usage(format!(
            "Cascading setting {} can not be added, these columns already exist: {}",
            setting,
            existing.join(", ")
        )));
    }

    let (setting_col, lock_col) = (quote_ident(setting)?, quote_ident(&lock_column)?);
    let mut application = format!("{} {}", setting_col, data_type);
    if let Some(value) = default {
        application.push_str(&format!(" DEFAULT {}::{}", quote_literal(Some(value)), data_type));
    }
    if !null {
        application.push_str(" NOT NULL");
    }

    info!("Adding cascading namespace setting {}", setting);
    ctx.execute_with_lock_retries(vec![
        format!(
            "ALTER TABLE {} ADD COLUMN {} {}, ADD COLUMN {} boolean DEFAULT false NOT NULL",
            quote_ident(NAMESPACE_SETTINGS)?,
            setting_col,
            data_type,
            lock_col
        ),
        format!(
            "ALTER TABLE {} ADD COLUMN {}, ADD COLUMN {} boolean DEFAULT false NOT NULL",
            quote_ident(APPLICATION_SETTINGS)?,
            application,
            lock_col
        ),
    ])
    .await
}

/// Drop the columns created by [`add_cascading_namespace_setting`].
pub async fn remove_cascading_namespace_setting(ctx: &mut MigrationContext, setting: &str) -> Result<()> {
    let (setting_col, lock_col) = (quote_ident(setting)?, quote_ident(&format!("lock_{}", setting))?);
    let mut statements = Vec::with_capacity(2);
    for table in [NAMESPACE_SETTINGS, APPLICATION_SETTINGS] {
        statements.push(format!(
            "ALTER TABLE {} DROP COLUMN IF EXISTS {}, DROP COLUMN IF EXISTS {}",
            quote_ident(table)?,
            setting_col,
            lock_col
        ));
    }
    ctx.execute_with_lock_retries(statements).await
}

/// Whether a feature flag is enabled, falling back to `default_enabled` when
/// the flag was never persisted.
pub async fn feature_flag_enabled(ctx: &mut MigrationContext, flag: &str, default_enabled: bool) -> Result<bool> {
    let persisted = ctx
        .select_value("SELECT key FROM features WHERE key = $1", &[flag])
        .await?;
    if persisted.is_none() {
        return Ok(default_enabled);
    }
    let gate = ctx
        .select_value(
            "SELECT value FROM feature_gates WHERE feature_key = $1 AND key = 'boolean'",
            &[flag],
        )
        .await?;
    Ok(gate.as_deref() == Some("true"))
}

/// Copy a boolean feature flag into an `application_settings` column.
pub async fn migrate_feature_flag_to_setting(
    ctx: &mut MigrationContext,
    flag: &str,
    setting: &str,
    default_enabled: bool,
) -> Result<()> {
    let (table, column) = (quote_ident(APPLICATION_SETTINGS)?, quote_ident(setting)?);
    update_application_setting(ctx, flag, default_enabled, |value| {
        format!(
            "UPDATE {} SET {} = {} WHERE id = (SELECT MAX(id) FROM {})",
            table, column, value, table
        )
    })
    .await
}

/// Copy a boolean feature flag into `key` of a jsonb `application_settings`
/// column.
pub async fn migrate_feature_flag_to_jsonb_setting(
    ctx: &mut MigrationContext,
    flag: &str,
    column: &str,
    key: &str,
    default_enabled: bool,
) -> Result<()> {
    let (table, column) = (quote_ident(APPLICATION_SETTINGS)?, quote_ident(column)?);
    let path = quote_literal(Some(&format!("{{{}}}", key)));
    update_application_setting(ctx, flag, default_enabled, |value| {
        format!(
            "UPDATE {} SET {} = jsonb_set({}, {}, to_jsonb({}), true) WHERE id = (SELECT MAX(id) FROM {})",
            table, column, column, path, value, table
        )
    })
    .await
}

async fn update_application_setting<F>(
    ctx: &mut MigrationContext,
    flag: &str,
    default_enabled: bool,
    render: F,
) -> Result<()>
where
    F: Fn(&str) -> String,
{
    ctx.suppress_schema_restriction(true);
    let result = async {
        let enabled = feature_flag_enabled(ctx, flag, default_enabled).await?;
        info!("Migrating feature flag {} (enabled: {}) to application settings", flag, enabled);
        ctx.execute(&render(if enabled { "true" } else { "false" })).await
    }
    .await;
    ctx.suppress_schema_restriction(false);
    result
}
