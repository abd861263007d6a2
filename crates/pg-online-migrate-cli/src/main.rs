//! pg-online-migrate CLI - lock-aware PostgreSQL schema migrations.

use clap::{Parser, Subcommand};
use pg_online_migrate::helpers::{bigint, swapping, triggers};
use pg_online_migrate::{
    Config, MigrateError, Migration, MigrationContext, MigrationOutcome, MigrationRunner, MigrationSettings, PgPool,
    SqlFileMigration,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "pg-online-migrate")]
#[command(about = "Zero-downtime PostgreSQL schema migrations")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations
    Run {
        /// Directory containing `<version>_<name>.sql` migrations
        #[arg(long, default_value = "db/migrate")]
        dir: PathBuf,
    },

    /// Revert one applied migration
    Rollback {
        /// Directory containing `<version>_<name>.sql` migrations
        #[arg(long, default_value = "db/migrate")]
        dir: PathBuf,

        /// Version to revert
        #[arg(long = "migration-version", value_name = "VERSION")]
        version: i64,
    },

    /// Show applied and pending migrations
    Status {
        /// Directory containing `<version>_<name>.sql` migrations
        #[arg(long, default_value = "db/migrate")]
        dir: PathBuf,
    },

    /// Test the database connection
    HealthCheck,

    /// Swap the names of two columns under lock retries
    SwapColumns {
        #[arg(long)]
        table: String,
        #[arg(long)]
        column1: String,
        #[arg(long)]
        column2: String,

        /// Also swap the column defaults
        #[arg(long)]
        with_defaults: bool,
    },

    /// Swap the names of two indexes under lock retries
    SwapIndexes {
        #[arg(long)]
        table: String,
        #[arg(long)]
        index1: String,
        #[arg(long)]
        index2: String,

        /// Schema of the indexes (default: the table's schema)
        #[arg(long)]
        schema: Option<String>,
    },

    /// Swap the names of two foreign keys under lock retries
    SwapForeignKeys {
        #[arg(long)]
        table: String,
        #[arg(long)]
        fk1: String,
        #[arg(long)]
        fk2: String,
    },

    /// Mirror the indexes of an integer column onto its bigint shadow column
    MirrorBigintIndexes {
        #[arg(long)]
        table: String,
        #[arg(long)]
        column: String,
    },

    /// Install a trigger copying one column into another
    InstallRenameTriggers {
        #[arg(long)]
        table: String,
        #[arg(long)]
        old_column: String,
        #[arg(long)]
        new_column: String,
    },

    /// Remove a trigger installed by install-rename-triggers
    RemoveRenameTriggers {
        #[arg(long)]
        table: String,
        #[arg(long)]
        old_column: String,
        #[arg(long)]
        new_column: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(MigrateError::Config)?;

    let mut config = Config::load(&cli.config)?;
    config.apply_env_overrides();
    info!("Loaded configuration from {:?}", cli.config);

    // Migration files are read before connecting so that a bad directory
    // fails fast.
    let migrations = match &cli.command {
        Commands::Run { dir } | Commands::Rollback { dir, .. } | Commands::Status { dir } => load_migrations(dir)?,
        _ => Vec::new(),
    };

    let cancel_token = setup_signal_handler().await?;
    tokio::select! {
        result = execute(cli.command, &config, migrations, cli.output_json) => result,
        _ = cancel_token.cancelled() => Err(MigrateError::Cancelled),
    }
}

async fn execute(
    command: Commands,
    config: &Config,
    migrations: Vec<Arc<dyn Migration>>,
    output_json: bool,
) -> Result<(), MigrateError> {
    let pool = PgPool::connect(&config.database).await?;

    if let Commands::HealthCheck = command {
        let version = pool.server_version().await?;
        if output_json {
            let result = serde_json::json!({
                "healthy": true,
                "target": config.database.display_target(),
                "server_version": version,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("Health Check Results:");
            println!("  PostgreSQL: OK ({})", config.database.display_target());
            println!("  Server version: {}", version);
        }
        return Ok(());
    }

    let mut ctx = MigrationContext::new(Box::new(pool.connection().await?), MigrationSettings::from_config(config));
    let runner = MigrationRunner::new(config.schema_registry());

    match command {
        Commands::HealthCheck => {}

        Commands::Run { .. } => {
            let summary = runner.migrate(&mut ctx, &migrations).await?;
            if output_json {
                println!("{}", summary.to_json()?);
            } else {
                println!("\nMigrations completed!");
                println!("  Run ID: {}", summary.run_id);
                println!("  Database: {}", summary.database);
                println!("  Duration: {:.2}s", summary.duration_seconds);
                println!("  Applied: {}", summary.applied);
                println!("  Skipped (other database): {}", summary.skipped);
                println!("  Already applied: {}", summary.already_applied);
                for report in &summary.migrations {
                    if !report.locked_tables.is_empty() {
                        println!("  Writes locked by {}: {:?}", report.version, report.locked_tables);
                    }
                }
            }
        }

        Commands::Rollback { version, .. } => {
            let migration = migrations
                .iter()
                .find(|m| m.version() == version)
                .ok_or_else(|| MigrateError::Config(format!("No migration with version {} found", version)))?;
            let report = runner.rollback(&mut ctx, migration).await?;
            if output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.outcome == MigrationOutcome::Skipped {
                println!("Removed {} {} (not run on this database)", report.version, report.name);
            } else {
                println!("Reverted {} {} ({:.2}s)", report.version, report.name, report.duration_seconds);
            }
        }

        Commands::Status { .. } => {
            let statuses = runner.status(&mut ctx, &migrations).await?;
            if output_json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                println!("Migration status ({}):", config.database.name);
                for status in &statuses {
                    let mark = if status.applied { "up" } else { "down" };
                    println!("  {:>4}  {}  {}", mark, status.version, status.name);
                }
            }
        }

        Commands::SwapColumns {
            table,
            column1,
            column2,
            with_defaults,
        } => {
            ctx.with_lock_retries(move |ctx| {
                let (table, column1, column2) = (table.clone(), column1.clone(), column2.clone());
                Box::pin(async move {
                    swapping::swap_columns(ctx, &table, &column1, &column2).await?;
                    if with_defaults {
                        swapping::swap_columns_default(ctx, &table, &column1, &column2).await?;
                    }
                    swapping::reset_all_trigger_functions(ctx, &table).await?;
                    Ok(())
                })
            })
            .await?;
            println!("Columns swapped");
        }

        Commands::SwapIndexes {
            table,
            index1,
            index2,
            schema,
        } => {
            ctx.with_lock_retries(move |ctx| {
                let (table, index1, index2, schema) = (table.clone(), index1.clone(), index2.clone(), schema.clone());
                Box::pin(async move { swapping::swap_indexes(ctx, &table, &index1, &index2, schema.as_deref()).await })
            })
            .await?;
            println!("Indexes swapped");
        }

        Commands::SwapForeignKeys { table, fk1, fk2 } => {
            ctx.with_lock_retries(move |ctx| {
                let (table, fk1, fk2) = (table.clone(), fk1.clone(), fk2.clone());
                Box::pin(async move { swapping::swap_foreign_keys(ctx, &table, &fk1, &fk2).await })
            })
            .await?;
            println!("Foreign keys swapped");
        }

        Commands::MirrorBigintIndexes { table, column } => {
            let created = bigint::add_bigint_column_indexes(&mut ctx, &table, &column).await?;
            if output_json {
                println!("{}", serde_json::to_string_pretty(&created)?);
            } else {
                println!("Mirrored {} index(es)", created.len());
                for name in &created {
                    println!("  {}", name);
                }
            }
        }

        Commands::InstallRenameTriggers {
            table,
            old_column,
            new_column,
        } => {
            ctx.with_lock_retries(move |ctx| {
                let (table, old, new) = (table.clone(), old_column.clone(), new_column.clone());
                Box::pin(async move { triggers::install_rename_triggers(ctx, &table, &old, &new).await })
            })
            .await?;
            println!("Rename trigger installed");
        }

        Commands::RemoveRenameTriggers {
            table,
            old_column,
            new_column,
        } => {
            ctx.with_lock_retries(move |ctx| {
                let (table, old, new) = (table.clone(), old_column.clone(), new_column.clone());
                Box::pin(async move { triggers::remove_rename_triggers(ctx, &table, &old, &new).await })
            })
            .await?;
            println!("Rename trigger removed");
        }
    }

    Ok(())
}

fn load_migrations(dir: &Path) -> Result<Vec<Arc<dyn Migration>>, MigrateError> {
    if !dir.is_dir() {
        return Err(MigrateError::Config(format!(
            "Migrations directory not found: {:?}",
            dir
        )));
    }
    let migrations = SqlFileMigration::load_dir(dir)?;
    info!("Loaded {} migration(s) from {:?}", migrations.len(), dir);
    Ok(migrations
        .into_iter()
        .map(|m| Arc::new(m) as Arc<dyn Migration>)
        .collect())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };

    // RUST_LOG wins over --verbosity
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    for (kind, label) in [(SignalKind::interrupt(), "SIGINT"), (SignalKind::terminate(), "SIGTERM")] {
        let mut stream = signal(kind)?;
        let token = cancel_token.clone();
        tokio::spawn(async move {
            stream.recv().await;
            eprintln!("\nReceived {}. Cancelling the migration run...", label);
            token.cancel();
        });
    }

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("\nReceived Ctrl-C. Cancelling the migration run...");
                token.cancel();
            }
            Err(e) => tracing::warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    Ok(cancel_token)
}
