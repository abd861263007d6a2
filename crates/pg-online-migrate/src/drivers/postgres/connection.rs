//! tokio-postgres session behind the [`Connection`] trait.
//!
//! Uses deadpool-postgres for pooling. A migration run checks out a single
//! session and keeps it for the whole run, since `SET LOCAL`, savepoints and
//! the `pg_locks` lookups of the lock monitor are all session-scoped.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Config as PgConfig, Row};
use tracing::{debug, info, warn};

use super::tls::SslMode;
use crate::config::DatabaseConfig;
use crate::core::connection::{Connection, Record};
use crate::error::{MigrateError, Result};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Pool of sessions against the migration target.
#[derive(Clone)]
pub struct PgPool {
    pool: Pool,
    target: String,
}

impl PgPool {
    /// Build the pool and verify that a session can be opened.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("pg-online-migrate");
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let manager = match SslMode::parse(&config.ssl_mode)?.connector()? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
            }
        };
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| MigrateError::pool(e, "creating PostgreSQL pool"))?;

        let this = Self {
            pool,
            target: config.display_target(),
        };
        this.health_check().await?;
        info!("Connected to PostgreSQL: {}", this.target);
        Ok(this)
    }

    /// Check out a session for a migration run.
    pub async fn connection(&self) -> Result<PgConnection> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, format!("getting connection to {}", self.target)))?;
        Ok(PgConnection { client, depth: 0 })
    }

    /// Round-trip a trivial query.
    pub async fn health_check(&self) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, format!("testing connection to {}", self.target)))?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(MigrateError::from_pg)?;
        Ok(())
    }

    /// Server version string (`SHOW server_version`).
    pub async fn server_version(&self) -> Result<String> {
        let mut conn = self.connection().await?;
        let rows = conn.query("SHOW server_version", &[]).await?;
        Ok(rows
            .first()
            .and_then(|r| r.first())
            .unwrap_or("unknown")
            .to_string())
    }
}

/// One pooled PostgreSQL session.
pub struct PgConnection {
    client: Object,
    depth: usize,
}

#[async_trait]
impl Connection for PgConnection {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        debug!(sql, "execute");
        self.client
            .batch_execute(sql)
            .await
            .map_err(MigrateError::from_pg)
    }

    async fn query(&mut self, sql: &str, params: &[&str]) -> Result<Vec<Record>> {
        debug!(sql, ?params, "query");
        let params: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let rows = self
            .client
            .query(sql, &params)
            .await
            .map_err(MigrateError::from_pg)?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    fn transaction_depth(&self) -> usize {
        self.depth
    }

    fn set_transaction_depth(&mut self, depth: usize) {
        self.depth = depth;
    }
}

/// Render every column of a row as text.
fn row_to_record(row: &Row) -> Record {
    let columns = row.columns();
    let names = columns.iter().map(|c| c.name().to_string()).collect();
    let values = columns
        .iter()
        .enumerate()
        .map(|(i, col)| cell_text(row, i, col.type_()))
        .collect();
    Record::new(names, values)
}

fn cell_text(row: &Row, idx: usize, ty: &Type) -> Option<String> {
    match *ty {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(|b| if b { "t" } else { "f" }.to_string()),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx).ok().flatten().map(|v| v.to_string()),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx).ok().flatten().map(|v| v.to_string()),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx).ok().flatten().map(|v| v.to_string()),
        Type::OID => row.try_get::<_, Option<u32>>(idx).ok().flatten().map(|v| v.to_string()),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx).ok().flatten().map(|v| v.to_string()),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).ok().flatten().map(|v| v.to_string()),
        Type::CHAR => row
            .try_get::<_, Option<i8>>(idx)
            .ok()
            .flatten()
            .map(|v| (v as u8 as char).to_string()),
        _ => row.try_get::<_, Option<String>>(idx).ok().flatten(),
    }
}
