//! Database driver implementations.
//!
//! Only PostgreSQL is supported: the lock-retry, trigger and lock-monitor
//! machinery depends on PostgreSQL semantics (`lock_timeout`, `pg_locks`,
//! plpgsql triggers, `CREATE INDEX CONCURRENTLY`).

pub mod postgres;

pub use postgres::{PgConnection, PgPool, SslMode};
