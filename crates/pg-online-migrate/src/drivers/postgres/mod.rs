//! PostgreSQL driver.
//!
//! - [`PgPool`] / [`PgConnection`]: pooled tokio-postgres sessions implementing
//!   [`Connection`](crate::core::Connection)
//! - [`SslMode`]: rustls-based TLS setup

mod connection;
mod tls;

pub use connection::{PgConnection, PgPool};
pub use tls::SslMode;
