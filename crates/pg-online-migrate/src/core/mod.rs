//! Core abstractions shared by every helper.
//!
//! - [`identifier`]: identifier validation, quoting and derived object names
//! - [`connection`]: the [`Connection`] session trait and text [`Record`] rows
//! - [`schema`]: column, index, foreign key and trigger metadata
//! - [`catalog`]: `pg_catalog` introspection over a [`Connection`]
//!
//! Helpers never hold a driver type directly. They take `&mut dyn Connection`
//! (or a migration context wrapping one), which keeps them testable with a
//! recording connection and lets the PostgreSQL driver live in `drivers/`.

pub mod catalog;
pub mod connection;
pub mod identifier;
pub mod schema;

pub use connection::{Connection, Record};
pub use identifier::{quote_ident, qualify, QualifiedTable};
pub use schema::{ColumnInfo, ForeignKeyInfo, IndexColumns, IndexDefinition, PerColumnOption, TriggerInfo};
