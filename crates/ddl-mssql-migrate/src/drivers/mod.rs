//! Database driver implementations.
//!
//! Each module implements [`Driver`](crate::core::Driver) and
//! [`Session`](crate::core::Session) for one engine:
//!
//! - [`postgres`]: PostgreSQL source (`tokio-postgres`)
//! - [`mysql`]: MySQL/MariaDB source (`sqlx`, feature `mysql`)
//! - [`mssql`]: Microsoft SQL Server target (`tiberius`)
//! - [`memory`]: in-process tables for dry runs and tests
//! - [`common`]: TLS and connect-error helpers
//!
//! # Adding New Databases
//!
//! 1. Create a module under `drivers/`
//! 2. Implement `Driver` and `Session`
//! 3. Register the driver in `DriverCatalog::with_builtins()`
//! 4. Gate heavy client libraries behind a feature in `Cargo.toml`

pub mod common;
pub mod memory;
pub mod mssql;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod postgres;

pub use common::{classify_connect_error, pg_connector, SslMode};
pub use memory::{MemoryColumn, MemoryDriver, MemorySession};
pub use mssql::MssqlDriver;
#[cfg(feature = "mysql")]
pub use mysql::MysqlDriver;
pub use postgres::PostgresDriver;
