//! # ddl-mssql-migrate
//!
//! Translate MySQL and PostgreSQL DDL to Microsoft SQL Server and move the
//! data across.
//!
//! - **Rule-based DDL translation** with per-rule hit counts
//! - **Conflict detection** against an existing target schema, with renames
//! - **Full copies** and **incremental syncs** driven by a per-table watermark
//! - **Per-row failure isolation**: a refused row never aborts its table
//! - **Recurring runs** registered with cron
//!
//! ## Example
//!
//! ```rust,no_run
//! use ddl_mssql_migrate::{Config, Orchestrator, RunOptions, SchemaDocument};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> ddl_mssql_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let ddl = SchemaDocument::load("schema.sql")?;
//!     let orchestrator = Orchestrator::new(config);
//!     let result = orchestrator
//!         .run(&ddl, &RunOptions::default(), CancellationToken::new())
//!         .await?;
//!     println!("Migrated {} rows", result.rows_transferred);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod conflict;
pub mod connection;
pub mod core;
pub mod dialect;
pub mod drivers;
pub mod error;
pub mod orchestrator;
pub mod schedule;
pub mod state;
pub mod sync;
pub mod transfer;

// Re-exports for convenient access
pub use config::{Config, EndpointConfig, MigrationConfig, MigrationMode, WatermarkPolicy};
pub use conflict::{ConflictRecord, ConflictResolver};
pub use connection::{ConnectionHandle, ConnectionManager, Role};
pub use core::{DriverCatalog, SqlValue};
pub use dialect::{SchemaDocument, TranslationEngine};
pub use error::{MigrateError, Result};
pub use orchestrator::{MigrationResult, Orchestrator, Phase, RunOptions};
pub use schedule::{CrontabRegistrar, JobRegistrar, ScheduleRequest};
pub use state::{FileWatermarkStore, Watermark, WatermarkStore};
pub use sync::IncrementalSync;
pub use transfer::{TableSpec, TransferEngine, TransferResult};
