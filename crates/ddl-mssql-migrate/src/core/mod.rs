//! Core abstractions shared by drivers and the migration pipeline.
//!
//! - [`value`]: row values
//! - [`traits`]: [`Driver`] and [`Session`], the seam every engine implements
//! - [`catalog`]: driver registry for dependency injection
//! - [`identifier`]: identifier validation and quoting

pub mod catalog;
pub mod identifier;
pub mod traits;
pub mod value;

pub use catalog::DriverCatalog;
pub use traits::{Driver, ReadRequest, RowCursor, RowFilter, Session, TableRef, WriteOutcome};
pub use value::{Row, SqlNullType, SqlValue};
