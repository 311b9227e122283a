//! Driver and session traits.
//!
//! - [`Driver`]: opens sessions for one database engine
//! - [`Session`]: an open connection that can run DDL, stream rows out and
//!   write rows in
//!
//! Connection lifecycle (timeouts, retries, release) lives in
//! [`crate::connection`]; drivers only know how to connect once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::config::{DriverKind, EndpointConfig};
use crate::connection::ConnectFailure;
use crate::error::Result;
use crate::transfer::RowFailureReason;

use super::value::Row;

/// A table on one side of the migration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    /// Schema or database name; empty for the driver default.
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// `schema.name` for logs and state keys.
    pub fn display_name(&self) -> String {
        if self.schema.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema, self.name)
        }
    }
}

/// Which rows a read selects.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RowFilter {
    /// Every row.
    #[default]
    All,
    /// Rows whose `column` is strictly greater than `after`.
    ModifiedAfter {
        column: String,
        after: DateTime<Utc>,
    },
}

/// A read against a source table.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub table: TableRef,
    /// Columns to select; empty selects all columns.
    pub columns: Vec<String>,
    pub filter: RowFilter,
    /// Ascending sort column. Incremental reads sort on the watermark column
    /// so failures can be located relative to successful rows.
    pub order_by: Option<String>,
}

/// Forward-only, non-restartable row stream.
///
/// Dropping the cursor releases the server-side resources behind it.
pub struct RowCursor<'a> {
    /// Column names, in row value order.
    pub columns: Vec<String>,
    pub rows: BoxStream<'a, Result<Row>>,
}

impl std::fmt::Debug for RowCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCursor")
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

/// Result of writing one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The target refused the row. The session is still usable.
    Rejected {
        reason: RowFailureReason,
        message: String,
    },
    /// The row's primary key or a unique key is already in the target. The
    /// session is still usable.
    DuplicateKey { message: String },
}

/// An open connection.
///
/// Errors returned from these methods are fatal for the session; row-level
/// refusals are reported through [`WriteOutcome::Rejected`] or
/// [`WriteOutcome::DuplicateKey`] instead.
#[async_trait]
pub trait Session: Send {
    /// Engine behind this session.
    fn kind(&self) -> DriverKind;

    /// Execute one DDL statement.
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Start streaming rows. The cursor borrows the session until dropped.
    async fn read_rows<'a>(&'a mut self, request: &ReadRequest) -> Result<RowCursor<'a>>;

    /// Insert one row into `table`.
    async fn write_row(
        &mut self,
        table: &TableRef,
        columns: &[String],
        row: &Row,
    ) -> Result<WriteOutcome>;

    /// Gracefully end the session.
    async fn close(&mut self) -> Result<()>;
}

/// Connects sessions for one engine.
#[async_trait]
pub trait Driver: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// Make a single connection attempt.
    async fn connect(
        &self,
        endpoint: &EndpointConfig,
    ) -> std::result::Result<Box<dyn Session>, ConnectFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_display_name() {
        assert_eq!(TableRef::new("dbo", "users").display_name(), "dbo.users");
        assert_eq!(TableRef::new("", "users").display_name(), "users");
    }

    #[test]
    fn test_default_filter_selects_everything() {
        assert_eq!(RowFilter::default(), RowFilter::All);
    }
}
