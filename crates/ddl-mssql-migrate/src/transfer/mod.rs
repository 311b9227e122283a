//! Row transfer engine.
//!
//! Streams rows from a source cursor and writes them to the target one at a
//! time. Rows the target refuses are counted and recorded with a reason; they
//! never stop the stream. Cursor errors and lost connections are fatal for
//! the table.
//!
//! A pass that resumes from a held watermark re-reads rows an earlier pass
//! already wrote. A duplicate key on such a row counts as already present,
//! not as a failure.

mod transform;

pub use transform::ValueTransform;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{MigrationConfig, TableConfig};
use crate::connection::ConnectionHandle;
use crate::core::{ReadRequest, RowFilter, Session, TableRef, WriteOutcome};
use crate::error::{MigrateError, Result};
use crate::state::Watermark;

/// Row failures logged at warn level per table; the rest go to debug.
const WARN_LOG_LIMIT: u64 = 10;

/// Why the target refused a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowFailureReason {
    /// A value could not be converted to the column type.
    TypeCoercion,
    /// Key, uniqueness, NOT NULL, check or foreign key violation.
    ConstraintViolation,
    Other,
}

impl RowFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowFailureReason::TypeCoercion => "type_coercion",
            RowFailureReason::ConstraintViolation => "constraint_violation",
            RowFailureReason::Other => "other",
        }
    }
}

/// One refused row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFailure {
    /// 1-based position in the source stream.
    pub row_number: u64,
    pub reason: RowFailureReason,
    pub message: String,
}

/// What a table pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferResult {
    pub table: String,
    pub rows_transferred: u64,
    pub rows_failed: u64,
    /// Re-read rows an earlier pass had already written.
    pub rows_already_present: u64,
    /// First failures, capped; `rows_failed` is exact.
    pub failures: Vec<RowFailure>,
    /// Latest modification time among written or already present rows.
    pub max_transferred_modified: Option<DateTime<Utc>>,
    /// Earliest modification time among refused rows.
    pub min_failed_modified: Option<DateTime<Utc>>,
    /// Latest written modification time strictly below the earliest refused
    /// one (equal to `max_transferred_modified` when nothing failed).
    pub max_modified_before_failure: Option<DateTime<Utc>>,
    /// Distinct modification times of refused rows, ascending.
    #[serde(skip)]
    pub refused_modified: Vec<DateTime<Utc>>,
    pub duration_ms: u64,
}

/// Source and target of one table pass.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub source: TableRef,
    pub target: TableRef,
    /// Columns to copy; empty copies every source column.
    pub columns: Vec<String>,
    /// Modification timestamp column, when the table has one.
    pub watermark_column: Option<String>,
    pub transforms: BTreeMap<String, ValueTransform>,
    /// Sort column for unfiltered reads. Filtered reads always sort on the
    /// filter column.
    pub order_by: Option<String>,
    /// Lower-cased source column to target column.
    pub column_renames: BTreeMap<String, String>,
    /// Watermark this pass resumes from.
    pub resume_from: Option<Watermark>,
}

impl TableSpec {
    pub fn new(source: TableRef, target: TableRef) -> Self {
        Self {
            source,
            target,
            columns: Vec::new(),
            watermark_column: None,
            transforms: BTreeMap::new(),
            order_by: None,
            column_renames: BTreeMap::new(),
            resume_from: None,
        }
    }

    /// Spec for a configured table.
    pub fn from_config(
        table: &TableConfig,
        migration: &MigrationConfig,
        source_schema: &str,
        target_schema: &str,
    ) -> Self {
        Self {
            source: TableRef::new(source_schema, &table.name),
            target: TableRef::new(target_schema, &table.name),
            columns: table.columns.clone(),
            watermark_column: Some(migration.watermark_column_for(table).to_string()),
            transforms: table.transforms.clone(),
            order_by: None,
            column_renames: BTreeMap::new(),
            resume_from: None,
        }
    }

    pub fn with_watermark_column(mut self, column: impl Into<String>) -> Self {
        self.watermark_column = Some(column.into());
        self
    }

    pub fn with_order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by = Some(column.into());
        self
    }

    /// Write source column `from` into target column `to`.
    pub fn with_column_rename(mut self, from: &str, to: impl Into<String>) -> Self {
        self.column_renames.insert(from.to_lowercase(), to.into());
        self
    }

    pub fn with_transform(mut self, column: impl Into<String>, transform: ValueTransform) -> Self {
        self.transforms.insert(column.into(), transform);
        self
    }

    pub fn resuming(mut self, watermark: &Watermark) -> Self {
        self.resume_from = Some(watermark.clone());
        self
    }

    /// Whether a row with this modification time was written by the pass
    /// being resumed.
    fn already_written(&self, modified: Option<DateTime<Utc>>) -> bool {
        match (&self.resume_from, modified) {
            (Some(watermark), Some(m)) => watermark.covers(m),
            _ => false,
        }
    }
}

/// Tracks modification times of written and refused rows.
///
/// Exact when rows arrive in ascending modification order (incremental reads
/// sort on the watermark column); otherwise the held value errs low.
#[derive(Debug, Default)]
struct WatermarkTracker {
    max_success: Option<DateTime<Utc>>,
    min_failed: Option<DateTime<Utc>>,
    refused: BTreeSet<DateTime<Utc>>,
    // two largest distinct success times seen before the first timed failure
    top: Option<DateTime<Utc>>,
    second: Option<DateTime<Utc>>,
    held: Option<Option<DateTime<Utc>>>,
}

impl WatermarkTracker {
    fn success(&mut self, ts: Option<DateTime<Utc>>) {
        let Some(t) = ts else { return };
        self.max_success = self.max_success.max(Some(t));
        if self.held.is_some() {
            return;
        }
        match self.top {
            None => self.top = Some(t),
            Some(top) if t > top => {
                self.second = Some(top);
                self.top = Some(t);
            }
            Some(top) if t < top && self.second.map_or(true, |s| t > s) => {
                self.second = Some(t)
            }
            _ => {}
        }
    }

    fn failure(&mut self, ts: Option<DateTime<Utc>>) {
        let Some(f) = ts else { return };
        self.refused.insert(f);
        if self.min_failed.map_or(true, |m| f < m) {
            self.min_failed = Some(f);
        }
        let candidate = match self.held {
            None => match self.top {
                Some(top) if top < f => Some(top),
                _ => self.second.filter(|s| *s < f),
            },
            Some(held) => held.filter(|h| *h < f),
        };
        self.held = Some(candidate);
    }

    fn before_failure(&self) -> Option<DateTime<Utc>> {
        match self.held {
            Some(held) => held,
            None => self.max_success,
        }
    }
}

/// Which side broke during a transfer.
enum Fault {
    Source(MigrateError),
    Target(MigrateError),
    Other(MigrateError),
}

/// Copies rows between two open connections.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    max_recorded_failures: usize,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new(100)
    }
}

impl TransferEngine {
    pub fn new(max_recorded_failures: usize) -> Self {
        Self {
            max_recorded_failures,
        }
    }

    /// Copy the rows of `spec.source` selected by `filter` into `spec.target`.
    ///
    /// A fatal error marks the handle that caused it as failed. Cancellation
    /// drops the cursor and returns [`MigrateError::Cancelled`].
    pub async fn transfer(
        &self,
        source: &mut ConnectionHandle,
        target: &mut ConnectionHandle,
        spec: &TableSpec,
        filter: &RowFilter,
        cancel: &CancellationToken,
    ) -> Result<TransferResult> {
        let outcome = {
            let src = source.session()?;
            let dst = target.session()?;
            self.run(src, dst, spec, filter, cancel).await
        };

        match outcome {
            Ok(result) => Ok(result),
            Err(Fault::Source(e)) => {
                source.mark_failed();
                Err(table_error(spec, e))
            }
            Err(Fault::Target(e)) => {
                target.mark_failed();
                Err(table_error(spec, e))
            }
            Err(Fault::Other(e)) => Err(table_error(spec, e)),
        }
    }

    async fn run(
        &self,
        source: &mut dyn Session,
        target: &mut dyn Session,
        spec: &TableSpec,
        filter: &RowFilter,
        cancel: &CancellationToken,
    ) -> std::result::Result<TransferResult, Fault> {
        let started = Instant::now();
        let table = spec.source.display_name();
        let order_by = match filter {
            RowFilter::ModifiedAfter { column, .. } => Some(column.clone()),
            RowFilter::All => spec.order_by.clone(),
        };
        let request = ReadRequest {
            table: spec.source.clone(),
            columns: spec.columns.clone(),
            filter: filter.clone(),
            order_by,
        };

        info!("{}: starting transfer to {}", table, spec.target.display_name());
        let mut cursor = source.read_rows(&request).await.map_err(Fault::Source)?;

        let watermark_idx = spec
            .watermark_column
            .as_deref()
            .and_then(|col| column_index(&cursor.columns, col));
        let mut plan = Vec::with_capacity(spec.transforms.len());
        for (column, transform) in &spec.transforms {
            let idx = column_index(&cursor.columns, column).ok_or_else(|| {
                Fault::Other(MigrateError::Config(format!(
                    "transform '{}' configured for unknown column '{}'",
                    transform.as_str(),
                    column
                )))
            })?;
            plan.push((idx, *transform));
        }

        let target_columns: Vec<String> = cursor
            .columns
            .iter()
            .map(|c| {
                spec.column_renames
                    .get(&c.to_lowercase())
                    .cloned()
                    .unwrap_or_else(|| c.clone())
            })
            .collect();

        let mut result = TransferResult {
            table: table.clone(),
            ..Default::default()
        };
        let mut tracker = WatermarkTracker::default();
        let mut row_number: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("{}: cancelled after {} rows", table, row_number);
                    return Err(Fault::Other(MigrateError::Cancelled));
                }
                next = cursor.rows.next() => next,
            };
            let Some(row) = next else { break };
            let mut row = row.map_err(Fault::Source)?;
            row_number += 1;

            let modified = watermark_idx.and_then(|i| row[i].as_timestamp());

            let mut refused = None;
            for (idx, transform) in &plan {
                let value = std::mem::replace(
                    &mut row[*idx],
                    crate::core::SqlValue::Null(crate::core::SqlNullType::String),
                );
                match transform.apply(value) {
                    Ok(v) => row[*idx] = v,
                    Err(message) => {
                        refused = Some((
                            RowFailureReason::TypeCoercion,
                            format!("{}: {}", cursor.columns[*idx], message),
                        ));
                        break;
                    }
                }
            }

            if refused.is_none() {
                match target
                    .write_row(&spec.target, &target_columns, &row)
                    .await
                    .map_err(Fault::Target)?
                {
                    WriteOutcome::Written => {
                        result.rows_transferred += 1;
                        tracker.success(modified);
                        continue;
                    }
                    WriteOutcome::Rejected { reason, message } => refused = Some((reason, message)),
                    WriteOutcome::DuplicateKey { .. } if spec.already_written(modified) => {
                        result.rows_already_present += 1;
                        tracker.success(modified);
                        debug!("{}: row {} already present", table, row_number);
                        continue;
                    }
                    WriteOutcome::DuplicateKey { message } => {
                        refused = Some((RowFailureReason::ConstraintViolation, message))
                    }
                }
            }

            if let Some((reason, message)) = refused {
                result.rows_failed += 1;
                tracker.failure(modified);
                if result.rows_failed <= WARN_LOG_LIMIT {
                    warn!("{}: row {} refused ({}): {}", table, row_number, reason.as_str(), message);
                } else {
                    debug!("{}: row {} refused ({}): {}", table, row_number, reason.as_str(), message);
                }
                if result.failures.len() < self.max_recorded_failures {
                    result.failures.push(RowFailure {
                        row_number,
                        reason,
                        message,
                    });
                }
            }
        }

        result.max_transferred_modified = tracker.max_success;
        result.min_failed_modified = tracker.min_failed;
        result.max_modified_before_failure = tracker.before_failure();
        result.refused_modified = std::mem::take(&mut tracker.refused).into_iter().collect();
        result.duration_ms = started.elapsed().as_millis() as u64;

        if result.rows_already_present > 0 {
            info!(
                "{}: {} re-read rows were already present",
                table, result.rows_already_present
            );
        }
        info!(
            "{}: {} rows transferred, {} failed in {}ms",
            table, result.rows_transferred, result.rows_failed, result.duration_ms
        );
        Ok(result)
    }
}

fn column_index(columns: &[String], name: &str) -> Option<usize> {
    columns.iter().position(|c| c.eq_ignore_ascii_case(name))
}

fn table_error(spec: &TableSpec, error: MigrateError) -> MigrateError {
    match error {
        MigrateError::Cancelled | MigrateError::Config(_) => error,
        other => MigrateError::transfer(spec.source.display_name(), other.to_string()),
    }
}
