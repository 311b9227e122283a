//! Incremental sync: a transfer filtered on the table's watermark.
//!
//! The first sync of a table reads every row. Later syncs read rows whose
//! modification column is strictly greater than the stored watermark. Reads
//! are sorted on that column so failed rows can be placed relative to the
//! rows around them.
//!
//! A watermark held below a failed row makes the next sync re-read rows it
//! already wrote. The pass resumes from the stored watermark, so those rows
//! count as already present and the watermark moves past them once the
//! failed row goes through.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WatermarkPolicy;
use crate::connection::ConnectionHandle;
use crate::core::RowFilter;
use crate::error::{MigrateError, Result};
use crate::state::Watermark;
use crate::transfer::{TableSpec, TransferEngine, TransferResult};

/// Wraps a [`TransferEngine`] with a watermark filter and update policy.
#[derive(Debug, Clone, Default)]
pub struct IncrementalSync {
    engine: TransferEngine,
    policy: WatermarkPolicy,
}

impl IncrementalSync {
    pub fn new(engine: TransferEngine, policy: WatermarkPolicy) -> Self {
        Self { engine, policy }
    }

    pub fn policy(&self) -> WatermarkPolicy {
        self.policy
    }

    /// Copy rows modified after `watermark` and compute the next watermark.
    ///
    /// The returned watermark is never earlier than `watermark` and is
    /// unchanged when no row was transferred. It is not persisted here.
    pub async fn sync_incremental(
        &self,
        source: &mut ConnectionHandle,
        target: &mut ConnectionHandle,
        spec: &TableSpec,
        watermark: &Watermark,
        cancel: &CancellationToken,
    ) -> Result<(TransferResult, Watermark)> {
        let column = spec.watermark_column.clone().ok_or_else(|| {
            MigrateError::Config(format!(
                "table {} has no watermark column for incremental sync",
                spec.source.display_name()
            ))
        })?;

        let filter = match watermark.last_seen {
            Some(after) => {
                debug!("{}: syncing rows with {} > {}", spec.source.display_name(), column, after);
                RowFilter::ModifiedAfter {
                    column: column.clone(),
                    after,
                }
            }
            None => {
                info!("{}: first sync, reading all rows", spec.source.display_name());
                RowFilter::All
            }
        };
        let spec = spec.clone().with_order_by(column).resuming(watermark);

        let result = self
            .engine
            .transfer(source, target, &spec, &filter, cancel)
            .await?;

        let next = watermark
            .advanced_to(next_watermark(&result, self.policy))
            .recorded(result.max_transferred_modified, &result.refused_modified);
        if result.rows_failed > 0 && self.policy == WatermarkPolicy::HoldAtFailure {
            warn!(
                "{}: {} row(s) failed, watermark held at {:?}",
                result.table, result.rows_failed, next.last_seen
            );
        }
        Ok((result, next))
    }
}

/// Candidate watermark for a finished pass. `None` leaves it unchanged.
///
/// Rows already present count as transferred: an earlier pass wrote them.
pub fn next_watermark(
    result: &TransferResult,
    policy: WatermarkPolicy,
) -> Option<chrono::DateTime<chrono::Utc>> {
    if result.rows_transferred + result.rows_already_present == 0 {
        return None;
    }
    match policy {
        WatermarkPolicy::HoldAtFailure => result.max_modified_before_failure,
        WatermarkPolicy::AdvancePastFailures => result.max_transferred_modified,
    }
}
