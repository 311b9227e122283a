//! Watermark persistence for incremental sync.
//!
//! The [`WatermarkStore`] trait decouples the orchestrator from where
//! watermarks live:
//!
//! - [`FileWatermarkStore`]: one signed JSON file per table
//! - [`MemoryWatermarkStore`]: process-local, for dry runs and tests
//!
//! Stores never move a watermark backwards: saving an older `last_seen` than
//! the stored one keeps the stored value.
//!
//! A held watermark sits below rows that were already written. It carries the
//! greatest written modification time (`high_water`) and the times of the rows
//! that were refused, so the next pass can tell a row it wrote before from a
//! row that still conflicts.

mod file;
mod memory;

pub use file::FileWatermarkStore;
pub use memory::MemoryWatermarkStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Greatest modification time already synced for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Table key, `schema.name`.
    pub table: String,
    /// `None` until the first successful pass.
    pub last_seen: Option<DateTime<Utc>>,
    /// Greatest modification time written to the target by any pass.
    #[serde(default)]
    pub high_water: Option<DateTime<Utc>>,
    /// Modification times of refused rows after `last_seen`, ascending.
    #[serde(default)]
    pub refused: Vec<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Watermark {
    /// Watermark of a table that has never been synced.
    pub fn initial(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            last_seen: None,
            high_water: None,
            refused: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// The later of the current value and `candidate`. Refusals at or below
    /// the new value are dropped.
    #[must_use]
    pub fn advanced_to(&self, candidate: Option<DateTime<Utc>>) -> Self {
        match candidate {
            Some(c) if self.last_seen.map_or(true, |seen| c > seen) => Self {
                table: self.table.clone(),
                last_seen: Some(c),
                high_water: self.high_water.max(Some(c)),
                refused: self.refused.iter().copied().filter(|r| *r > c).collect(),
                updated_at: Utc::now(),
            },
            _ => self.clone(),
        }
    }

    /// Record what a pass over the rows after `last_seen` wrote and refused.
    /// `high_water` never regresses; `refused` is replaced.
    #[must_use]
    pub fn recorded(&self, written_through: Option<DateTime<Utc>>, refused: &[DateTime<Utc>]) -> Self {
        let high_water = self.high_water.max(written_through);
        let mut refused: Vec<DateTime<Utc>> = refused
            .iter()
            .copied()
            .filter(|r| self.last_seen.map_or(true, |seen| *r > seen))
            .collect();
        refused.sort();
        refused.dedup();

        if high_water == self.high_water && refused == self.refused {
            return self.clone();
        }
        Self {
            table: self.table.clone(),
            last_seen: self.last_seen,
            high_water,
            refused,
            updated_at: Utc::now(),
        }
    }

    /// Stored value after saving `newer` over `self`.
    #[must_use]
    pub fn merged(&self, newer: &Watermark) -> Self {
        self.advanced_to(newer.last_seen)
            .recorded(newer.high_water, &newer.refused)
    }

    /// Whether a row with modification time `modified` was written by an
    /// earlier pass: at or below `high_water` and not among the refusals.
    pub fn covers(&self, modified: DateTime<Utc>) -> bool {
        self.high_water.is_some_and(|hw| modified <= hw) && self.refused.binary_search(&modified).is_err()
    }
}

/// Persistence for per-table watermarks.
///
/// Implementations must be `Send + Sync`; workers for different tables save
/// concurrently, and read-modify-write of one table is atomic.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Stored watermark for `table`, or [`Watermark::initial`].
    async fn load(&self, table: &str) -> Result<Watermark>;

    /// Store `watermark` unless the stored one is already later. Returns the
    /// value now stored.
    async fn save(&self, watermark: &Watermark) -> Result<Watermark>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_advanced_to_never_regresses() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let wm = Watermark::initial("dbo.orders").advanced_to(Some(t0));
        assert_eq!(wm.last_seen, Some(t0));

        assert_eq!(wm.advanced_to(Some(t0 - Duration::hours(1))).last_seen, Some(t0));
        assert_eq!(wm.advanced_to(None).last_seen, Some(t0));
        assert_eq!(
            wm.advanced_to(Some(t0 + Duration::seconds(1))).last_seen,
            Some(t0 + Duration::seconds(1))
        );
    }

    #[test]
    fn test_held_watermark_remembers_written_and_refused_rows() {
        let t = |m: i64| Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(m);

        // rows at 10 and 30 written, 20 refused, held at 10
        let held = Watermark::initial("t")
            .advanced_to(Some(t(10)))
            .recorded(Some(t(30)), &[t(20), t(20)]);
        assert_eq!(held.last_seen, Some(t(10)));
        assert_eq!(held.high_water, Some(t(30)));
        assert_eq!(held.refused, vec![t(20)]);
        assert!(held.covers(t(30)));
        assert!(held.covers(t(25)));
        assert!(!held.covers(t(20)));
        assert!(!held.covers(t(31)));

        // moving past the refused row forgets it
        let cleared = held.advanced_to(Some(t(30)));
        assert!(cleared.refused.is_empty());
        assert_eq!(cleared.high_water, Some(t(30)));

        // a later pass replaces the refusals but never lowers high_water
        let again = held.recorded(Some(t(15)), &[]);
        assert_eq!(again.high_water, Some(t(30)));
        assert!(again.refused.is_empty());
        assert_eq!(held.recorded(Some(t(30)), &[t(20)]), held);
    }

    #[test]
    fn test_merged_keeps_later_values() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let stored = Watermark::initial("t")
            .advanced_to(Some(t0 + Duration::hours(2)))
            .recorded(Some(t0 + Duration::hours(3)), &[]);
        let older = Watermark::initial("t").advanced_to(Some(t0));

        let merged = stored.merged(&older);
        assert_eq!(merged.last_seen, Some(t0 + Duration::hours(2)));
        assert_eq!(merged.high_water, Some(t0 + Duration::hours(3)));
    }

    #[test]
    fn test_initial_has_no_value() {
        let wm = Watermark::initial("t");
        assert_eq!(wm.table, "t");
        assert!(wm.last_seen.is_none());
    }
}
