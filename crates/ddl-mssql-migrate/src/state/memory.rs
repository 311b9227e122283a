//! In-process watermark store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Watermark, WatermarkStore};
use crate::error::Result;

/// Keeps watermarks in a map. Used by dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    entries: Mutex<HashMap<String, Watermark>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with `watermarks` already saved.
    pub fn with_entries(watermarks: impl IntoIterator<Item = Watermark>) -> Self {
        let entries = watermarks
            .into_iter()
            .map(|w| (w.table.clone(), w))
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn load(&self, table: &str) -> Result<Watermark> {
        Ok(self
            .entries
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_else(|| Watermark::initial(table)))
    }

    async fn save(&self, watermark: &Watermark) -> Result<Watermark> {
        let mut entries = self.entries.lock().await;
        let stored = match entries.get(&watermark.table) {
            Some(current) => current.merged(watermark),
            None => watermark.clone(),
        };
        entries.insert(stored.table.clone(), stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[tokio::test]
    async fn test_save_keeps_later_value() {
        let store = MemoryWatermarkStore::new();
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        store
            .save(&Watermark::initial("dbo.a").advanced_to(Some(t)))
            .await
            .unwrap();
        let stored = store
            .save(&Watermark::initial("dbo.a").advanced_to(Some(t - Duration::days(1))))
            .await
            .unwrap();

        assert_eq!(stored.last_seen, Some(t));
        assert_eq!(store.load("dbo.a").await.unwrap().last_seen, Some(t));
        assert!(store.load("dbo.b").await.unwrap().last_seen.is_none());
    }
}
