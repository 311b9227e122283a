//! File-backed watermark store.
//!
//! Each table gets `<state_dir>/<table>.watermark.json`. Files carry an
//! HMAC-SHA256 signature keyed by the source/target identity
//! ([`Config::state_key`](crate::Config::state_key)). A file edited by hand,
//! written for other databases or naming another table is ignored with a
//! warning and the table starts from its initial watermark.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Watermark, WatermarkStore};
use crate::error::{MigrateError, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WatermarkFile {
    table: String,
    last_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    high_water: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    refused: Vec<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hmac: Option<String>,
}

impl WatermarkFile {
    fn signature(&self, key: &str) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;
        let content = serde_json::to_string(&unsigned)?;

        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Stores watermarks as signed JSON files in one directory.
#[derive(Debug)]
pub struct FileWatermarkStore {
    dir: PathBuf,
    key: String,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileWatermarkStore {
    /// Store rooted at `dir`, signing with `key`.
    /// The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            key: key.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding `table`'s watermark.
    pub fn path_for(&self, table: &str) -> PathBuf {
        let name: String = table
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.watermark.json", name))
    }

    async fn table_lock(&self, table: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .clone()
    }

    async fn read(&self, table: &str) -> Result<Option<Watermark>> {
        let path = self.path_for(table);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MigrateError::file_access(&path, e)),
        };
        let file: WatermarkFile = serde_json::from_str(&content)?;

        let expected = file.signature(&self.key)?;
        if file.hmac.as_deref() != Some(expected.as_str()) {
            warn!(
                "Ignoring watermark file {}: signature does not match this source/target",
                path.display()
            );
            return Ok(None);
        }
        if file.table != table {
            warn!(
                "Ignoring watermark file {}: it belongs to table '{}'",
                path.display(),
                file.table
            );
            return Ok(None);
        }

        Ok(Some(Watermark {
            table: file.table,
            last_seen: file.last_seen,
            high_water: file.high_water,
            refused: file.refused,
            updated_at: file.updated_at,
        }))
    }

    async fn write(&self, watermark: &Watermark) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| MigrateError::file_access(&self.dir, e))?;

        let mut file = WatermarkFile {
            table: watermark.table.clone(),
            last_seen: watermark.last_seen,
            high_water: watermark.high_water,
            refused: watermark.refused.clone(),
            updated_at: watermark.updated_at,
            hmac: None,
        };
        file.hmac = Some(file.signature(&self.key)?);
        let content = serde_json::to_string_pretty(&file)?;

        // temp file + rename: readers see the old or the new file, never half
        let path = self.path_for(&watermark.table);
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, content)
            .await
            .map_err(|e| MigrateError::file_access(&temp_path, e))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| MigrateError::file_access(&path, e))?;
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn load(&self, table: &str) -> Result<Watermark> {
        let lock = self.table_lock(table).await;
        let _guard = lock.lock().await;
        Ok(self
            .read(table)
            .await?
            .unwrap_or_else(|| Watermark::initial(table)))
    }

    async fn save(&self, watermark: &Watermark) -> Result<Watermark> {
        let lock = self.table_lock(&watermark.table).await;
        let _guard = lock.lock().await;

        let stored = match self.read(&watermark.table).await? {
            Some(current) => current.merged(watermark),
            None => watermark.clone(),
        };
        self.write(&stored).await?;
        debug!(
            "Saved watermark for {}: {:?}",
            stored.table, stored.last_seen
        );
        Ok(stored)
    }
}
