//! Model metadata cache.
//!
//! After a successful load the worker records which backend and precision
//! profile won, so the next session can report it without re-probing.
//! Writes are best effort.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use crate::inference::SessionMetadata;
use crate::runtime::{Backend, PrecisionProfile};

/// One cached load outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    pub model_id: String,
    pub precision_profile: PrecisionProfile,
    pub backend: Backend,
    pub size_mb: u32,
    pub loaded_at: DateTime<Utc>,
}

impl MetadataRecord {
    pub fn from_metadata(meta: &SessionMetadata) -> Self {
        Self {
            model_id: meta.session_id.clone(),
            precision_profile: meta.precision_profile,
            backend: meta.backend,
            size_mb: meta.size_mb,
            loaded_at: Utc::now(),
        }
    }
}

/// JSON files under a cache directory, one per model.
#[derive(Debug, Clone)]
pub struct ModelMetadataCache {
    dir: PathBuf,
}

impl ModelMetadataCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the record for `model_id`.
    pub fn path_for(&self, model_id: &str) -> PathBuf {
        let sanitized: String = model_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("metadata-{}.json", sanitized))
    }

    pub async fn write(&self, record: &MetadataRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create cache dir {}", self.dir.display()))?;
        let path = self.path_for(&record.model_id);
        let contents = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(path = %path.display(), "Cached model metadata");
        Ok(())
    }

    /// Read the record for `model_id`, `None` if it was never written.
    pub async fn read(&self, model_id: &str) -> Result<Option<MetadataRecord>> {
        let path = self.path_for(model_id);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let record = serde_json::from_slice(&contents)
            .with_context(|| format!("corrupt metadata record {}", path.display()))?;
        Ok(Some(record))
    }
}
