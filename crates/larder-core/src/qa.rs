//! Quality-assurance log of failed extractions.
//!
//! Every task that ends in failure produces one [`QaEntry`]. The JSONL sink
//! appends one JSON object per line so the log survives crashes and can be
//! tailed while a run is in progress.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::AppError;
use crate::traits::QaSink;

/// One failed task, as written to the QA log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaEntry {
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub error: String,
    pub kind: String,
    /// Whatever partial candidate was recovered before the task failed.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub partial_data: Option<serde_json::Value>,
}

impl QaEntry {
    /// Build an entry from a task error, capturing any partial candidate.
    pub fn from_error(url: &str, error: &AppError) -> Self {
        let partial_data = match error {
            AppError::ExtractionExhausted {
                partial: Some(candidate),
                ..
            } => serde_json::to_value(candidate.as_ref()).ok(),
            _ => None,
        };
        Self {
            timestamp: Utc::now(),
            url: url.to_string(),
            error: error.to_string(),
            kind: error.kind().to_string(),
            partial_data,
        }
    }
}

/// Appends entries to a JSON Lines file.
#[derive(Clone)]
pub struct JsonlQaSink {
    path: PathBuf,
    file: Arc<AsyncMutex<File>>,
}

impl JsonlQaSink {
    /// Open (creating if needed) `path` for appending.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Arc::new(AsyncMutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl QaSink for JsonlQaSink {
    async fn record(&self, entry: &QaEntry) -> Result<(), AppError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps entries in memory. Used when no QA path is configured.
#[derive(Clone, Default)]
pub struct MemoryQaSink {
    entries: Arc<Mutex<Vec<QaEntry>>>,
}

impl MemoryQaSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<QaEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl QaSink for MemoryQaSink {
    async fn record(&self, entry: &QaEntry) -> Result<(), AppError> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(entry.clone());
        Ok(())
    }
}
