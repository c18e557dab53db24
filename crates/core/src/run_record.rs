//! Persisted "last successful run" marker for incremental ingestion.

use crate::error::RunRecordError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::path::{Path, PathBuf};

#[skip_serializing_none]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub last_successful_run: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// The record after a run that started at `started_at` completed.
    pub fn advanced_to(started_at: DateTime<Utc>) -> Self {
        Self {
            last_successful_run: Some(started_at),
        }
    }
}

/// JSON file holding a [`RunRecord`]; saves go through a temp file and rename.
#[derive(Debug, Clone)]
pub struct RunRecordStore {
    path: PathBuf,
}

impl RunRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> RunRecordError {
        RunRecordError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    /// A missing file is an empty record; an unreadable or corrupt one is an error.
    pub async fn load(&self) -> Result<RunRecord, RunRecordError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RunRecord::default())
            }
            Err(error) => return Err(self.io_error(error)),
        };

        serde_json::from_slice(&bytes).map_err(|source| RunRecordError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })
    }

    pub async fn save(&self, record: &RunRecord) -> Result<(), RunRecordError> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| self.io_error(error))?;
        }

        let payload = serde_json::to_vec_pretty(record).map_err(|source| RunRecordError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })?;

        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        tokio::fs::write(&temp, payload)
            .await
            .map_err(|error| self.io_error(error))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|error| self.io_error(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_loads_as_empty() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = RunRecordStore::new(dir.path().join("state/run_record.json"));
        assert_eq!(store.load().await?, RunRecord::default());
        Ok(())
    }

    #[tokio::test]
    async fn save_then_load() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = RunRecordStore::new(dir.path().join("state/run_record.json"));
        let started = DateTime::from_timestamp(1_700_000_000, 0).ok_or("timestamp")?;

        store.save(&RunRecord::advanced_to(started)).await?;
        assert_eq!(store.load().await?.last_successful_run, Some(started));
        assert!(!dir.path().join("state/run_record.json.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("run_record.json");
        tokio::fs::write(&path, b"{not json").await?;

        let result = RunRecordStore::new(path).load().await;
        assert!(matches!(result, Err(RunRecordError::Corrupt { .. })));
        Ok(())
    }
}
