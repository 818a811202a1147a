//! JSONL file destination
//!
//! Writes one JSON object per line, each carrying the record's provenance
//! fields. Lines are independent: a reader tolerates a trailing partial line
//! left by a crashed write and simply ignores it.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error};
use validator::Validate;

use super::{Destination, DestinationConfig, DestinationFactory, WriteResult};
use crate::error::DestinationError;
use crate::message::Record;
use crate::pipeline::JobContext;

/// One output line. `source_record_id` and `source_data` are the stable part
/// of the format; the remaining provenance fields ride along.
#[derive(Serialize)]
struct FileRow<'a> {
    source_record_id: &'a str,
    source_timestamp: DateTime<Utc>,
    source_data: &'a str,
    extracted_at: DateTime<Utc>,
    loaded_at: DateTime<Utc>,
    row_id: &'a str,
}

/// Append-only JSONL sink
pub struct FileDestination {
    path: PathBuf,
    // Serializes concurrent write calls so lines never interleave.
    write_lock: Mutex<()>,
}

impl FileDestination {
    pub fn new(filepath: impl Into<PathBuf>) -> Self {
        Self {
            path: filepath.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn append_lines(&self, records: &[Record]) -> Result<u64, DestinationError> {
        let loaded_at = Utc::now();
        let mut payload = Vec::with_capacity(records.len() * 256);
        for record in records {
            let row = FileRow {
                source_record_id: &record.source_record_id,
                source_timestamp: record.source_timestamp,
                source_data: &record.source_data,
                extracted_at: record.extracted_at,
                loaded_at: record.loaded_at.unwrap_or(loaded_at),
                row_id: &record.row_id,
            };
            serde_json::to_writer(&mut payload, &row)?;
            payload.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&payload).await?;
        file.flush().await?;

        Ok(records.len() as u64)
    }
}

#[async_trait]
impl Destination for FileDestination {
    async fn check(&self) -> Result<(), DestinationError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(DestinationError::config(format!(
                    "Output directory does not exist: {}",
                    parent.display()
                )));
            }
        }
        Ok(())
    }

    async fn write(&self, records: &[Record]) -> WriteResult {
        match self.append_lines(records).await {
            Ok(written) => {
                debug!(records = written, path = %self.path.display(), "lines appended");
                WriteResult::success(written)
            }
            Err(e) => {
                error!(path = %self.path.display(), "file write failed: {e}");
                WriteResult::failure(e.to_string())
            }
        }
    }
}

/// Factory for the file destination
pub struct FileDestinationFactory;

#[async_trait]
impl DestinationFactory for FileDestinationFactory {
    async fn create(
        &self,
        config: &DestinationConfig,
        _job: &JobContext,
    ) -> Result<Arc<dyn Destination>, DestinationError> {
        match config {
            DestinationConfig::File(file_config) => {
                file_config
                    .validate()
                    .map_err(|e| DestinationError::config(e.to_string()))?;
                Ok(Arc::new(FileDestination::new(&file_config.filepath)))
            }
            #[cfg(feature = "bigquery")]
            other => Err(DestinationError::config(format!(
                "File factory received '{}' configuration",
                other.type_tag()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceRecord;
    use serde_json::json;
    use std::collections::HashSet;

    fn record(id: &str) -> Record {
        Record::from_source(
            SourceRecord {
                id: id.to_string(),
                data: json!({"id": id, "name": "kraken"}),
                timestamp: Utc::now(),
            },
            Utc::now(),
        )
    }

    async fn read_rows(path: &std::path::Path) -> Vec<serde_json::Value> {
        let content = tokio::fs::read_to_string(path).await.unwrap();
        content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    #[tokio::test]
    async fn test_writes_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let destination = FileDestination::new(&path);

        let result = destination.write(&[record("9898"), record("88787")]).await;
        assert!(result.success);
        assert_eq!(result.records_written, 2);

        let rows = read_rows(&path).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["source_record_id"], "9898");
        assert!(rows[0]["source_data"]
            .as_str()
            .unwrap()
            .contains("kraken"));
    }

    #[tokio::test]
    async fn test_rewrite_keeps_row_id_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let destination = FileDestination::new(&path);

        let batch = [record("9898"), record("88787")];
        // Simulated broker redelivery: the same batch written twice.
        assert!(destination.write(&batch).await.success);
        assert!(destination.write(&batch).await.success);

        let rows = read_rows(&path).await;
        assert_eq!(rows.len(), 4);
        let distinct_ids: HashSet<&str> = rows
            .iter()
            .map(|row| row["row_id"].as_str().unwrap())
            .collect();
        assert_eq!(distinct_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_readers_ignore_trailing_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let destination = FileDestination::new(&path);
        assert!(destination.write(&[record("9898")]).await.success);

        // A crashed writer leaves a torn line behind.
        let mut content = tokio::fs::read_to_string(&path).await.unwrap();
        content.push_str("{\"source_record_id\": \"88");
        tokio::fs::write(&path, content).await.unwrap();

        let rows = read_rows(&path).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["source_record_id"], "9898");
    }

    #[tokio::test]
    async fn test_check_rejects_missing_directory() {
        let destination = FileDestination::new("/nonexistent-dir-tributary/out.jsonl");
        assert!(destination.check().await.is_err());
    }
}
