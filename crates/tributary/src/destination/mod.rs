//! Destination writers
//!
//! A destination durably persists batches of records. The write operation is
//! a hard boundary: every failure is folded into a [`WriteResult`] with a
//! human-readable message, and the consumer loop only ever observes the
//! resulting status transition, never a raw error.
//!
//! Two sinks ship with the engine, selected by a configuration type tag
//! through a registry:
//!
//! - `file` - one JSON object per line, for local runs and tests
//! - `bigquery_streaming` - batched, schema-validated, concurrent appends
//!   over the BigQuery Storage Write API          (feature `bigquery`)

pub mod file;

#[cfg(feature = "bigquery")]
pub mod bigquery;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::DestinationError;
use crate::message::Record;
use crate::pipeline::JobContext;

/// Result of one destination write call
#[derive(Debug, Clone, Default)]
pub struct WriteResult {
    /// Whether the whole batch landed. A batch either fully lands or fails;
    /// partial writes are never reported as success.
    pub success: bool,
    /// Human-readable failure message
    pub message: Option<String>,
    /// Number of records written on success
    pub records_written: u64,
}

impl WriteResult {
    /// A successful write of `records_written` rows
    pub fn success(records_written: u64) -> Self {
        Self {
            success: true,
            message: None,
            records_written,
        }
    }

    /// A failed write with a message
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            records_written: 0,
        }
    }
}

/// Trait implemented by destination writers
#[async_trait]
pub trait Destination: Send + Sync {
    /// Verify connectivity and provision what the destination needs
    /// (idempotent).
    async fn check(&self) -> Result<(), DestinationError>;

    /// Write a batch of records. Never panics and never returns a raw error;
    /// failures come back as an unsuccessful [`WriteResult`].
    async fn write(&self, records: &[Record]) -> WriteResult;
}

/// File destination configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct FileDestinationConfig {
    /// Path of the output file; created if absent, appended otherwise
    #[validate(length(min = 1))]
    pub filepath: String,

    /// Records buffered in the consumer before a write (0 = write-through)
    #[serde(default)]
    pub buffer_records: usize,
}

/// User-facing destination configuration, tagged by destination type
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DestinationConfig {
    /// JSONL file sink
    File(FileDestinationConfig),
    /// BigQuery Storage Write API sink
    #[cfg(feature = "bigquery")]
    BigqueryStreaming(bigquery::config::BigQueryStreamingConfig),
}

impl DestinationConfig {
    /// Registry key for this destination type
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            #[cfg(feature = "bigquery")]
            Self::BigqueryStreaming(_) => "bigquery_streaming",
        }
    }

    /// Consumer-side record buffering threshold for this destination
    pub fn buffer_records(&self) -> usize {
        match self {
            Self::File(config) => config.buffer_records,
            #[cfg(feature = "bigquery")]
            Self::BigqueryStreaming(config) => config.buffer_records,
        }
    }
}

/// Factory trait for constructing destinations from configuration
#[async_trait]
pub trait DestinationFactory: Send + Sync {
    async fn create(
        &self,
        config: &DestinationConfig,
        job: &JobContext,
    ) -> Result<Arc<dyn Destination>, DestinationError>;
}

/// Registry mapping a destination type tag to a constructor
pub struct DestinationRegistry {
    destinations: HashMap<String, Arc<dyn DestinationFactory>>,
}

impl DestinationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            destinations: HashMap::new(),
        }
    }

    /// Register a destination factory under a type tag
    pub fn register(&mut self, name: &str, factory: Arc<dyn DestinationFactory>) {
        self.destinations.insert(name.to_string(), factory);
    }

    /// Get a destination factory by type tag
    pub fn get(&self, name: &str) -> Option<&Arc<dyn DestinationFactory>> {
        self.destinations.get(name)
    }

    /// Check if a type tag is registered
    pub fn contains(&self, name: &str) -> bool {
        self.destinations.contains_key(name)
    }

    /// Number of registered destinations
    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    /// Construct a destination for the given configuration
    pub async fn create(
        &self,
        config: &DestinationConfig,
        job: &JobContext,
    ) -> Result<Arc<dyn Destination>, DestinationError> {
        let tag = config.type_tag();
        let factory = self.get(tag).ok_or_else(|| {
            DestinationError::config(format!(
                "Destination type '{tag}' is not enabled in this build"
            ))
        })?;
        factory.create(config, job).await
    }
}

impl Default for DestinationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with all enabled destinations
pub fn create_destination_registry() -> DestinationRegistry {
    let mut registry = DestinationRegistry::new();

    registry.register("file", Arc::new(file::FileDestinationFactory));

    #[cfg(feature = "bigquery")]
    registry.register(
        "bigquery_streaming",
        Arc::new(bigquery::BigQueryStreamingDestinationFactory),
    );

    registry
}

/// Construct a destination from configuration using the default registry
pub async fn create_destination(
    config: &DestinationConfig,
    job: &JobContext,
) -> Result<Arc<dyn Destination>, DestinationError> {
    create_destination_registry().create(config, job).await
}

/// Consumer-side record accumulator.
///
/// Collects records across queue messages until the threshold is reached,
/// bounding destination round-trips for chatty sources. A threshold of `0`
/// means write-through. The consumer always flushes on termination.
#[derive(Debug, Default)]
pub struct RecordBuffer {
    records: Vec<Record>,
    threshold: usize,
}

impl RecordBuffer {
    /// Create a buffer flushing at `threshold` records (0 = write-through)
    pub fn new(threshold: usize) -> Self {
        Self {
            records: Vec::new(),
            threshold,
        }
    }

    /// Append a batch of records
    pub fn extend(&mut self, records: Vec<Record>) {
        self.records.extend(records);
    }

    /// Whether enough records accumulated to warrant a write
    pub fn should_flush(&self) -> bool {
        if self.threshold == 0 {
            !self.records.is_empty()
        } else {
            self.records.len() >= self.threshold
        }
    }

    /// Take all buffered records
    pub fn drain(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.records)
    }

    /// Number of buffered records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the buffer holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceRecord;
    use chrono::Utc;
    use serde_json::json;

    fn record(id: &str) -> Record {
        Record::from_source(
            SourceRecord {
                id: id.to_string(),
                data: json!({"id": id}),
                timestamp: Utc::now(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_registry_contents() {
        let registry = create_destination_registry();
        assert!(registry.contains("file"));

        #[cfg(feature = "bigquery")]
        assert!(registry.contains("bigquery_streaming"));
    }

    #[test]
    fn test_write_result_constructors() {
        let ok = WriteResult::success(42);
        assert!(ok.success);
        assert_eq!(ok.records_written, 42);
        assert!(ok.message.is_none());

        let failed = WriteResult::failure("2/3 append chunks failed");
        assert!(!failed.success);
        assert_eq!(failed.records_written, 0);
    }

    #[test]
    fn test_write_through_buffer() {
        let mut buffer = RecordBuffer::new(0);
        assert!(!buffer.should_flush());
        buffer.extend(vec![record("1")]);
        assert!(buffer.should_flush());
        assert_eq!(buffer.drain().len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_threshold_buffer() {
        let mut buffer = RecordBuffer::new(3);
        buffer.extend(vec![record("1"), record("2")]);
        assert!(!buffer.should_flush());
        buffer.extend(vec![record("3")]);
        assert!(buffer.should_flush());
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_config_from_yaml() {
        let config: DestinationConfig = serde_yaml::from_str(
            r#"
            type: file
            filepath: /tmp/out.jsonl
            "#,
        )
        .unwrap();
        assert_eq!(config.type_tag(), "file");
        assert_eq!(config.buffer_records(), 0);
    }
}
