//! BigQuery streaming destination configuration

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::DestinationError;
use crate::types::SensitiveString;

/// Primitive column types supported by the streaming writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Datetime,
    Date,
}

/// Column nullability mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnMode {
    Required,
    #[default]
    Nullable,
    Repeated,
}

impl ColumnMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Required => "REQUIRED",
            Self::Nullable => "NULLABLE",
            Self::Repeated => "REPEATED",
        }
    }
}

/// One user-declared destination column (unnest mode)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BigQueryColumn {
    /// Name of the column
    pub name: String,
    /// Type of the column
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Mode of the column
    #[serde(default)]
    pub mode: ColumnMode,
    /// Description of the column
    #[serde(default)]
    pub description: Option<String>,
}

/// Time partitioning granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionGranularity {
    #[default]
    Day,
    Hour,
    Month,
    Year,
}

impl PartitionGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "DAY",
            Self::Hour => "HOUR",
            Self::Month => "MONTH",
            Self::Year => "YEAR",
        }
    }
}

/// Single time-partitioning rule applied at table creation
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TimePartitioningSpec {
    /// Partition column
    pub field: String,
    /// Partition granularity
    #[serde(rename = "type", default)]
    pub granularity: PartitionGranularity,
}

/// Destination credentials
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BigQueryAuthentication {
    /// Service-account key as a JSON string
    #[serde(default)]
    pub service_account_key: Option<SensitiveString>,

    /// Path to a service-account key file, used when no inline key is set.
    /// When both are absent, application default credentials are used.
    #[serde(default)]
    pub service_account_key_file: Option<String>,
}

/// Configuration for the BigQuery streaming destination
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct BigQueryStreamingConfig {
    /// GCP project ID
    #[validate(length(min = 1, max = 255))]
    pub project_id: String,

    /// BigQuery dataset ID
    #[validate(length(min = 1, max = 1024))]
    pub dataset_id: String,

    /// Table ID; inferred from the job's source and stream names when absent
    #[serde(default)]
    pub table_id: Option<String>,

    /// Dataset location used when the dataset has to be created
    #[serde(default = "default_dataset_location")]
    pub dataset_location: String,

    /// Project decoded source payloads onto the declared columns instead of
    /// storing the raw payload as an opaque string column
    #[serde(default)]
    pub unnest: bool,

    /// Declared destination columns. Required when `unnest` is true.
    #[serde(default)]
    pub record_schema: Option<Vec<BigQueryColumn>>,

    /// Time-partitioning rule for the destination table
    #[serde(default)]
    pub time_partitioning: Option<TimePartitioningSpec>,

    /// Maximum rows per streaming append request
    #[serde(default = "default_max_rows_per_chunk")]
    #[validate(range(min = 1, max = 50_000))]
    pub max_rows_per_chunk: usize,

    /// Records buffered in the consumer before a write (0 = write-through)
    #[serde(default)]
    pub buffer_records: usize,

    /// Destination credentials
    #[serde(default)]
    pub authentication: Option<BigQueryAuthentication>,
}

fn default_dataset_location() -> String {
    "US".to_string()
}

fn default_max_rows_per_chunk() -> usize {
    5_000
}

impl BigQueryStreamingConfig {
    /// Validate invariants that cut across fields
    pub fn check(&self) -> Result<(), DestinationError> {
        self.validate()
            .map_err(|e| DestinationError::config(e.to_string()))?;

        if self.unnest {
            match &self.record_schema {
                Some(columns) if !columns.is_empty() => {}
                _ => {
                    return Err(DestinationError::config(
                        "unnest requires a non-empty record_schema",
                    ))
                }
            }
        }
        Ok(())
    }
}
