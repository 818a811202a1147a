//! BigQuery streaming destination
//!
//! Writes batches into a BigQuery table through the Storage Write API
//! default stream: the wire schema is compiled once per table, rows are
//! strictly validated and serialized to protobuf, chunked by row count, and
//! appended concurrently across a worker pool owned by the destination
//! instance. A batch either fully lands or the write reports failure.
//!
//! # Authentication
//!
//! A service-account key can be supplied in configuration, inline or as a
//! file path; it is parsed and handed to the client constructor exactly once
//! when the destination is built. Without it the client falls back to
//! application default credentials. Process-wide environment state is never
//! mutated.

pub mod append;
pub mod config;
pub mod encode;
pub mod schema;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use gcp_bigquery_client::model::dataset::Dataset;
use gcp_bigquery_client::model::table::Table;
use gcp_bigquery_client::model::table_schema::TableSchema;
use gcp_bigquery_client::model::time_partitioning::TimePartitioning;
use gcp_bigquery_client::Client;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, info};

use self::append::{chunk_rows, dispatch_chunks, StorageWriteTransport};
use self::config::BigQueryStreamingConfig;
use self::encode::{encode_row, project_provenance, project_unnested, EncodedRow};
use self::schema::WireSchema;
use super::{Destination, DestinationConfig, DestinationFactory, WriteResult};
use crate::error::DestinationError;
use crate::message::Record;
use crate::pipeline::JobContext;

/// Streaming writer for one destination table
pub struct BigQueryStreamingDestination {
    config: BigQueryStreamingConfig,
    client: Client,
    table_id: String,
    wire_schema: Arc<WireSchema>,
    /// Worker pool bound for concurrent chunk appends, reused across writes
    append_pool: Arc<Semaphore>,
    /// Table provisioning runs once, on the first write
    table_ready: OnceCell<()>,
}

impl BigQueryStreamingDestination {
    /// Build the destination: validate configuration, construct the
    /// authenticated client, and compile the wire schema.
    pub async fn connect(
        config: BigQueryStreamingConfig,
        job: &JobContext,
    ) -> Result<Self, DestinationError> {
        config.check()?;

        let client = Self::create_client(&config).await?;

        let wire_schema = if config.unnest {
            let columns = config.record_schema.as_deref().unwrap_or_default();
            Arc::new(WireSchema::from_columns(columns))
        } else {
            Arc::new(WireSchema::provenance())
        };

        let table_id = config
            .table_id
            .clone()
            .unwrap_or_else(|| job.default_table_name());

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Ok(Self {
            config,
            client,
            table_id,
            wire_schema,
            append_pool: Arc::new(Semaphore::new(workers)),
            table_ready: OnceCell::new(),
        })
    }

    async fn create_client(config: &BigQueryStreamingConfig) -> Result<Client, DestinationError> {
        let auth = config.authentication.as_ref();

        if let Some(key) = auth.and_then(|a| a.service_account_key.as_ref()) {
            let sa_key = serde_json::from_str(key.expose_secret()).map_err(|e| {
                DestinationError::config(format!("Invalid service account key: {e}"))
            })?;
            Client::from_service_account_key(sa_key, false)
                .await
                .map_err(|e| {
                    DestinationError::connection(format!(
                        "Failed to create BigQuery client from inline key: {e}"
                    ))
                })
        } else if let Some(path) = auth.and_then(|a| a.service_account_key_file.as_ref()) {
            let sa_key = gcp_bigquery_client::yup_oauth2::read_service_account_key(path)
                .await
                .map_err(|e| {
                    DestinationError::config(format!(
                        "Failed to read service account key from '{path}': {e}"
                    ))
                })?;
            Client::from_service_account_key(sa_key, false)
                .await
                .map_err(|e| {
                    DestinationError::connection(format!(
                        "Failed to create BigQuery client from key file: {e}"
                    ))
                })
        } else {
            Client::from_application_default_credentials()
                .await
                .map_err(|e| {
                    DestinationError::connection(format!(
                        "Failed to create BigQuery client with ADC: {e}"
                    ))
                })
        }
    }

    /// Create the dataset if absent, in the configured location. Idempotent.
    async fn ensure_dataset(&self) -> Result<(), DestinationError> {
        let project = &self.config.project_id;
        let dataset = &self.config.dataset_id;

        if self.client.dataset().get(project, dataset).await.is_ok() {
            return Ok(());
        }

        info!(project, dataset, "creating missing dataset");
        self.client
            .dataset()
            .create(Dataset::new(project, dataset).location(&self.config.dataset_location))
            .await
            .map_err(|e| {
                DestinationError::connection(format!("Failed to create dataset {dataset}: {e}"))
            })?;
        Ok(())
    }

    /// Create the destination table with the compiled schema and configured
    /// time partitioning. No-op when the table already exists.
    async fn ensure_table(&self) -> Result<(), DestinationError> {
        self.ensure_dataset().await?;

        let project = &self.config.project_id;
        let dataset = &self.config.dataset_id;

        if self
            .client
            .table()
            .get(project, dataset, &self.table_id, None)
            .await
            .is_ok()
        {
            debug!(table = %self.table_id, "destination table already exists");
            return Ok(());
        }

        let table_schema = TableSchema::new(self.wire_schema.to_table_field_schemas());
        // TODO: wire clustering keys through configuration. They must never
        // reorder the schema's columns.
        let mut table = Table::new(project, dataset, &self.table_id, table_schema);

        if let Some(spec) = &self.config.time_partitioning {
            let mut partitioning = TimePartitioning::per_day().field(&spec.field);
            partitioning.r#type = spec.granularity.as_str().to_string();
            table = table.time_partitioning(partitioning);
        }

        info!(table = %self.table_id, "creating destination table");
        self.client.table().create(table).await.map_err(|e| {
            DestinationError::connection(format!(
                "Failed to create table {}: {e}",
                self.table_id
            ))
        })?;
        Ok(())
    }

    /// Project and serialize the whole batch; any row failure fails the batch.
    fn serialize_batch(&self, records: &[Record]) -> Result<Vec<EncodedRow>, DestinationError> {
        let loaded_at = Utc::now();
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let projected = if self.config.unnest {
                project_unnested(&self.wire_schema, record)?
            } else {
                project_provenance(&self.wire_schema, record, loaded_at)?
            };
            rows.push(encode_row(&projected));
        }
        Ok(rows)
    }

    async fn write_batch(&self, records: &[Record]) -> Result<u64, DestinationError> {
        self.table_ready
            .get_or_try_init(|| self.ensure_table())
            .await?;

        let rows = self.serialize_batch(records)?;
        let chunks = chunk_rows(rows, self.config.max_rows_per_chunk);
        if chunks.is_empty() {
            return Ok(0);
        }

        // One write stream per invocation; every chunk appends to it.
        let transport = Arc::new(StorageWriteTransport::new(
            self.client.clone(),
            self.config.project_id.clone(),
            self.config.dataset_id.clone(),
            self.table_id.clone(),
            self.wire_schema.clone(),
        ));

        dispatch_chunks(transport, self.append_pool.clone(), chunks).await
    }
}

#[async_trait]
impl Destination for BigQueryStreamingDestination {
    async fn check(&self) -> Result<(), DestinationError> {
        self.ensure_dataset().await
    }

    async fn write(&self, records: &[Record]) -> WriteResult {
        match self.write_batch(records).await {
            Ok(written) => {
                info!(
                    table = %self.table_id,
                    records = written,
                    "batch appended"
                );
                WriteResult::success(written)
            }
            Err(e) => WriteResult::failure(e.to_string()),
        }
    }
}

/// Factory for the BigQuery streaming destination
pub struct BigQueryStreamingDestinationFactory;

#[async_trait]
impl DestinationFactory for BigQueryStreamingDestinationFactory {
    async fn create(
        &self,
        config: &DestinationConfig,
        job: &JobContext,
    ) -> Result<Arc<dyn Destination>, DestinationError> {
        match config {
            DestinationConfig::BigqueryStreaming(bq_config) => Ok(Arc::new(
                BigQueryStreamingDestination::connect(bq_config.clone(), job).await?,
            )),
            other => Err(DestinationError::config(format!(
                "bigquery_streaming factory received '{}' configuration",
                other.type_tag()
            ))),
        }
    }
}
