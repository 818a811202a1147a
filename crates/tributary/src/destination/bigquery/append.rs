//! Chunking and concurrent append dispatch
//!
//! A batch's serialized rows are partitioned into contiguous chunks bounded
//! by row count, then one append call per chunk is dispatched over a
//! semaphore-bounded worker pool. All chunks target the same write stream,
//! resolved once per write invocation. The batch succeeds only if every
//! chunk succeeds; a single failing chunk fails the whole batch.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use gcp_bigquery_client::google::cloud::bigquery::storage::v1::append_rows_response;
use gcp_bigquery_client::storage::StreamName;
use gcp_bigquery_client::Client;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::encode::EncodedRow;
use super::schema::WireSchema;
use crate::error::DestinationError;

/// Partition serialized rows into contiguous chunks of at most `max_rows`.
/// Chunk boundaries depend only on row count, never payload size.
pub fn chunk_rows(rows: Vec<EncodedRow>, max_rows: usize) -> Vec<Vec<EncodedRow>> {
    if rows.is_empty() {
        return Vec::new();
    }
    let max_rows = max_rows.max(1);
    let mut chunks = Vec::with_capacity(rows.len().div_ceil(max_rows));
    let mut rows = rows;
    while rows.len() > max_rows {
        let tail = rows.split_off(max_rows);
        chunks.push(rows);
        rows = tail;
    }
    chunks.push(rows);
    chunks
}

/// One append call against the destination's streaming write endpoint
#[async_trait]
pub(crate) trait AppendTransport: Send + Sync + 'static {
    async fn append_chunk(&self, rows: Vec<EncodedRow>) -> Result<(), DestinationError>;
}

/// Dispatch one append per chunk across the worker pool and collect every
/// chunk's result. Returns the number of rows written, or an append error
/// naming how many chunks failed - partially-written batches are never
/// reported as success.
pub(crate) async fn dispatch_chunks(
    transport: Arc<dyn AppendTransport>,
    pool: Arc<Semaphore>,
    chunks: Vec<Vec<EncodedRow>>,
) -> Result<u64, DestinationError> {
    let total_chunks = chunks.len();
    let mut tasks = JoinSet::new();

    for (index, chunk) in chunks.into_iter().enumerate() {
        let transport = transport.clone();
        let pool = pool.clone();
        tasks.spawn(async move {
            let _permit = pool
                .acquire_owned()
                .await
                .map_err(|_| DestinationError::append("Append worker pool closed"))?;
            let rows = chunk.len() as u64;
            debug!(chunk = index, rows, "dispatching append chunk");
            transport.append_chunk(chunk).await.map(|_| rows)
        });
    }

    let mut rows_written = 0u64;
    let mut failures: Vec<DestinationError> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(rows)) => rows_written += rows,
            Ok(Err(e)) => failures.push(e),
            Err(e) => failures.push(DestinationError::append(format!(
                "Append task panicked: {e}"
            ))),
        }
    }

    if failures.is_empty() {
        Ok(rows_written)
    } else {
        warn!(
            failed = failures.len(),
            total = total_chunks,
            "append batch failed"
        );
        Err(DestinationError::append(format!(
            "{}/{} append chunks failed, first failure: {}",
            failures.len(),
            total_chunks,
            failures[0]
        )))
    }
}

/// Production transport over the BigQuery Storage Write API default stream
pub(crate) struct StorageWriteTransport {
    client: Client,
    project_id: String,
    dataset_id: String,
    table_id: String,
    schema: Arc<WireSchema>,
    trace_id: String,
}

impl StorageWriteTransport {
    pub(crate) fn new(
        client: Client,
        project_id: String,
        dataset_id: String,
        table_id: String,
        schema: Arc<WireSchema>,
    ) -> Self {
        let trace_id = format!("tributary-{table_id}");
        Self {
            client,
            project_id,
            dataset_id,
            table_id,
            schema,
            trace_id,
        }
    }
}

#[async_trait]
impl AppendTransport for StorageWriteTransport {
    async fn append_chunk(&self, rows: Vec<EncodedRow>) -> Result<(), DestinationError> {
        let stream_name = StreamName::new_default(
            self.project_id.clone(),
            self.dataset_id.clone(),
            self.table_id.clone(),
        );
        let table_descriptor = self.schema.to_table_descriptor();
        let (proto_rows, _num_processed) = gcp_bigquery_client::storage::StorageApi::create_rows(
            &table_descriptor,
            &rows,
            usize::MAX,
        );

        // Each worker appends through its own client handle; the underlying
        // channel and auth state are shared.
        let mut client = self.client.clone();
        let mut responses = client
            .storage_mut()
            .append_rows(&stream_name, proto_rows, self.trace_id.clone())
            .await
            .map_err(|e| DestinationError::append(format!("append_rows call failed: {e}")))?;

        while let Some(response) = responses.next().await {
            let response = response
                .map_err(|e| DestinationError::append(format!("Append stream error: {e}")))?;
            if let Some(append_rows_response::Response::Error(status)) = response.response {
                return Err(DestinationError::append(format!(
                    "Append rejected with status {}: {}",
                    status.code, status.message
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rows(count: usize) -> Vec<EncodedRow> {
        (0..count)
            .map(|i| EncodedRow {
                bytes: vec![i as u8],
            })
            .collect()
    }

    struct CountingTransport {
        calls: AtomicUsize,
        fail_chunk_of_len: Option<usize>,
    }

    impl CountingTransport {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_chunk_of_len: None,
            }
        }

        fn failing_on(len: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_chunk_of_len: Some(len),
            }
        }
    }

    #[async_trait]
    impl AppendTransport for CountingTransport {
        async fn append_chunk(&self, rows: Vec<EncodedRow>) -> Result<(), DestinationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_chunk_of_len == Some(rows.len()) {
                return Err(DestinationError::append("stream returned INTERNAL"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_chunk_boundaries_by_row_count() {
        let chunks = chunk_rows(rows(2_500), 1_000);
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1_000, 1_000, 500]);

        // No rows dropped, order preserved.
        let flattened: Vec<u8> = chunks.into_iter().flatten().map(|r| r.bytes[0]).collect();
        let expected: Vec<u8> = (0..2_500usize).map(|i| i as u8).collect();
        assert_eq!(flattened, expected);
    }

    #[test]
    fn test_chunking_edges() {
        assert!(chunk_rows(rows(0), 1_000).is_empty());
        assert_eq!(chunk_rows(rows(1_000), 1_000).len(), 1);
        assert_eq!(chunk_rows(rows(1_001), 1_000).len(), 2);
    }

    #[tokio::test]
    async fn test_all_chunks_succeed() {
        let transport = Arc::new(CountingTransport::new());
        let pool = Arc::new(Semaphore::new(4));
        let chunks = chunk_rows(rows(2_500), 1_000);

        let written = dispatch_chunks(transport.clone(), pool, chunks)
            .await
            .unwrap();
        assert_eq!(written, 2_500);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_chunk_failure_fails_batch() {
        // The 500-row tail chunk fails; the whole batch must fail and the
        // failure message must account for it.
        let transport = Arc::new(CountingTransport::failing_on(500));
        let pool = Arc::new(Semaphore::new(4));
        let chunks = chunk_rows(rows(2_500), 1_000);

        let err = dispatch_chunks(transport.clone(), pool, chunks)
            .await
            .unwrap_err();
        assert!(matches!(err, DestinationError::Append(_)));
        assert!(err.to_string().contains("1/3"));
        // Every chunk was still dispatched and accounted for.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }
}
