//! Producer loop: source pages → queue messages
//!
//! Pulls pages from the source connector, packages each page as a
//! [`QueueMessage`] with a strictly increasing iteration, and periodically
//! pushes the `(iteration, pagination)` cursor to the checkpoint backend so
//! recovery granularity stays bounded. On source exhaustion it persists a
//! final cursor and enqueues the termination marker.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::{JobContext, PipelineStatus, StopSignal};
use crate::checkpoint::CheckpointBackend;
use crate::message::{QueueMessage, Record};
use crate::queue::QueueBackend;
use crate::source::{Source, SourcePage};

/// Default number of iterations between checkpoint writes
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10;

/// The extraction side of a pipeline
pub struct Producer<S: Source> {
    job: JobContext,
    source: S,
    queue: Arc<dyn QueueBackend>,
    checkpoint: Arc<dyn CheckpointBackend>,
    checkpoint_interval: u64,
}

impl<S: Source> Producer<S> {
    pub fn new(
        job: JobContext,
        source: S,
        queue: Arc<dyn QueueBackend>,
        checkpoint: Arc<dyn CheckpointBackend>,
    ) -> Self {
        Self {
            job,
            source,
            queue,
            checkpoint,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }

    /// Override how many iterations pass between cursor writes.
    /// `0` disables periodic checkpointing; the final cursor is still saved.
    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Run the extraction loop to a terminal status.
    pub async fn run(mut self, stop: StopSignal) -> PipelineStatus {
        // Outstanding fire-and-forget cursor writes, joined before the final
        // save so an older cursor can never overwrite it.
        let mut checkpoint_tasks = tokio::task::JoinSet::new();

        let (mut iteration, mut pagination) = match self.checkpoint.load_cursor(&self.job.job_id).await
        {
            Ok(Some(cursor)) => {
                info!(
                    job_id = %self.job.job_id,
                    iteration = cursor.iteration,
                    "resuming extraction from checkpoint"
                );
                (cursor.iteration + 1, cursor.pagination)
            }
            Ok(None) => (0, None),
            Err(e) => {
                // At-least-once: starting over re-extracts rather than loses.
                warn!(job_id = %self.job.job_id, "failed to load cursor, starting fresh: {e}");
                (0, None)
            }
        };

        loop {
            if stop.is_raised() {
                info!(job_id = %self.job.job_id, "stop signal observed, leaving producer loop");
                return PipelineStatus::KilledByRunner;
            }

            let page = match self.source.next_page(pagination.clone()).await {
                Ok(page) => page,
                Err(e) => {
                    error!(
                        job_id = %self.job.job_id,
                        source = self.source.name(),
                        "unrecoverable source error: {e}"
                    );
                    return PipelineStatus::Error;
                }
            };

            match page {
                SourcePage::Exhausted => {
                    while checkpoint_tasks.join_next().await.is_some() {}

                    // Final cursor is awaited so recovery starts past the
                    // last batch even when the periodic interval never fired.
                    if let Err(e) = self
                        .checkpoint
                        .save_cursor(&self.job.job_id, iteration, pagination.clone())
                        .await
                    {
                        warn!(job_id = %self.job.job_id, "final cursor save failed: {e}");
                    }

                    if let Err(e) = self.queue.enqueue(QueueMessage::termination(iteration)).await {
                        error!(job_id = %self.job.job_id, "failed to enqueue termination: {e}");
                        return PipelineStatus::Error;
                    }

                    info!(
                        job_id = %self.job.job_id,
                        iterations = iteration,
                        "source exhausted, termination enqueued"
                    );
                    return PipelineStatus::Success;
                }
                SourcePage::Page {
                    records,
                    next_pagination,
                } => {
                    let extracted_at = Utc::now();
                    let records: Vec<Record> = records
                        .into_iter()
                        .map(|record| Record::from_source(record, extracted_at))
                        .collect();
                    let batch_size = records.len();

                    let message = QueueMessage::new(iteration, records, next_pagination.clone());
                    if let Err(e) = self.queue.enqueue(message).await {
                        error!(job_id = %self.job.job_id, iteration, "enqueue failed: {e}");
                        return PipelineStatus::Error;
                    }
                    debug!(iteration, records = batch_size, "batch enqueued");

                    if self.checkpoint_interval > 0
                        && iteration > 0
                        && iteration % self.checkpoint_interval == 0
                    {
                        // Fire-and-forget: the cursor write must not block
                        // extraction beyond the configured interval.
                        let checkpoint = self.checkpoint.clone();
                        let job_id = self.job.job_id.clone();
                        let cursor_pagination = next_pagination.clone();
                        checkpoint_tasks.spawn(async move {
                            if let Err(e) = checkpoint
                                .save_cursor(&job_id, iteration, cursor_pagination)
                                .await
                            {
                                warn!(job_id = %job_id, iteration, "cursor save failed: {e}");
                            }
                        });
                    }

                    pagination = next_pagination;
                    iteration += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointBackend;
    use crate::queue::memory::MemoryQueue;
    use crate::queue::Dequeued;
    use crate::source::dummy::DummySource;
    use std::time::Duration;

    fn test_job() -> JobContext {
        JobContext::new("test-job", "dummy", "creatures")
    }

    #[tokio::test]
    async fn test_iterations_are_gapless_and_terminated() {
        let queue = Arc::new(MemoryQueue::new(64, Duration::from_millis(20)));
        let checkpoint = Arc::new(InMemoryCheckpointBackend::new());
        let producer = Producer::new(
            test_job(),
            DummySource::new(),
            queue.clone(),
            checkpoint.clone(),
        );

        let status = producer.run(StopSignal::new()).await;
        assert_eq!(status, PipelineStatus::Success);

        let stop = StopSignal::new();
        let mut iterations = Vec::new();
        let mut terminations = 0;
        loop {
            match queue.dequeue(&stop).await.unwrap() {
                Dequeued::Message(message) => {
                    if message.is_termination() {
                        terminations += 1;
                        break;
                    }
                    iterations.push(message.iteration);
                }
                Dequeued::TimedOut => break,
                Dequeued::Stopped => unreachable!(),
            }
        }

        assert_eq!(iterations, vec![0, 1, 2]);
        assert_eq!(terminations, 1);
    }

    #[tokio::test]
    async fn test_final_cursor_saved_on_exhaustion() {
        let queue = Arc::new(MemoryQueue::new(64, Duration::from_millis(20)));
        let checkpoint = Arc::new(InMemoryCheckpointBackend::new());
        let producer = Producer::new(
            test_job(),
            DummySource::new(),
            queue.clone(),
            checkpoint.clone(),
        )
        .with_checkpoint_interval(2);

        producer.run(StopSignal::new()).await;

        let cursor = checkpoint.load_cursor("test-job").await.unwrap().unwrap();
        // The dummy source yields three pages; the final cursor covers the
        // iteration after the last batch.
        assert_eq!(cursor.iteration, 3);
    }

    #[tokio::test]
    async fn test_stop_before_first_page() {
        let queue = Arc::new(MemoryQueue::new(64, Duration::from_millis(20)));
        let checkpoint = Arc::new(InMemoryCheckpointBackend::new());
        let producer = Producer::new(test_job(), DummySource::new(), queue.clone(), checkpoint);

        let stop = StopSignal::new();
        stop.raise();
        let status = producer.run(stop.clone()).await;
        assert_eq!(status, PipelineStatus::KilledByRunner);

        // Nothing was enqueued.
        stop.clear();
        assert!(matches!(
            queue.dequeue(&stop).await.unwrap(),
            Dequeued::TimedOut
        ));
    }
}
