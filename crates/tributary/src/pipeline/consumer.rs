//! Consumer loop: queue messages → destination writes
//!
//! Dequeues envelopes with a bounded wait, hands their records to the
//! destination writer, and resolves to a terminal [`PipelineStatus`]. A batch
//! either fully lands or the loop halts: write failures are never skipped,
//! preserving at-least-once semantics at batch granularity.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{PipelineStatus, StopSignal};
use crate::destination::{Destination, RecordBuffer};
use crate::queue::{Dequeued, QueueBackend};

/// The loading side of a pipeline
pub struct Consumer {
    queue: Arc<dyn QueueBackend>,
    destination: Arc<dyn Destination>,
    buffer: RecordBuffer,
}

impl Consumer {
    /// Create a write-through consumer (no destination-side buffering)
    pub fn new(queue: Arc<dyn QueueBackend>, destination: Arc<dyn Destination>) -> Self {
        Self::with_buffer(queue, destination, 0)
    }

    /// Create a consumer that accumulates up to `buffer_records` rows before
    /// writing. `0` writes through on every message. Buffered rows are always
    /// flushed when the termination marker arrives.
    pub fn with_buffer(
        queue: Arc<dyn QueueBackend>,
        destination: Arc<dyn Destination>,
        buffer_records: usize,
    ) -> Self {
        Self {
            queue,
            destination,
            buffer: RecordBuffer::new(buffer_records),
        }
    }

    /// Run the consumption loop to a terminal status.
    pub async fn run(mut self, stop: StopSignal) -> PipelineStatus {
        let status = PipelineStatus::Running;

        loop {
            let dequeued = match self.queue.dequeue(&stop).await {
                Ok(dequeued) => dequeued,
                Err(e) => {
                    error!("queue transport failure: {e}");
                    return status.transition(PipelineStatus::Error);
                }
            };

            let message = match dequeued {
                Dequeued::Stopped => {
                    info!("stop signal observed, leaving consumer loop");
                    // Buffered records were already acked; writing them out
                    // here keeps the kill path lossless. A failed flush still
                    // kills the loop - the checkpoint replays those rows.
                    if !self.flush().await {
                        warn!("flush on shutdown failed, rows will be re-extracted");
                    }
                    return status.transition(PipelineStatus::KilledByRunner);
                }
                Dequeued::TimedOut => continue,
                Dequeued::Message(message) => message,
            };

            if message.is_termination() {
                info!("termination signal received, flushing pending records");
                if !self.flush().await {
                    return status.transition(PipelineStatus::Error);
                }
                if let Err(e) = self.queue.ack().await {
                    warn!("failed to ack termination message: {e}");
                }
                return status.transition(PipelineStatus::Success);
            }

            debug!(
                iteration = message.iteration,
                records = message.records.len(),
                "batch dequeued"
            );
            self.buffer.extend(message.records);

            if self.buffer.should_flush() && !self.flush().await {
                return status.transition(PipelineStatus::Error);
            }

            // Acked only after the batch was handed off (buffered or
            // written); a crash before this point leaves the message for
            // redelivery on the broker-backed queues.
            if let Err(e) = self.queue.ack().await {
                error!("failed to ack message: {e}");
                return status.transition(PipelineStatus::Error);
            }
        }
    }

    /// Write all buffered records. Returns `false` on write failure.
    async fn flush(&mut self) -> bool {
        if self.buffer.is_empty() {
            return true;
        }

        let pending = self.buffer.drain();
        let result = self.destination.write(&pending).await;
        if result.success {
            debug!(records = result.records_written, "batch written");
            true
        } else {
            error!(
                "destination write failed: {}",
                result.message.as_deref().unwrap_or("unknown error")
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{Destination, WriteResult};
    use crate::message::{QueueMessage, Record};
    use crate::queue::memory::MemoryQueue;
    use crate::source::SourceRecord;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingDestination {
        written: Mutex<Vec<String>>,
        write_calls: AtomicUsize,
        fail: bool,
    }

    impl RecordingDestination {
        fn new() -> Self {
            Self {
                written: Mutex::new(Vec::new()),
                write_calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl Destination for RecordingDestination {
        async fn check(&self) -> Result<(), crate::error::DestinationError> {
            Ok(())
        }

        async fn write(&self, records: &[Record]) -> WriteResult {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return WriteResult::failure("Missing required field: name");
            }
            let mut written = self.written.lock().unwrap();
            written.extend(records.iter().map(|r| r.source_record_id.clone()));
            WriteResult::success(records.len() as u64)
        }
    }

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

    async fn queue_with(messages: Vec<QueueMessage>) -> Arc<MemoryQueue> {
        let queue = Arc::new(MemoryQueue::new(64, Duration::from_millis(20)));
        for message in messages {
            queue.enqueue(message).await.unwrap();
        }
        queue
    }

    #[tokio::test]
    async fn test_termination_yields_success() {
        let queue = queue_with(vec![
            QueueMessage::new(0, vec![record("1")], None),
            QueueMessage::termination(1),
        ])
        .await;
        let destination = Arc::new(RecordingDestination::new());
        let consumer = Consumer::new(queue, destination.clone());

        let status = consumer.run(StopSignal::new()).await;
        assert_eq!(status, PipelineStatus::Success);
        assert_eq!(*destination.written.lock().unwrap(), vec!["1"]);
    }

    #[tokio::test]
    async fn test_write_failure_yields_error() {
        let queue = queue_with(vec![QueueMessage::new(0, vec![record("1")], None)]).await;
        let destination = Arc::new(RecordingDestination::failing());
        let consumer = Consumer::new(queue, destination);

        let status = consumer.run(StopSignal::new()).await;
        assert_eq!(status, PipelineStatus::Error);
    }

    #[tokio::test]
    async fn test_stop_signal_yields_killed() {
        let queue = queue_with(vec![QueueMessage::new(0, vec![record("1")], None)]).await;
        let destination = Arc::new(RecordingDestination::new());
        let consumer = Consumer::new(queue, destination.clone());

        let stop = StopSignal::new();
        stop.raise();
        let status = consumer.run(stop).await;
        assert_eq!(status, PipelineStatus::KilledByRunner);
        // The queued message was not consumed.
        assert!(destination.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_buffered_records_flush_on_termination() {
        let queue = queue_with(vec![
            QueueMessage::new(0, vec![record("1"), record("2")], None),
            QueueMessage::new(1, vec![record("3")], None),
            QueueMessage::termination(2),
        ])
        .await;
        let destination = Arc::new(RecordingDestination::new());
        // Threshold larger than the total so only the termination flush fires.
        let consumer = Consumer::with_buffer(queue, destination.clone(), 100);

        let status = consumer.run(StopSignal::new()).await;
        assert_eq!(status, PipelineStatus::Success);
        assert_eq!(destination.write_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*destination.written.lock().unwrap(), vec!["1", "2", "3"]);
    }
}
