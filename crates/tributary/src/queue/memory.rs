//! In-process queue backend
//!
//! A bounded `tokio::sync::mpsc` channel shared between the producer and
//! consumer tasks of one process. The single reader removes a message on
//! take, so there is no redelivery and `ack` is a no-op.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Dequeued, QueueBackend, QueueBackendFactory, QueueConfig};
use crate::error::EngineError;
use crate::message::QueueMessage;
use crate::pipeline::StopSignal;

/// In-process bounded queue
pub struct MemoryQueue {
    sender: mpsc::Sender<QueueMessage>,
    receiver: Mutex<mpsc::Receiver<QueueMessage>>,
    poll_interval: Duration,
}

impl MemoryQueue {
    /// Create a queue holding at most `max_messages` buffered messages
    pub fn new(max_messages: usize, poll_interval: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(max_messages);
        Self {
            sender,
            receiver: Mutex::new(receiver),
            poll_interval,
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn setup(&self) -> Result<(), EngineError> {
        // Nothing to declare; the channel exists from construction.
        Ok(())
    }

    async fn enqueue(&self, message: QueueMessage) -> Result<(), EngineError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| EngineError::transport("In-process queue closed"))
    }

    async fn dequeue(&self, stop: &StopSignal) -> Result<Dequeued, EngineError> {
        if stop.is_raised() {
            return Ok(Dequeued::Stopped);
        }

        let mut receiver = self.receiver.lock().await;
        match tokio::time::timeout(self.poll_interval, receiver.recv()).await {
            Ok(Some(message)) => Ok(Dequeued::Message(message)),
            Ok(None) => Err(EngineError::transport("In-process queue closed")),
            Err(_) => Ok(Dequeued::TimedOut),
        }
    }

    async fn ack(&self) -> Result<(), EngineError> {
        // Single reader, message already removed on take.
        Ok(())
    }

    async fn teardown(&self) -> Result<(), EngineError> {
        debug!("in-process queue torn down with process");
        Ok(())
    }
}

/// Factory for the in-process backend
pub struct MemoryQueueFactory;

#[async_trait]
impl QueueBackendFactory for MemoryQueueFactory {
    async fn create(&self, config: &QueueConfig) -> Result<Arc<dyn QueueBackend>, EngineError> {
        Ok(Arc::new(MemoryQueue::new(
            config.max_messages,
            Duration::from_millis(config.poll_interval_ms),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::QueueMessage;

    fn short_poll_queue() -> MemoryQueue {
        MemoryQueue::new(16, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = short_poll_queue();
        let stop = StopSignal::new();

        for iteration in 0..3 {
            queue
                .enqueue(QueueMessage::new(iteration, vec![], None))
                .await
                .unwrap();
        }

        for expected in 0..3 {
            match queue.dequeue(&stop).await.unwrap() {
                Dequeued::Message(message) => assert_eq!(message.iteration, expected),
                other => panic!("expected message, got {other:?}"),
            }
            queue.ack().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_empty_queue_times_out() {
        let queue = short_poll_queue();
        let stop = StopSignal::new();
        assert!(matches!(
            queue.dequeue(&stop).await.unwrap(),
            Dequeued::TimedOut
        ));
    }

    #[tokio::test]
    async fn test_stop_signal_short_circuits() {
        let queue = short_poll_queue();
        queue
            .enqueue(QueueMessage::new(0, vec![], None))
            .await
            .unwrap();

        let stop = StopSignal::new();
        stop.raise();

        // The queued message is not consumed once the stop flag is raised.
        assert!(matches!(
            queue.dequeue(&stop).await.unwrap(),
            Dequeued::Stopped
        ));
        stop.clear();
        assert!(matches!(
            queue.dequeue(&stop).await.unwrap(),
            Dequeued::Message(_)
        ));
    }
}
