//! Kafka queue backend
//!
//! A broker topic/queue over [rskafka](https://crates.io/crates/rskafka), the
//! pure Rust Kafka client: no librdkafka, no C dependencies. Envelopes are
//! produced to partition 0 of the configured topic, which preserves FIFO
//! order for a single producer, and fetched from a consumed offset that is
//! committed in-process on `ack`.
//!
//! Kafka has no ephemeral queue delete; topic cleanup is left to broker
//! retention, so `teardown` is a logged no-op.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rskafka::client::partition::{Compression, OffsetAt, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use rskafka::record::Record;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Dequeued, QueueBackend, QueueBackendFactory, QueueConfig};
use crate::error::EngineError;
use crate::message::QueueMessage;
use crate::pipeline::StopSignal;

/// Upper bound on bytes fetched per poll
const MAX_FETCH_BYTES: i32 = 16 * 1024 * 1024;

/// Connection timeout for the initial broker handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Broker topic/queue backend
pub struct KafkaQueue {
    client: Client,
    topic: String,
    poll_interval: Duration,
    partition: OnceLock<Arc<PartitionClient>>,
    /// Offset of the next record to fetch
    next_offset: AtomicI64,
    /// Offset one past the last acknowledged record
    committed_offset: AtomicI64,
    /// Records fetched but not yet handed to the consumer
    fetched: Mutex<VecDeque<(QueueMessage, i64)>>,
    /// Offset of the message most recently returned by `dequeue`
    in_flight: Mutex<Option<i64>>,
}

impl KafkaQueue {
    /// Connect to the broker. The topic is declared later by `setup`.
    pub async fn connect(config: &QueueConfig) -> Result<Self, EngineError> {
        let broker = config.require_broker()?;
        let bootstrap = format!("{}:{}", broker.host, broker.port);

        let client = tokio::time::timeout(
            CONNECT_TIMEOUT,
            ClientBuilder::new(vec![bootstrap.clone()]).build(),
        )
        .await
        .map_err(|_| {
            EngineError::transport(format!("Connection timeout to Kafka broker {bootstrap}"))
        })?
        .map_err(|e| EngineError::transport(format!("Failed to connect to Kafka: {e}")))?;

        Ok(Self {
            client,
            topic: config.name.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            partition: OnceLock::new(),
            next_offset: AtomicI64::new(0),
            committed_offset: AtomicI64::new(0),
            fetched: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(None),
        })
    }

    fn partition_client(&self) -> Result<&Arc<PartitionClient>, EngineError> {
        self.partition
            .get()
            .ok_or_else(|| EngineError::transport("Kafka queue used before setup"))
    }

    /// Offset one past the last acknowledged record. A restarted consumer
    /// refetches from here, giving at-least-once delivery.
    pub fn committed_offset(&self) -> i64 {
        self.committed_offset.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueBackend for KafkaQueue {
    async fn setup(&self) -> Result<(), EngineError> {
        if self.partition.get().is_some() {
            return Ok(());
        }

        // Topic declaration is idempotent; an existing topic is fine.
        match self.client.controller_client() {
            Ok(controller) => {
                if let Err(e) = controller.create_topic(&self.topic, 1, 1, 5_000).await {
                    debug!(topic = %self.topic, "create_topic skipped: {e}");
                }
            }
            Err(e) => {
                warn!("failed to reach controller for topic declaration: {e}");
            }
        }

        let partition = self
            .client
            .partition_client(&self.topic, 0, UnknownTopicHandling::Error)
            .await
            .map_err(|e| {
                EngineError::transport(format!(
                    "Failed to open partition 0 of topic '{}': {e}",
                    self.topic
                ))
            })?;

        let earliest = partition.get_offset(OffsetAt::Earliest).await.map_err(|e| {
            EngineError::transport(format!("Failed to read earliest offset: {e}"))
        })?;
        self.next_offset.store(earliest, Ordering::SeqCst);
        self.committed_offset.store(earliest, Ordering::SeqCst);

        info!(topic = %self.topic, earliest, "kafka queue ready");
        let _ = self.partition.set(Arc::new(partition));
        Ok(())
    }

    async fn enqueue(&self, message: QueueMessage) -> Result<(), EngineError> {
        let payload = message.to_bytes()?;
        let record = Record {
            key: None,
            value: Some(payload),
            headers: BTreeMap::new(),
            timestamp: Utc::now(),
        };

        self.partition_client()?
            .produce(vec![record], Compression::NoCompression)
            .await
            .map_err(|e| EngineError::transport(format!("Kafka produce failed: {e}")))?;
        Ok(())
    }

    async fn dequeue(&self, stop: &StopSignal) -> Result<Dequeued, EngineError> {
        if stop.is_raised() {
            return Ok(Dequeued::Stopped);
        }

        {
            let mut fetched = self.fetched.lock().await;
            if let Some((message, offset)) = fetched.pop_front() {
                *self.in_flight.lock().await = Some(offset);
                return Ok(Dequeued::Message(message));
            }
        }

        let partition = self.partition_client()?;
        let start = self.next_offset.load(Ordering::SeqCst);
        let (records, _high_watermark) = partition
            .fetch_records(start, 1..MAX_FETCH_BYTES, self.poll_interval.as_millis() as i32)
            .await
            .map_err(|e| EngineError::transport(format!("Kafka fetch failed: {e}")))?;

        if records.is_empty() {
            return Ok(Dequeued::TimedOut);
        }

        let mut fetched = self.fetched.lock().await;
        for record_and_offset in records {
            let value = record_and_offset.record.value.ok_or_else(|| {
                EngineError::serialization("Kafka record carried no payload")
            })?;
            let message = QueueMessage::from_bytes(&value)?;
            fetched.push_back((message, record_and_offset.offset));
            self.next_offset
                .store(record_and_offset.offset + 1, Ordering::SeqCst);
        }

        match fetched.pop_front() {
            Some((message, offset)) => {
                *self.in_flight.lock().await = Some(offset);
                Ok(Dequeued::Message(message))
            }
            None => Ok(Dequeued::TimedOut),
        }
    }

    async fn ack(&self) -> Result<(), EngineError> {
        if let Some(offset) = self.in_flight.lock().await.take() {
            self.committed_offset.store(offset + 1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn teardown(&self) -> Result<(), EngineError> {
        // No topic delete in rskafka; retention owns cleanup.
        debug!(
            topic = %self.topic,
            committed = self.committed_offset(),
            "kafka queue teardown left to broker retention"
        );
        Ok(())
    }
}

/// Factory for the Kafka backend
pub struct KafkaQueueFactory;

#[async_trait]
impl QueueBackendFactory for KafkaQueueFactory {
    async fn create(
        &self,
        config: &QueueConfig,
    ) -> Result<Arc<dyn QueueBackend>, EngineError> {
        let queue = KafkaQueue::connect(config).await?;
        queue.setup().await?;
        Ok(Arc::new(queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{BrokerConfig, QueueType};

    fn kafka_config() -> QueueConfig {
        QueueConfig {
            queue_type: QueueType::Kafka,
            name: "tributary-test".to_string(),
            broker: Some(BrokerConfig {
                host: "localhost".to_string(),
                port: 9092,
            }),
            max_messages: 1_000,
            poll_interval_ms: 200,
        }
    }

    #[test]
    fn test_config_requires_broker() {
        let mut config = kafka_config();
        config.broker = None;
        assert!(config.require_broker().is_err());
    }

    #[test]
    fn test_config_from_yaml() {
        let config: QueueConfig = serde_yaml::from_str(
            r#"
            type: kafka
            name: creatures
            broker:
              host: kafka.internal
              port: 9092
            "#,
        )
        .unwrap();
        assert_eq!(config.queue_type, QueueType::Kafka);
        let broker = config.require_broker().unwrap();
        assert_eq!(broker.host, "kafka.internal");
        assert_eq!(broker.port, 9092);
    }
}
