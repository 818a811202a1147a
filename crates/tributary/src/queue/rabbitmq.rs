//! RabbitMQ queue backend
//!
//! A broker exchange/queue over [lapin](https://crates.io/crates/lapin).
//! The per-job queue is declared with an `x-max-length` bound at `setup`,
//! deliveries stay unacknowledged until the consumer calls `ack`, and
//! `teardown` deletes the ephemeral queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Dequeued, QueueBackend, QueueBackendFactory, QueueConfig};
use crate::error::EngineError;
use crate::message::QueueMessage;
use crate::pipeline::StopSignal;

/// Broker exchange/queue backend
pub struct RabbitMqQueue {
    // Kept alive for the channel's lifetime; dropping it closes the channel.
    _connection: Connection,
    channel: Channel,
    queue_name: String,
    max_messages: usize,
    poll_interval: Duration,
    consumer: Mutex<Option<lapin::Consumer>>,
    /// Acker of the delivery most recently returned by `dequeue`
    in_flight: Mutex<Option<lapin::acker::Acker>>,
}

impl RabbitMqQueue {
    /// Connect to the broker and open a channel.
    pub async fn connect(config: &QueueConfig) -> Result<Self, EngineError> {
        let broker = config.require_broker()?;
        let uri = format!("amqp://{}:{}", broker.host, broker.port);

        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| {
                EngineError::transport(format!("Failed to connect to RabbitMQ at {uri}: {e}"))
            })?;
        let channel = connection.create_channel().await.map_err(|e| {
            EngineError::transport(format!("Failed to open RabbitMQ channel: {e}"))
        })?;

        Ok(Self {
            _connection: connection,
            channel,
            queue_name: config.name.clone(),
            max_messages: config.max_messages,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            consumer: Mutex::new(None),
            in_flight: Mutex::new(None),
        })
    }
}

#[async_trait]
impl QueueBackend for RabbitMqQueue {
    async fn setup(&self) -> Result<(), EngineError> {
        let mut arguments = FieldTable::default();
        arguments.insert(
            "x-max-length".into(),
            AMQPValue::LongLongInt(self.max_messages as i64),
        );

        self.channel
            .queue_declare(
                &self.queue_name,
                QueueDeclareOptions::default(),
                arguments,
            )
            .await
            .map_err(|e| {
                EngineError::transport(format!(
                    "Failed to declare queue '{}': {e}",
                    self.queue_name
                ))
            })?;

        info!(queue = %self.queue_name, max_messages = self.max_messages, "rabbitmq queue declared");
        Ok(())
    }

    async fn enqueue(&self, message: QueueMessage) -> Result<(), EngineError> {
        let payload = message.to_bytes()?;

        self.channel
            .basic_publish(
                "",
                &self.queue_name,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| EngineError::transport(format!("RabbitMQ publish failed: {e}")))?
            .await
            .map_err(|e| {
                EngineError::transport(format!("RabbitMQ publish confirmation failed: {e}"))
            })?;
        Ok(())
    }

    async fn dequeue(&self, stop: &StopSignal) -> Result<Dequeued, EngineError> {
        if stop.is_raised() {
            return Ok(Dequeued::Stopped);
        }

        let mut guard = self.consumer.lock().await;
        if guard.is_none() {
            let consumer = self
                .channel
                .basic_consume(
                    &self.queue_name,
                    "tributary-consumer",
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    EngineError::transport(format!("RabbitMQ consume setup failed: {e}"))
                })?;
            *guard = Some(consumer);
        }
        let consumer = guard
            .as_mut()
            .ok_or_else(|| EngineError::transport("RabbitMQ consumer not initialized"))?;

        match tokio::time::timeout(self.poll_interval, consumer.next()).await {
            Err(_) => Ok(Dequeued::TimedOut),
            Ok(None) => Err(EngineError::transport(
                "RabbitMQ consume stream closed by broker",
            )),
            Ok(Some(Err(e))) => Err(EngineError::transport(format!(
                "RabbitMQ delivery failed: {e}"
            ))),
            Ok(Some(Ok(delivery))) => {
                let message = QueueMessage::from_bytes(&delivery.data)?;
                *self.in_flight.lock().await = Some(delivery.acker);
                Ok(Dequeued::Message(message))
            }
        }
    }

    async fn ack(&self) -> Result<(), EngineError> {
        if let Some(acker) = self.in_flight.lock().await.take() {
            acker
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| EngineError::transport(format!("RabbitMQ ack failed: {e}")))?;
        }
        Ok(())
    }

    async fn teardown(&self) -> Result<(), EngineError> {
        self.channel
            .queue_delete(&self.queue_name, QueueDeleteOptions::default())
            .await
            .map_err(|e| {
                EngineError::transport(format!(
                    "Failed to delete queue '{}': {e}",
                    self.queue_name
                ))
            })?;
        debug!(queue = %self.queue_name, "rabbitmq queue deleted");
        Ok(())
    }
}

/// Factory for the RabbitMQ backend
pub struct RabbitMqQueueFactory;

#[async_trait]
impl QueueBackendFactory for RabbitMqQueueFactory {
    async fn create(
        &self,
        config: &QueueConfig,
    ) -> Result<Arc<dyn QueueBackend>, EngineError> {
        let queue = RabbitMqQueue::connect(config).await?;
        queue.setup().await?;
        Ok(Arc::new(queue))
    }
}
