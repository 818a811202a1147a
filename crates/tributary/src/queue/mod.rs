//! Queue backend abstraction
//!
//! The queue decouples extraction from loading: the producer loop enqueues
//! [`QueueMessage`] envelopes, the consumer loop dequeues them with a bounded
//! wait so it can periodically re-check the stop flag. Three interchangeable
//! backends implement the contract, selected by a configuration type tag
//! through a registry:
//!
//! - `memory` - in-process bounded channel, single reader, no redelivery
//! - `kafka` - broker topic/queue over rskafka              (feature `kafka`)
//! - `rabbitmq` - broker exchange/queue over lapin          (feature `rabbitmq`)
//!
//! All backends deliver messages in the order a single producer enqueued
//! them, and the broker variants keep a message until the consumer
//! acknowledges it.

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::EngineError;
use crate::message::QueueMessage;
use crate::pipeline::StopSignal;

/// Outcome of one bounded-wait dequeue attempt
#[derive(Debug)]
pub enum Dequeued {
    /// A message was taken from the queue
    Message(QueueMessage),
    /// The bounded wait elapsed with no message available
    TimedOut,
    /// The stop signal was observed; no message was consumed
    Stopped,
}

/// Capability interface implemented by every queue backend
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Declare the per-job queue (broker variants). Idempotent.
    async fn setup(&self) -> Result<(), EngineError>;

    /// Append a message to the queue. Blocks when the configured maximum
    /// buffered message count is reached (backpressure).
    async fn enqueue(&self, message: QueueMessage) -> Result<(), EngineError>;

    /// Take the next message, waiting at most the configured poll interval.
    ///
    /// The stop signal is checked before blocking; an observed stop returns
    /// [`Dequeued::Stopped`] without consuming anything. Connection loss
    /// surfaces as [`EngineError::Transport`], never a silent drop.
    async fn dequeue(&self, stop: &StopSignal) -> Result<Dequeued, EngineError>;

    /// Acknowledge the message most recently returned by `dequeue`.
    ///
    /// Broker variants hold the message until this call; the in-process
    /// variant's single reader already removed it, so this is a no-op there.
    async fn ack(&self) -> Result<(), EngineError>;

    /// Tear down the ephemeral per-job queue where the broker supports it.
    async fn teardown(&self) -> Result<(), EngineError>;
}

/// Type tag selecting a queue backend implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// In-process bounded channel
    Memory,
    /// Kafka topic
    Kafka,
    /// RabbitMQ queue
    Rabbitmq,
}

impl QueueType {
    /// Registry key for this queue type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Kafka => "kafka",
            Self::Rabbitmq => "rabbitmq",
        }
    }
}

/// Broker endpoint for the broker-backed queue types
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct BrokerConfig {
    /// Broker hostname
    #[validate(length(min = 1, max = 253))]
    pub host: String,

    /// Broker port
    #[validate(range(min = 1))]
    pub port: u16,
}

/// User-facing queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct QueueConfig {
    /// Which backend to use
    #[serde(rename = "type")]
    pub queue_type: QueueType,

    /// Queue or topic name
    #[serde(default = "default_queue_name")]
    #[validate(length(min = 1, max = 249))]
    pub name: String,

    /// Broker host/port; required for the broker-backed queue types
    #[serde(default)]
    pub broker: Option<BrokerConfig>,

    /// Maximum number of buffered messages before enqueue backpressure
    #[serde(default = "default_max_messages")]
    #[validate(range(min = 1))]
    pub max_messages: usize,

    /// Bounded dequeue wait in milliseconds, after which the consumer
    /// re-checks the stop flag
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 10, max = 60_000))]
    pub poll_interval_ms: u64,
}

fn default_queue_name() -> String {
    "tributary".to_string()
}

fn default_max_messages() -> usize {
    1_000_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

impl QueueConfig {
    /// Convenience constructor for the in-process backend
    pub fn memory(max_messages: usize) -> Self {
        Self {
            queue_type: QueueType::Memory,
            name: default_queue_name(),
            broker: None,
            max_messages,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    /// The broker endpoint, or a config error for broker-backed types
    pub fn require_broker(&self) -> Result<&BrokerConfig, EngineError> {
        self.broker.as_ref().ok_or_else(|| {
            EngineError::config(format!(
                "Queue type '{}' requires broker host/port",
                self.queue_type.as_str()
            ))
        })
    }
}

/// Factory trait for constructing queue backends from configuration
#[async_trait]
pub trait QueueBackendFactory: Send + Sync {
    async fn create(&self, config: &QueueConfig) -> Result<Arc<dyn QueueBackend>, EngineError>;
}

/// Registry of available queue backends
///
/// Maps a type tag to a constructor; the set of variants is closed and
/// selected by configuration rather than subclassing.
pub struct QueueRegistry {
    backends: HashMap<String, Arc<dyn QueueBackendFactory>>,
}

impl QueueRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Register a backend factory under a type tag
    pub fn register(&mut self, name: &str, factory: Arc<dyn QueueBackendFactory>) {
        self.backends.insert(name.to_string(), factory);
    }

    /// Get a backend factory by type tag
    pub fn get(&self, name: &str) -> Option<&Arc<dyn QueueBackendFactory>> {
        self.backends.get(name)
    }

    /// Check if a type tag is registered
    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Number of registered backends
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Construct a backend for the given configuration
    pub async fn create(&self, config: &QueueConfig) -> Result<Arc<dyn QueueBackend>, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::config(e.to_string()))?;

        let tag = config.queue_type.as_str();
        let factory = self.get(tag).ok_or_else(|| {
            EngineError::config(format!("Queue type '{tag}' is not enabled in this build"))
        })?;
        factory.create(config).await
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with all enabled queue backends
pub fn create_queue_registry() -> QueueRegistry {
    let mut registry = QueueRegistry::new();

    // In-process backend is always available
    registry.register("memory", Arc::new(memory::MemoryQueueFactory));

    #[cfg(feature = "kafka")]
    registry.register("kafka", Arc::new(kafka::KafkaQueueFactory));

    #[cfg(feature = "rabbitmq")]
    registry.register("rabbitmq", Arc::new(rabbitmq::RabbitMqQueueFactory));

    registry
}

/// Construct a queue backend from configuration using the default registry
pub async fn create_queue(config: &QueueConfig) -> Result<Arc<dyn QueueBackend>, EngineError> {
    create_queue_registry().create(config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_contents() {
        let registry = create_queue_registry();
        assert!(registry.contains("memory"));

        #[cfg(feature = "kafka")]
        assert!(registry.contains("kafka"));

        #[cfg(feature = "rabbitmq")]
        assert!(registry.contains("rabbitmq"));
    }

    #[test]
    fn test_registry_empty_initially() {
        let registry = QueueRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_type_is_config_error() {
        let registry = QueueRegistry::new();
        let config = QueueConfig::memory(16);
        let err = registry.create(&config).await.err().unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_config_from_yaml() {
        let config: QueueConfig = serde_yaml::from_str(
            r#"
            type: memory
            max_messages: 500
            "#,
        )
        .unwrap();
        assert_eq!(config.queue_type, QueueType::Memory);
        assert_eq!(config.max_messages, 500);
        assert_eq!(config.name, "tributary");
        assert_eq!(config.poll_interval_ms, 1_000);
    }

    #[test]
    fn test_broker_required_for_broker_types() {
        let config: QueueConfig = serde_yaml::from_str(
            r#"
            type: rabbitmq
            name: creatures
            "#,
        )
        .unwrap();
        assert!(config.require_broker().is_err());
    }
}
