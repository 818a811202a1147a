//! tributary - queue-mediated extract-load engine
//!
//! A source produces batches of records, a queue decouples extraction from
//! loading, and a destination writer durably persists batches into an
//! analytical store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌───────────────┐   ┌─────────────────┐
//! │  Source  │──▶│ Producer loop │──▶│ Queue backend │──▶│  Consumer loop  │
//! └──────────┘   └───────┬───────┘   │ memory/kafka/ │   └────────┬────────┘
//!                        │           │   rabbitmq    │            │
//!                        ▼           └───────────────┘            ▼
//!               ┌─────────────────┐                     ┌──────────────────┐
//!               │ Checkpoint      │                     │ Destination      │
//!               │ backend (cursor)│                     │ bigquery / file  │
//!               └─────────────────┘                     └──────────────────┘
//! ```
//!
//! The producer packages each source page as a [`QueueMessage`] with a
//! strictly increasing iteration and periodically checkpoints its cursor;
//! the consumer dequeues with a bounded wait, hands batches to the
//! destination, and resolves to a terminal [`PipelineStatus`]. Delivery is
//! at-least-once; destination rows carry content-derived ids so redelivered
//! batches stay idempotent per row.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tributary::checkpoint::InMemoryCheckpointBackend;
//! use tributary::source::dummy::DummySource;
//! use tributary::{
//!     create_destination, create_queue, Consumer, DestinationConfig, JobContext, Producer,
//!     QueueConfig, StopSignal,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let job = JobContext::new("job-1", "dummy", "creatures");
//! let queue = create_queue(&QueueConfig::memory(1_000)).await?;
//! let destination_config: DestinationConfig = serde_yaml::from_str(
//!     "{type: file, filepath: /tmp/creatures.jsonl}",
//! )?;
//! let destination = create_destination(&destination_config, &job).await?;
//!
//! let producer = Producer::new(
//!     job,
//!     DummySource::new(),
//!     queue.clone(),
//!     Arc::new(InMemoryCheckpointBackend::new()),
//! );
//! let consumer = Consumer::new(queue, destination);
//!
//! let outcome = tributary::run_pipeline(producer, consumer, StopSignal::new()).await?;
//! assert!(outcome.is_success());
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod destination;
pub mod error;
pub mod message;
pub mod pipeline;
pub mod queue;
pub mod source;
pub mod types;

pub use error::{DestinationError, EngineError, Result};
pub use message::{derive_row_id, QueueMessage, QueueSignal, Record};
pub use pipeline::{
    run_pipeline, Consumer, JobContext, PipelineOutcome, PipelineStatus, Producer, StopSignal,
};
pub use queue::{
    create_queue, create_queue_registry, Dequeued, QueueBackend, QueueConfig, QueueRegistry,
    QueueType,
};
pub use destination::{
    create_destination, create_destination_registry, Destination, DestinationConfig,
    DestinationRegistry, WriteResult,
};
pub use checkpoint::{CheckpointBackend, Cursor, InMemoryCheckpointBackend};
pub use source::{Source, SourcePage, SourceRecord};
pub use types::SensitiveString;
