//! Pipeline runtime: producer/consumer loops and their shared status model
//!
//! The producer and consumer run as independent tasks (or threads) whose only
//! shared state is the queue backend and a cooperative [`StopSignal`]. Each
//! loop resolves to a terminal [`PipelineStatus`] that the external runner
//! uses to decide restart policy; the loops themselves never restart.

pub mod consumer;
pub mod producer;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::source::Source;

pub use consumer::Consumer;
pub use producer::Producer;

/// Cooperative stop flag shared by the producer and consumer loops.
///
/// Checked between loop iterations, never inside an in-flight write: a write,
/// once started, always runs to completion before the flag is re-checked.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that both loops exit at their next check
    pub fn raise(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Reset the flag (test tooling)
    pub fn clear(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    /// Whether a stop was requested
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Terminal status of a pipeline loop.
///
/// `Running` only exists while a loop is live; every loop resolves to one of
/// the three terminal states, and terminal states absorb: once reached, no
/// further transition is possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    /// The loop is live
    Running,
    /// Clean end of stream
    Success,
    /// A fatal transport, source, schema, or write failure
    Error,
    /// The external runner raised the stop flag
    KilledByRunner,
}

impl PipelineStatus {
    /// Whether this status absorbs further transitions
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Apply a transition; terminal states ignore it
    pub fn transition(self, next: Self) -> Self {
        if self.is_terminal() {
            self
        } else {
            next
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::KilledByRunner => write!(f, "killed_by_runner"),
        }
    }
}

/// Identity of one pipeline run, shared by both loops
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    /// Unique id of this job, the checkpoint key
    pub job_id: String,
    /// Name of the source connector
    pub source_name: String,
    /// Name of the extracted stream
    pub stream_name: String,
}

impl JobContext {
    pub fn new(
        job_id: impl Into<String>,
        source_name: impl Into<String>,
        stream_name: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            source_name: source_name.into(),
            stream_name: stream_name.into(),
        }
    }

    /// Default destination table name when none is configured
    pub fn default_table_name(&self) -> String {
        format!("{}_{}", self.source_name, self.stream_name)
    }
}

/// Terminal statuses of one full pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub producer: PipelineStatus,
    pub consumer: PipelineStatus,
}

impl PipelineOutcome {
    /// Whether both loops ended cleanly
    pub fn is_success(&self) -> bool {
        self.producer == PipelineStatus::Success && self.consumer == PipelineStatus::Success
    }
}

/// Run a producer/consumer pair as concurrent tasks and join both.
///
/// Convenience wrapper for the single-process case; the loops work just as
/// well spawned on separate runtimes or processes, since they only share the
/// queue backend and the stop flag.
pub async fn run_pipeline<S>(
    producer: Producer<S>,
    consumer: Consumer,
    stop: StopSignal,
) -> Result<PipelineOutcome, EngineError>
where
    S: Source + 'static,
{
    let producer_handle = tokio::spawn(producer.run(stop.clone()));
    let consumer_handle = tokio::spawn(consumer.run(stop));

    let producer_status = producer_handle
        .await
        .map_err(|e| EngineError::Internal(format!("Producer task failed: {e}")))?;
    let consumer_status = consumer_handle
        .await
        .map_err(|e| EngineError::Internal(format!("Consumer task failed: {e}")))?;

    Ok(PipelineOutcome {
        producer: producer_status,
        consumer: consumer_status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_absorb() {
        for terminal in [
            PipelineStatus::Success,
            PipelineStatus::Error,
            PipelineStatus::KilledByRunner,
        ] {
            assert!(terminal.is_terminal());
            assert_eq!(terminal.transition(PipelineStatus::Running), terminal);
            assert_eq!(terminal.transition(PipelineStatus::Error), terminal);
        }
    }

    #[test]
    fn test_running_transitions_out() {
        let status = PipelineStatus::Running;
        assert!(!status.is_terminal());
        assert_eq!(
            status.transition(PipelineStatus::KilledByRunner),
            PipelineStatus::KilledByRunner
        );
    }

    #[test]
    fn test_stop_signal_is_shared() {
        let stop = StopSignal::new();
        let observer = stop.clone();
        assert!(!observer.is_raised());
        stop.raise();
        assert!(observer.is_raised());
    }

    #[test]
    fn test_default_table_name() {
        let job = JobContext::new("job-1", "dummy", "creatures");
        assert_eq!(job.default_table_name(), "dummy_creatures");
    }
}
