//! Checkpoint backend interface
//!
//! The producer loop persists `(iteration, pagination)` pairs every N
//! iterations so a restarted producer can resume extraction with bounded
//! replay. The durable store behind this interface is an external
//! collaborator; the in-memory implementation covers tests and the
//! single-process runner case.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::EngineError;
use crate::source::Pagination;

/// A persisted extraction resume point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// Iteration of the last batch covered by this cursor
    pub iteration: u64,
    /// Opaque source resume point after that batch
    pub pagination: Option<Pagination>,
}

/// Narrow interface over the checkpoint store
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    /// Persist the cursor for a job. Overwrites any previous cursor.
    async fn save_cursor(
        &self,
        job_id: &str,
        iteration: u64,
        pagination: Option<Pagination>,
    ) -> Result<(), EngineError>;

    /// Load the most recent cursor for a job, if any
    async fn load_cursor(&self, job_id: &str) -> Result<Option<Cursor>, EngineError>;
}

/// In-memory checkpoint store
#[derive(Debug, Default)]
pub struct InMemoryCheckpointBackend {
    cursors: RwLock<HashMap<String, Cursor>>,
}

impl InMemoryCheckpointBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointBackend for InMemoryCheckpointBackend {
    async fn save_cursor(
        &self,
        job_id: &str,
        iteration: u64,
        pagination: Option<Pagination>,
    ) -> Result<(), EngineError> {
        let mut cursors = self.cursors.write().await;
        cursors.insert(
            job_id.to_string(),
            Cursor {
                iteration,
                pagination,
            },
        );
        Ok(())
    }

    async fn load_cursor(&self, job_id: &str) -> Result<Option<Cursor>, EngineError> {
        let cursors = self.cursors.read().await;
        Ok(cursors.get(job_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_load_cursor() {
        let backend = InMemoryCheckpointBackend::new();

        assert_eq!(backend.load_cursor("job-1").await.unwrap(), None);

        backend
            .save_cursor("job-1", 4, Some(json!({"cursor": 5})))
            .await
            .unwrap();

        let cursor = backend.load_cursor("job-1").await.unwrap().unwrap();
        assert_eq!(cursor.iteration, 4);
        assert_eq!(cursor.pagination, Some(json!({"cursor": 5})));

        // A later save overwrites the previous cursor.
        backend.save_cursor("job-1", 8, None).await.unwrap();
        let cursor = backend.load_cursor("job-1").await.unwrap().unwrap();
        assert_eq!(cursor.iteration, 8);
        assert_eq!(cursor.pagination, None);
    }

    #[tokio::test]
    async fn test_cursors_are_per_job() {
        let backend = InMemoryCheckpointBackend::new();
        backend.save_cursor("job-a", 1, None).await.unwrap();
        assert_eq!(backend.load_cursor("job-b").await.unwrap(), None);
    }
}
