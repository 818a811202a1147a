//! Source connector trait
//!
//! A source hands the producer loop one page of records at a time, together
//! with the opaque resume point for the following page. Concrete API
//! connectors live outside the engine; the [`dummy`] source ships with the
//! crate for tests and examples.

pub mod dummy;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Opaque resume point describing where the next page starts.
///
/// The engine never inspects pagination values; they round-trip through the
/// queue envelope into the checkpoint backend.
pub type Pagination = serde_json::Value;

/// One raw record as produced by a source connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Identifier of the record in the source system
    pub id: String,
    /// The record payload
    pub data: serde_json::Value,
    /// Timestamp of the record in the source system
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one page pull
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePage {
    /// A page of records plus the resume point for the next pull
    Page {
        records: Vec<SourceRecord>,
        next_pagination: Option<Pagination>,
    },
    /// The source has no further records
    Exhausted,
}

/// Trait for source connectors
///
/// `next_page(None)` starts from the beginning; passing the pagination value
/// returned by the previous call resumes from there, including across process
/// restarts when the value was restored from a checkpoint.
#[async_trait]
pub trait Source: Send + Sync {
    /// Human-readable source name, used in logs and default table names
    fn name(&self) -> &str;

    /// Pull the next page of records
    async fn next_page(
        &mut self,
        pagination: Option<Pagination>,
    ) -> Result<SourcePage, EngineError>;
}
