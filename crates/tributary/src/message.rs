//! Queue message envelope
//!
//! The [`QueueMessage`] is the unit of transport between the producer and
//! consumer loops: one extraction batch, serializable to bytes so broker
//! backends can carry it as an opaque payload and reconstruct an equivalent
//! record collection on the other side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::EngineError;
use crate::source::SourceRecord;

/// Control values carried by a [`QueueMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueSignal {
    /// End-of-stream marker. A termination message carries no records.
    Termination,
}

/// One row of a batch, with provenance fields attached at extraction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable synthetic row id, derived from record content (not write time)
    /// so broker redelivery of the same batch yields the same id set.
    pub row_id: String,

    /// Identifier of the record in the source system
    pub source_record_id: String,

    /// Timestamp of the record in the source system
    pub source_timestamp: DateTime<Utc>,

    /// Opaque source payload, carried as JSON text
    pub source_data: String,

    /// When the producer extracted this record
    pub extracted_at: DateTime<Utc>,

    /// When the destination wrote this record. Stamped once per write call by
    /// the destination writer; `None` while the record is in flight.
    #[serde(default)]
    pub loaded_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Build a record from raw source output, stamping extraction provenance.
    pub fn from_source(record: SourceRecord, extracted_at: DateTime<Utc>) -> Self {
        let source_data = record.data.to_string();
        let row_id = derive_row_id(&record.id, &source_data);
        Self {
            row_id,
            source_record_id: record.id,
            source_timestamp: record.timestamp,
            source_data,
            extracted_at,
            loaded_at: None,
        }
    }
}

/// Derive the stable synthetic row id from record content.
///
/// Two deliveries of the same `(source_record_id, source_data)` pair always
/// produce the same id, which makes destination writes idempotent per row
/// under broker redelivery.
pub fn derive_row_id(source_record_id: &str, source_data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_record_id.as_bytes());
    hasher.update(b":");
    hasher.update(source_data.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The envelope crossing the queue: one extraction batch.
///
/// Invariants: all records in one message share the message's `iteration`;
/// a message with `signal == Some(Termination)` has an empty record
/// collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Position of this batch in the producer's sequence, strictly increasing
    pub iteration: u64,

    /// The batch's records, in source order
    pub records: Vec<Record>,

    /// When this batch was enqueued
    pub extracted_at: DateTime<Utc>,

    /// Opaque resume point after this batch; consumed only by the checkpoint
    /// backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<serde_json::Value>,

    /// Optional control value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<QueueSignal>,
}

impl QueueMessage {
    /// Create a data message. `extracted_at` is set at enqueue time.
    pub fn new(
        iteration: u64,
        records: Vec<Record>,
        pagination: Option<serde_json::Value>,
    ) -> Self {
        Self {
            iteration,
            records,
            extracted_at: Utc::now(),
            pagination,
            signal: None,
        }
    }

    /// Override the enqueue timestamp (replays and tests)
    pub fn with_extracted_at(mut self, extracted_at: DateTime<Utc>) -> Self {
        self.extracted_at = extracted_at;
        self
    }

    /// Create the end-of-stream marker for the given iteration.
    pub fn termination(iteration: u64) -> Self {
        Self {
            iteration,
            records: Vec::new(),
            extracted_at: Utc::now(),
            pagination: None,
            signal: Some(QueueSignal::Termination),
        }
    }

    /// Whether this message marks the end of the stream
    pub fn is_termination(&self) -> bool {
        matches!(self.signal, Some(QueueSignal::Termination))
    }

    /// Serialize the envelope for broker transport
    pub fn to_bytes(&self) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(self).map_err(|e| {
            EngineError::serialization(format!("Failed to serialize queue message: {e}"))
        })
    }

    /// Reconstruct an envelope from broker bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        serde_json::from_slice(bytes).map_err(|e| {
            EngineError::serialization(format!("Failed to deserialize queue message: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_record(id: &str) -> Record {
        let source = SourceRecord {
            id: id.to_string(),
            data: json!({"id": id, "name": "kraken"}),
            timestamp: Utc::now(),
        };
        Record::from_source(source, Utc::now())
    }

    #[test]
    fn test_row_id_is_content_derived() {
        let a = sample_record("9898");
        // Same content extracted at a different time keeps the same row id.
        let b = Record::from_source(
            SourceRecord {
                id: "9898".to_string(),
                data: json!({"id": "9898", "name": "kraken"}),
                timestamp: a.source_timestamp,
            },
            Utc::now(),
        );
        assert_eq!(a.row_id, b.row_id);

        let other = sample_record("88787");
        assert_ne!(a.row_id, other.row_id);
    }

    #[test]
    fn test_envelope_roundtrip() {
        let message = QueueMessage::new(
            7,
            vec![sample_record("9898"), sample_record("88787")],
            Some(json!({"cursor": "page-2"})),
        )
        .with_extracted_at(Utc::now());

        let bytes = message.to_bytes().unwrap();
        let restored = QueueMessage::from_bytes(&bytes).unwrap();

        assert_eq!(restored.iteration, 7);
        assert_eq!(restored.records.len(), 2);
        assert_eq!(restored.records[0].source_record_id, "9898");
        assert_eq!(restored.records[0].row_id, message.records[0].row_id);
        assert_eq!(restored.pagination, Some(json!({"cursor": "page-2"})));
        assert!(!restored.is_termination());
    }

    #[test]
    fn test_termination_message_has_no_records() {
        let message = QueueMessage::termination(42);
        assert!(message.is_termination());
        assert!(message.records.is_empty());

        // The reserved control value crosses the wire in its canonical form.
        let bytes = message.to_bytes().unwrap();
        assert!(std::str::from_utf8(&bytes)
            .unwrap()
            .contains("\"TERMINATION\""));

        let restored = QueueMessage::from_bytes(&bytes).unwrap();
        assert!(restored.is_termination());
        assert!(restored.records.is_empty());
        assert_eq!(restored.iteration, 42);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        let err = QueueMessage::from_bytes(b"not a message").unwrap_err();
        assert!(matches!(err, EngineError::Serialization(_)));
    }
}
