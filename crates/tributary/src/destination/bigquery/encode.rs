//! Row projection and protobuf serialization
//!
//! Every row is checked against the compiled wire schema before any bytes
//! are produced: a field the schema does not declare fails at decode time
//! with a parse error, and a missing value for a REQUIRED field fails with
//! an encode error. Neither is swallowed; both fail the whole batch.

use chrono::{DateTime, Utc};
use prost::bytes::{Buf, BufMut};
use prost::encoding::{self, DecodeContext, WireType};
use prost::DecodeError;

use super::config::{ColumnMode, ColumnType};
use super::schema::{
    WireField, WireSchema, COL_EXTRACTED_AT, COL_LOADED_AT, COL_ROW_ID, COL_SOURCE_DATA,
    COL_SOURCE_RECORD_ID, COL_SOURCE_TIMESTAMP,
};
use crate::error::DestinationError;
use crate::message::Record;

/// Largest second-granularity epoch (9999-12-31 00:00:00 UTC).
///
/// Integer epochs above this are evidently microsecond-scale and are divided
/// by 1_000_000 before conversion. The heuristic is inherently lossy near
/// the boundary but sources do not declare their timestamp precision, so it
/// is kept as documented behavior rather than corrected.
const MAX_SECONDS_EPOCH: i64 = 253_402_214_400;

/// Text form used for timestamp-like values in unnest mode
const UNNEST_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Text form used for the provenance timestamp columns
const PROVENANCE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A scalar value on its way into a wire field
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    String(String),
    Int64(i64),
    Float64(f64),
    Bool(bool),
    /// REPEATED mode: all elements share the field's scalar type
    Repeated(Vec<WireValue>),
}

/// One row projected onto the wire schema: `(field number, value)` pairs in
/// schema order.
pub type ProjectedRow = Vec<(u32, WireValue)>;

/// Normalize an integer epoch to a UTC datetime using the magnitude
/// heuristic described on [`MAX_SECONDS_EPOCH`].
pub fn normalize_epoch(epoch: i64) -> Result<DateTime<Utc>, DestinationError> {
    let normalized = if epoch > MAX_SECONDS_EPOCH {
        DateTime::from_timestamp_micros(epoch)
    } else {
        DateTime::from_timestamp(epoch, 0)
    };
    normalized.ok_or_else(|| {
        DestinationError::encode(format!("Epoch value {epoch} is out of range"))
    })
}

fn coerce_scalar(field: &WireField, value: &serde_json::Value) -> Result<WireValue, DestinationError> {
    let mismatch = |expected: &str| {
        DestinationError::encode(format!(
            "Field '{}' expected {expected}, got {value}",
            field.name
        ))
    };

    match field.column_type {
        ColumnType::String => value
            .as_str()
            .map(|s| WireValue::String(s.to_string()))
            .ok_or_else(|| mismatch("a string")),
        ColumnType::Integer => value
            .as_i64()
            .map(WireValue::Int64)
            .ok_or_else(|| mismatch("an integer")),
        ColumnType::Float => value
            .as_f64()
            .map(WireValue::Float64)
            .ok_or_else(|| mismatch("a number")),
        ColumnType::Boolean => value
            .as_bool()
            .map(WireValue::Bool)
            .ok_or_else(|| mismatch("a boolean")),
        ColumnType::Timestamp | ColumnType::Datetime => {
            // Heterogeneous sources send either preformatted text or integer
            // epochs of unknown precision.
            if let Some(text) = value.as_str() {
                Ok(WireValue::String(text.to_string()))
            } else if let Some(epoch) = value.as_i64() {
                let normalized = normalize_epoch(epoch)?;
                Ok(WireValue::String(
                    normalized.format(UNNEST_TIMESTAMP_FORMAT).to_string(),
                ))
            } else {
                Err(mismatch("a timestamp string or integer epoch"))
            }
        }
        ColumnType::Date => value
            .as_str()
            .map(|s| WireValue::String(s.to_string()))
            .ok_or_else(|| mismatch("a date string")),
    }
}

fn coerce(field: &WireField, value: &serde_json::Value) -> Result<WireValue, DestinationError> {
    if field.mode == ColumnMode::Repeated {
        let elements = value.as_array().ok_or_else(|| {
            DestinationError::encode(format!(
                "Field '{}' is REPEATED and expects an array, got {value}",
                field.name
            ))
        })?;
        let coerced = elements
            .iter()
            .map(|element| coerce_scalar(field, element))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(WireValue::Repeated(coerced))
    } else {
        coerce_scalar(field, value)
    }
}

/// Project a record's decoded payload onto the declared columns (unnest mode).
///
/// Rejects any payload field absent from the wire schema before encoding so
/// schema drift produces a field-level error, and enforces REQUIRED columns.
pub fn project_unnested(
    schema: &WireSchema,
    record: &Record,
) -> Result<ProjectedRow, DestinationError> {
    let payload: serde_json::Value = serde_json::from_str(&record.source_data).map_err(|e| {
        DestinationError::parse(format!(
            "Record '{}' payload is not valid JSON: {e}",
            record.source_record_id
        ))
    })?;
    let object = payload.as_object().ok_or_else(|| {
        DestinationError::parse(format!(
            "Record '{}' payload is not a JSON object",
            record.source_record_id
        ))
    })?;

    for key in object.keys() {
        if schema.field(key).is_none() {
            return Err(DestinationError::parse(key.clone()));
        }
    }

    let mut row = ProjectedRow::with_capacity(schema.fields.len());
    for field in &schema.fields {
        match object.get(&field.name) {
            Some(value) if !value.is_null() => {
                row.push((field.number, coerce(field, value)?));
            }
            _ => {
                if field.mode == ColumnMode::Required {
                    return Err(DestinationError::encode(field.name.clone()));
                }
                // NULLABLE / REPEATED columns are simply absent on the wire.
            }
        }
    }
    Ok(row)
}

/// Project a record onto the six provenance columns (non-unnest mode).
pub fn project_provenance(
    schema: &WireSchema,
    record: &Record,
    loaded_at: DateTime<Utc>,
) -> Result<ProjectedRow, DestinationError> {
    let format_ts =
        |ts: DateTime<Utc>| ts.format(PROVENANCE_TIMESTAMP_FORMAT).to_string();

    let mut row = ProjectedRow::with_capacity(schema.fields.len());
    for field in &schema.fields {
        let value = match field.name.as_str() {
            COL_SOURCE_RECORD_ID => WireValue::String(record.source_record_id.clone()),
            COL_SOURCE_TIMESTAMP => WireValue::String(format_ts(record.source_timestamp)),
            COL_SOURCE_DATA => WireValue::String(record.source_data.clone()),
            COL_EXTRACTED_AT => WireValue::String(format_ts(record.extracted_at)),
            COL_LOADED_AT => {
                WireValue::String(format_ts(record.loaded_at.unwrap_or(loaded_at)))
            }
            COL_ROW_ID => WireValue::String(record.row_id.clone()),
            other => {
                return Err(DestinationError::schema(format!(
                    "Unexpected provenance column '{other}'"
                )))
            }
        };
        row.push((field.number, value));
    }
    Ok(row)
}

/// Serialize one projected row against the wire schema into protobuf bytes.
pub fn encode_row(row: &ProjectedRow) -> EncodedRow {
    let mut bytes = Vec::with_capacity(128);
    for (number, value) in row {
        encode_value(*number, value, &mut bytes);
    }
    EncodedRow { bytes }
}

fn encode_value(tag: u32, value: &WireValue, buf: &mut Vec<u8>) {
    match value {
        WireValue::String(s) => encoding::string::encode(tag, s, buf),
        WireValue::Int64(i) => encoding::int64::encode(tag, i, buf),
        WireValue::Float64(f) => encoding::double::encode(tag, f, buf),
        WireValue::Bool(b) => encoding::bool::encode(tag, b, buf),
        WireValue::Repeated(elements) => {
            for element in elements {
                encode_value(tag, element, buf);
            }
        }
    }
}

/// A pre-serialized row.
///
/// Implements `prost::Message` by emitting its already-encoded field bytes,
/// which lets the storage client treat dynamically-shaped rows like any
/// statically generated message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedRow {
    pub bytes: Vec<u8>,
}

impl prost::Message for EncodedRow {
    fn encode_raw(&self, buf: &mut impl BufMut)
    where
        Self: Sized,
    {
        buf.put_slice(&self.bytes);
    }

    fn encoded_len(&self) -> usize {
        self.bytes.len()
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut impl Buf,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        // Decoding is not part of the write path; skip unknown fields.
        encoding::skip_field(wire_type, tag, buf, ctx)
    }

    fn clear(&mut self) {
        self.bytes.clear();
    }
}
