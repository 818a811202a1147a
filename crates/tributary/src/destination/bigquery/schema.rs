//! Wire schema compilation
//!
//! The wire schema is derived deterministically from the destination row
//! definition: one physical field per declared column, field order and names
//! fixed for the lifetime of a destination table. It is compiled once per
//! table and drives both table creation and the per-row serialization
//! descriptor.

use gcp_bigquery_client::model::table_field_schema::TableFieldSchema;
use gcp_bigquery_client::storage::{
    ColumnMode as StorageColumnMode, ColumnType as StorageColumnType, FieldDescriptor,
    TableDescriptor,
};

use super::config::{BigQueryColumn, ColumnMode, ColumnType};

/// Provenance column names used when the raw payload is stored opaquely
pub const COL_SOURCE_RECORD_ID: &str = "_source_record_id";
pub const COL_SOURCE_TIMESTAMP: &str = "_source_timestamp";
pub const COL_SOURCE_DATA: &str = "_source_data";
pub const COL_EXTRACTED_AT: &str = "_tributary_extracted_at";
pub const COL_LOADED_AT: &str = "_tributary_loaded_at";
pub const COL_ROW_ID: &str = "_tributary_id";

/// One physical field of a destination table
#[derive(Debug, Clone, PartialEq)]
pub struct WireField {
    pub name: String,
    /// Protobuf field number, stable for the table's lifetime
    pub number: u32,
    pub column_type: ColumnType,
    pub mode: ColumnMode,
    pub description: Option<String>,
}

/// Compiled column layout for one destination table
#[derive(Debug, Clone, PartialEq)]
pub struct WireSchema {
    pub fields: Vec<WireField>,
}

impl WireSchema {
    /// Compile the schema from user-declared columns (unnest mode).
    /// Field numbers follow declaration order.
    pub fn from_columns(columns: &[BigQueryColumn]) -> Self {
        let fields = columns
            .iter()
            .enumerate()
            .map(|(index, column)| WireField {
                name: column.name.clone(),
                number: index as u32 + 1,
                column_type: column.column_type,
                mode: column.mode,
                description: column.description.clone(),
            })
            .collect();
        Self { fields }
    }

    /// The fixed six-column provenance schema (non-unnest mode)
    pub fn provenance() -> Self {
        let columns = [
            (COL_SOURCE_RECORD_ID, ColumnType::String, ColumnMode::Required),
            (COL_SOURCE_TIMESTAMP, ColumnType::Timestamp, ColumnMode::Required),
            (COL_SOURCE_DATA, ColumnType::String, ColumnMode::Nullable),
            (COL_EXTRACTED_AT, ColumnType::Timestamp, ColumnMode::Required),
            (COL_LOADED_AT, ColumnType::Timestamp, ColumnMode::Required),
            (COL_ROW_ID, ColumnType::String, ColumnMode::Required),
        ];

        let fields = columns
            .iter()
            .enumerate()
            .map(|(index, (name, column_type, mode))| WireField {
                name: name.to_string(),
                number: index as u32 + 1,
                column_type: *column_type,
                mode: *mode,
                description: None,
            })
            .collect();
        Self { fields }
    }

    /// Look up a field by column name
    pub fn field(&self, name: &str) -> Option<&WireField> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Table schema used for idempotent table creation
    pub fn to_table_field_schemas(&self) -> Vec<TableFieldSchema> {
        self.fields
            .iter()
            .map(|field| {
                let mut schema = match field.column_type {
                    ColumnType::String => TableFieldSchema::string(&field.name),
                    ColumnType::Integer => TableFieldSchema::integer(&field.name),
                    ColumnType::Float => TableFieldSchema::float(&field.name),
                    ColumnType::Boolean => TableFieldSchema::bool(&field.name),
                    ColumnType::Timestamp => TableFieldSchema::timestamp(&field.name),
                    ColumnType::Datetime => TableFieldSchema::date_time(&field.name),
                    ColumnType::Date => TableFieldSchema::date(&field.name),
                };
                schema.mode = Some(field.mode.as_str().to_string());
                schema.description = field.description.clone();
                schema
            })
            .collect()
    }

    /// Serialization descriptor for the streaming append requests.
    ///
    /// Timestamp-like columns travel as canonical strings on the wire, so
    /// their descriptor type is `String`; the table schema gives them their
    /// warehouse type.
    pub fn to_table_descriptor(&self) -> TableDescriptor {
        let field_descriptors = self
            .fields
            .iter()
            .map(|field| FieldDescriptor {
                name: field.name.clone(),
                number: field.number,
                typ: match field.column_type {
                    ColumnType::Integer => StorageColumnType::Int64,
                    ColumnType::Float => StorageColumnType::Double,
                    ColumnType::Boolean => StorageColumnType::Bool,
                    ColumnType::String
                    | ColumnType::Timestamp
                    | ColumnType::Datetime
                    | ColumnType::Date => StorageColumnType::String,
                },
                mode: match field.mode {
                    ColumnMode::Required => StorageColumnMode::Required,
                    ColumnMode::Nullable => StorageColumnMode::Nullable,
                    ColumnMode::Repeated => StorageColumnMode::Repeated,
                },
            })
            .collect();
        TableDescriptor { field_descriptors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provenance_schema_shape() {
        let schema = WireSchema::provenance();
        let names: Vec<&str> = schema.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                COL_SOURCE_RECORD_ID,
                COL_SOURCE_TIMESTAMP,
                COL_SOURCE_DATA,
                COL_EXTRACTED_AT,
                COL_LOADED_AT,
                COL_ROW_ID,
            ]
        );
        // Field numbers are 1-based and follow declaration order.
        let numbers: Vec<u32> = schema.fields.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);

        // Only the raw payload column is nullable.
        assert_eq!(
            schema.field(COL_SOURCE_DATA).unwrap().mode,
            ColumnMode::Nullable
        );
        assert_eq!(
            schema.field(COL_ROW_ID).unwrap().mode,
            ColumnMode::Required
        );
    }

    #[test]
    fn test_declared_columns_keep_order() {
        let columns = vec![
            BigQueryColumn {
                name: "id".to_string(),
                column_type: ColumnType::Integer,
                mode: ColumnMode::Required,
                description: None,
            },
            BigQueryColumn {
                name: "name".to_string(),
                column_type: ColumnType::String,
                mode: ColumnMode::Required,
                description: Some("creature name".to_string()),
            },
            BigQueryColumn {
                name: "created_at".to_string(),
                column_type: ColumnType::Datetime,
                mode: ColumnMode::Required,
                description: None,
            },
        ];

        let schema = WireSchema::from_columns(&columns);
        assert_eq!(schema.fields.len(), 3);
        assert_eq!(schema.fields[0].number, 1);
        assert_eq!(schema.fields[2].number, 3);
        assert_eq!(schema.field("name").unwrap().description.as_deref(), Some("creature name"));
        assert!(schema.field("unknown").is_none());
    }

    #[test]
    fn test_descriptor_types() {
        let schema = WireSchema::provenance();
        let descriptor = schema.to_table_descriptor();
        assert_eq!(descriptor.field_descriptors.len(), 6);
        // Timestamps travel as strings on the wire.
        assert!(descriptor
            .field_descriptors
            .iter()
            .all(|f| matches!(f.typ, StorageColumnType::String)));
    }
}
