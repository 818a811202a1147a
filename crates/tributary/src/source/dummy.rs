//! Synthetic paginated source for tests and examples
//!
//! Mimics a small cursor-paginated HTTP API: three pages of creature records,
//! then exhaustion. No external dependencies, so the full pipeline can be
//! exercised without network access.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;

use super::{Pagination, Source, SourcePage, SourceRecord};
use crate::error::EngineError;

/// In-memory fake-API source emitting a fixed set of creature records
pub struct DummySource {
    name: String,
}

impl DummySource {
    pub fn new() -> Self {
        Self {
            name: "dummy".to_string(),
        }
    }

    fn page(&self, index: usize) -> Vec<SourceRecord> {
        let creatures: &[(&str, &str)] = match index {
            0 => &[("9898", "kraken"), ("88787", "yeti")],
            1 => &[("98", "mothman"), ("3333", "selkie")],
            _ => &[("56565", "wyvern")],
        };

        creatures
            .iter()
            .map(|(id, name)| SourceRecord {
                id: id.to_string(),
                data: json!({"id": id, "name": name}),
                timestamp: Utc.with_ymd_and_hms(2024, 12, 5, 11, 30, 0).single()
                    .unwrap_or_else(Utc::now),
            })
            .collect()
    }
}

impl Default for DummySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Source for DummySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_page(
        &mut self,
        pagination: Option<Pagination>,
    ) -> Result<SourcePage, EngineError> {
        let index = match pagination {
            None => 0,
            Some(value) => value
                .get("cursor")
                .and_then(|c| c.as_u64())
                .ok_or_else(|| EngineError::source("Dummy source received malformed cursor"))?
                as usize,
        };

        if index > 2 {
            return Ok(SourcePage::Exhausted);
        }

        let next_pagination = Some(json!({"cursor": index as u64 + 1}));
        Ok(SourcePage::Page {
            records: self.page(index),
            next_pagination,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_first_page() {
        let mut source = DummySource::new();
        match source.next_page(None).await.unwrap() {
            SourcePage::Page {
                records,
                next_pagination,
            } => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[0].id, "9898");
                assert_eq!(next_pagination, Some(json!({"cursor": 1})));
            }
            SourcePage::Exhausted => panic!("first page should not be exhausted"),
        }
    }

    #[tokio::test]
    async fn test_pagination_walks_all_records() {
        let mut source = DummySource::new();
        let mut ids = Vec::new();
        let mut pagination = None;

        loop {
            match source.next_page(pagination.take()).await.unwrap() {
                SourcePage::Page {
                    records,
                    next_pagination,
                } => {
                    ids.extend(records.into_iter().map(|r| r.id));
                    pagination = next_pagination;
                }
                SourcePage::Exhausted => break,
            }
        }

        assert_eq!(ids, vec!["9898", "88787", "98", "3333", "56565"]);
    }

    #[tokio::test]
    async fn test_malformed_cursor_is_source_error() {
        let mut source = DummySource::new();
        let err = source
            .next_page(Some(json!({"cursor": "not-a-number"})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Source(_)));
    }
}
