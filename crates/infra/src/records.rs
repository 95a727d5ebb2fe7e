//! Business records the jobs generate output for.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The record a work-key names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRecord {
    /// Work-key
    pub id: String,
    /// Text handed to the generator
    pub input_text: Option<String>,
    /// Structured context handed alongside the input
    #[serde(default)]
    pub context: JsonValue,
    pub output_text: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
}

impl WorkRecord {
    pub fn new(id: impl Into<String>, input_text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input_text: Some(input_text.into()),
            context: JsonValue::Null,
            output_text: None,
            generated_at: None,
        }
    }

    pub fn with_context(mut self, context: JsonValue) -> Self {
        self.context = context;
        self
    }

    /// Input text, if present and not blank.
    pub fn usable_input(&self) -> Option<&str> {
        self.input_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RecordStoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("record storage error: {0}")]
    Storage(String),
}

/// Store owning the business records.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_by_id(&self, work_key: &str) -> Result<Option<WorkRecord>, RecordStoreError>;

    async fn update(&self, record: &WorkRecord) -> Result<(), RecordStoreError>;
}

/// In-memory record store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<String, WorkRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: WorkRecord) {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(record.id.clone(), record);
    }

    pub fn get(&self, work_key: &str) -> Option<WorkRecord> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(work_key)
            .cloned()
    }
}

#[async_trait::async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get_by_id(&self, work_key: &str) -> Result<Option<WorkRecord>, RecordStoreError> {
        Ok(self.get(work_key))
    }

    async fn update(&self, record: &WorkRecord) -> Result<(), RecordStoreError> {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match records.get_mut(&record.id) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(RecordStoreError::NotFound(record.id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_input_is_not_usable() {
        let mut record = WorkRecord::new("call-1", "   ");
        assert!(record.usable_input().is_none());

        record.input_text = None;
        assert!(record.usable_input().is_none());

        record.input_text = Some("hello".to_string());
        assert_eq!(record.usable_input(), Some("hello"));
    }

    #[tokio::test]
    async fn update_requires_existing_record() {
        let store = InMemoryRecordStore::new();
        let record = WorkRecord::new("call-1", "transcript");

        assert!(matches!(
            store.update(&record).await,
            Err(RecordStoreError::NotFound(_))
        ));

        store.insert(record.clone());
        let mut updated = record;
        updated.output_text = Some("summary".to_string());
        store.update(&updated).await.unwrap();

        assert_eq!(
            store.get_by_id("call-1").await.unwrap().unwrap().output_text.as_deref(),
            Some("summary")
        );
    }
}
