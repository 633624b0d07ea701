//! Canonical preset query records keyed by id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A preset query as supplied by callers: an explicit (id, text) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetQuery {
    #[serde(rename = "preset_query_id")]
    pub id: String,
    #[serde(rename = "preset_query")]
    pub text: String,
}

#[cfg(test)]
impl PresetQuery {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// A stored preset query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetQueryRecord {
    #[serde(rename = "preset_query_id")]
    pub id: String,
    #[serde(rename = "preset_query")]
    pub text: String,
    /// Insertion sequence, stable across updates
    pub seq: u64,
    /// Unix seconds
    pub created_at: i64,
    /// Unix seconds
    pub updated_at: i64,
}

/// Id -> record map plus the insertion sequence counter.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: HashMap<String, PresetQueryRecord>,
    next_seq: u64,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize, next_seq: u64) -> Self {
        Self {
            records: HashMap::with_capacity(capacity),
            next_seq,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, id: &str) -> Option<&PresetQueryRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Sequence number the next added record will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Reset the sequence counter, used when rolling back an add.
    pub fn set_next_seq(&mut self, next_seq: u64) {
        self.next_seq = next_seq;
    }

    pub fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Insert or replace a record, returning the previous one.
    ///
    /// Keeps `next_seq` ahead of every stored sequence number.
    pub fn insert(&mut self, record: PresetQueryRecord) -> Option<PresetQueryRecord> {
        if record.seq >= self.next_seq {
            self.next_seq = record.seq + 1;
        }
        self.records.insert(record.id.clone(), record)
    }

    pub fn remove(&mut self, id: &str) -> Option<PresetQueryRecord> {
        self.records.remove(id)
    }

    /// All records, oldest first.
    pub fn iter_by_seq(&self) -> Vec<&PresetQueryRecord> {
        let mut records: Vec<&PresetQueryRecord> = self.records.values().collect();
        records.sort_by_key(|r| r.seq);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, seq: u64) -> PresetQueryRecord {
        PresetQueryRecord {
            id: id.to_string(),
            text: format!("text of {id}"),
            seq,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_allocate_seq_is_monotonic() {
        let mut store = RecordStore::new();
        assert_eq!(store.allocate_seq(), 0);
        assert_eq!(store.allocate_seq(), 1);
        assert_eq!(store.next_seq(), 2);
    }

    #[test]
    fn test_insert_advances_next_seq() {
        let mut store = RecordStore::new();
        store.insert(record("a", 41));
        assert_eq!(store.next_seq(), 42);

        store.insert(record("b", 3));
        assert_eq!(store.next_seq(), 42);
    }

    #[test]
    fn test_insert_replaces_and_returns_previous() {
        let mut store = RecordStore::new();
        store.insert(record("a", 0));

        let mut replacement = record("a", 0);
        replacement.text = "new".to_string();
        let previous = store.insert(replacement).unwrap();

        assert_eq!(previous.text, "text of a");
        assert_eq!(store.get("a").unwrap().text, "new");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_iter_by_seq() {
        let mut store = RecordStore::new();
        store.insert(record("c", 5));
        store.insert(record("a", 1));
        store.insert(record("b", 3));

        let ids: Vec<&str> = store.iter_by_seq().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_preset_query_wire_names() {
        let preset: PresetQuery = serde_json::from_str(
            r#"{"preset_query": "show total sales", "preset_query_id": "p1"}"#,
        )
        .unwrap();
        assert_eq!(preset, PresetQuery::new("p1", "show total sales"));
    }
}
