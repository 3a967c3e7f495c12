//! In-memory record store standing in for a database

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub bytes: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

/// Concurrent key-value store with a simulated write latency
///
/// A write only lands after the latency has elapsed, so a write future
/// dropped mid-flight leaves nothing behind.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: DashMap<String, StoredRecord>,
    write_latency: Duration,
    writes: AtomicU64,
}

impl RecordStore {
    pub fn new(write_latency: Duration) -> Self {
        Self {
            write_latency,
            ..Default::default()
        }
    }

    /// Store a copy of `bytes` under `key`, replacing any previous value
    pub async fn write(&self, key: &str, bytes: &[u8]) {
        if !self.write_latency.is_zero() {
            tokio::time::sleep(self.write_latency).await;
        }
        self.records.insert(
            key.to_string(),
            StoredRecord {
                bytes: bytes.to_vec(),
                stored_at: Utc::now(),
            },
        );
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, key: &str) -> Option<StoredRecord> {
        self.records.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Completed writes, including overwrites
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_get() {
        let store = RecordStore::default();
        store.write("clinical_record/1", b"{}").await;

        let record = store.get("clinical_record/1").unwrap();
        assert_eq!(record.bytes, b"{}");
        assert_eq!(store.len(), 1);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_keeps_one_entry() {
        let store = RecordStore::default();
        store.write("k", b"first").await;
        store.write("k", b"second").await;

        assert_eq!(store.len(), 1);
        assert_eq!(store.writes(), 2);
        assert_eq!(store.get("k").unwrap().bytes, b"second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_write_leaves_nothing() {
        let store = RecordStore::new(Duration::from_millis(100));

        let cut_short =
            tokio::time::timeout(Duration::from_millis(10), store.write("k", b"partial")).await;

        assert!(cut_short.is_err());
        assert!(store.is_empty());
        assert_eq!(store.writes(), 0);
    }
}
