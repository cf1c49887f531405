//! Cache entries.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wall clock in milliseconds.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// One cached value with its bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    /// Wall-clock expiry, milliseconds since the epoch.
    pub absolute_expiry: i64,
    pub created_at: i64,
    pub last_accessed: i64,
    pub access_count: usize,
    /// Estimated value size in bytes.
    pub size: usize,
    pub tags: Vec<String>,
    pub schema: Option<String>,
    pub cluster: Option<String>,
}

impl CacheEntry {
    pub fn expired(&self, now: i64) -> bool {
        now > self.absolute_expiry
    }

    pub fn touch(&mut self, now: i64) {
        self.access_count += 1;
        self.last_accessed = now;
    }
}

/// Entry bookkeeping without the value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryMetadata {
    pub absolute_expiry: i64,
    pub created_at: i64,
    pub last_accessed: i64,
    pub access_count: usize,
    pub size: usize,
    pub tags: Vec<String>,
    pub schema: Option<String>,
    pub cluster: Option<String>,
}

impl From<&CacheEntry> for EntryMetadata {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            absolute_expiry: entry.absolute_expiry,
            created_at: entry.created_at,
            last_accessed: entry.last_accessed,
            access_count: entry.access_count,
            size: entry.size,
            tags: entry.tags.clone(),
            schema: entry.schema.clone(),
            cluster: entry.cluster.clone(),
        }
    }
}
