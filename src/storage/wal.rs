//! Write-Ahead Log
//!
//! Append and query operations over the `log:` key family of a service's
//! store. Keys are minted by the id service, so their 20-digit wall-clock
//! prefix gives the family chronological iteration order for free.
//!
//! Queries come in two flavors: whole-family (count, list) for the
//! operational endpoints, and windowed-and-grouped for the sweeper. The
//! grouped view buckets records by correlation id and sorts each bucket by
//! `(date_time, key)` — the key carries the id-service counter, which breaks
//! ties between records stamped in the same microsecond.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::storage::kv::{KvStore, Result};
use crate::storage::log_record::{key_timestamp, LogRecord, LOG_KEY_PREFIX};

/// A log record together with the store key it lives under.
pub type KeyedRecord<V> = (String, LogRecord<V>);

#[derive(Clone)]
pub struct Wal {
    store: Arc<KvStore>,
}

impl Wal {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    pub fn append<V: Serialize>(&self, key: &str, record: &LogRecord<V>) -> Result<()> {
        self.store.put(key, record)
    }

    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<LogRecord<V>>> {
        self.store.get(key)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(key)
    }

    pub fn count(&self) -> Result<usize> {
        let mut count = 0;
        for entry in self.store.scan_prefix(LOG_KEY_PREFIX) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Every record in the log family. Undecodable entries are skipped with
    /// a warning rather than failing the whole listing.
    pub fn all<V: DeserializeOwned>(&self) -> Result<Vec<KeyedRecord<V>>> {
        let mut records = Vec::new();
        for entry in self.store.scan_prefix(LOG_KEY_PREFIX) {
            let (key, bytes) = entry?;
            match serde_json::from_slice::<LogRecord<V>>(&bytes) {
                Ok(record) => records.push((key, record)),
                Err(e) => warn!("Skipping undecodable log record {key}: {e}"),
            }
        }
        Ok(records)
    }

    /// Records whose key timestamp lies within `[now - min_diff, now]`.
    pub fn within_window<V: DeserializeOwned>(
        &self,
        now: DateTime<Utc>,
        min_diff: i64,
    ) -> Result<Vec<KeyedRecord<V>>> {
        let lower_bound = now - Duration::minutes(min_diff);
        let mut records = Vec::new();
        for entry in self.store.scan_prefix(LOG_KEY_PREFIX) {
            let (key, bytes) = entry?;
            let Some(minted_at) = key_timestamp(&key) else {
                warn!("Skipping log key without timestamp: {key}");
                continue;
            };
            if minted_at < lower_bound || minted_at > now {
                continue;
            }
            match serde_json::from_slice::<LogRecord<V>>(&bytes) {
                Ok(record) => records.push((key, record)),
                Err(e) => warn!("Skipping undecodable log record {key}: {e}"),
            }
        }
        Ok(records)
    }

    /// Windowed records grouped by correlation id, each group sorted by
    /// `(date_time, key)` ascending.
    pub fn grouped<V: DeserializeOwned>(
        &self,
        now: DateTime<Utc>,
        min_diff: i64,
    ) -> Result<BTreeMap<Uuid, Vec<KeyedRecord<V>>>> {
        let mut groups: BTreeMap<Uuid, Vec<KeyedRecord<V>>> = BTreeMap::new();
        for (key, record) in self.within_window(now, min_diff)? {
            groups
                .entry(record.correlation_id)
                .or_default()
                .push((key, record));
        }
        for group in groups.values_mut() {
            group.sort_by(|(key_a, rec_a), (key_b, rec_b)| {
                rec_a
                    .date_time
                    .cmp(&rec_b.date_time)
                    .then_with(|| key_a.cmp(key_b))
            });
        }
        Ok(groups)
    }
}
