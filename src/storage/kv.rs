//! Key-Value Store
//!
//! Thin typed wrapper around a per-service sled database. Entity records and
//! log records live in the same key space and are told apart purely by the
//! `log:` key prefix, so a single prefix scan enumerates the log family.
//!
//! The one primitive the rest of the system leans on is `commit_atomic`: a
//! pipelined commit that applies an entity write together with its
//! CREATE/UPDATE log record as a single sled batch. Partial application is
//! impossible — either both land or neither does — which is what lets the
//! sweeper reason about crash states from the log alone.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Non-UTF8 key in store")]
    InvalidKey,
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub struct KvStore {
    db: sled::Db,
}

impl KvStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = sled::Config::new()
            .path(path)
            .flush_every_ms(Some(100)) // Frequent durability
            .cache_capacity(64 * 1024 * 1024) // 64MB cache
            .mode(sled::Mode::HighThroughput);

        let db = config.open()?;
        Ok(Self { db })
    }

    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.db.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    /// Encode a value the way this store stores it.
    pub fn encode<V: Serialize>(value: &V) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    /// Apply a group of writes in one atomic batch. Used to couple an
    /// entity mutation with its write-ahead record.
    pub fn commit_atomic(&self, writes: &[(&str, Vec<u8>)]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for (key, bytes) in writes {
            batch.insert(key.as_bytes(), bytes.clone());
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    /// Iterate `(key, value_bytes)` pairs under a key prefix.
    pub fn scan_prefix(&self, prefix: &str) -> impl Iterator<Item = Result<(String, Vec<u8>)>> + '_ {
        self.db.scan_prefix(prefix.as_bytes()).map(|item| {
            let (key_bytes, value_bytes) = item?;
            let key = String::from_utf8(key_bytes.to_vec()).map_err(|_| StoreError::InvalidKey)?;
            Ok((key, value_bytes.to_vec()))
        })
    }

    /// Flush pending writes to disk, ensuring durability before shutdown.
    pub async fn close(&self) -> Result<()> {
        info!("Flushing store to disk...");
        self.db.flush_async().await?;
        Ok(())
    }
}
