//! Durable storage behind the room directory.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  persist hook  ┌──────────────┐  put(key, bytes)  ┌───────────┐
//! │    Room     │ ─────────────► │ PersistQueue │ ────────────────► │ RoomStore │
//! └─────────────┘                │ (bounded,    │   retry+backoff   └─────┬─────┘
//!                                │  one worker) │                         │
//!                                └──────────────┘          ┌──────────────┴───────────┐
//!                                                          ▼                          ▼
//!                                                    MemoryStore               RocksStore
//!                                                                     CF "rooms"    LZ4 records
//!                                                                     CF "metadata" bincode
//! ```
//!
//! The store itself is an opaque async key-value interface; rooms are
//! stored as JSON-encoded [`RoomRecord`]s under their key.

pub mod memory;
pub mod queue;
pub mod rocks;

use async_trait::async_trait;

use crate::room::RoomRecord;

pub use memory::MemoryStore;
pub use queue::{PersistQueue, PersistStats};
pub use rocks::{RocksStore, RoomMetadata, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    /// Store not reachable right now
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Async key-value store holding encoded room records.
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Encode a record as stored: `{password, access, identMap, data}` JSON.
pub fn encode_record(record: &RoomRecord) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(record).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode a stored record. Missing fields default to null / empty.
pub fn decode_record(bytes: &[u8]) -> Result<RoomRecord, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
}
