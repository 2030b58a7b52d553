mod sqlite;

pub use sqlite::SqliteEngramStore;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use cbus_protocol::{EngramMessage, EngramMeta};

/// Messages kept per engram when a prune request does not say otherwise.
pub const DEFAULT_KEEP_LAST: usize = 50;

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store lock poisoned")]
    Lock,

    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of an atomic ingest: whether the engram record was created
/// by this call or already existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Created,
    Appended,
}

/// Abstract storage interface for engram persistence.
///
/// All methods use `&self` — implementations must handle interior
/// mutability (e.g. `Mutex<Connection>` for sqlite).
pub trait EngramStore: Send + Sync + 'static {
    /// Idempotent schema bootstrap; safe to call repeatedly.
    fn init(&self) -> Result<(), StorageError>;

    /// First-write: overwrite engram metadata and insert the given
    /// messages tagged with `id`.
    fn store(
        &self,
        id: &str,
        meta: &EngramMeta,
        messages: &[EngramMessage],
    ) -> Result<(), StorageError>;

    /// Insert one message. Engram metadata need not pre-exist.
    fn append(&self, id: &str, message: &EngramMessage) -> Result<(), StorageError>;

    /// Whether an engram metadata record exists for `id`.
    fn exists(&self, id: &str) -> Result<bool, StorageError>;

    /// Store-if-absent-else-append, atomic per engram id: the existence
    /// check and the resulting write happen under one lock so racing
    /// first-writers cannot both create metadata.
    fn ingest(&self, message: &EngramMessage) -> Result<IngestOutcome, StorageError>;

    /// All messages for an engram in insertion order. Unknown or absent
    /// ids yield an empty list, not an error.
    fn load(&self, id: Option<&str>) -> Result<Vec<EngramMessage>, StorageError>;

    /// Metadata for all known engrams.
    fn list(&self) -> Result<Vec<EngramMeta>, StorageError>;

    /// Remove metadata and all messages for an engram.
    fn delete(&self, id: &str) -> Result<(), StorageError>;

    /// Delete the oldest messages beyond `keep_last` (insertion order).
    /// Returns the number removed.
    fn prune(&self, id: &str, keep_last: Option<usize>) -> Result<usize, StorageError>;
}

/// Generate a time-ordered message id.
///
/// Zero-padded millisecond prefix plus a random suffix: lexicographic
/// order matches creation order at millisecond granularity, and the
/// suffix keeps same-millisecond ids unique.
pub fn message_id() -> String {
    let ms = Utc::now().timestamp_millis().max(0);
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{ms:013}-{}", &suffix[..8])
}
