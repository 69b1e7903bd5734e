use async_trait::async_trait;
use thiserror::Error;
use time::Duration;
use tokio::io::AsyncRead;

mod cascade;
mod memory;

pub use cascade::StorageCascade;
pub use memory::InMemoryLayer;

/// Streamed value handed out of, or into, a storage layer.
pub type EntryReader = Box<dyn AsyncRead + Send + Unpin>;

/// A stored value together with its remaining freshness. A non-positive TTL
/// means the entry is stale but still present.
pub struct LayerHit {
    pub reader: EntryReader,
    pub ttl: Duration,
}

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("cache backend I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("entry of {size} bytes cannot be fitted into a cache of {capacity} bytes")]
    CapacityExceeded { size: u64, capacity: u64 },
}

/// One tier of cache storage. Every operation must be safe for concurrent
/// use; entries may be evicted at any moment, so callers treat absence as a
/// miss, never as a fault.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Look up a stored value. `None` is a miss; a hit reports the remaining
    /// TTL, which is negative for stale entries.
    async fn get(&self, key: &str) -> Result<Option<LayerHit>, LayerError>;

    /// Store a value, replacing any existing entry under the key. The reader
    /// is consumed. Fails only on backend faults or when capacity cannot be
    /// reclaimed.
    async fn set(&self, key: &str, entry: EntryReader, ttl: Duration) -> Result<(), LayerError>;

    /// Move the expiration of an existing entry. Refreshing an absent key is
    /// a successful no-op, distinguishing it from a backend failure.
    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), LayerError>;

    /// Remove an entry. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), LayerError>;
}
