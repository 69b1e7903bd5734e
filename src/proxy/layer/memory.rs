use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use time::{Duration, OffsetDateTime};
use tokio::io::AsyncReadExt;
use tracing::trace;

use super::{CacheLayer, EntryReader, LayerError, LayerHit};

/// Byte-bounded in-memory cache tier.
///
/// Entries move through absent -> fresh -> stale; keys observed stale on a
/// read are remembered and reclaimed first when a write needs room, after
/// which fresh entries are evicted in unspecified order. Reads share the
/// store lock; writes and capacity maintenance take it exclusively.
pub struct InMemoryLayer {
    max_size: u64,
    state: RwLock<StoreState>,
    stale_keys: Mutex<HashSet<String>>,
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<String, StoredEntry>,
    current_size: u64,
}

struct StoredEntry {
    data: Bytes,
    expires_at: OffsetDateTime,
}

impl InMemoryLayer {
    pub fn new(max_size: u64) -> Self {
        Self {
            max_size,
            state: RwLock::new(StoreState::default()),
            stale_keys: Mutex::new(HashSet::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn current_size(&self) -> u64 {
        self.state.read().current_size
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.read().entries.len()
    }
}

impl StoreState {
    fn remove(&mut self, key: &str) -> u64 {
        match self.entries.remove(key) {
            Some(entry) => {
                let size = entry.data.len() as u64;
                self.current_size -= size;
                size
            }
            None => 0,
        }
    }

    /// Free at least `needed` bytes: known-stale keys first, then fresh
    /// entries in whatever order the table yields them.
    fn make_room(&mut self, mut needed: u64, stale_keys: &mut HashSet<String>) -> bool {
        while needed > 0 {
            let Some(key) = stale_keys.iter().next().cloned() else {
                break;
            };
            stale_keys.remove(&key);
            needed = needed.saturating_sub(self.remove(&key));
        }

        while needed > 0 {
            let Some(key) = self.entries.keys().next().cloned() else {
                return false;
            };
            stale_keys.remove(&key);
            needed = needed.saturating_sub(self.remove(&key));
        }
        true
    }
}

#[async_trait]
impl CacheLayer for InMemoryLayer {
    async fn get(&self, key: &str) -> Result<Option<LayerHit>, LayerError> {
        let (data, ttl) = {
            let state = self.state.read();
            match state.entries.get(key) {
                Some(entry) => (
                    entry.data.clone(),
                    entry.expires_at - OffsetDateTime::now_utc(),
                ),
                None => return Ok(None),
            }
        };

        if ttl <= Duration::ZERO {
            self.stale_keys.lock().insert(key.to_string());
        }

        Ok(Some(LayerHit {
            reader: Box::new(Cursor::new(data)),
            ttl,
        }))
    }

    async fn set(&self, key: &str, mut entry: EntryReader, ttl: Duration) -> Result<(), LayerError> {
        let mut data = Vec::new();
        entry.read_to_end(&mut data).await?;
        let size = data.len() as u64;

        let mut state = self.state.write();
        state.remove(key);

        if size > self.max_size {
            return Err(LayerError::CapacityExceeded {
                size,
                capacity: self.max_size,
            });
        }
        let available = self.max_size - state.current_size;
        if size > available {
            let mut stale_keys = self.stale_keys.lock();
            if !state.make_room(size - available, &mut stale_keys) {
                return Err(LayerError::CapacityExceeded {
                    size,
                    capacity: self.max_size,
                });
            }
        }

        state.current_size += size;
        state.entries.insert(
            key.to_string(),
            StoredEntry {
                data: Bytes::from(data),
                expires_at: OffsetDateTime::now_utc() + ttl,
            },
        );
        if ttl > Duration::ZERO {
            self.stale_keys.lock().remove(key);
        }
        trace!(key, size, "stored in-memory cache entry");
        Ok(())
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), LayerError> {
        let mut state = self.state.write();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.expires_at = OffsetDateTime::now_utc() + ttl;
            if ttl > Duration::ZERO {
                self.stale_keys.lock().remove(key);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), LayerError> {
        let mut state = self.state.write();
        state.remove(key);
        self.stale_keys.lock().remove(key);
        Ok(())
    }
}
