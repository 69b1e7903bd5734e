use std::sync::Arc;

use time::Duration;
use tracing::{debug, warn};

use super::{CacheLayer, EntryReader, LayerError, LayerHit};

/// Ordered tiers of cache storage, fastest and smallest first. The cascade
/// adds no locking of its own; each layer serializes its own mutations, so a
/// multi-layer write is not atomic and later reads may observe partial
/// state. Callers already treat absence as a miss.
#[derive(Clone)]
pub struct StorageCascade {
    layers: Arc<Vec<Arc<dyn CacheLayer>>>,
}

impl StorageCascade {
    pub fn new(layers: Vec<Arc<dyn CacheLayer>>) -> Self {
        Self {
            layers: Arc::new(layers),
        }
    }

    /// Probe the tiers in order and return the first hit.
    pub async fn get(&self, key: &str) -> Result<Option<LayerHit>, LayerError> {
        for layer in self.layers.iter() {
            if let Some(hit) = layer.get(key).await? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    /// Write-through store. The supplied reader is consumed by the first
    /// tier; every subsequent tier is fed by re-reading the entry from the
    /// tier above it. A failure in the first tier surfaces to the caller.
    pub async fn set(
        &self,
        key: &str,
        entry: EntryReader,
        ttl: Duration,
    ) -> Result<(), LayerError> {
        let mut entry = Some(entry);
        for (index, layer) in self.layers.iter().enumerate() {
            let reader = match entry.take() {
                Some(reader) => reader,
                None => match self.layers[index - 1].get(key).await? {
                    Some(hit) => hit.reader,
                    None => {
                        // Evicted between the two writes; eviction may occur
                        // at any time, so stop propagating quietly.
                        debug!(key, tier = index, "entry vanished during write-through");
                        return Ok(());
                    }
                },
            };
            layer.set(key, reader, ttl).await?;
        }
        Ok(())
    }

    /// Remove the key from every tier. The first failure is reported after
    /// all tiers have been attempted.
    pub async fn delete(&self, key: &str) -> Result<(), LayerError> {
        let mut first_error = None;
        for layer in self.layers.iter() {
            if let Err(err) = layer.delete(key).await
                && first_error.is_none()
            {
                first_error = Some(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Update the expiration in every tier. Per-tier misses are no-ops by
    /// contract and backend faults only get logged; a refresh is advisory.
    pub async fn refresh(&self, key: &str, ttl: Duration) {
        for (index, layer) in self.layers.iter().enumerate() {
            if let Err(err) = layer.refresh(key, ttl).await {
                warn!(key, tier = index, error = %err, "failed to refresh cache entry");
            }
        }
    }
}
