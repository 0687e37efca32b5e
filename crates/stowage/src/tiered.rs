//! Two-tier cache
//!
//! Reads try memory, then disk; disk hits are promoted into memory with the
//! value length as cost. Writes and removals go to disk first, which stays
//! authoritative if the process dies between the two tiers.

use bytes::Bytes;
use std::path::Path;
use stowage_common::{Result, StorageKey, StowageConfig, storage_key};
use stowage_disk::DiskCache;
use stowage_memory::{MemoryCache, PressureSignal};
use tracing::{debug, info};

pub struct TieredCache {
    memory: MemoryCache<String, Bytes>,
    disk: DiskCache,
}

impl TieredCache {
    pub fn open(config: &StowageConfig) -> Result<Self> {
        config.validate()?;
        let memory = MemoryCache::with_config(&config.memory)?;
        let disk = DiskCache::open(&config.disk)?;
        info!("Opened tiered cache at {:?}", disk.path());
        Ok(Self { memory, disk })
    }

    /// Open with default limits at `path`
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = StowageConfig::default();
        config.disk.path = path.as_ref().to_path_buf();
        Self::open(&config)
    }

    pub fn memory(&self) -> &MemoryCache<String, Bytes> {
        &self.memory
    }

    pub fn disk(&self) -> &DiskCache {
        &self.disk
    }

    pub fn contains<K: StorageKey + ?Sized>(&self, key: &K) -> Result<bool> {
        let key = storage_key(key);
        if self.memory.contains(key.as_str()) {
            return Ok(true);
        }
        self.disk.contains(&key)
    }

    pub fn get<K: StorageKey + ?Sized>(&self, key: &K) -> Result<Option<Bytes>> {
        let key = storage_key(key);
        if let Some(value) = self.memory.get(key.as_str()) {
            return Ok(Some(value));
        }
        let Some(value) = self.disk.get(&key)? else {
            return Ok(None);
        };
        Ok(Some(self.promote(key, value)))
    }

    pub fn set<K: StorageKey + ?Sized>(&self, key: &K, value: impl Into<Bytes>) -> Result<()> {
        let key = storage_key(key);
        let value = value.into();
        self.disk.set(&key, &value)?;
        self.memory.set_with_cost(key, value.clone(), value.len() as u64);
        Ok(())
    }

    /// Remove from both tiers; returns whether either held the key
    pub fn remove<K: StorageKey + ?Sized>(&self, key: &K) -> Result<bool> {
        let key = storage_key(key);
        let on_disk = self.disk.remove(&key)?;
        let in_memory = self.memory.remove(key.as_str());
        Ok(on_disk || in_memory)
    }

    pub fn remove_all(&self) -> Result<()> {
        self.disk.remove_all()?;
        self.memory.clear();
        Ok(())
    }

    /// Forward a host pressure signal to the memory tier
    pub fn on_pressure_signal(&self, signal: PressureSignal) {
        self.memory.on_pressure_signal(signal);
    }

    pub async fn contains_async<K: StorageKey + ?Sized>(&self, key: &K) -> Result<bool> {
        let key = storage_key(key);
        if self.memory.contains(key.as_str()) {
            return Ok(true);
        }
        self.disk.contains_async(&key).await
    }

    pub async fn get_async<K: StorageKey + ?Sized>(&self, key: &K) -> Result<Option<Bytes>> {
        let key = storage_key(key);
        if let Some(value) = self.memory.get(key.as_str()) {
            return Ok(Some(value));
        }
        let Some(value) = self.disk.get_async(&key).await? else {
            return Ok(None);
        };
        Ok(Some(self.promote(key, value)))
    }

    pub async fn set_async<K: StorageKey + ?Sized>(
        &self,
        key: &K,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        let key = storage_key(key);
        let value = value.into();
        self.disk.set_async(&key, value.to_vec()).await?;
        self.memory.set_with_cost(key, value.clone(), value.len() as u64);
        Ok(())
    }

    pub async fn remove_async<K: StorageKey + ?Sized>(&self, key: &K) -> Result<bool> {
        let key = storage_key(key);
        let on_disk = self.disk.remove_async(&key).await?;
        let in_memory = self.memory.remove(key.as_str());
        Ok(on_disk || in_memory)
    }

    pub async fn remove_all_async(&self) -> Result<()> {
        self.disk.remove_all_async().await?;
        self.memory.clear();
        Ok(())
    }

    fn promote(&self, key: String, value: Vec<u8>) -> Bytes {
        let value = Bytes::from(value);
        debug!("Promoting {} ({} bytes) to memory", key, value.len());
        self.memory.set_with_cost(key, value.clone(), value.len() as u64);
        value
    }
}
