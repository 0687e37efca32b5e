//! Thread-safe disk cache
//!
//! Wraps a `KvStorage` in one mutex. Size and count trims take the lock
//! per batch through a try-lock spin, so long trims yield to foreground
//! reads and writes between batches.
//! Async variants run the blocking operation on tokio's blocking pool.

use crate::item::KvItem;
use crate::space;
use crate::storage::{KvStorage, REMOVE_ALL_BATCH, TrimBudget};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use stowage_common::{
    DiskCacheConfig, Error, Periodic, Result, SpinBackoff, StorageKey, StorageMode, SystemClock,
    TrimPlan, WallClock, filename_for_key, storage_key,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct Limits {
    cost: u64,
    count: u64,
    age: Duration,
    free_disk_space: u64,
}

struct Shared {
    storage: Mutex<KvStorage>,
    limits: RwLock<Limits>,
    name: RwLock<Option<String>>,
    path: PathBuf,
    mode: StorageMode,
    inline_threshold: u64,
    clock: Arc<dyn WallClock>,
    backoff: SpinBackoff,
}

impl Shared {
    fn label(&self) -> String {
        self.name
            .read()
            .clone()
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Content filename for a value, or `None` to store it inline
    fn filename_for(&self, key: &str, len: usize) -> Option<String> {
        let file_backed = match self.mode {
            StorageMode::Sqlite => false,
            StorageMode::File => true,
            StorageMode::Mixed => u64::try_from(len).map_or(true, |len| len > self.inline_threshold),
        };
        file_backed.then(|| filename_for_key(key))
    }

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.storage.lock().exists(key)?)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.storage.lock().get_value(key)?)
    }

    fn get_item(&self, key: &str) -> Result<Option<KvItem>> {
        Ok(self.storage.lock().get(key)?)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let filename = self.filename_for(key, value.len());
        self.storage.lock().put(key, value, filename.as_deref())?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.storage.lock().remove(key)?)
    }

    fn remove_all(&self) -> Result<()> {
        self.storage.lock().remove_all()?;
        Ok(())
    }

    fn remove_all_with_progress(&self, mut progress: impl FnMut(usize, usize)) -> Result<()> {
        let total = usize::try_from(self.storage.lock().item_count()?).unwrap_or(0);
        let mut deleted = 0;
        while deleted < total {
            let removed = self
                .storage
                .lock()
                .remove_lru_batch(REMOVE_ALL_BATCH.min(total - deleted))?;
            if removed == 0 {
                break;
            }
            deleted += removed;
            progress(deleted, total);
        }
        self.storage.lock().checkpoint();
        Ok(())
    }

    fn total_cost(&self) -> Result<u64> {
        Ok(u64::try_from(self.storage.lock().total_size()?).unwrap_or(0))
    }

    fn total_count(&self) -> Result<u64> {
        Ok(u64::try_from(self.storage.lock().item_count()?).unwrap_or(0))
    }

    fn trim_to_cost(&self, limit: u64) -> Result<()> {
        self.trim_by(TrimBudget::Size(signed_limit(limit)))
    }

    fn trim_to_count(&self, limit: u64) -> Result<()> {
        self.trim_by(TrimBudget::Count(signed_limit(limit)))
    }

    fn trim_by(&self, budget: TrimBudget) -> Result<()> {
        let plan = {
            let mut storage = self.storage.lock();
            match budget {
                TrimBudget::Size(limit) => TrimPlan::for_signed_limit(storage.total_size()?, limit),
                TrimBudget::Count(limit) => {
                    TrimPlan::for_signed_limit(storage.item_count()?, limit)
                }
            }
        };
        match plan {
            TrimPlan::ClearAll => return self.remove_all(),
            TrimPlan::WithinLimit => return Ok(()),
            TrimPlan::Evict => {}
        }

        loop {
            let mut storage = self.backoff.acquire(|| self.storage.try_lock());
            if storage.evict_lru_batch(budget)? {
                storage.checkpoint();
                break;
            }
        }
        debug!("Disk cache {} trimmed to {:?}", self.label(), budget);
        Ok(())
    }

    fn trim_to_age(&self, limit: Duration) -> Result<()> {
        if limit == Duration::MAX {
            return Ok(());
        }
        if limit.is_zero() {
            return self.remove_all();
        }
        let age = i64::try_from(limit.as_secs()).unwrap_or(i64::MAX);
        let cutoff = self.clock.unix_now().saturating_sub(age);
        self.storage.lock().remove_older_than(cutoff)?;
        Ok(())
    }

    fn trim_to_free_disk_space(&self, target: u64) -> Result<()> {
        if target == 0 {
            return Ok(());
        }
        let available = space::available_bytes(&self.path)?;
        let Some(budget) = space::budget_for_free_space(self.total_cost()?, available, target)
        else {
            return Ok(());
        };
        debug!(
            "Disk cache {} has {} bytes free, trimming to {} bytes",
            self.label(),
            available,
            budget
        );
        self.trim_to_cost(budget)
    }

    fn auto_trim(&self) {
        let limits = *self.limits.read();
        let results = [
            ("cost", self.trim_to_cost(limits.cost)),
            ("count", self.trim_to_count(limits.count)),
            ("age", self.trim_to_age(limits.age)),
            (
                "free space",
                self.trim_to_free_disk_space(limits.free_disk_space),
            ),
        ];
        for (trim, result) in results {
            if let Err(e) = result {
                warn!("Disk cache {} {} trim failed: {}", self.label(), trim, e);
            }
        }
    }
}

/// Limits are stored unsigned; the index counts in `i64`
fn signed_limit(limit: u64) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Disk tier with limits, periodic trimming and async variants
pub struct DiskCache {
    auto_trim: Periodic,
    shared: Arc<Shared>,
}

impl DiskCache {
    /// Open a cache at the configured path
    pub fn open(config: &DiskCacheConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    pub fn open_with_clock(config: &DiskCacheConfig, clock: Arc<dyn WallClock>) -> Result<Self> {
        config.validate()?;

        let mut storage =
            KvStorage::open_with_clock(&config.path, config.storage_mode, Arc::clone(&clock))?;
        storage.set_error_logs_enabled(config.error_logs_enabled);

        let shared = Arc::new(Shared {
            storage: Mutex::new(storage),
            limits: RwLock::new(Limits {
                cost: config.cost_limit(),
                count: config.count_limit(),
                age: config.age_limit(),
                free_disk_space: config.free_disk_space_limit,
            }),
            name: RwLock::new(config.name.clone()),
            path: config.path.clone(),
            mode: config.storage_mode,
            inline_threshold: config.inline_threshold,
            clock,
            backoff: SpinBackoff::default(),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let auto_trim = Periodic::start(
            "stowage-disk-auto-trim",
            config.auto_trim_interval(),
            move || {
                let Some(shared) = weak.upgrade() else {
                    return false;
                };
                shared.auto_trim();
                true
            },
        )?;
        debug!("Opened disk cache {}", shared.label());

        Ok(Self { auto_trim, shared })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.shared.mode
    }

    pub fn inline_threshold(&self) -> u64 {
        self.shared.inline_threshold
    }

    pub fn contains<K: StorageKey + ?Sized>(&self, key: &K) -> Result<bool> {
        self.shared.contains(&storage_key(key))
    }

    pub fn get<K: StorageKey + ?Sized>(&self, key: &K) -> Result<Option<Vec<u8>>> {
        self.shared.get(&storage_key(key))
    }

    /// Value with its index metadata
    pub fn get_item<K: StorageKey + ?Sized>(&self, key: &K) -> Result<Option<KvItem>> {
        self.shared.get_item(&storage_key(key))
    }

    pub fn set<K: StorageKey + ?Sized>(&self, key: &K, value: &[u8]) -> Result<()> {
        self.shared.set(&storage_key(key), value)
    }

    pub fn remove<K: StorageKey + ?Sized>(&self, key: &K) -> Result<bool> {
        self.shared.remove(&storage_key(key))
    }

    pub fn remove_all(&self) -> Result<()> {
        self.shared.remove_all()
    }

    /// Remove everything in batches, reporting `(deleted, total)` after each
    pub fn remove_all_with_progress(&self, progress: impl FnMut(usize, usize)) -> Result<()> {
        self.shared.remove_all_with_progress(progress)
    }

    /// Total stored bytes
    pub fn total_cost(&self) -> Result<u64> {
        self.shared.total_cost()
    }

    pub fn total_count(&self) -> Result<u64> {
        self.shared.total_count()
    }

    pub fn trim_to_cost(&self, limit: u64) -> Result<()> {
        self.shared.trim_to_cost(limit)
    }

    pub fn trim_to_count(&self, limit: u64) -> Result<()> {
        self.shared.trim_to_count(limit)
    }

    /// Remove items not accessed within `limit`
    pub fn trim_to_age(&self, limit: Duration) -> Result<()> {
        self.shared.trim_to_age(limit)
    }

    /// Trim until the volume has `target` free bytes or the cache is empty
    pub fn trim_to_free_disk_space(&self, target: u64) -> Result<()> {
        self.shared.trim_to_free_disk_space(target)
    }

    pub fn stop_auto_trim(&mut self) {
        self.auto_trim.stop();
    }

    pub fn cost_limit(&self) -> u64 {
        self.shared.limits.read().cost
    }

    pub fn set_cost_limit(&self, limit: u64) {
        self.shared.limits.write().cost = limit;
    }

    pub fn count_limit(&self) -> u64 {
        self.shared.limits.read().count
    }

    pub fn set_count_limit(&self, limit: u64) {
        self.shared.limits.write().count = limit;
    }

    pub fn age_limit(&self) -> Duration {
        self.shared.limits.read().age
    }

    pub fn set_age_limit(&self, limit: Duration) {
        self.shared.limits.write().age = limit;
    }

    pub fn free_disk_space_limit(&self) -> u64 {
        self.shared.limits.read().free_disk_space
    }

    pub fn set_free_disk_space_limit(&self, bytes: u64) {
        self.shared.limits.write().free_disk_space = bytes;
    }

    pub fn name(&self) -> Option<String> {
        self.shared.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.shared.name.write() = Some(name.into());
    }

    pub fn error_logs_enabled(&self) -> bool {
        self.shared.storage.lock().error_logs_enabled()
    }

    pub fn set_error_logs_enabled(&self, enabled: bool) {
        self.shared.storage.lock().set_error_logs_enabled(enabled);
    }

    // Async variants

    pub async fn contains_async<K: StorageKey + ?Sized>(&self, key: &K) -> Result<bool> {
        let key = storage_key(key);
        self.run_blocking(move |shared| shared.contains(&key)).await
    }

    pub async fn get_async<K: StorageKey + ?Sized>(&self, key: &K) -> Result<Option<Vec<u8>>> {
        let key = storage_key(key);
        self.run_blocking(move |shared| shared.get(&key)).await
    }

    pub async fn set_async<K: StorageKey + ?Sized>(&self, key: &K, value: Vec<u8>) -> Result<()> {
        let key = storage_key(key);
        self.run_blocking(move |shared| shared.set(&key, &value))
            .await
    }

    pub async fn get_item_async<K: StorageKey + ?Sized>(&self, key: &K) -> Result<Option<KvItem>> {
        let key = storage_key(key);
        self.run_blocking(move |shared| shared.get_item(&key)).await
    }

    pub async fn remove_async<K: StorageKey + ?Sized>(&self, key: &K) -> Result<bool> {
        let key = storage_key(key);
        self.run_blocking(move |shared| shared.remove(&key)).await
    }

    pub async fn remove_all_async(&self) -> Result<()> {
        self.run_blocking(|shared| shared.remove_all()).await
    }

    /// Batched `remove_all` off the calling task; `progress` runs on the
    /// blocking pool
    pub async fn remove_all_with_progress_async(
        &self,
        progress: impl FnMut(usize, usize) + Send + 'static,
    ) -> Result<()> {
        self.run_blocking(move |shared| shared.remove_all_with_progress(progress))
            .await
    }

    pub async fn total_cost_async(&self) -> Result<u64> {
        self.run_blocking(Shared::total_cost).await
    }

    pub async fn total_count_async(&self) -> Result<u64> {
        self.run_blocking(Shared::total_count).await
    }

    pub async fn trim_to_cost_async(&self, limit: u64) -> Result<()> {
        self.run_blocking(move |shared| shared.trim_to_cost(limit))
            .await
    }

    pub async fn trim_to_count_async(&self, limit: u64) -> Result<()> {
        self.run_blocking(move |shared| shared.trim_to_count(limit))
            .await
    }

    pub async fn trim_to_age_async(&self, limit: Duration) -> Result<()> {
        self.run_blocking(move |shared| shared.trim_to_age(limit))
            .await
    }

    async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Shared) -> Result<T> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || op(&shared))
            .await
            .map_err(|e| Error::worker(format!("disk task failed: {e}")))?
    }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        self.auto_trim.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread;
    use std::time::Instant;
    use stowage_common::{HashedKey, ManualClock};
    use tempfile::{TempDir, tempdir};

    fn config(dir: &TempDir, mode: StorageMode) -> DiskCacheConfig {
        DiskCacheConfig {
            storage_mode: mode,
            inline_threshold: 64,
            ..DiskCacheConfig::with_path(dir.path())
        }
    }

    fn data_files(dir: &TempDir) -> usize {
        fs::read_dir(dir.path().join("data")).unwrap().count()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_set_get_remove() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(&config(&dir, StorageMode::Mixed)).unwrap();

        cache.set("a", b"hello").unwrap();
        assert!(cache.contains("a").unwrap());
        assert_eq!(cache.get("a").unwrap().unwrap(), b"hello");
        assert_eq!(cache.get_item("a").unwrap().unwrap().meta.size, 5);

        assert!(cache.remove("a").unwrap());
        assert!(!cache.remove("a").unwrap());
        assert!(cache.get("a").unwrap().is_none());
    }

    #[test]
    fn test_threshold_placement() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(&config(&dir, StorageMode::Mixed)).unwrap();

        cache.set("inline", &[1; 64]).unwrap();
        assert_eq!(data_files(&dir), 0);

        cache.set("file", &[2; 65]).unwrap();
        assert_eq!(data_files(&dir), 1);
        let item = cache.get_item("file").unwrap().unwrap();
        assert_eq!(item.meta.filename, Some(filename_for_key("file")));

        // Shrinking moves the value back inline
        cache.set("file", &[3; 10]).unwrap();
        assert_eq!(data_files(&dir), 0);
        assert_eq!(cache.get("file").unwrap().unwrap(), vec![3; 10]);
    }

    #[test]
    fn test_mode_placement() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(&config(&dir, StorageMode::File)).unwrap();
        cache.set("tiny", b"x").unwrap();
        assert_eq!(data_files(&dir), 1);
        drop(cache);

        let dir = tempdir().unwrap();
        let cache = DiskCache::open(&config(&dir, StorageMode::Sqlite)).unwrap();
        cache.set("huge", &[0; 4096]).unwrap();
        assert_eq!(data_files(&dir), 0);
        assert_eq!(cache.get("huge").unwrap().unwrap().len(), 4096);
    }

    #[test]
    fn test_hashed_keys() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(&config(&dir, StorageMode::Mixed)).unwrap();

        cache.set(&42u64, b"int").unwrap();
        cache.set(&HashedKey(("user", 7)), b"tuple").unwrap();
        assert_eq!(cache.get(&42u64).unwrap().unwrap(), b"int");
        assert_eq!(cache.get(&HashedKey(("user", 7))).unwrap().unwrap(), b"tuple");
        assert!(cache.get(&HashedKey(("user", 8))).unwrap().is_none());
    }

    #[test]
    fn test_trim_to_cost_and_count() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(10_000));
        let cache =
            DiskCache::open_with_clock(&config(&dir, StorageMode::Mixed), clock.clone()).unwrap();
        for i in 0..40 {
            cache.set(&format!("k{i:02}"), &[0; 100]).unwrap();
            clock.advance(1);
        }
        assert_eq!(cache.total_cost().unwrap(), 4000);

        cache.trim_to_cost(u64::MAX).unwrap();
        assert_eq!(cache.total_count().unwrap(), 40);

        cache.trim_to_cost(2500).unwrap();
        assert_eq!(cache.total_cost().unwrap(), 2500);
        assert!(!cache.contains("k14").unwrap());
        assert!(cache.contains("k15").unwrap());

        cache.trim_to_count(5).unwrap();
        assert_eq!(cache.total_count().unwrap(), 5);
        assert!(cache.contains("k39").unwrap());

        cache.trim_to_count(0).unwrap();
        assert_eq!(cache.total_count().unwrap(), 0);
    }

    #[test]
    fn test_trim_interleaves_with_writers() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(DiskCache::open(&config(&dir, StorageMode::Sqlite)).unwrap());
        for i in 0..200 {
            cache.set(&format!("k{i}"), b"v").unwrap();
        }

        let writer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..50 {
                    cache.set(&format!("w{i}"), b"v").unwrap();
                }
            })
        };
        cache.trim_to_count(10).unwrap();
        writer.join().unwrap();

        // Writers may land after the last batch; the trim itself completed
        assert!(cache.total_count().unwrap() <= 60);
        cache.trim_to_count(10).unwrap();
        assert_eq!(cache.total_count().unwrap(), 10);
    }

    #[test]
    fn test_trim_to_age() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(10_000));
        let cache =
            DiskCache::open_with_clock(&config(&dir, StorageMode::Mixed), clock.clone()).unwrap();
        cache.set("old", b"1").unwrap();
        clock.advance(100);
        cache.set("new", b"2").unwrap();
        clock.advance(10);

        cache.trim_to_age(Duration::MAX).unwrap();
        assert_eq!(cache.total_count().unwrap(), 2);

        cache.trim_to_age(Duration::from_secs(50)).unwrap();
        assert!(!cache.contains("old").unwrap());
        assert!(cache.contains("new").unwrap());

        cache.trim_to_age(Duration::ZERO).unwrap();
        assert_eq!(cache.total_count().unwrap(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_trim_to_free_disk_space() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(&config(&dir, StorageMode::Mixed)).unwrap();
        cache.set("a", &[0; 100]).unwrap();

        cache.trim_to_free_disk_space(0).unwrap();
        assert_eq!(cache.total_count().unwrap(), 1);

        // No volume has this much free space
        cache.trim_to_free_disk_space(u64::MAX).unwrap();
        assert_eq!(cache.total_count().unwrap(), 0);
    }

    #[test]
    fn test_auto_trim() {
        let dir = tempdir().unwrap();
        let cfg = DiskCacheConfig {
            count_limit: Some(2),
            auto_trim_interval_secs: 1,
            ..config(&dir, StorageMode::Mixed)
        };
        let cache = DiskCache::open(&cfg).unwrap();
        for i in 0..5 {
            cache.set(&format!("k{i}"), b"v").unwrap();
        }
        assert!(wait_until(|| cache.total_count().unwrap() <= 2));
    }

    #[test]
    fn test_limits_are_runtime_settable() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(&config(&dir, StorageMode::Mixed)).unwrap();
        assert_eq!(cache.cost_limit(), u64::MAX);
        assert_eq!(cache.age_limit(), Duration::MAX);

        cache.set_cost_limit(1024);
        cache.set_count_limit(10);
        cache.set_age_limit(Duration::from_secs(60));
        cache.set_free_disk_space_limit(1 << 20);
        cache.set_name("thumbnails");
        cache.set_error_logs_enabled(false);

        assert_eq!(cache.cost_limit(), 1024);
        assert_eq!(cache.count_limit(), 10);
        assert_eq!(cache.age_limit(), Duration::from_secs(60));
        assert_eq!(cache.free_disk_space_limit(), 1 << 20);
        assert_eq!(cache.name().as_deref(), Some("thumbnails"));
        assert!(!cache.error_logs_enabled());
    }

    #[test]
    fn test_remove_all_with_progress() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(&config(&dir, StorageMode::Mixed)).unwrap();
        for i in 0..40 {
            cache.set(&format!("k{i}"), &[0; 100]).unwrap();
        }

        let mut last = (0, 0);
        cache
            .remove_all_with_progress(|deleted, total| last = (deleted, total))
            .unwrap();
        assert_eq!(last, (40, 40));
        assert_eq!(cache.total_count().unwrap(), 0);
        assert_eq!(data_files(&dir), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempdir().unwrap();
        let cfg = DiskCacheConfig {
            auto_trim_interval_secs: 0,
            ..config(&dir, StorageMode::Mixed)
        };
        assert!(matches!(DiskCache::open(&cfg), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_async_variants() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(&config(&dir, StorageMode::Mixed)).unwrap();

        cache.set_async("a", vec![1; 200]).await.unwrap();
        cache.set_async("b", b"small".to_vec()).await.unwrap();
        assert!(cache.contains_async("a").await.unwrap());
        assert_eq!(cache.get_async("a").await.unwrap().unwrap().len(), 200);

        assert!(cache.remove_async("a").await.unwrap());
        assert!(cache.get_async("a").await.unwrap().is_none());

        cache.trim_to_count_async(0).await.unwrap();
        assert_eq!(cache.total_count().unwrap(), 0);

        cache.set_async("c", vec![4; 100]).await.unwrap();
        assert_eq!(cache.total_count_async().await.unwrap(), 1);
        assert_eq!(cache.total_cost_async().await.unwrap(), 100);
        let item = cache.get_item_async("c").await.unwrap().unwrap();
        assert_eq!(item.meta.filename, Some(filename_for_key("c")));
        assert_eq!(item.value.len(), 100);
        cache.remove_all_async().await.unwrap();
        assert!(!cache.contains_async("c").await.unwrap());
    }
}
