//! Disk key-value store
//!
//! Values live either inline in the index or as files in `data/`,
//! depending on the `StorageMode` and whether the caller passes a filename.
//!
//! Consistency rules between the two substrates:
//! - Write: file first, then row; a failed row write deletes the new file
//! - Delete: file first, then row
//! - Read: a row whose file cannot be read is deleted and reported as a miss
//!
//! A crash between the steps of a delete therefore leaves at worst a row
//! without a file, which the next read heals.
//!
//! `KvStorage` is not internally synchronized; callers hold one lock per
//! instance around each call (see `DiskCache`). Only the trash purge runs on
//! its own thread.

use crate::error::{KvError, KvResult};
use crate::index::{Index, Record};
use crate::item::{ItemMeta, KvItem};
use crate::layout::{self, StoreLayout};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stowage_common::{SerialQueue, StorageMode, SystemClock, TrimPlan, WallClock};
use tracing::{debug, info, warn};

/// Rows fetched per step of a size or count trim
pub const TRIM_BATCH: usize = 16;

/// Rows deleted per step of a progress-reporting `remove_all`
pub const REMOVE_ALL_BATCH: usize = 32;

/// Aggregate a trim step is bounded by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimBudget {
    /// Total value bytes
    Size(i64),
    /// Number of items
    Count(i64),
}

impl TrimBudget {
    const fn limit(self) -> i64 {
        match self {
            Self::Size(limit) | Self::Count(limit) => limit,
        }
    }

    const fn weight(self, meta: &ItemMeta) -> i64 {
        match self {
            Self::Size(_) => meta.size,
            Self::Count(_) => 1,
        }
    }
}

pub struct KvStorage {
    layout: StoreLayout,
    mode: StorageMode,
    index: Index,
    clock: Arc<dyn WallClock>,
    trash_queue: SerialQueue,
}

impl KvStorage {
    /// Open or create a store at `path`
    pub fn open(path: impl Into<PathBuf>, mode: StorageMode) -> KvResult<Self> {
        Self::open_with_clock(path, mode, Arc::new(SystemClock))
    }

    /// Open or create a store with an explicit wall clock
    ///
    /// If the index cannot be opened, the store is wiped and rebuilt once
    /// before giving up.
    pub fn open_with_clock(
        path: impl Into<PathBuf>,
        mode: StorageMode,
        clock: Arc<dyn WallClock>,
    ) -> KvResult<Self> {
        let layout = StoreLayout::new(path);
        layout.create_dirs().map_err(|e| {
            KvError::Init(format!("failed to create {}: {e}", layout.root().display()))
        })?;
        let trash_queue = SerialQueue::new("stowage-trash")
            .map_err(|e| KvError::Init(format!("failed to start trash queue: {e}")))?;

        let mut index = Index::new(layout.index_path());
        if let Err(e) = index.open() {
            warn!("Index at {:?} is unusable ({}), rebuilding store", layout.root(), e);
            drop(index);
            reset_files(&layout).map_err(|e| {
                KvError::Init(format!("failed to reset {}: {e}", layout.root().display()))
            })?;
            index = Index::new(layout.index_path());
            index.open().map_err(|e| {
                KvError::Init(format!(
                    "index at {} unusable after reset: {e}",
                    layout.index_path().display()
                ))
            })?;
        }

        let storage = Self {
            layout,
            mode,
            index,
            clock,
            trash_queue,
        };
        storage.purge_trash();
        info!("Opened disk store at {:?} ({:?} mode)", storage.path(), mode);
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        self.layout.root()
    }

    pub const fn mode(&self) -> StorageMode {
        self.mode
    }

    pub const fn error_logs_enabled(&self) -> bool {
        self.index.error_logs_enabled()
    }

    pub fn set_error_logs_enabled(&mut self, enabled: bool) {
        self.index.set_error_logs_enabled(enabled);
    }

    pub fn exists(&mut self, key: &str) -> KvResult<bool> {
        check_key(key)?;
        self.index.exists(key)
    }

    /// Store a value
    ///
    /// With a filename in `File` or `Mixed` mode the value is written to
    /// `data/<filename>`; otherwise it is stored inline. `File` mode
    /// requires a filename; `Sqlite` mode ignores it.
    pub fn put(&mut self, key: &str, value: &[u8], filename: Option<&str>) -> KvResult<()> {
        check_key(key)?;
        if value.is_empty() {
            return Err(KvError::InvalidArgument("value must not be empty"));
        }
        let filename = filename.filter(|name| !name.is_empty());
        if filename.is_some_and(|name| !layout::is_valid_filename(name)) {
            return Err(KvError::InvalidArgument("filename must be a plain file name"));
        }
        let size = i64::try_from(value.len())
            .map_err(|_| KvError::InvalidArgument("value is too large"))?;
        let now = self.clock.unix_now();

        match (self.mode, filename) {
            (StorageMode::File | StorageMode::Mixed, Some(name)) => {
                let previous = self.index.filename(key)?;
                self.layout.write_file(name, value)?;
                if let Err(e) = self.index.upsert(key, None, Some(name), size, now) {
                    self.delete_file(name);
                    return Err(e);
                }
                if let Some(old) = previous.filter(|old| old != name) {
                    self.delete_file(&old);
                }
                Ok(())
            }
            (StorageMode::File, None) => Err(KvError::InvalidArgument(
                "file storage mode requires a filename",
            )),
            (StorageMode::Sqlite | StorageMode::Mixed, _) => {
                if let Some(old) = self.index.filename(key)? {
                    self.delete_file(&old);
                }
                self.index.upsert(key, Some(value), None, size, now)
            }
        }
    }

    /// Value and metadata; refreshes the access time
    pub fn get(&mut self, key: &str) -> KvResult<Option<KvItem>> {
        check_key(key)?;
        let Some(record) = self.index.get(key, true)? else {
            return Ok(None);
        };
        let Some(item) = self.materialize(record)? else {
            return Ok(None);
        };
        self.touch(&[key]);
        Ok(Some(item))
    }

    /// Metadata only; does not refresh the access time
    pub fn get_metadata(&mut self, key: &str) -> KvResult<Option<ItemMeta>> {
        check_key(key)?;
        Ok(self.index.get(key, false)?.map(|record| record.meta))
    }

    /// Value only; refreshes the access time
    pub fn get_value(&mut self, key: &str) -> KvResult<Option<Vec<u8>>> {
        Ok(self.get(key)?.map(|item| item.value))
    }

    /// Items found among `keys`; refreshes the access time of all of them
    pub fn get_many<S: AsRef<str>>(&mut self, keys: &[S]) -> KvResult<Vec<KvItem>> {
        let keys = batch_keys(keys)?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let records = self.index.get_many(&keys, true)?;
        let mut items = Vec::with_capacity(records.len());
        for record in records {
            if let Some(item) = self.materialize(record)? {
                items.push(item);
            }
        }
        if !items.is_empty() {
            self.touch(&keys);
        }
        Ok(items)
    }

    /// Metadata found among `keys`
    pub fn get_metadata_many<S: AsRef<str>>(&mut self, keys: &[S]) -> KvResult<Vec<ItemMeta>> {
        let keys = batch_keys(keys)?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let records = self.index.get_many(&keys, false)?;
        Ok(records.into_iter().map(|record| record.meta).collect())
    }

    /// Values found among `keys`, by key
    pub fn get_values<S: AsRef<str>>(&mut self, keys: &[S]) -> KvResult<HashMap<String, Vec<u8>>> {
        Ok(self
            .get_many(keys)?
            .into_iter()
            .map(|item| (item.meta.key, item.value))
            .collect())
    }

    /// Remove a key; returns whether a row was deleted
    pub fn remove(&mut self, key: &str) -> KvResult<bool> {
        check_key(key)?;
        if self.mode.uses_files()
            && let Some(name) = self.index.filename(key)?
        {
            self.delete_file(&name);
        }
        Ok(self.index.delete(key)? > 0)
    }

    /// Remove keys; returns the number of rows deleted
    pub fn remove_many<S: AsRef<str>>(&mut self, keys: &[S]) -> KvResult<usize> {
        let keys = batch_keys(keys)?;
        if keys.is_empty() {
            return Ok(0);
        }
        if self.mode.uses_files() {
            for name in self.index.filenames(&keys)? {
                self.delete_file(&name);
            }
        }
        self.index.delete_many(&keys)
    }

    /// Remove items larger than `size` bytes
    ///
    /// `i64::MAX` is a no-op; a non-positive size removes everything.
    pub fn remove_larger_than(&mut self, size: i64) -> KvResult<()> {
        if size == i64::MAX {
            return Ok(());
        }
        if size <= 0 {
            return self.remove_all();
        }
        if self.mode.uses_files() {
            for name in self.index.filenames_larger_than(size)? {
                self.delete_file(&name);
            }
        }
        let removed = self.index.delete_larger_than(size)?;
        self.index.checkpoint();
        debug!("Removed {} items larger than {} bytes", removed, size);
        Ok(())
    }

    /// Remove items last accessed before `time` (unix seconds)
    ///
    /// A non-positive time is a no-op; `i64::MAX` removes everything.
    pub fn remove_older_than(&mut self, time: i64) -> KvResult<()> {
        if time <= 0 {
            return Ok(());
        }
        if time == i64::MAX {
            return self.remove_all();
        }
        if self.mode.uses_files() {
            for name in self.index.filenames_accessed_before(time)? {
                self.delete_file(&name);
            }
        }
        let removed = self.index.delete_accessed_before(time)?;
        self.index.checkpoint();
        debug!("Removed {} items last accessed before {}", removed, time);
        Ok(())
    }

    /// Remove least-recently-accessed items until total size fits `max`
    pub fn remove_to_fit_size(&mut self, max: i64) -> KvResult<()> {
        self.remove_to_fit(TrimBudget::Size(max))
    }

    /// Remove least-recently-accessed items until the count fits `max`
    pub fn remove_to_fit_count(&mut self, max: i64) -> KvResult<()> {
        self.remove_to_fit(TrimBudget::Count(max))
    }

    fn remove_to_fit(&mut self, budget: TrimBudget) -> KvResult<()> {
        let total = self.aggregate(budget)?;
        match TrimPlan::for_signed_limit(total, budget.limit()) {
            TrimPlan::ClearAll => return self.remove_all(),
            TrimPlan::WithinLimit => return Ok(()),
            TrimPlan::Evict => {}
        }
        while !self.evict_lru_batch(budget)? {}
        self.index.checkpoint();
        Ok(())
    }

    fn aggregate(&mut self, budget: TrimBudget) -> KvResult<i64> {
        match budget {
            TrimBudget::Size(_) => self.index.total_size(),
            TrimBudget::Count(_) => self.index.total_count(),
        }
    }

    /// One step of a size or count trim
    ///
    /// Deletes up to `TRIM_BATCH` least-recently-accessed items while the
    /// aggregate is over budget. Returns `true` once the store fits or there
    /// is nothing left to delete.
    pub fn evict_lru_batch(&mut self, budget: TrimBudget) -> KvResult<bool> {
        let max = budget.limit();
        let mut total = self.aggregate(budget)?;
        if total <= max {
            return Ok(true);
        }
        let victims = self.index.lru_batch(TRIM_BATCH)?;
        if victims.is_empty() {
            return Ok(true);
        }
        for victim in victims {
            if total <= max {
                break;
            }
            self.delete_item(&victim)?;
            total -= budget.weight(&victim);
        }
        Ok(total <= max)
    }

    /// Delete up to `limit` least-recently-accessed items; returns how many
    pub fn remove_lru_batch(&mut self, limit: usize) -> KvResult<usize> {
        let victims = self.index.lru_batch(limit)?;
        for victim in &victims {
            self.delete_item(victim)?;
        }
        Ok(victims.len())
    }

    /// Remove everything
    ///
    /// The index is closed and deleted, the content directory is moved into
    /// the trash in one rename, and the index is recreated. The trash is
    /// purged in the background.
    pub fn remove_all(&mut self) -> KvResult<()> {
        self.index.close()?;
        let reset = reset_files(&self.layout);
        if let Err(e) = &reset {
            warn!("Failed to reset store at {:?}: {}", self.path(), e);
        }
        self.purge_trash();
        self.index.open()?;
        reset?;
        info!("Removed all items from {:?}", self.path());
        Ok(())
    }

    /// Remove everything in batches, reporting `(deleted, total)` after each
    pub fn remove_all_with_progress(
        &mut self,
        mut progress: impl FnMut(usize, usize),
    ) -> KvResult<()> {
        let total = usize::try_from(self.index.total_count()?).unwrap_or(0);
        let mut deleted = 0;
        while deleted < total {
            let removed = self.remove_lru_batch(REMOVE_ALL_BATCH.min(total - deleted))?;
            if removed == 0 {
                break;
            }
            deleted += removed;
            progress(deleted, total);
        }
        self.index.checkpoint();
        Ok(())
    }

    pub fn item_count(&mut self) -> KvResult<i64> {
        self.index.total_count()
    }

    pub fn total_size(&mut self) -> KvResult<i64> {
        self.index.total_size()
    }

    /// Merge the index write-ahead log into the main file
    pub fn checkpoint(&mut self) {
        self.index.checkpoint();
    }

    /// Turn a row into an item, healing rows whose file is gone
    fn materialize(&mut self, record: Record) -> KvResult<Option<KvItem>> {
        let Record { meta, inline } = record;
        let value = match meta.filename.as_deref() {
            Some(name) if self.mode.uses_files() => match self.layout.read_file(name) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    debug!("Dropping row {}: file {} unreadable ({})", meta.key, name, e);
                    self.index.delete(&meta.key)?;
                    None
                }
            },
            _ => inline,
        };
        Ok(value.map(|value| KvItem { meta, value }))
    }

    fn delete_item(&mut self, meta: &ItemMeta) -> KvResult<()> {
        if self.mode.uses_files()
            && let Some(name) = &meta.filename
        {
            self.delete_file(name);
        }
        self.index.delete(&meta.key)?;
        Ok(())
    }

    fn touch(&mut self, keys: &[&str]) {
        let now = self.clock.unix_now();
        // Access time is best effort; the index logs failures
        let _ = match keys {
            [key] => self.index.touch(key, now),
            _ => self.index.touch_many(keys, now),
        };
    }

    fn delete_file(&self, name: &str) {
        if let Err(e) = self.layout.delete_file(name)
            && self.index.error_logs_enabled()
        {
            warn!("Failed to delete {:?}: {}", self.layout.file_path(name), e);
        }
    }

    fn purge_trash(&self) {
        let trash = self.layout.trash_dir().to_path_buf();
        self.trash_queue.dispatch(move || match layout::empty_dir(&trash) {
            Ok(0) => {}
            Ok(purged) => debug!("Purged {} entries from {:?}", purged, trash),
            Err(e) => warn!("Failed to purge {:?}: {}", trash, e),
        });
    }
}

/// Delete the index files and stage the content directory for deletion
fn reset_files(layout: &StoreLayout) -> std::io::Result<()> {
    layout.remove_index_files()?;
    layout.move_data_to_trash()?;
    Ok(())
}

fn check_key(key: &str) -> KvResult<()> {
    if key.is_empty() {
        return Err(KvError::InvalidArgument("key must not be empty"));
    }
    Ok(())
}

fn batch_keys<S: AsRef<str>>(keys: &[S]) -> KvResult<Vec<&str>> {
    keys.iter()
        .map(|key| {
            let key = key.as_ref();
            check_key(key).map(|()| key)
        })
        .collect()
}
