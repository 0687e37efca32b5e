//! Configuration types for Stowage
//!
//! Every field has a default, so a TOML file only needs to name what it
//! changes:
//!
//! ```toml
//! [memory]
//! cost_limit = 67108864
//! release_policy = "deferred"
//!
//! [disk]
//! path = "/var/cache/myapp/objects"
//! storage_mode = "mixed"
//! inline_threshold = 16384
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default memory auto-trim interval in seconds
pub const DEFAULT_MEMORY_TRIM_INTERVAL_SECS: f64 = 5.0;

/// Default disk auto-trim interval in seconds
pub const DEFAULT_DISK_TRIM_INTERVAL_SECS: u64 = 60;

/// Values larger than this are written to their own file in mixed mode
pub const DEFAULT_INLINE_THRESHOLD: u64 = 20 * 1024;

/// Where evicted memory values are dropped
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleasePolicy {
    /// Drop on the calling thread, after the store lock is released
    Inline,
    /// Drop on the process-wide release queue
    #[default]
    Background,
    /// Park until the owning thread calls `drain_deferred`
    Deferred,
}

/// How the disk store lays out values
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Every value is stored inline in the index
    Sqlite,
    /// Every value is stored in its own file
    File,
    /// Inline up to the threshold, file above it
    #[default]
    Mixed,
}

impl StorageMode {
    /// Whether values may live in the content directory
    #[must_use]
    pub const fn uses_files(self) -> bool {
        !matches!(self, Self::Sqlite)
    }
}

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StowageConfig {
    /// Memory tier
    pub memory: MemoryCacheConfig,
    /// Disk tier
    pub disk: DiskCacheConfig,
}

impl StowageConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        self.memory.validate()?;
        self.disk.validate()
    }
}

/// Memory tier configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Optional name, used in log messages
    pub name: Option<String>,
    /// Total cost limit (unlimited when absent)
    pub cost_limit: Option<u64>,
    /// Entry count limit (unlimited when absent)
    pub count_limit: Option<u64>,
    /// Maximum entry age in seconds (unlimited when absent)
    pub age_limit_secs: Option<f64>,
    /// Delay between background trims
    pub auto_trim_interval_secs: f64,
    /// Where evicted values are dropped
    pub release_policy: ReleasePolicy,
    /// Clear the store on a memory warning
    pub remove_all_on_memory_warning: bool,
    /// Clear the store when the host enters the background
    pub remove_all_on_background: bool,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            name: None,
            cost_limit: None,
            count_limit: None,
            age_limit_secs: None,
            auto_trim_interval_secs: DEFAULT_MEMORY_TRIM_INTERVAL_SECS,
            release_policy: ReleasePolicy::default(),
            remove_all_on_memory_warning: true,
            remove_all_on_background: true,
        }
    }
}

impl MemoryCacheConfig {
    #[must_use]
    pub fn cost_limit(&self) -> u64 {
        self.cost_limit.unwrap_or(u64::MAX)
    }

    #[must_use]
    pub fn count_limit(&self) -> u64 {
        self.count_limit.unwrap_or(u64::MAX)
    }

    /// Age limit as a duration; non-positive ages clamp to zero
    #[must_use]
    pub fn age_limit(&self) -> Duration {
        self.age_limit_secs.map_or(Duration::MAX, secs_to_duration)
    }

    #[must_use]
    pub fn auto_trim_interval(&self) -> Duration {
        secs_to_duration(self.auto_trim_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.auto_trim_interval_secs.is_finite() && self.auto_trim_interval_secs > 0.0) {
            return Err(Error::config(format!(
                "memory auto_trim_interval_secs must be positive, got {}",
                self.auto_trim_interval_secs
            )));
        }
        Ok(())
    }
}

/// Disk tier configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Store directory (index, data/ and trash/ live under it)
    pub path: PathBuf,
    /// Optional name, used in log messages
    pub name: Option<String>,
    /// Value layout
    pub storage_mode: StorageMode,
    /// Mixed mode writes values larger than this to files
    pub inline_threshold: u64,
    /// Total size limit in bytes (unlimited when absent)
    pub cost_limit: Option<u64>,
    /// Entry count limit (unlimited when absent)
    pub count_limit: Option<u64>,
    /// Maximum time since last access, in seconds (unlimited when absent)
    pub age_limit_secs: Option<u64>,
    /// Trim until the volume has at least this many free bytes (0 disables)
    pub free_disk_space_limit: u64,
    /// Delay between background trims
    pub auto_trim_interval_secs: u64,
    /// Log index-level errors
    pub error_logs_enabled: bool,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("stowage"),
            name: None,
            storage_mode: StorageMode::default(),
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            cost_limit: None,
            count_limit: None,
            age_limit_secs: None,
            free_disk_space_limit: 0,
            auto_trim_interval_secs: DEFAULT_DISK_TRIM_INTERVAL_SECS,
            error_logs_enabled: true,
        }
    }
}

impl DiskCacheConfig {
    /// Create config rooted at a store directory
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn cost_limit(&self) -> u64 {
        self.cost_limit.unwrap_or(u64::MAX)
    }

    #[must_use]
    pub fn count_limit(&self) -> u64 {
        self.count_limit.unwrap_or(u64::MAX)
    }

    #[must_use]
    pub fn age_limit(&self) -> Duration {
        self.age_limit_secs.map_or(Duration::MAX, Duration::from_secs)
    }

    #[must_use]
    pub const fn auto_trim_interval(&self) -> Duration {
        Duration::from_secs(self.auto_trim_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::config("disk path must not be empty"));
        }
        if self.auto_trim_interval_secs == 0 {
            return Err(Error::config("disk auto_trim_interval_secs must be positive"));
        }
        Ok(())
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StowageConfig::default();
        assert_eq!(config.memory.cost_limit(), u64::MAX);
        assert_eq!(config.memory.count_limit(), u64::MAX);
        assert_eq!(config.memory.age_limit(), Duration::MAX);
        assert_eq!(config.memory.auto_trim_interval(), Duration::from_secs(5));
        assert_eq!(config.memory.release_policy, ReleasePolicy::Background);
        assert!(config.memory.remove_all_on_memory_warning);
        assert!(config.memory.remove_all_on_background);

        assert_eq!(config.disk.storage_mode, StorageMode::Mixed);
        assert_eq!(config.disk.inline_threshold, 20 * 1024);
        assert_eq!(config.disk.free_disk_space_limit, 0);
        assert_eq!(config.disk.auto_trim_interval(), Duration::from_secs(60));
        assert!(config.disk.error_logs_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = StowageConfig::from_toml_str(
            r#"
            [memory]
            cost_limit = 1024
            age_limit_secs = 0.5
            release_policy = "deferred"

            [disk]
            path = "/tmp/objects"
            storage_mode = "file"
            count_limit = 10
            error_logs_enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.memory.cost_limit(), 1024);
        assert_eq!(config.memory.age_limit(), Duration::from_millis(500));
        assert_eq!(config.memory.release_policy, ReleasePolicy::Deferred);
        assert_eq!(config.memory.count_limit(), u64::MAX);

        assert_eq!(config.disk.path, PathBuf::from("/tmp/objects"));
        assert_eq!(config.disk.storage_mode, StorageMode::File);
        assert_eq!(config.disk.count_limit(), 10);
        assert!(!config.disk.error_logs_enabled);
        assert_eq!(config.disk.inline_threshold, DEFAULT_INLINE_THRESHOLD);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = StowageConfig::from_toml_str("[memory]\nauto_trim_interval_secs = 0.0\n")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = StowageConfig::from_toml_str("[disk]\nstorage_mode = \"tape\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stowage.toml");
        std::fs::write(&path, "[disk]\nauto_trim_interval_secs = 30\n").unwrap();

        let config = StowageConfig::load(&path).unwrap();
        assert_eq!(config.disk.auto_trim_interval(), Duration::from_secs(30));

        assert!(StowageConfig::load(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_negative_age_clamps_to_zero() {
        let config = MemoryCacheConfig {
            age_limit_secs: Some(-1.0),
            ..Default::default()
        };
        assert_eq!(config.age_limit(), Duration::ZERO);
    }
}
