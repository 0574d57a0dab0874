//! Configuration for a backup target
//!
//! A [`BackupConfig`] is what the operator writes (usually a TOML file). It is
//! turned into a [`ValidatedConfig`] exactly once at startup; only the
//! validated form is handed to the mirror, snapshot and retention components.

use chrono::{Local, NaiveDateTime, Utc};
use keeper_retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ValidationError;
use crate::keys::{join_key, normalize_prefix, DELIMITER};
use crate::storage::{list_window, ListingMode, ObjectStore};
use crate::{KeeperError, Result};

/// Local subdirectories mirrored as blobs, in the order they are synced
pub const BLOB_DIRS: [&str; 2] = ["blobs", "blobs_crashes"];

/// Local subdirectory archived into snapshots
pub const DATA_DIR: &str = "data";

/// Since we back up twice a day, this keeps roughly a month of snapshots
pub const DEFAULT_MAX_SNAPSHOTS: usize = 64;

/// Twelve hours between backup cycles
pub const DEFAULT_INTERVAL_SECS: u64 = 12 * 60 * 60;

/// Entries fetched for the dedup check and for pruning
pub const DEFAULT_LISTING_CAP: usize = 1024;

/// Entries fetched by the startup credentials check
pub const SMOKE_TEST_KEYS: usize = 10;

/// File name of the temporary snapshot archive
pub const TEMP_ARCHIVE_NAME: &str = "keeper-tmp-backup.zip";

const DEFAULT_REGION: &str = "us-east-1";

/// Enumeration of supported object-store backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Amazon S3 or an S3-compatible service
    S3,
    /// A directory on a locally mounted filesystem; `bucket` is its path
    Local,
}

/// Static access credentials for the object store
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Time zone used to stamp snapshot names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeZoneChoice {
    Local,
    Utc,
}

impl TimeZoneChoice {
    /// Current wall-clock time in this zone
    pub fn now(self) -> NaiveDateTime {
        match self {
            TimeZoneChoice::Local => Local::now().naive_local(),
            TimeZoneChoice::Utc => Utc::now().naive_utc(),
        }
    }
}

/// How recent-snapshot listings are fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStrategy {
    /// A single page capped at `listing_cap` entries
    Bounded,
    /// Paginate to completion
    Exhaustive,
}

/// Scheduling and retention settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Pause after each cycle, in seconds
    pub interval_secs: u64,
    /// Snapshots kept by retention pruning
    pub max_snapshots: usize,
    pub listing: ListingStrategy,
    pub listing_cap: usize,
    pub time_zone: TimeZoneChoice,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            max_snapshots: DEFAULT_MAX_SNAPSHOTS,
            listing: ListingStrategy::Bounded,
            listing_cap: DEFAULT_LISTING_CAP,
            time_zone: TimeZoneChoice::Local,
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn listing_mode(&self) -> ListingMode {
        match self.listing {
            ListingStrategy::Bounded => ListingMode::Bounded {
                cap: self.listing_cap,
            },
            ListingStrategy::Exhaustive => ListingMode::Exhaustive,
        }
    }
}

/// Backup target as written by the operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// Bucket name (S3) or store directory (local backend)
    pub bucket: String,
    /// Remote root prefix, e.g. `apptranslator/`
    pub remote_root: String,
    /// Directory holding `blobs`, `blobs_crashes` and `data`
    pub local_root: PathBuf,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible stores
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Static credentials; the provider chain of the environment is used when absent
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Where the snapshot archive is staged; defaults to the system temp dir
    #[serde(default)]
    pub temp_archive: Option<PathBuf>,
}

fn default_backend() -> StoreBackend {
    StoreBackend::S3
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

impl BackupConfig {
    /// Minimal configuration with defaults for everything optional
    pub fn new<B, R, P>(bucket: B, remote_root: R, local_root: P) -> Self
    where
        B: Into<String>,
        R: Into<String>,
        P: Into<PathBuf>,
    {
        Self {
            backend: default_backend(),
            bucket: bucket.into(),
            remote_root: remote_root.into(),
            local_root: local_root.into(),
            region: default_region(),
            endpoint: None,
            credentials: None,
            schedule: ScheduleConfig::default(),
            retry: RetryPolicy::default(),
            temp_archive: None,
        }
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| KeeperError::config(format!("Invalid configuration: {e}")))
    }

    /// Load a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            KeeperError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Path of the temporary snapshot archive
    pub fn temp_archive_path(&self) -> PathBuf {
        self.temp_archive
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(TEMP_ARCHIVE_NAME))
    }
}

/// A configuration that passed startup validation
///
/// Immutable: the remote root is normalized to end with the delimiter and the
/// local root is known to exist.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    inner: BackupConfig,
}

impl ValidatedConfig {
    /// Validate a configuration against the local filesystem and the store
    ///
    /// Checks that the local root exists, normalizes the remote root, and lists
    /// a few keys as a credentials and connectivity smoke test. No retries.
    pub fn validate<S>(config: BackupConfig, store: &S) -> std::result::Result<Self, ValidationError>
    where
        S: ObjectStore + ?Sized,
    {
        let validated = Self::validate_local(config)?;

        let prefix = validated.remote_root().to_string();
        list_window(store, &prefix, DELIMITER, ListingMode::Bounded { cap: SMOKE_TEST_KEYS })
            .map_err(|source| ValidationError::SmokeTestFailed {
                prefix: prefix.clone(),
                source,
            })?;

        info!(
            bucket = %validated.inner.bucket,
            remote_root = %prefix,
            local_root = %validated.inner.local_root.display(),
            "Backup configuration validated"
        );
        Ok(validated)
    }

    /// Checks that do not touch the object store
    pub fn validate_local(mut config: BackupConfig) -> std::result::Result<Self, ValidationError> {
        if !config.local_root.exists() {
            return Err(ValidationError::LocalDirMissing(config.local_root));
        }
        if !config.local_root.is_dir() {
            return Err(ValidationError::LocalDirNotADirectory(config.local_root));
        }
        if config.bucket.trim().is_empty() {
            return Err(ValidationError::EmptyBucket);
        }
        config
            .retry
            .validate()
            .map_err(ValidationError::InvalidSetting)?;
        if config.schedule.listing_cap == 0 {
            return Err(ValidationError::InvalidSetting(
                "schedule.listing_cap must be at least 1".to_string(),
            ));
        }

        if config.schedule.interval_secs == 0 {
            return Err(ValidationError::InvalidSetting(
                "schedule.interval_secs must be at least 1".to_string(),
            ));
        }

        // snapshot keys must be `<root>/<name>.zip` for retention to recognize them
        config.remote_root = normalize_prefix(&config.remote_root);
        if config.remote_root.matches(DELIMITER).count() != 1 {
            return Err(ValidationError::InvalidSetting(format!(
                "remote_root '{}' must be a single non-empty path segment, snapshot keys have exactly two segments",
                config.remote_root
            )));
        }
        debug!(remote_root = %config.remote_root, "Remote root normalized");
        Ok(Self { inner: config })
    }

    pub fn config(&self) -> &BackupConfig {
        &self.inner
    }

    /// Remote root prefix, always ending with the delimiter
    pub fn remote_root(&self) -> &str {
        &self.inner.remote_root
    }

    pub fn local_root(&self) -> &Path {
        &self.inner.local_root
    }

    pub fn schedule(&self) -> &ScheduleConfig {
        &self.inner.schedule
    }

    /// Local directory archived into snapshots
    pub fn data_dir(&self) -> PathBuf {
        self.inner.local_root.join(DATA_DIR)
    }

    /// (local directory, remote prefix) pairs mirrored each cycle
    pub fn blob_mirrors(&self) -> Vec<(PathBuf, String)> {
        BLOB_DIRS
            .iter()
            .map(|dir| {
                (
                    self.inner.local_root.join(dir),
                    join_key(&self.inner.remote_root, dir),
                )
            })
            .collect()
    }
}
