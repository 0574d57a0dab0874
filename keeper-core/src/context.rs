//! Shared state of a backup target
//!
//! [`BackupContext`] bundles everything a cycle needs: the validated
//! configuration, the object store, the retry policy for blob uploads, the
//! listing mode for recency checks, and the clock that stamps snapshot names.

use chrono::NaiveDateTime;
use keeper_retry::RetryPolicy;
use std::path::PathBuf;

use crate::config::{TimeZoneChoice, ValidatedConfig};
use crate::storage::ListingMode;

/// Source of the wall-clock time used in snapshot names
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Reads the system clock in the configured time zone
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    zone: TimeZoneChoice,
}

impl SystemClock {
    pub fn new(zone: TimeZoneChoice) -> Self {
        Self { zone }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        self.zone.now()
    }
}

/// Always returns the same instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

/// Everything one backup target needs, owned in one place
pub struct BackupContext<S> {
    config: ValidatedConfig,
    store: S,
    retry: RetryPolicy,
    listing: ListingMode,
    clock: Box<dyn Clock>,
}

impl<S> BackupContext<S> {
    /// Context with the retry policy, listing mode and time zone taken from the configuration
    pub fn new(config: ValidatedConfig, store: S) -> Self {
        let retry = config.config().retry.clone();
        let listing = config.schedule().listing_mode();
        let clock = Box::new(SystemClock::new(config.schedule().time_zone));
        Self {
            config,
            store,
            retry,
            listing,
            clock,
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_listing_mode(mut self, listing: ListingMode) -> Self {
        self.listing = listing;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn listing_mode(&self) -> ListingMode {
        self.listing
    }

    /// Current time as used for snapshot names
    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub fn temp_archive_path(&self) -> PathBuf {
        self.config.config().temp_archive_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupConfig;
    use chrono::NaiveDate;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_context_takes_settings_from_config() {
        let dir = TempDir::new().unwrap();
        let mut config = BackupConfig::new("bucket", "app", dir.path());
        config.schedule.listing_cap = 50;
        config.retry = RetryPolicy::fixed(5, Duration::from_millis(7));
        let validated = ValidatedConfig::validate_local(config).unwrap();

        let ctx = BackupContext::new(validated, ());
        assert_eq!(ctx.listing_mode(), ListingMode::Bounded { cap: 50 });
        assert_eq!(ctx.retry_policy().max_attempts, 5);
        assert_eq!(ctx.config().remote_root(), "app/");
    }

    #[test]
    fn test_fixed_clock_override() {
        let dir = TempDir::new().unwrap();
        let validated =
            ValidatedConfig::validate_local(BackupConfig::new("bucket", "app", dir.path())).unwrap();
        let at = NaiveDate::from_ymd_opt(2012, 10, 11)
            .unwrap()
            .and_hms_opt(11, 21, 0)
            .unwrap();

        let ctx = BackupContext::new(validated, ())
            .with_clock(FixedClock(at))
            .with_listing_mode(ListingMode::Exhaustive);
        assert_eq!(ctx.now(), at);
        assert_eq!(ctx.listing_mode(), ListingMode::Exhaustive);
    }
}
