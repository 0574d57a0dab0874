//! Retention pruning of old snapshots
//!
//! Only keys with the strict snapshot naming shape are ever considered, so
//! blob prefixes and foreign objects under the root survive pruning. Names
//! sort chronologically as plain strings; the oldest are deleted first.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::BackupContext;
use crate::keys::{SnapshotName, DELIMITER};
use crate::observability;
use crate::storage::{list_window, ObjectStore};
use crate::Result;

/// What a retention pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Snapshot keys found in the listing window
    pub considered: usize,
    pub deleted: usize,
    pub failed: usize,
    /// The listing failed and nothing was attempted
    pub skipped_listing: bool,
    /// Keys removed (or that would be removed in a dry run)
    pub deleted_keys: Vec<String>,
}

/// Snapshot names among `keys`, oldest first
pub fn sorted_snapshots<I, K>(keys: I) -> Vec<SnapshotName>
where
    I: IntoIterator<Item = K>,
    K: AsRef<str>,
{
    let mut snapshots: Vec<SnapshotName> = keys
        .into_iter()
        .filter_map(|key| SnapshotName::parse(key.as_ref()))
        .collect();
    snapshots.sort_by(|a, b| a.key.cmp(&b.key));
    snapshots
}

/// The oldest snapshots beyond the newest `max_to_keep`
pub fn select_for_deletion<I, K>(keys: I, max_to_keep: usize) -> Vec<SnapshotName>
where
    I: IntoIterator<Item = K>,
    K: AsRef<str>,
{
    let mut snapshots = sorted_snapshots(keys);
    let excess = snapshots.len().saturating_sub(max_to_keep);
    snapshots.truncate(excess);
    snapshots
}

/// Deletes snapshots beyond the retention count
pub struct RetentionPruner<'a, S> {
    ctx: &'a BackupContext<S>,
}

impl<'a, S: ObjectStore> RetentionPruner<'a, S> {
    pub fn new(ctx: &'a BackupContext<S>) -> Self {
        Self { ctx }
    }

    /// Snapshots in the listing window, oldest first
    pub fn snapshots(&self) -> Result<Vec<SnapshotName>> {
        let prefix = self.ctx.config().remote_root();
        let keys = list_window(self.ctx.store(), prefix, DELIMITER, self.ctx.listing_mode())?;
        Ok(sorted_snapshots(keys))
    }

    /// Keep the newest `max_to_keep` snapshots and delete the rest
    ///
    /// Never fails: a listing failure skips the pass, and a failed delete is
    /// logged and counted while the remaining deletes go ahead.
    pub fn prune(&self, max_to_keep: usize) -> PruneReport {
        self.run(max_to_keep, false)
    }

    /// Report what [`prune`](Self::prune) would delete without deleting anything
    pub fn plan(&self, max_to_keep: usize) -> PruneReport {
        self.run(max_to_keep, true)
    }

    fn run(&self, max_to_keep: usize, dry_run: bool) -> PruneReport {
        let mut report = PruneReport::default();
        let snapshots = match self.snapshots() {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!(error = %e, "Could not list snapshots, skipping retention");
                report.skipped_listing = true;
                return report;
            }
        };
        report.considered = snapshots.len();

        let excess = snapshots.len().saturating_sub(max_to_keep);
        if excess == 0 {
            debug!(count = snapshots.len(), max_to_keep, "Nothing to prune");
            return report;
        }

        for snapshot in snapshots.into_iter().take(excess) {
            if dry_run {
                report.deleted_keys.push(snapshot.key);
                continue;
            }
            match self.ctx.store().delete(&snapshot.key) {
                Ok(()) => {
                    debug!(key = %snapshot.key, "Deleted old snapshot");
                    report.deleted += 1;
                    report.deleted_keys.push(snapshot.key);
                }
                Err(e) => {
                    warn!(key = %snapshot.key, error = %e, "Failed to delete old snapshot");
                    report.failed += 1;
                }
            }
        }

        if !dry_run {
            info!(
                considered = report.considered,
                deleted = report.deleted,
                failed = report.failed,
                max_to_keep,
                "Pruned old snapshots"
            );
            observability::record_prune(report.deleted, report.failed);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupConfig, ValidatedConfig};
    use crate::storage::{ListPage, MemoryObjectStore, MockObjectStore};
    use crate::KeeperError;
    use tempfile::TempDir;

    const DIGEST: &str = "c7fedc06cf4b08fef66090eaa0ad7a68dc13a325";

    /// 70 snapshot keys, two per day at 09:00 and 21:00, starting 2023-12-20
    fn seventy_keys() -> Vec<String> {
        let start = chrono::NaiveDate::from_ymd_opt(2023, 12, 20).unwrap();
        (0..70)
            .map(|i| {
                let day = start + chrono::Days::new(i / 2);
                let hour = if i % 2 == 0 { 9 } else { 21 };
                let at = day.and_hms_opt(hour, 0, 0).unwrap();
                SnapshotName::new("app/", at, DIGEST).key
            })
            .collect()
    }

    fn context<S>(store: S) -> (TempDir, BackupContext<S>) {
        let tmp = TempDir::new().unwrap();
        let validated =
            ValidatedConfig::validate_local(BackupConfig::new("bucket", "app", tmp.path())).unwrap();
        (tmp, BackupContext::new(validated, store))
    }

    #[test]
    fn test_select_for_deletion_takes_oldest() {
        let keys = seventy_keys();
        let mut shuffled = keys.clone();
        shuffled.reverse();

        let selected: Vec<String> = select_for_deletion(&shuffled, 64)
            .into_iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(selected, keys[..6].to_vec());
        // crosses the year boundary correctly
        assert!(selected[0].starts_with("app/231220_0900_"));
    }

    #[test]
    fn test_select_ignores_foreign_keys() {
        let mut keys = seventy_keys()[..3].to_vec();
        keys.push("app/blobs/".to_string());
        keys.push("app/000000_0000_notes.txt".to_string());
        keys.push("app/README.zip".to_string());

        let selected = select_for_deletion(&keys, 1);
        assert_eq!(selected.len(), 2);
        assert!(selected.iter().all(|s| s.digest == DIGEST));
        assert!(select_for_deletion(&keys, 64).is_empty());
    }

    #[test]
    fn test_prune_seventy_keep_sixty_four() {
        let keys = seventy_keys();
        let mut all = keys.clone();
        all.push("app/blobs/a.txt".to_string());
        let (_tmp, ctx) = context(MemoryObjectStore::with_keys(all));

        let report = RetentionPruner::new(&ctx).prune(64);
        assert_eq!(report.considered, 70);
        assert_eq!(report.deleted, 6);
        assert_eq!(report.failed, 0);
        assert!(!report.skipped_listing);
        assert_eq!(ctx.store().deleted_keys(), keys[..6].to_vec());

        let remaining = ctx.store().keys();
        assert_eq!(remaining.len(), 65);
        assert!(remaining.contains(&"app/blobs/a.txt".to_string()));
    }

    #[test]
    fn test_plan_deletes_nothing() {
        let keys = seventy_keys();
        let (_tmp, ctx) = context(MemoryObjectStore::with_keys(keys.clone()));

        let report = RetentionPruner::new(&ctx).plan(64);
        assert_eq!(report.deleted_keys, keys[..6].to_vec());
        assert_eq!(report.deleted, 0);
        assert!(ctx.store().deleted_keys().is_empty());
    }

    #[test]
    fn test_delete_failures_do_not_stop_pruning() {
        let keys = seventy_keys()[..5].to_vec();
        let listed = keys.clone();
        let mut store = MockObjectStore::new();
        store.expect_list().times(1).returning(move |_| {
            Ok(ListPage {
                keys: listed.clone(),
                ..ListPage::default()
            })
        });
        let failing = keys[0].clone();
        store
            .expect_delete()
            .times(3)
            .returning(move |key| {
                if key == failing {
                    Err(KeeperError::storage("Access denied"))
                } else {
                    Ok(())
                }
            });

        let (_tmp, ctx) = context(store);
        let report = RetentionPruner::new(&ctx).prune(2);
        assert_eq!(report.considered, 5);
        assert_eq!(report.deleted, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.deleted_keys, keys[1..3].to_vec());
    }

    #[test]
    fn test_listing_failure_skips_prune() {
        let mut store = MockObjectStore::new();
        store
            .expect_list()
            .returning(|_| Err(KeeperError::storage("unreachable")));
        store.expect_delete().never();

        let (_tmp, ctx) = context(store);
        let report = RetentionPruner::new(&ctx).prune(0);
        assert!(report.skipped_listing);
        assert_eq!(report.deleted, 0);
    }

    #[test]
    fn test_snapshots_sorted_oldest_first() {
        let keys = seventy_keys();
        let mut reversed = keys.clone();
        reversed.reverse();
        let (_tmp, ctx) = context(MemoryObjectStore::with_keys(reversed));

        let snapshots = RetentionPruner::new(&ctx).snapshots().unwrap();
        let listed: Vec<String> = snapshots.into_iter().map(|s| s.key).collect();
        assert_eq!(listed, keys);
    }
}
