/*!
Blob directory mirroring.

Blob files are immutable once written, so mirroring is presence-only: a file
whose key already exists remotely is skipped without comparing content, and
every other file is uploaded.
*/

use keeper_retry::RetryPolicy;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::archive::relative_key;
use crate::context::BackupContext;
use crate::keys::{comparable_key, join_key, normalize_prefix, DELIMITER};
use crate::observability;
use crate::storage::{list_all, ObjectStore, Visibility};
use crate::upload::put_with_retry;
use crate::Result;

/// Counts from one directory sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Files already present remotely
    pub skipped: usize,
    /// Files uploaded
    pub copied: usize,
}

/// Mirrors a local directory tree into a remote prefix
pub struct BlobMirror<'a, S: ?Sized> {
    store: &'a S,
    retry: &'a RetryPolicy,
}

impl<'a, S: ObjectStore + ?Sized> BlobMirror<'a, S> {
    pub fn new(store: &'a S, retry: &'a RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn from_context(ctx: &'a BackupContext<S>) -> Self
    where
        S: Sized,
    {
        Self::new(ctx.store(), ctx.retry_policy())
    }

    /// Upload every file under `local_dir` missing from `remote_dir`
    ///
    /// The remote side is listed completely before the walk starts. Upload
    /// failures (after retries), walk errors and files that cannot be mapped
    /// to a key abort the sync.
    pub fn sync(&self, local_dir: &Path, remote_dir: &str) -> Result<SyncStats> {
        let remote_base = remote_dir.trim_start_matches(DELIMITER);
        let prefix = normalize_prefix(remote_base);
        let existing: HashSet<String> = list_all(self.store, &prefix, "")?
            .iter()
            .map(|key| comparable_key(key))
            .collect();
        debug!(prefix = %prefix, existing = existing.len(), "Listed remote blobs");

        let mut stats = SyncStats::default();
        let walker = WalkDir::new(local_dir)
            .follow_links(false)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = relative_key(local_dir, entry.path())?;
            let key = join_key(remote_base, &relative);
            if existing.contains(&comparable_key(&key)) {
                stats.skipped += 1;
                continue;
            }

            put_with_retry(self.store, entry.path(), &key, Visibility::PublicRead, self.retry)?;
            debug!(key = %key, "Copied blob");
            stats.copied += 1;
        }

        info!(
            local_dir = %local_dir.display(),
            prefix = %prefix,
            skipped = stats.skipped,
            copied = stats.copied,
            "Blob directory synced"
        );
        observability::record_blob_sync(stats.copied, stats.skipped);
        Ok(stats)
    }
}
