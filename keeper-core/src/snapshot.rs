/*!
Deduplicated snapshots of the data directory.

Each cycle packs the data directory into a zip and hashes it. If a key
containing that digest is already among the recent snapshots nothing is
uploaded; otherwise the archive is stored under a timestamped,
content-addressed name.

The dedup check only sees the listing window (one bounded page by default),
so a digest older than the window can be uploaded a second time. Use
[`ListingMode::Exhaustive`](crate::storage::ListingMode) to search every key.
*/

use serde::Serialize;
use tracing::{info, warn};

use crate::archive::TempArchive;
use crate::context::BackupContext;
use crate::keys::{SnapshotName, DELIMITER};
use crate::observability;
use crate::storage::{list_window, ObjectStore, Visibility};
use crate::Result;

/// What a snapshot attempt did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SnapshotOutcome {
    /// A new archive was stored under `key`
    Uploaded { key: String, digest: String },
    /// An archive with this digest was already stored
    Unchanged { digest: String },
}

impl SnapshotOutcome {
    pub fn digest(&self) -> &str {
        match self {
            SnapshotOutcome::Uploaded { digest, .. } | SnapshotOutcome::Unchanged { digest } => digest,
        }
    }

    pub fn is_uploaded(&self) -> bool {
        matches!(self, SnapshotOutcome::Uploaded { .. })
    }
}

/// Creates snapshots, skipping the upload when the content is unchanged
pub struct SnapshotDeduplicator<'a, S> {
    ctx: &'a BackupContext<S>,
}

impl<'a, S: ObjectStore> SnapshotDeduplicator<'a, S> {
    pub fn new(ctx: &'a BackupContext<S>) -> Self {
        Self { ctx }
    }

    /// Archive the data directory and upload it unless its digest is already stored
    ///
    /// The temporary archive is removed on every path out of this function.
    /// The upload is attempted once.
    pub fn maybe_snapshot(&self) -> Result<SnapshotOutcome> {
        let config = self.ctx.config();
        let archive = TempArchive::create(&self.ctx.temp_archive_path(), &config.data_dir())?;
        let digest = archive.sha1_hex()?;

        if self.already_uploaded(&digest) {
            info!(digest = %digest, "Snapshot unchanged, skipping upload");
            observability::record_snapshot(false);
            return Ok(SnapshotOutcome::Unchanged { digest });
        }

        let name = SnapshotName::new(config.remote_root(), self.ctx.now(), &digest);
        self.ctx
            .store()
            .put(archive.path(), &name.key, Visibility::PublicRead)?;

        info!(key = %name.key, digest = %digest, "Uploaded snapshot");
        observability::record_snapshot(true);
        Ok(SnapshotOutcome::Uploaded {
            key: name.key,
            digest,
        })
    }

    /// True if a key in the listing window contains `digest`
    ///
    /// A failed listing counts as "not uploaded", so the snapshot is stored
    /// rather than silently skipped.
    pub fn already_uploaded(&self, digest: &str) -> bool {
        let prefix = self.ctx.config().remote_root();
        match list_window(self.ctx.store(), prefix, DELIMITER, self.ctx.listing_mode()) {
            Ok(keys) => keys.iter().any(|key| key.contains(digest)),
            Err(e) => {
                warn!(prefix = %prefix, error = %e, "Could not list existing snapshots, uploading anyway");
                false
            }
        }
    }
}
