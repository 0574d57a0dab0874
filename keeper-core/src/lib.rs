/*!
# Keeper Core Engine

Unattended backup of an application's state directory to object storage.

A backup target is a local directory holding:

- `blobs/` and `blobs_crashes/`: write-once files, mirrored one object per file
- `data/`: mutable state, archived into deduplicated zip snapshots

Every cycle mirrors the blob directories (uploading only what is missing),
zips the data directory, uploads the archive unless an archive with the same
SHA-1 is already stored, and then deletes the oldest snapshots beyond the
retention count.

## Architecture

The pipeline only talks to storage through the [`ObjectStore`] port:
- [`LocalObjectStore`] keeps objects under a directory
- `S3ObjectStore` (feature `s3`) talks to Amazon S3 or a compatible service

## Usage

```rust,no_run
use keeper_core::{BackupConfig, BackupScheduler, LocalObjectStore, ShutdownSignal};

let config = BackupConfig::from_file("/etc/keeper.toml")?;
let store = LocalObjectStore::new(&config.bucket);
let scheduler = BackupScheduler::start(config, store)?;

let report = scheduler.run_cycle();
println!("aborted: {}", report.is_aborted());

// Or loop until another thread calls `shutdown.trigger()`
let shutdown = ShutdownSignal::new();
scheduler.run(&shutdown);
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/

pub mod archive;
pub mod config;
pub mod context;
pub mod error;
pub mod keys;
pub mod mirror;
pub mod observability;
pub mod retention;
pub mod scheduler;
pub mod snapshot;
pub mod storage;
pub mod upload;

pub use config::{BackupConfig, StoreBackend, ValidatedConfig};
pub use context::{BackupContext, Clock, FixedClock, SystemClock};
pub use error::{KeeperError, Result, ValidationError};
pub use keys::SnapshotName;
pub use mirror::{BlobMirror, SyncStats};
pub use retention::{PruneReport, RetentionPruner};
pub use scheduler::{BackupScheduler, CycleReport, ShutdownSignal};
pub use snapshot::{SnapshotDeduplicator, SnapshotOutcome};
pub use storage::{ListingMode, LocalObjectStore, ObjectStore, Visibility};
#[cfg(feature = "s3")]
pub use storage::S3ObjectStore;
pub use upload::put_with_retry;
