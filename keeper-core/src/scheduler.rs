/*!
Backup scheduling.

A [`BackupScheduler`] owns one validated backup target and runs cycles on it:
mirror every blob directory, snapshot the data directory, and prune old
snapshots when a new one was stored. [`BackupScheduler::run`] repeats this
with a pause after each cycle until a [`ShutdownSignal`] fires.
*/

use serde::Serialize;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{error, info, info_span};

use crate::config::{BackupConfig, ValidatedConfig};
use crate::context::BackupContext;
use crate::error::ValidationError;
use crate::mirror::{BlobMirror, SyncStats};
use crate::observability;
use crate::retention::{PruneReport, RetentionPruner};
use crate::snapshot::{SnapshotDeduplicator, SnapshotOutcome};
use crate::storage::ObjectStore;

/// Cross-thread stop request for the backup loop
///
/// Triggering interrupts the pause between cycles; a cycle in progress runs
/// to completion first.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    triggered: Mutex<bool>,
    changed: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let mut triggered = self.lock();
        *triggered = true;
        self.changed.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.lock()
    }

    /// Block for up to `timeout`; returns true if shutdown was requested
    ///
    /// A timeout too large to represent as a deadline waits until triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut triggered = self.lock();
        while !*triggered {
            triggered = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    match self.changed.wait_timeout(triggered, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                None => match self.changed.wait(triggered) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                },
            };
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.triggered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Result of one blob directory sync within a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorReport {
    pub remote_dir: String,
    pub stats: SyncStats,
}

/// What one cycle did
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub mirrors: Vec<MirrorReport>,
    pub snapshot: Option<SnapshotOutcome>,
    pub prune: Option<PruneReport>,
    /// Error that aborted the cycle
    pub error: Option<String>,
    pub duration: Duration,
}

impl CycleReport {
    pub fn is_aborted(&self) -> bool {
        self.error.is_some()
    }
}

/// Runs backup cycles for one target
pub struct BackupScheduler<S> {
    ctx: BackupContext<S>,
}

impl<S: ObjectStore> BackupScheduler<S> {
    pub fn new(ctx: BackupContext<S>) -> Self {
        Self { ctx }
    }

    /// Validate `config` against `store` and build a scheduler for it
    ///
    /// A validation failure is fatal; callers should report it and exit.
    pub fn start(config: BackupConfig, store: S) -> Result<Self, ValidationError> {
        let validated = ValidatedConfig::validate(config, &store)?;
        Ok(Self::new(BackupContext::new(validated, store)))
    }

    pub fn context(&self) -> &BackupContext<S> {
        &self.ctx
    }

    /// Mirror blobs, snapshot data, and prune when a snapshot was uploaded
    ///
    /// A failure in any mirror or in the snapshot aborts the rest of the
    /// cycle; the error is recorded in the report rather than returned.
    pub fn run_cycle(&self) -> CycleReport {
        let span = info_span!("backup_cycle", remote_root = %self.ctx.config().remote_root());
        let _enter = span.enter();
        let started = Instant::now();
        let mut report = CycleReport::default();

        let mirror = BlobMirror::from_context(&self.ctx);
        for (local_dir, remote_dir) in self.ctx.config().blob_mirrors() {
            match mirror.sync(&local_dir, &remote_dir) {
                Ok(stats) => report.mirrors.push(MirrorReport { remote_dir, stats }),
                Err(e) => {
                    error!(local_dir = %local_dir.display(), error = %e, "Blob mirror failed, aborting cycle");
                    report.error = Some(e.to_string());
                    return self.finish(report, started);
                }
            }
        }

        match SnapshotDeduplicator::new(&self.ctx).maybe_snapshot() {
            Ok(outcome) => {
                if outcome.is_uploaded() {
                    let max = self.ctx.config().schedule().max_snapshots;
                    report.prune = Some(RetentionPruner::new(&self.ctx).prune(max));
                }
                report.snapshot = Some(outcome);
            }
            Err(e) => {
                error!(error = %e, "Snapshot failed, aborting cycle");
                report.error = Some(e.to_string());
            }
        }

        self.finish(report, started)
    }

    fn finish(&self, mut report: CycleReport, started: Instant) -> CycleReport {
        report.duration = started.elapsed();
        observability::record_cycle(report.duration, report.is_aborted());
        info!(
            aborted = report.is_aborted(),
            duration_ms = report.duration.as_millis() as u64,
            "Backup cycle finished"
        );
        report
    }

    /// Run cycles until `shutdown` fires, pausing the configured interval after each
    pub fn run(&self, shutdown: &ShutdownSignal) {
        let interval = self.ctx.config().schedule().interval();
        info!(interval_secs = interval.as_secs(), "Backup loop started");

        while !shutdown.is_triggered() {
            self.run_cycle();
            if shutdown.wait_timeout(interval) {
                break;
            }
        }

        info!("Backup loop stopped");
    }
}
