//! Uploads with retry
//!
//! Blob uploads go through [`put_with_retry`]; transient store failures are
//! retried according to the configured [`RetryPolicy`].

use keeper_retry::{retry, RetryError, RetryPolicy};
use std::path::Path;
use tracing::debug;

use crate::observability;
use crate::storage::{ObjectStore, Visibility};
use crate::Result;

/// Upload `local_path` to `key`, retrying transient failures
///
/// With the default policy this makes at most two attempts separated by a
/// fixed 100 ms pause, and returns the outcome of the last attempt.
pub fn put_with_retry<S>(
    store: &S,
    local_path: &Path,
    key: &str,
    visibility: Visibility,
    policy: &RetryPolicy,
) -> Result<()>
where
    S: ObjectStore + ?Sized,
{
    retry("put", policy, |attempt| {
        if attempt > 1 {
            observability::record_upload_retry();
            debug!(key = %key, attempt, "Retrying upload");
        }
        store.put(local_path, key, visibility)
    })
    .map_err(RetryError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockObjectStore;
    use crate::KeeperError;
    use mockall::Sequence;
    use std::time::Duration;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_retries_once_then_succeeds() {
        let mut store = MockObjectStore::new();
        let mut seq = Sequence::new();
        store
            .expect_put()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(KeeperError::storage("503 Slow Down")));
        store
            .expect_put()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let result = put_with_retry(
            &store,
            Path::new("/tmp/a.txt"),
            "app/blobs/a.txt",
            Visibility::PublicRead,
            &fast_policy(2),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_returns_second_failure() {
        let mut store = MockObjectStore::new();
        let mut seq = Sequence::new();
        store
            .expect_put()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(KeeperError::storage("first")));
        store
            .expect_put()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(KeeperError::storage("second")));

        let result = put_with_retry(
            &store,
            Path::new("/tmp/a.txt"),
            "k",
            Visibility::PublicRead,
            &fast_policy(2),
        );
        match result {
            Err(KeeperError::Storage(msg)) => assert_eq!(msg, "second"),
            other => panic!("expected storage error, got {other:?}"),
        }
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let mut store = MockObjectStore::new();
        store
            .expect_put()
            .times(1)
            .returning(|_, _, _| Err(KeeperError::validation("bad key")));

        let result = put_with_retry(
            &store,
            Path::new("/tmp/a.txt"),
            "k",
            Visibility::Private,
            &fast_policy(3),
        );
        assert!(matches!(result, Err(KeeperError::Validation(_))));
    }
}
