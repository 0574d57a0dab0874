/*!
Local filesystem object store.

Keys map to files below a base directory, so a mounted disk or network share
can serve as the backup target.
*/

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use walkdir::WalkDir;

use super::{paginate, ListPage, ListRequest, ObjectStore, Visibility};
use crate::keys::DELIMITER;
use crate::{KeeperError, Result};

const PARTIAL_SUFFIX: &str = ".keeper-partial";

/// Object store backed by a directory
///
/// # Example
/// ```rust,no_run
/// use keeper_core::storage::{LocalObjectStore, ObjectStore, Visibility};
/// use std::path::Path;
///
/// let store = LocalObjectStore::new("/mnt/backups");
/// store.put(Path::new("/etc/hostname"), "host/hostname", Visibility::Private)?;
/// # Ok::<(), keeper_core::KeeperError>(())
/// ```
#[derive(Debug)]
pub struct LocalObjectStore {
    base_dir: PathBuf,
    base_ready: AtomicBool,
}

impl LocalObjectStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            base_ready: AtomicBool::new(false),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a key to a path below the base directory
    fn resolve_key(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.base_dir.clone();
        for segment in key.split(DELIMITER).filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(KeeperError::validation(format!("Invalid object key '{key}'")));
            }
            path.push(segment);
        }
        if path == self.base_dir {
            return Err(KeeperError::validation(format!("Invalid object key '{key}'")));
        }
        Ok(path)
    }

    fn ensure_base_dir(&self) -> Result<()> {
        if self.base_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        fs::create_dir_all(&self.base_dir).map_err(|e| {
            KeeperError::storage(format!(
                "Failed to create store directory {}: {e}",
                self.base_dir.display()
            ))
        })?;
        self.base_ready.store(true, Ordering::Release);
        Ok(())
    }

    fn all_keys(&self) -> Result<Vec<String>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.base_dir).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.base_dir)
                .map_err(|_| KeeperError::storage("Store walk escaped its base directory"))?;
            let segments: Option<Vec<&str>> =
                relative.components().map(|c| c.as_os_str().to_str()).collect();
            let Some(segments) = segments else {
                debug!(path = %entry.path().display(), "Skipping non UTF-8 file name");
                continue;
            };
            let key = segments.join(DELIMITER);
            if key.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            keys.push(key);
        }
        keys.sort();
        Ok(keys)
    }
}

impl ObjectStore for LocalObjectStore {
    fn list(&self, request: &ListRequest) -> Result<ListPage> {
        let keys = self.all_keys()?;
        Ok(paginate(keys.iter().map(String::as_str), request))
    }

    fn put(&self, local_path: &Path, key: &str, visibility: Visibility) -> Result<()> {
        self.ensure_base_dir()?;
        let target = self.resolve_key(key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                KeeperError::storage(format!("Failed to create directory {}: {e}", parent.display()))
            })?;
        }

        // copy next to the target first so a crash never leaves a truncated object
        let mut partial = target.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);
        fs::copy(local_path, &partial).map_err(|e| {
            KeeperError::storage(format!(
                "Failed to copy {} to {}: {e}",
                local_path.display(),
                partial.display()
            ))
        })?;
        fs::rename(&partial, &target).map_err(|e| {
            KeeperError::storage(format!("Failed to move object into place at {}: {e}", target.display()))
        })?;

        debug!(key = %key, visibility = ?visibility, "Stored object in local store");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let target = self.resolve_key(key)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeeperError::storage(format!(
                "Failed to delete object {}: {e}",
                target.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_put_list_delete() {
        let src = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(store_dir.path().join("bucket"));
        let file = source_file(&src, "a.txt", "hello");

        store.put(&file, "app/blobs/a.txt", Visibility::PublicRead).unwrap();
        store.put(&file, "app/snap.zip", Visibility::PublicRead).unwrap();
        assert_eq!(
            fs::read_to_string(store_dir.path().join("bucket/app/blobs/a.txt")).unwrap(),
            "hello"
        );

        let flat = store.list(&ListRequest::new("app/")).unwrap();
        assert_eq!(flat.keys, vec!["app/blobs/a.txt", "app/snap.zip"]);

        let shallow = store.list(&ListRequest::new("app/").delimiter("/")).unwrap();
        assert_eq!(shallow.keys, vec!["app/snap.zip"]);
        assert_eq!(shallow.common_prefixes, vec!["app/blobs/"]);

        store.delete("app/snap.zip").unwrap();
        let flat = store.list(&ListRequest::new("app/")).unwrap();
        assert_eq!(flat.keys, vec!["app/blobs/a.txt"]);
    }

    #[test]
    fn test_delete_missing_key_succeeds() {
        let store_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(store_dir.path());
        assert!(store.delete("app/missing.zip").is_ok());
    }

    #[test]
    fn test_list_missing_base_dir_is_empty() {
        let store = LocalObjectStore::new("/definitely/not/a/store");
        let page = store.list(&ListRequest::new("")).unwrap();
        assert!(page.keys.is_empty());
        assert!(!page.is_truncated);
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let src = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(store_dir.path());
        let file = source_file(&src, "a.txt", "x");
        assert!(matches!(
            store.put(&file, "../outside.txt", Visibility::Private),
            Err(KeeperError::Validation(_))
        ));
        assert!(matches!(
            store.put(&file, "/", Visibility::Private),
            Err(KeeperError::Validation(_))
        ));
        assert!(matches!(store.delete("a/../../b"), Err(KeeperError::Validation(_))));
    }

    #[test]
    fn test_malformed_key_fails_without_retry() {
        let src = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(store_dir.path());
        let file = source_file(&src, "a.txt", "x");
        let policy = keeper_retry::RetryPolicy::fixed(3, std::time::Duration::from_secs(60));

        let started = std::time::Instant::now();
        let result = crate::upload::put_with_retry(
            &store,
            &file,
            "../outside.txt",
            Visibility::Private,
            &policy,
        );
        assert!(matches!(result, Err(KeeperError::Validation(_))));
        assert!(started.elapsed() < std::time::Duration::from_secs(60));
    }

    #[test]
    fn test_put_missing_source_fails() {
        let store_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(store_dir.path());
        let result = store.put(Path::new("/no/such/file"), "k", Visibility::Private);
        assert!(matches!(result, Err(KeeperError::Storage(_))));
    }
}
