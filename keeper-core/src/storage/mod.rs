/*!
Object store port and adapters.

The backup pipeline only needs three operations from a remote store: a
paginated listing, an upload of a local file, and a delete. [`ObjectStore`]
captures exactly that; adapters implement it for S3 and for a plain local
directory.
*/

pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

use std::path::Path;

use crate::{KeeperError, Result};

pub use local::LocalObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

/// Maximum keys a single listing page may return
pub const MAX_KEYS_PER_PAGE: usize = 1000;

/// Content type used when the file extension is unknown
pub const DEFAULT_CONTENT_TYPE: &str = "binary/octet-stream";

/// Access level applied to uploaded objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Private,
    PublicRead,
}

/// Parameters of a single listing call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    pub prefix: String,
    /// Empty for a flat, recursive listing
    pub delimiter: String,
    /// Only keys sorting after the marker are returned
    pub marker: String,
    pub max_keys: usize,
}

impl ListRequest {
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self {
            prefix: prefix.into(),
            delimiter: String::new(),
            marker: String::new(),
            max_keys: MAX_KEYS_PER_PAGE,
        }
    }

    pub fn delimiter<S: Into<String>>(mut self, delimiter: S) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn marker<S: Into<String>>(mut self, marker: S) -> Self {
        self.marker = marker.into();
        self
    }

    pub fn max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys;
        self
    }
}

/// One page of a listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Object keys in store order
    pub keys: Vec<String>,
    /// Groups collapsed by the delimiter
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

impl ListPage {
    /// Marker for the next page, or `None` when the listing is complete
    ///
    /// Stores that omit the next marker on truncated pages continue from the
    /// last key of the page.
    pub fn continuation(&self) -> Option<String> {
        if !self.is_truncated {
            return None;
        }
        if let Some(marker) = &self.next_marker {
            return Some(marker.clone());
        }
        let last_key = self.keys.last();
        let last_prefix = self.common_prefixes.last();
        match (last_key, last_prefix) {
            (Some(k), Some(p)) => Some(k.max(p).clone()),
            (Some(k), None) => Some(k.clone()),
            (None, Some(p)) => Some(p.clone()),
            (None, None) => None,
        }
    }
}

/// How many entries a recency listing fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingMode {
    /// One page of at most `cap` entries
    Bounded { cap: usize },
    /// Every entry, following continuation markers
    Exhaustive,
}

impl Default for ListingMode {
    fn default() -> Self {
        ListingMode::Bounded {
            cap: crate::config::DEFAULT_LISTING_CAP,
        }
    }
}

/// Object store abstraction consumed by the backup pipeline
///
/// All operations block until the store answers.
#[cfg_attr(test, mockall::automock)]
pub trait ObjectStore {
    /// List at most `request.max_keys` keys under `request.prefix`
    fn list(&self, request: &ListRequest) -> Result<ListPage>;

    /// Upload a local file under `key`
    ///
    /// The content type is derived from the file extension. Implementations
    /// make sure the destination container exists before the first write.
    fn put(&self, local_path: &Path, key: &str, visibility: Visibility) -> Result<()>;

    /// Delete `key`; deleting a missing key succeeds
    fn delete(&self, key: &str) -> Result<()>;
}

impl<T: ObjectStore + ?Sized> ObjectStore for Box<T> {
    fn list(&self, request: &ListRequest) -> Result<ListPage> {
        (**self).list(request)
    }

    fn put(&self, local_path: &Path, key: &str, visibility: Visibility) -> Result<()> {
        (**self).put(local_path, key, visibility)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }
}

impl<T: ObjectStore + ?Sized> ObjectStore for &T {
    fn list(&self, request: &ListRequest) -> Result<ListPage> {
        (**self).list(request)
    }

    fn put(&self, local_path: &Path, key: &str, visibility: Visibility) -> Result<()> {
        (**self).put(local_path, key, visibility)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }
}

/// List every key under `prefix`, following continuation markers until the
/// listing is no longer truncated
pub fn list_all<S>(store: &S, prefix: &str, delimiter: &str) -> Result<Vec<String>>
where
    S: ObjectStore + ?Sized,
{
    let mut keys = Vec::new();
    let mut marker = String::new();

    loop {
        let request = ListRequest::new(prefix)
            .delimiter(delimiter)
            .marker(marker.clone())
            .max_keys(MAX_KEYS_PER_PAGE);
        let page = store.list(&request)?;
        let next = page.continuation();
        keys.extend(page.keys);

        match next {
            Some(next) if next == marker => {
                return Err(KeeperError::storage(format!(
                    "Listing of '{prefix}' did not advance past marker '{marker}'"
                )));
            }
            Some(next) => marker = next,
            None if page.is_truncated => {
                return Err(KeeperError::storage(format!(
                    "Listing of '{prefix}' is truncated but has no continuation marker"
                )));
            }
            None => break,
        }
    }

    Ok(keys)
}

/// List the keys used by recency checks: a single bounded page, or
/// everything in exhaustive mode
pub fn list_window<S>(store: &S, prefix: &str, delimiter: &str, mode: ListingMode) -> Result<Vec<String>>
where
    S: ObjectStore + ?Sized,
{
    match mode {
        ListingMode::Bounded { cap } => {
            let request = ListRequest::new(prefix).delimiter(delimiter).max_keys(cap);
            Ok(store.list(&request)?.keys)
        }
        ListingMode::Exhaustive => list_all(store, prefix, delimiter),
    }
}

/// Content type for a local file, guessed from its extension
pub fn content_type_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}

/// Build one listing page from keys already sorted in ascending order
///
/// Mirrors S3 v1 listing rules: keys outside the prefix or not after the
/// marker are skipped; with a delimiter, keys sharing the next path segment
/// are collapsed into one common prefix that counts against `max_keys`.
pub(crate) fn paginate<'a, I>(sorted_keys: I, request: &ListRequest) -> ListPage
where
    I: IntoIterator<Item = &'a str>,
{
    let mut page = ListPage::default();
    let mut returned = 0usize;
    let mut last_returned: Option<String> = None;

    for key in sorted_keys {
        let Some(rest) = key.strip_prefix(request.prefix.as_str()) else {
            continue;
        };
        if !request.marker.is_empty() && key <= request.marker.as_str() {
            continue;
        }

        let group = if request.delimiter.is_empty() {
            None
        } else {
            rest.find(request.delimiter.as_str())
                .map(|idx| &key[..request.prefix.len() + idx + request.delimiter.len()])
        };

        if let Some(group) = group {
            if page.common_prefixes.last().map(String::as_str) == Some(group) {
                continue;
            }
            // the marker itself was a collapsed group from the previous page
            if !request.marker.is_empty() && group == request.marker {
                continue;
            }
        }

        if returned >= request.max_keys {
            page.is_truncated = true;
            break;
        }

        match group {
            Some(group) => {
                page.common_prefixes.push(group.to_string());
                last_returned = Some(group.to_string());
            }
            None => {
                page.keys.push(key.to_string());
                last_returned = Some(key.to_string());
            }
        }
        returned += 1;
    }

    if page.is_truncated {
        page.next_marker = last_returned;
    }
    page
}

/// Memory-based object store for testing
///
/// Records every upload and delete so tests can assert on store traffic.
#[cfg(test)]
pub struct MemoryObjectStore {
    objects: std::sync::Mutex<std::collections::BTreeMap<String, (Vec<u8>, Visibility)>>,
    puts: std::sync::Mutex<Vec<String>>,
    deletes: std::sync::Mutex<Vec<String>>,
    list_calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: std::sync::Mutex::new(std::collections::BTreeMap::new()),
            puts: std::sync::Mutex::new(Vec::new()),
            deletes: std::sync::Mutex::new(Vec::new()),
            list_calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Store pre-populated with empty objects
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        {
            let mut objects = store.objects.lock().unwrap();
            for key in keys {
                objects.insert(key.into(), (Vec::new(), Visibility::Private));
            }
        }
        store
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn contents(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).map(|(data, _)| data.clone())
    }

    pub fn visibility(&self, key: &str) -> Option<Visibility> {
        self.objects.lock().unwrap().get(key).map(|(_, v)| *v)
    }

    /// Keys uploaded so far, in upload order
    pub fn put_keys(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    /// Keys deleted so far, in delete order
    pub fn deleted_keys(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl ObjectStore for MemoryObjectStore {
    fn list(&self, request: &ListRequest) -> Result<ListPage> {
        self.list_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let objects = self.objects.lock().unwrap();
        Ok(paginate(objects.keys().map(String::as_str), request))
    }

    fn put(&self, local_path: &Path, key: &str, visibility: Visibility) -> Result<()> {
        let data = std::fs::read(local_path)?;
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (data, visibility));
        self.puts.lock().unwrap().push(key.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        self.deletes.lock().unwrap().push(key.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(page: &ListPage) -> Vec<&str> {
        page.keys.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_paginate_prefix_and_marker() {
        let all = ["a/1", "a/2", "a/3", "b/1"];
        let page = paginate(all, &ListRequest::new("a/").max_keys(2));
        assert_eq!(keys(&page), vec!["a/1", "a/2"]);
        assert!(page.is_truncated);
        assert_eq!(page.continuation().as_deref(), Some("a/2"));

        let page = paginate(all, &ListRequest::new("a/").marker("a/2").max_keys(2));
        assert_eq!(keys(&page), vec!["a/3"]);
        assert!(!page.is_truncated);
        assert_eq!(page.continuation(), None);
    }

    #[test]
    fn test_paginate_delimiter_groups_subdirectories() {
        let all = [
            "app/121011_1121_x.zip",
            "app/blobs/a",
            "app/blobs/b",
            "app/blobs_crashes/c",
            "app/z.zip",
        ];
        let page = paginate(all, &ListRequest::new("app/").delimiter("/"));
        assert_eq!(keys(&page), vec!["app/121011_1121_x.zip", "app/z.zip"]);
        assert_eq!(
            page.common_prefixes,
            vec!["app/blobs/".to_string(), "app/blobs_crashes/".to_string()]
        );
    }

    #[test]
    fn test_paginate_group_marker_is_not_repeated() {
        let all = ["app/a.zip", "app/blobs/a", "app/blobs/b", "app/c.zip"];
        let first = paginate(all, &ListRequest::new("app/").delimiter("/").max_keys(2));
        assert_eq!(first.common_prefixes, vec!["app/blobs/".to_string()]);
        let marker = first.continuation().unwrap();
        assert_eq!(marker, "app/blobs/");

        let second = paginate(
            all,
            &ListRequest::new("app/").delimiter("/").marker(marker).max_keys(2),
        );
        assert_eq!(keys(&second), vec!["app/c.zip"]);
        assert!(second.common_prefixes.is_empty());
    }

    #[test]
    fn test_list_all_follows_markers() {
        let names: Vec<String> = (0..2500).map(|i| format!("p/{i:05}")).collect();
        let store = MemoryObjectStore::with_keys(names.clone());
        let listed = list_all(&store, "p/", "").unwrap();
        assert_eq!(listed, names);
        assert_eq!(store.list_calls(), 3);
    }

    #[test]
    fn test_list_all_uses_last_key_without_next_marker() {
        let mut store = MockObjectStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_list()
            .withf(|req| req.marker.is_empty())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(ListPage {
                    keys: vec!["p/1".to_string(), "p/2".to_string()],
                    is_truncated: true,
                    ..ListPage::default()
                })
            });
        store
            .expect_list()
            .withf(|req| req.marker == "p/2")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(ListPage {
                    keys: vec!["p/3".to_string()],
                    ..ListPage::default()
                })
            });

        let listed = list_all(&store, "p/", "").unwrap();
        assert_eq!(listed, vec!["p/1", "p/2", "p/3"]);
    }

    #[test]
    fn test_list_all_detects_stuck_listing() {
        let mut store = MockObjectStore::new();
        store.expect_list().returning(|_| {
            Ok(ListPage {
                is_truncated: true,
                ..ListPage::default()
            })
        });
        assert!(list_all(&store, "p/", "").is_err());
    }

    #[test]
    fn test_list_window_bounded_is_single_page() {
        let names: Vec<String> = (0..50).map(|i| format!("p/{i:03}")).collect();
        let store = MemoryObjectStore::with_keys(names);
        let listed = list_window(&store, "p/", "/", ListingMode::Bounded { cap: 20 }).unwrap();
        assert_eq!(listed.len(), 20);
        assert_eq!(store.list_calls(), 1);

        let listed = list_window(&store, "p/", "/", ListingMode::Exhaustive).unwrap();
        assert_eq!(listed.len(), 50);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Path::new("a/b.txt")), "text/plain");
        assert_eq!(content_type_for(Path::new("snap.zip")), "application/zip");
        assert_eq!(content_type_for(Path::new("blob")), DEFAULT_CONTENT_TYPE);
    }
}
