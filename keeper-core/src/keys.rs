/*!
Remote key conventions.

Snapshot objects are named `<root-prefix><YYMMDD>_<HHMM>_<sha1-hex>.zip`, e.g.
`apptranslator/121011_1121_c7fedc06cf4b08fef66090eaa0ad7a68dc13a325.zip`. The
date/time prefix is fixed width and zero padded, so sorting keys as strings
sorts them chronologically. Blob objects mirror local relative paths under
`<root-prefix>blobs/` and `<root-prefix>blobs_crashes/`.
*/

use chrono::NaiveDateTime;

/// Path delimiter used by the object store
pub const DELIMITER: &str = "/";

/// Extension of snapshot archives
pub const SNAPSHOT_EXTENSION: &str = ".zip";

/// Hex length of a SHA-1 digest
pub const DIGEST_HEX_LEN: usize = 40;

/// `strftime` format of the timestamp part of a snapshot name
pub const TIMESTAMP_FORMAT: &str = "%y%m%d_%H%M";

const DATE_LEN: usize = 6;
const TIME_LEN: usize = 4;

/// Normalize a remote root prefix: no leading delimiter, exactly one trailing delimiter.
///
/// An empty prefix stays empty (the bucket root).
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_start_matches(DELIMITER);
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.ends_with(DELIMITER) {
        trimmed.to_string()
    } else {
        format!("{trimmed}{DELIMITER}")
    }
}

/// Join key segments with the delimiter, collapsing duplicate delimiters at the seams
pub fn join_key(base: &str, rest: &str) -> String {
    let base = base.trim_end_matches(DELIMITER);
    let rest = rest.trim_start_matches(DELIMITER);
    match (base.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{base}{DELIMITER}{rest}"),
    }
}

/// Key form used when comparing remote listings with local candidates
///
/// Listing results never carry a leading delimiter; a leading one is added to
/// both sides so that keys built with or without it compare equal.
pub fn comparable_key(key: &str) -> String {
    if key.starts_with(DELIMITER) {
        key.to_string()
    } else {
        format!("{DELIMITER}{key}")
    }
}

/// Parsed form of a snapshot object name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotName {
    /// `YYMMDD_HHMM`
    pub timestamp: String,
    /// Lowercase hex SHA-1 of the archive
    pub digest: String,
    /// Full remote key
    pub key: String,
}

impl SnapshotName {
    /// Build the snapshot name for an archive digest at the given wall-clock time
    pub fn new(root_prefix: &str, at: NaiveDateTime, digest: &str) -> Self {
        let timestamp = at.format(TIMESTAMP_FORMAT).to_string();
        let file_name = format!("{timestamp}_{digest}{SNAPSHOT_EXTENSION}");
        let key = join_key(root_prefix, &file_name);
        Self {
            timestamp,
            digest: digest.to_string(),
            key,
        }
    }

    /// Parse a key that follows the strict snapshot naming shape
    ///
    /// The key must have exactly two delimiter-separated segments, and the
    /// file name must split on `_` into parts of length 6, 4 and 44 (digest
    /// plus extension), ending in `.zip`.
    pub fn parse(key: &str) -> Option<Self> {
        let segments: Vec<&str> = key.split(DELIMITER).collect();
        if segments.len() != 2 {
            return None;
        }
        let parts: Vec<&str> = segments[1].split('_').collect();
        if parts.len() != 3 || parts[0].len() != DATE_LEN || parts[1].len() != TIME_LEN {
            return None;
        }
        if parts[2].len() != DIGEST_HEX_LEN + SNAPSHOT_EXTENSION.len() {
            return None;
        }
        let digest = parts[2].strip_suffix(SNAPSHOT_EXTENSION)?;
        Some(Self {
            timestamp: format!("{}_{}", parts[0], parts[1]),
            digest: digest.to_string(),
            key: key.to_string(),
        })
    }

    /// The wall-clock time encoded in the name, if it is a valid date
    pub fn created_at(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.timestamp, TIMESTAMP_FORMAT).ok()
    }
}

/// True if `key` has the strict snapshot naming shape
pub fn is_snapshot_key(key: &str) -> bool {
    SnapshotName::parse(key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};

    const DIGEST: &str = "c7fedc06cf4b08fef66090eaa0ad7a68dc13a325";

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 37)
            .unwrap()
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("apptranslator"), "apptranslator/");
        assert_eq!(normalize_prefix("apptranslator/"), "apptranslator/");
        assert_eq!(normalize_prefix("/apptranslator/"), "apptranslator/");
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("app/", "blobs"), "app/blobs");
        assert_eq!(join_key("app/blobs", "sub/b.txt"), "app/blobs/sub/b.txt");
        assert_eq!(join_key("", "a.txt"), "a.txt");
        assert_eq!(join_key("app", ""), "app");
    }

    #[test]
    fn test_comparable_key() {
        assert_eq!(comparable_key("app/a.txt"), "/app/a.txt");
        assert_eq!(comparable_key("/app/a.txt"), "/app/a.txt");
    }

    #[test]
    fn test_snapshot_name_format() {
        let name = SnapshotName::new("apptranslator/", at(2012, 10, 11, 11, 21), DIGEST);
        assert_eq!(
            name.key,
            "apptranslator/121011_1121_c7fedc06cf4b08fef66090eaa0ad7a68dc13a325.zip"
        );
        assert_eq!(name.timestamp, "121011_1121");
    }

    #[test]
    fn test_generated_key_parses_back() {
        let name = SnapshotName::new("app/", at(2024, 1, 2, 3, 4), DIGEST);
        let parsed = SnapshotName::parse(&name.key).expect("generated key must parse");
        assert_eq!(parsed, name);
        assert_eq!(parsed.created_at(), Some(at(2024, 1, 2, 3, 4).with_second(0).unwrap()));
    }

    #[test]
    fn test_zero_padding() {
        let name = SnapshotName::new("app/", at(2005, 3, 4, 5, 6), DIGEST);
        assert!(name.key.starts_with("app/050304_0506_"));
    }

    #[test]
    fn test_rejects_non_snapshot_keys() {
        assert!(!is_snapshot_key("app/blobs/a.txt"));
        assert!(!is_snapshot_key(&format!("app/sub/121011_1121_{DIGEST}.zip")));
        assert!(!is_snapshot_key(&format!("121011_1121_{DIGEST}.zip")));
        assert!(!is_snapshot_key(&format!("app/1210111_121_{DIGEST}.zip")));
        assert!(!is_snapshot_key(&format!("app/121011_1121_{DIGEST}.tar")));
        assert!(!is_snapshot_key("app/121011_1121_abc.zip"));
        assert!(!is_snapshot_key(&format!("app/121011_1121_x_{DIGEST}.zip")));
        assert!(is_snapshot_key(&format!("app/121011_1121_{DIGEST}.zip")));
    }

    #[test]
    fn test_lexicographic_order_is_chronological() {
        let times = [
            at(2023, 12, 31, 23, 59),
            at(2024, 1, 1, 0, 0),
            at(2024, 1, 1, 12, 0),
            at(2024, 2, 29, 0, 1),
            at(2024, 10, 1, 9, 30),
        ];
        let mut keys: Vec<String> = times
            .iter()
            .rev()
            .map(|t| SnapshotName::new("app/", *t, DIGEST).key)
            .collect();
        keys.sort();

        let expected: Vec<String> = times
            .iter()
            .map(|t| SnapshotName::new("app/", *t, DIGEST).key)
            .collect();
        assert_eq!(keys, expected);
    }
}
