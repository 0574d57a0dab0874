/*!
Error types for the Keeper core engine.
*/

use keeper_retry::RetryableError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the Keeper core.
pub type Result<T> = std::result::Result<T, KeeperError>;

/// Errors that can occur while mirroring, snapshotting or pruning.
#[derive(Error, Debug)]
pub enum KeeperError {
    /// I/O errors during local file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Object store errors (list, put, delete)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Archive creation errors
    #[error("Archive error: {0}")]
    Archive(String),

    /// A walked file does not live under the directory being mirrored
    #[error("Unknown file '{}' is not under mirror root '{}'", .path.display(), .root.display())]
    UnknownFile { path: PathBuf, root: PathBuf },

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input rejected before touching storage, such as a malformed object key
    #[error("Validation error: {0}")]
    Validation(String),
}

impl KeeperError {
    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new archive error
    pub fn archive<S: Into<String>>(msg: S) -> Self {
        Self::Archive(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<walkdir::Error> for KeeperError {
    fn from(err: walkdir::Error) -> Self {
        let path = err.path().map(|p| p.display().to_string());
        match err.into_io_error() {
            Some(io) => KeeperError::Io(io),
            None => KeeperError::storage(format!(
                "Directory walk failed at {}",
                path.unwrap_or_else(|| "<unknown>".to_string())
            )),
        }
    }
}

impl From<zip::result::ZipError> for KeeperError {
    fn from(err: zip::result::ZipError) -> Self {
        KeeperError::archive(err.to_string())
    }
}

impl RetryableError for KeeperError {
    fn is_transient(&self) -> bool {
        matches!(self, KeeperError::Io(_) | KeeperError::Storage(_))
    }
}

/// Named reasons why startup validation refused a configuration.
///
/// These are fatal: the caller is expected to report them and exit without
/// starting the backup loop.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid backup: directory to backup '{}' doesn't exist", .0.display())]
    LocalDirMissing(PathBuf),

    #[error("Invalid backup: '{}' is not a directory", .0.display())]
    LocalDirNotADirectory(PathBuf),

    #[error("Invalid backup: bucket name is empty")]
    EmptyBucket,

    #[error("Invalid backup: {0}")]
    InvalidSetting(String),

    #[error("Invalid backup: listing '{prefix}' failed: {source}")]
    SmokeTestFailed {
        prefix: String,
        #[source]
        source: KeeperError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_keeper_error_display() {
        let error = KeeperError::validation("test validation error");
        assert_eq!(error.to_string(), "Validation error: test validation error");

        let error = KeeperError::storage("test storage error");
        assert_eq!(error.to_string(), "Storage error: test storage error");

        let error = KeeperError::UnknownFile {
            path: PathBuf::from("/elsewhere/a.txt"),
            root: PathBuf::from("/data/blobs"),
        };
        assert!(error.to_string().contains("/elsewhere/a.txt"));
        assert!(error.to_string().contains("/data/blobs"));
    }

    #[test]
    fn test_keeper_error_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let keeper_error = KeeperError::from(io_error);
        assert!(matches!(keeper_error, KeeperError::Io(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(KeeperError::storage("503 Slow Down").is_transient());
        assert!(KeeperError::Io(io::Error::new(io::ErrorKind::TimedOut, "timeout")).is_transient());
        assert!(KeeperError::validation("bad").is_permanent());
        assert!(KeeperError::UnknownFile {
            path: PathBuf::from("x"),
            root: PathBuf::from("y"),
        }
        .is_permanent());
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::LocalDirMissing(PathBuf::from("/nope"));
        assert_eq!(
            err.to_string(),
            "Invalid backup: directory to backup '/nope' doesn't exist"
        );

        let err = ValidationError::SmokeTestFailed {
            prefix: "app/".to_string(),
            source: KeeperError::storage("Access denied"),
        };
        assert!(err.to_string().contains("app/"));
        assert!(err.to_string().contains("Access denied"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<KeeperError>();
        assert_sync::<KeeperError>();
        assert_send::<ValidationError>();
    }
}
