/*!
Snapshot archives and content digests.

The data directory is packed into a zip whose bytes depend only on the file
tree: entries are added in sorted order, deflated, and stamped with each
file's modification time. Two archives of an unchanged directory therefore
have the same SHA-1, which is what snapshot deduplication keys on.
*/

use chrono::{DateTime, Datelike, Timelike, Utc};
use sha1::{Digest, Sha1};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::keys::DELIMITER;
use crate::{KeeperError, Result};

/// Zip archive on local disk that is deleted when dropped
#[derive(Debug)]
pub struct TempArchive {
    path: PathBuf,
}

impl TempArchive {
    /// Pack `source_dir` into a fresh archive at `path`
    ///
    /// A file left at `path` by an earlier run is removed first. The archive
    /// is removed again on every exit path, including a failed build.
    pub fn create(path: &Path, source_dir: &Path) -> Result<Self> {
        remove_if_exists(path)?;
        let archive = Self {
            path: path.to_path_buf(),
        };
        let entries = zip_directory(&archive.path, source_dir)?;
        debug!(
            archive = %archive.path.display(),
            source = %source_dir.display(),
            entries,
            "Created snapshot archive"
        );
        Ok(archive)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lowercase hex SHA-1 of the archive bytes
    pub fn sha1_hex(&self) -> Result<String> {
        file_sha1(&self.path)
    }
}

impl Drop for TempArchive {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(archive = %self.path.display(), error = %e, "Failed to remove temporary archive");
            }
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(KeeperError::archive(format!(
            "Failed to remove stale archive {}: {e}",
            path.display()
        ))),
    }
}

/// Write every regular file below `source_dir` into a zip at `archive_path`
///
/// Returns the number of entries written.
pub fn zip_directory(archive_path: &Path, source_dir: &Path) -> Result<usize> {
    let file = File::create(archive_path).map_err(|e| {
        KeeperError::archive(format!("Failed to create {}: {e}", archive_path.display()))
    })?;
    let mut writer = ZipWriter::new(BufWriter::new(file));
    let mut entries = 0usize;

    let walker = WalkDir::new(source_dir)
        .follow_links(false)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() || entry.path() == archive_path {
            continue;
        }

        let name = relative_key(source_dir, entry.path())?;
        let metadata = entry.metadata()?;
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip_timestamp(&metadata))
            .large_file(metadata.len() >= u64::from(u32::MAX));

        writer.start_file(name, options)?;
        let mut input = BufReader::new(File::open(entry.path())?);
        io::copy(&mut input, &mut writer)?;
        entries += 1;
    }

    writer.finish()?;
    Ok(entries)
}

fn zip_timestamp(metadata: &fs::Metadata) -> zip::DateTime {
    let Ok(modified) = metadata.modified() else {
        return zip::DateTime::default();
    };
    let at = DateTime::<Utc>::from(modified).naive_utc();
    let (Ok(year), Ok(month), Ok(day), Ok(hour), Ok(minute), Ok(second)) = (
        u16::try_from(at.year()),
        u8::try_from(at.month()),
        u8::try_from(at.day()),
        u8::try_from(at.hour()),
        u8::try_from(at.minute()),
        u8::try_from(at.second()),
    ) else {
        return zip::DateTime::default();
    };
    // zip timestamps cannot express dates before 1980
    zip::DateTime::from_date_and_time(year, month, day, hour, minute, second).unwrap_or_default()
}

/// Lowercase hex SHA-1 of a file's contents
pub fn file_sha1(path: &Path) -> Result<String> {
    let mut input = BufReader::new(File::open(path)?);
    let mut hasher = Sha1::new();
    io::copy(&mut input, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Path of `path` relative to `root`, joined with the store delimiter
///
/// Fails with [`KeeperError::UnknownFile`] when `path` is not below `root`
/// or has a component that is not valid UTF-8.
pub fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let unknown = || KeeperError::UnknownFile {
        path: path.to_path_buf(),
        root: root.to_path_buf(),
    };
    let relative = path.strip_prefix(root).map_err(|_| unknown())?;
    let segments = relative
        .components()
        .map(|c| c.as_os_str().to_str().ok_or_else(unknown))
        .collect::<Result<Vec<_>>>()?;
    if segments.is_empty() {
        return Err(unknown());
    }
    Ok(segments.join(DELIMITER))
}
