//! Archiver: gzip captured dumps into deterministically named files

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use tracing::info;

use crate::error::{Error, Result};

/// Comment embedded in every archive header
pub const ARCHIVE_COMMENT: &str = "Created by pachyderm backup helper";

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M";

/// A written archive
#[derive(Clone, Debug, PartialEq)]
pub struct ArchiveInfo {
    /// Full path of the archive file
    pub location: String,
    /// Uncompressed size
    pub bytes: u64,
}

/// Writes and reads dump archives under one directory
#[derive(Clone, Debug)]
pub struct Archiver {
    dir: PathBuf,
}

/// `{logical}-{YYYYMMDDHHMM}.sql.gz`
pub fn archive_name(logical: &str, at: DateTime<Utc>) -> String {
    format!("{}.gz", entry_name(logical, at))
}

fn entry_name(logical: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}.sql", logical, at.format(TIMESTAMP_FORMAT))
}

impl Archiver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Compress `data` into `{dir}/{logical}-{YYYYMMDDHHMM}.sql.gz`.
    ///
    /// An existing archive is never overwritten; the write fails instead. A
    /// failed write may leave a partial file behind.
    pub async fn write(&self, logical: &str, data: Vec<u8>, at: DateTime<Utc>) -> Result<ArchiveInfo> {
        if logical.is_empty() || logical.contains(['/', '\\']) || logical.starts_with('.') {
            return Err(Error::validation(format!("invalid archive name '{}'", logical)));
        }

        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.dir.join(archive_name(logical, at));
        let entry = entry_name(logical, at);
        let mtime = u32::try_from(at.timestamp()).unwrap_or(0);
        let bytes = data.len() as u64;

        let target = path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&target)?;
            let mut encoder = GzBuilder::new()
                .filename(entry)
                .comment(ARCHIVE_COMMENT)
                .mtime(mtime)
                .write(file, Compression::default());
            encoder.write_all(&data)?;
            let file = encoder.finish()?;
            file.sync_all()
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        let location = path.display().to_string();
        info!(location = %location, bytes, "Archive written");

        Ok(ArchiveInfo { location, bytes })
    }

    /// Decompress an archive previously written by [`Archiver::write`]
    pub async fn read(&self, location: &str) -> Result<Vec<u8>> {
        let path = self.resolve(location)?;
        tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut decoder = GzDecoder::new(File::open(path)?);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(format!("archive {}", location)),
            _ => Error::Io(e),
        })
    }

    /// Map a recorded location to a path inside the archive directory.
    ///
    /// Bare file names are looked up in the directory; absolute paths must
    /// already point inside it.
    pub fn resolve(&self, location: &str) -> Result<PathBuf> {
        let path = Path::new(location);
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path)
        };

        let escapes = resolved
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
        if escapes || !resolved.starts_with(&self.dir) {
            return Err(Error::validation(format!(
                "archive location '{}' is outside {}",
                location,
                self.dir.display()
            )));
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn name_uses_minute_resolution() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 15, 4, 59).unwrap();
        assert_eq!(archive_name("nightly", at), "nightly-202401021504.sql.gz");
    }

    #[tokio::test]
    async fn written_archive_decompresses_to_input() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(dir.path());
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 15, 4, 0).unwrap();
        let dump = b"CREATE TABLE commits (id text);\n".repeat(100);

        let info = archiver.write("nightly", dump.clone(), at).await.unwrap();
        assert!(info.location.ends_with("nightly-202401021504.sql.gz"));
        assert_eq!(info.bytes, dump.len() as u64);

        assert_eq!(archiver.read(&info.location).await.unwrap(), dump);
        assert_eq!(archiver.read("nightly-202401021504.sql.gz").await.unwrap(), dump);
    }

    #[tokio::test]
    async fn header_carries_comment_and_time() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(dir.path());
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 15, 4, 0).unwrap();

        let info = archiver.write("nightly", b"select 1;".to_vec(), at).await.unwrap();

        let decoder = GzDecoder::new(File::open(&info.location).unwrap());
        let header = decoder.header().unwrap();
        assert_eq!(header.comment(), Some(ARCHIVE_COMMENT.as_bytes()));
        assert_eq!(header.filename(), Some("nightly-202401021504.sql".as_bytes()));
        assert_eq!(header.mtime(), at.timestamp() as u32);
    }

    #[tokio::test]
    async fn same_minute_write_never_replaces_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(dir.path());
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 15, 4, 0).unwrap();

        let first = archiver.write("ml-nightly", b"TENANT-A".to_vec(), at).await.unwrap();
        let err = archiver
            .write("ml-nightly", b"TENANT-B".to_vec(), at)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists));
        assert_eq!(archiver.read(&first.location).await.unwrap(), b"TENANT-A");

        let other = archiver.write("staging-nightly", b"TENANT-B".to_vec(), at).await.unwrap();
        assert_ne!(other.location, first.location);
        assert_eq!(archiver.read(&other.location).await.unwrap(), b"TENANT-B");
    }

    #[tokio::test]
    async fn rejects_locations_outside_directory() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(dir.path());

        assert!(archiver.resolve("/etc/passwd").is_err());
        assert!(archiver.resolve("../escape.sql.gz").is_err());
        assert!(matches!(
            archiver.read("missing.sql.gz").await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(archiver
            .write("../up", Vec::new(), Utc::now())
            .await
            .is_err());
    }
}
