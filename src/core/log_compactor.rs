//! Merges the per-message `.npy` files written by the data loggers into one
//! compressed archive per source.
//!
//! Archive layout: a gzip stream of records, each being
//! `u16 name length | name | u64 payload length | payload` (little endian),
//! ordered by the timestamp embedded in the source file name.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::core::workers;
use crate::error::{Error, IoResultExt, Result};

const RAW_EXTENSION: &str = "npy";
const ARCHIVE_SUFFIX: &str = "_log.gz";
const STAGING_SUFFIX: &str = ".tmp";

static RAW_LOG_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<source>\d{3})_(?P<timestamp>\d+)\.npy$").expect("valid log name regex")
});

#[derive(Debug, Clone, Copy)]
pub struct CompactionOptions {
    pub workers: usize,
    pub verify_integrity: bool,
    pub remove_sources: bool,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            verify_integrity: false,
            remove_sources: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct CompactionReport {
    pub archives: Vec<PathBuf>,
    pub records: usize,
}

/// One source file as stored inside an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub name: String,
    pub data: Vec<u8>,
}

/// Path of the archive holding every message from `source_id`.
pub fn archive_path(directory: &Path, source_id: &str) -> PathBuf {
    directory.join(format!("{source_id}{ARCHIVE_SUFFIX}"))
}

/// Compact every raw log file in `directory`.
///
/// A missing directory or one without raw files is left alone. A directory
/// that already holds archives next to raw files is refused, since
/// recompacting would overwrite the existing archives.
pub async fn compact(directory: &Path, options: CompactionOptions) -> Result<CompactionReport> {
    if !directory.exists() {
        debug!(directory = %directory.display(), "No log directory, skipping compaction");
        return Ok(CompactionReport::default());
    }

    let inventory = {
        let directory = directory.to_path_buf();
        workers::run_blocking("compaction", move || take_inventory(&directory)).await?
    };

    if inventory.sources.is_empty() {
        debug!(directory = %directory.display(), "No uncompressed logs to compact");
        return Ok(CompactionReport::default());
    }
    if inventory.archives > 0 {
        return Err(Error::MixedLogDirectory {
            directory: directory.to_path_buf(),
        });
    }

    let records: usize = inventory.sources.values().map(Vec::len).sum();
    info!(
        directory = %directory.display(),
        sources = inventory.sources.len(),
        records,
        "Compacting behavior logs"
    );

    let staged: Vec<(PathBuf, PathBuf)> = inventory
        .sources
        .keys()
        .map(|id| {
            let archive = archive_path(directory, id);
            let staging = staging_path(&archive);
            (staging, archive)
        })
        .collect();

    let jobs: Vec<_> = inventory
        .sources
        .iter()
        .zip(&staged)
        .map(|((_, files), (staging, _))| {
            let files: Vec<PathBuf> = files.iter().map(|(_, path)| path.clone()).collect();
            let staging = staging.clone();
            let verify = options.verify_integrity;
            move || {
                write_archive(&staging, &files)?;
                if verify {
                    verify_archive(&staging, &files)?;
                }
                Ok(())
            }
        })
        .collect();

    if let Err(e) = workers::run_all("compaction", options.workers, jobs).await {
        for (staging, _) in &staged {
            if let Err(cleanup) = fs::remove_file(staging)
                && cleanup.kind() != ErrorKind::NotFound
            {
                warn!(path = %staging.display(), error = %cleanup, "Failed to remove staged archive");
            }
        }
        return Err(e);
    }

    let mut report = CompactionReport {
        archives: Vec::with_capacity(staged.len()),
        records,
    };
    for (staging, archive) in staged {
        fs::rename(&staging, &archive).at(&archive)?;
        report.archives.push(archive);
    }

    if options.remove_sources {
        for path in inventory.sources.values().flatten().map(|(_, path)| path) {
            fs::remove_file(path).at(path)?;
        }
    }

    info!(
        directory = %directory.display(),
        archives = report.archives.len(),
        "Behavior logs compacted"
    );
    Ok(report)
}

/// Read every record stored in an archive.
pub fn read_archive(path: &Path) -> Result<Vec<LogRecord>> {
    let file = File::open(path).at(path)?;
    let mut reader = GzDecoder::new(BufReader::new(file));
    let mut records = Vec::new();

    loop {
        let mut len = [0u8; 2];
        match reader.read_exact(&mut len) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(Error::io(path, e)),
        }

        let mut name = vec![0u8; u16::from_le_bytes(len) as usize];
        reader
            .read_exact(&mut name)
            .map_err(|e| malformed(path, format!("truncated record name: {e}")))?;
        let name = String::from_utf8(name)
            .map_err(|_| malformed(path, "record name is not UTF-8".to_string()))?;

        let mut size = [0u8; 8];
        reader
            .read_exact(&mut size)
            .map_err(|e| malformed(path, format!("truncated length of '{name}': {e}")))?;
        // The length field is untrusted; only allocate what the stream yields.
        let expected = u64::from_le_bytes(size);
        let mut data = Vec::new();
        let read = (&mut reader)
            .take(expected)
            .read_to_end(&mut data)
            .map_err(|e| malformed(path, format!("unreadable payload of '{name}': {e}")))?;
        if read as u64 != expected {
            return Err(malformed(
                path,
                format!("truncated payload of '{name}': {read} of {expected} bytes"),
            ));
        }

        records.push(LogRecord { name, data });
    }

    Ok(records)
}

struct Inventory {
    /// Raw files grouped by source id, each ordered by timestamp.
    sources: BTreeMap<String, Vec<(u64, PathBuf)>>,
    archives: usize,
}

fn take_inventory(directory: &Path) -> Result<Inventory> {
    let mut inventory = Inventory {
        sources: BTreeMap::new(),
        archives: 0,
    };

    for entry in fs::read_dir(directory).at(directory)? {
        let path = entry.at(directory)?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if name.ends_with(ARCHIVE_SUFFIX) {
            inventory.archives += 1;
        } else if name
            .strip_suffix(STAGING_SUFFIX)
            .is_some_and(|staged| staged.ends_with(ARCHIVE_SUFFIX))
        {
            // Left behind by an interrupted run; never committed.
            fs::remove_file(&path).at(&path)?;
        } else if path.extension().is_some_and(|ext| ext == RAW_EXTENSION) {
            let captures = RAW_LOG_NAME
                .captures(name)
                .ok_or_else(|| Error::UnrecognizedLogFile { path: path.clone() })?;
            let timestamp = captures["timestamp"]
                .parse::<u64>()
                .map_err(|_| Error::UnrecognizedLogFile { path: path.clone() })?;
            inventory
                .sources
                .entry(captures["source"].to_string())
                .or_default()
                .push((timestamp, path));
        }
    }

    for files in inventory.sources.values_mut() {
        files.sort();
    }
    Ok(inventory)
}

fn staging_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_owned();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

fn write_archive(staging: &Path, files: &[PathBuf]) -> Result<()> {
    let file = File::create(staging).at(staging)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());

    for path in files {
        let name = record_name(path);
        let data = fs::read(path).at(path)?;
        encoder
            .write_all(&(name.len() as u16).to_le_bytes())
            .at(staging)?;
        encoder.write_all(name.as_bytes()).at(staging)?;
        encoder
            .write_all(&(data.len() as u64).to_le_bytes())
            .at(staging)?;
        encoder.write_all(&data).at(staging)?;
    }

    let writer = encoder.finish().at(staging)?;
    let file = writer
        .into_inner()
        .map_err(|e| Error::io(staging, e.into_error()))?;
    file.sync_all().at(staging)?;
    debug!(archive = %staging.display(), records = files.len(), "Archive staged");
    Ok(())
}

fn verify_archive(staging: &Path, files: &[PathBuf]) -> Result<()> {
    let records = read_archive(staging)?;
    if records.len() != files.len() {
        return Err(malformed(
            staging,
            format!("holds {} records, expected {}", records.len(), files.len()),
        ));
    }

    for (record, path) in records.iter().zip(files) {
        let expected = fs::read(path).at(path)?;
        if record.name != record_name(path) || record.data != expected {
            return Err(malformed(
                staging,
                format!("record '{}' differs from its source", record.name),
            ));
        }
    }
    Ok(())
}

fn record_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn malformed(path: &Path, message: String) -> Error {
    Error::MalformedLogArchive {
        path: path.to_path_buf(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_logs(dir: &Path) {
        fs::write(dir.join("101_000100.npy"), b"first").unwrap();
        fs::write(dir.join("101_20.npy"), b"zero").unwrap();
        fs::write(dir.join("101_000300.npy"), vec![9u8; 2048]).unwrap();
        fs::write(dir.join("051_5.npy"), b"camera").unwrap();
    }

    fn options(verify: bool) -> CompactionOptions {
        CompactionOptions {
            workers: 2,
            verify_integrity: verify,
            remove_sources: true,
        }
    }

    #[tokio::test]
    async fn compacts_one_archive_per_source() {
        let temp = tempdir().unwrap();
        write_logs(temp.path());

        let report = compact(temp.path(), options(true)).await.unwrap();
        assert_eq!(report.archives.len(), 2);
        assert_eq!(report.records, 4);

        let records = read_archive(&archive_path(temp.path(), "101")).unwrap();
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["101_20", "101_000100", "101_000300"]);
        assert_eq!(records[0].data, b"zero");
        assert_eq!(records[2].data.len(), 2048);

        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| !n.ends_with(ARCHIVE_SUFFIX))
            .collect();
        assert!(leftovers.is_empty(), "sources and staging removed: {leftovers:?}");
    }

    #[tokio::test]
    async fn missing_directory_and_no_raw_files_are_noops() {
        let temp = tempdir().unwrap();
        let report = compact(&temp.path().join("absent"), options(false))
            .await
            .unwrap();
        assert!(report.archives.is_empty());

        fs::write(temp.path().join("101_log.gz"), b"").unwrap();
        let report = compact(temp.path(), options(false)).await.unwrap();
        assert!(report.archives.is_empty());
    }

    #[tokio::test]
    async fn mixed_directory_is_refused_untouched() {
        let temp = tempdir().unwrap();
        write_logs(temp.path());
        fs::write(temp.path().join("101_log.gz"), b"existing").unwrap();

        let err = compact(temp.path(), options(false)).await.unwrap_err();
        assert!(matches!(err, Error::MixedLogDirectory { .. }));
        assert_eq!(fs::read(temp.path().join("101_log.gz")).unwrap(), b"existing");
        assert!(temp.path().join("051_5.npy").exists());
    }

    #[tokio::test]
    async fn unparseable_raw_name_is_fatal() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("camera.npy"), b"x").unwrap();
        let err = compact(temp.path(), options(false)).await.unwrap_err();
        assert!(matches!(err, Error::UnrecognizedLogFile { .. }));
    }

    #[test]
    fn truncated_archive_is_reported() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("007_log.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::fast());
        encoder.write_all(&5u16.to_le_bytes()).unwrap();
        encoder.write_all(b"ab").unwrap();
        encoder.finish().unwrap();

        let err = read_archive(&path).unwrap_err();
        assert!(matches!(err, Error::MalformedLogArchive { .. }));
    }

    #[test]
    fn oversized_payload_length_is_reported() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("007_log.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::fast());
        encoder.write_all(&3u16.to_le_bytes()).unwrap();
        encoder.write_all(b"abc").unwrap();
        encoder.write_all(&u64::MAX.to_le_bytes()).unwrap();
        encoder.write_all(b"tiny").unwrap();
        encoder.finish().unwrap();

        let err = read_archive(&path).unwrap_err();
        assert!(matches!(err, Error::MalformedLogArchive { .. }), "{err}");
    }

    #[tokio::test]
    async fn only_staged_archives_are_cleaned_up() {
        let temp = tempdir().unwrap();
        write_logs(temp.path());
        fs::write(temp.path().join("101_log.gz.tmp"), b"stale").unwrap();
        fs::write(temp.path().join("notes.tmp"), b"operator notes").unwrap();

        let report = compact(temp.path(), options(true)).await.unwrap();
        assert_eq!(report.archives.len(), 2);
        assert!(!temp.path().join("101_log.gz.tmp").exists());
        assert_eq!(
            fs::read(temp.path().join("notes.tmp")).unwrap(),
            b"operator notes"
        );
    }
}
