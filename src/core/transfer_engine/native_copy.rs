use std::fs::{self, File};
use std::future::Future;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{Instrument, debug, info, info_span};

use crate::core::checksum;
use crate::core::transfer_engine::{TransferEngine, TransferRequest, TransferResult};
use crate::core::workers;
use crate::error::{Error, IoResultExt, Result};
use crate::logging::LogThrottle;

/// Buffer size for file I/O operations (128KB)
const BUFFER_SIZE: usize = 128 * 1024;

/// Minimum gap between copy progress events
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Parallel file copy followed by checksum verification of the destination.
///
/// Permissions and timestamps are carried over. Files already present at the
/// destination are overwritten; nothing is ever removed from the source.
pub struct NativeCopyEngine {
    /// Whether to fsync each file after writing (safer but slower)
    pub sync_files: bool,
    /// Concurrent file copies per transfer
    pub workers: usize,
    /// Hashing workers used when verifying the destination
    pub checksum_workers: usize,
}

impl Default for NativeCopyEngine {
    fn default() -> Self {
        Self {
            sync_files: true,
            workers: 8,
            checksum_workers: 8,
        }
    }
}

impl TransferEngine for NativeCopyEngine {
    fn transfer(
        &self,
        req: &TransferRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransferResult>> + Send>> {
        let source = req.source.clone();
        let destination = req.destination.clone();
        let sync_files = self.sync_files;
        let copy_workers = self.workers;
        let checksum_workers = self.checksum_workers;

        let span = info_span!(
            "native_copy",
            source = %source.display(),
            destination = %destination.display()
        );

        Box::pin(
            async move {
                // Fail before touching the destination if the source was never sealed.
                checksum::read_sidecar(&source)?;

                info!("Starting verified copy");
                let start_time = Instant::now();

                let scan = scan_directory(&source).await?;
                info!(
                    total_files = scan.files.len(),
                    total_bytes = scan.total_bytes,
                    total_dirs = scan.directories.len(),
                    "Scan complete"
                );

                create_directory_structure(&source, &destination, scan.directories).await?;

                let files = scan.files.len();
                let bytes_copied = copy_files(
                    &source,
                    &destination,
                    scan.files,
                    scan.total_bytes,
                    sync_files,
                    copy_workers,
                )
                .await?;

                let checksum =
                    checksum::verify_against_sidecar(&source, &destination, checksum_workers)
                        .await?;

                let duration_secs = start_time.elapsed().as_secs();
                let speed_mbps = if duration_secs > 0 {
                    bytes_copied as f64 / (1024.0 * 1024.0) / duration_secs as f64
                } else {
                    0.0
                };

                info!(
                    total_bytes = bytes_copied,
                    duration_secs,
                    speed_mbps = format!("{:.2}", speed_mbps),
                    checksum = %checksum,
                    "Verified copy complete"
                );

                Ok(TransferResult {
                    destination,
                    files,
                    total_bytes: bytes_copied,
                    duration_secs,
                    checksum,
                })
            }
            .instrument(span),
        )
    }
}

struct ScanResult {
    /// Files as paths relative to the source root
    files: Vec<FileInfo>,
    /// Directories relative to the source root
    directories: Vec<PathBuf>,
    total_bytes: u64,
}

#[derive(Clone)]
struct FileInfo {
    relative: PathBuf,
    size: u64,
}

async fn scan_directory(source: &Path) -> Result<ScanResult> {
    let source = source.to_path_buf();

    workers::run_blocking("transfer", move || {
        let mut scan = ScanResult {
            files: Vec::new(),
            directories: Vec::new(),
            total_bytes: 0,
        };
        scan_directory_recursive(&source, &source, &mut scan)?;
        Ok(scan)
    })
    .await
}

fn scan_directory_recursive(base: &Path, current: &Path, scan: &mut ScanResult) -> Result<()> {
    for entry in fs::read_dir(current).at(current)? {
        let entry = entry.at(current)?;
        let path = entry.path();

        // Use symlink_metadata to avoid following symlinks
        let metadata = path.symlink_metadata().at(&path)?;
        let relative = match path.strip_prefix(base) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => continue,
        };

        if metadata.is_dir() {
            scan.directories.push(relative);
            scan_directory_recursive(base, &path, scan)?;
        } else if metadata.is_file() {
            scan.total_bytes += metadata.len();
            scan.files.push(FileInfo {
                relative,
                size: metadata.len(),
            });
        }
        // Skip symlinks and other special files
    }

    Ok(())
}

/// Create the destination tree shallow-to-deep, mirroring directory permissions.
async fn create_directory_structure(
    source: &Path,
    destination: &Path,
    mut directories: Vec<PathBuf>,
) -> Result<()> {
    let source = source.to_path_buf();
    let destination = destination.to_path_buf();

    workers::run_blocking("transfer", move || {
        directories.sort_by_key(|d| d.components().count());

        fs::create_dir_all(&destination).at(&destination)?;
        for relative in &directories {
            let dest_dir = destination.join(relative);
            let permissions = fs::metadata(source.join(relative))
                .at(&source.join(relative))?
                .permissions();

            fs::create_dir_all(&dest_dir).at(&dest_dir)?;
            fs::set_permissions(&dest_dir, permissions).at(&dest_dir)?;
        }
        Ok(())
    })
    .await
}

async fn copy_files(
    source: &Path,
    destination: &Path,
    files: Vec<FileInfo>,
    total_bytes: u64,
    sync_files: bool,
    limit: usize,
) -> Result<u64> {
    let copied = Arc::new(AtomicU64::new(0));
    let throttle = Arc::new(LogThrottle::new(PROGRESS_INTERVAL));

    let jobs: Vec<_> = files
        .into_iter()
        .map(|file| {
            let from = source.join(&file.relative);
            let to = destination.join(&file.relative);
            let copied = copied.clone();
            let throttle = throttle.clone();
            move || {
                debug!(file = %file.relative.display(), size = file.size, "Copying file");
                let written = copy_single_file(&from, &to, sync_files)?;
                let so_far = copied.fetch_add(written, Ordering::Relaxed) + written;
                if throttle.should_log() {
                    let percentage = if total_bytes > 0 {
                        ((so_far as f64 / total_bytes as f64) * 100.0) as u8
                    } else {
                        100
                    };
                    info!(bytes_copied = so_far, total_bytes, percentage, "Copy progress");
                }
                Ok(written)
            }
        })
        .collect();

    let written = workers::run_all("transfer", limit, jobs).await?;
    Ok(written.into_iter().sum())
}

/// Copy a single file with metadata preservation
fn copy_single_file(source: &Path, dest: &Path, sync_file: bool) -> Result<u64> {
    let source_metadata = fs::metadata(source).at(source)?;

    let source_file = File::open(source).at(source)?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);

    let dest_file = File::create(dest).at(dest)?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest_file);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_written: u64 = 0;

    loop {
        let bytes_read = reader.read(&mut buffer).at(source)?;
        if bytes_read == 0 {
            break;
        }
        writer.write_all(&buffer[..bytes_read]).at(dest)?;
        bytes_written += bytes_read as u64;
    }

    writer.flush().at(dest)?;

    if sync_file {
        let inner = writer
            .into_inner()
            .map_err(|e| Error::io(dest, e.into_error()))?;
        inner.sync_all().at(dest)?;
    }

    // Permission or timestamp failures are tolerated on filesystems that lack support.
    if let Err(e) = fs::set_permissions(dest, source_metadata.permissions()) {
        debug!(dest = %dest.display(), error = %e, "Failed to set file permissions");
    }

    let atime = filetime::FileTime::from_last_access_time(&source_metadata);
    let mtime = filetime::FileTime::from_last_modification_time(&source_metadata);
    if let Err(e) = filetime::set_file_times(dest, atime, mtime) {
        debug!(dest = %dest.display(), error = %e, "Failed to preserve file timestamps");
    }

    Ok(bytes_written)
}
