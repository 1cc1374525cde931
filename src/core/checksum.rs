use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::core::workers;
use crate::error::{Error, IoResultExt, Result};

/// Name of the sidecar file that stores a tree's checksum at its root.
pub const CHECKSUM_FILENAME: &str = "ax_checksum.txt";

/// Read size for streaming file contents into the hasher (1MB)
const HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// Digest of a single file, keyed by its '/'-separated path relative to the tree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub relative_path: String,
    pub hash: [u8; 32],
}

/// Compute the checksum of a directory tree.
///
/// Each file is hashed together with its relative path on a bounded worker
/// pool. The per-file digests are then sorted by path and folded into one
/// BLAKE3 digest, so the result does not depend on enumeration order or on
/// the number of workers. The root sidecar file is never part of the digest.
pub async fn checksum(directory: &Path, workers: usize) -> Result<String> {
    let start = Instant::now();
    let root = directory.to_path_buf();

    let files = {
        let root = root.clone();
        workers::run_blocking("checksum", move || list_files(&root)).await?
    };

    info!(
        directory = %directory.display(),
        files = files.len(),
        workers,
        "Calculating directory checksum"
    );

    let jobs: Vec<_> = files
        .into_iter()
        .map(|relative_path| {
            let root = root.clone();
            move || hash_file(&root, &relative_path)
        })
        .collect();

    let digests = workers::run_all("checksum", workers, jobs).await?;
    let hex = combine(digests);

    debug!(
        directory = %directory.display(),
        checksum = %hex,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Directory checksum complete"
    );

    Ok(hex)
}

/// Compute the checksum and persist it as the tree's sidecar.
pub async fn checksum_and_save(directory: &Path, workers: usize) -> Result<String> {
    let hex = checksum(directory, workers).await?;
    let sidecar = directory.join(CHECKSUM_FILENAME);
    fs::write(&sidecar, &hex).at(&sidecar)?;
    info!(directory = %directory.display(), checksum = %hex, "Checksum sealed");
    Ok(hex)
}

/// Read the checksum recorded in a tree's sidecar.
pub fn read_sidecar(directory: &Path) -> Result<String> {
    let sidecar = directory.join(CHECKSUM_FILENAME);
    match fs::read_to_string(&sidecar) {
        Ok(content) => Ok(content.lines().next().unwrap_or("").trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::MissingChecksum {
            directory: directory.to_path_buf(),
        }),
        Err(e) => Err(Error::io(sidecar, e)),
    }
}

/// Recompute the checksum of `destination` and compare it with the sidecar
/// recorded at `origin`. Returns the verified checksum.
pub async fn verify_against_sidecar(
    origin: &Path,
    destination: &Path,
    workers: usize,
) -> Result<String> {
    let expected = read_sidecar(origin)?;
    let actual = checksum(destination, workers).await?;

    if expected != actual {
        warn!(
            origin = %origin.display(),
            destination = %destination.display(),
            expected = %expected,
            actual = %actual,
            "Checksum verification failed"
        );
        return Err(Error::ChecksumMismatch {
            origin: origin.to_path_buf(),
            destination: destination.to_path_buf(),
            expected,
            actual,
        });
    }

    Ok(actual)
}

/// Fold per-file digests into the tree digest. Input order does not matter.
pub fn combine(mut digests: Vec<FileDigest>) -> String {
    digests.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    let mut hasher = blake3::Hasher::new();
    for digest in &digests {
        hasher.update(digest.relative_path.as_bytes());
        hasher.update(&digest.hash);
    }
    hasher.finalize().to_hex().to_string()
}

/// Hash a file's relative path followed by its contents, streaming in chunks.
fn hash_file(root: &Path, relative: &Path) -> Result<FileDigest> {
    let relative_path = to_slash_path(relative);
    let path = root.join(relative);

    let mut file = fs::File::open(&path).at(&path)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(relative_path.as_bytes());

    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let bytes_read = file.read(&mut buffer).at(&path)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(FileDigest {
        relative_path,
        hash: *hasher.finalize().as_bytes(),
    })
}

/// Render a relative path with '/' separators regardless of platform.
pub(crate) fn to_slash_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// List every regular file under `root` as a path relative to it, skipping
/// symlinks and the root sidecar.
fn list_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    list_files_recursive(root, root, &mut files)?;
    Ok(files)
}

fn list_files_recursive(base: &Path, current: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(current).at(current)? {
        let entry = entry.at(current)?;
        let path = entry.path();
        let metadata = path.symlink_metadata().at(&path)?;

        if metadata.is_dir() {
            list_files_recursive(base, &path, files)?;
        } else if metadata.is_file() {
            let relative = path
                .strip_prefix(base)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| path.clone());
            if relative.as_os_str() == CHECKSUM_FILENAME {
                continue;
            }
            files.push(relative);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("top.bin"), b"top level").unwrap();
        fs::write(root.join("a/one.txt"), b"one").unwrap();
        fs::write(root.join("a/b/two.dat"), vec![7u8; 4096]).unwrap();
    }

    fn digest(path: &str, content: &[u8]) -> FileDigest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(path.as_bytes());
        hasher.update(content);
        FileDigest {
            relative_path: path.to_string(),
            hash: *hasher.finalize().as_bytes(),
        }
    }

    #[test]
    fn combine_ignores_input_order() {
        let a = digest("a/one.txt", b"one");
        let b = digest("a/b/two.dat", b"two");
        let c = digest("top.bin", b"top");

        let forward = combine(vec![a.clone(), b.clone(), c.clone()]);
        let reversed = combine(vec![c.clone(), b.clone(), a.clone()]);
        let shuffled = combine(vec![b, c, a]);

        assert_eq!(forward, reversed);
        assert_eq!(forward, shuffled);
    }

    #[tokio::test]
    async fn checksum_independent_of_worker_count() {
        let temp = tempdir().unwrap();
        populate(temp.path());

        let single = checksum(temp.path(), 1).await.unwrap();
        let many = checksum(temp.path(), 8).await.unwrap();
        assert_eq!(single, many);
        assert_eq!(single.len(), 64);
    }

    #[tokio::test]
    async fn checksum_covers_paths_not_just_content() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        fs::write(first.path().join("x.bin"), b"same").unwrap();
        fs::write(second.path().join("y.bin"), b"same").unwrap();

        let a = checksum(first.path(), 2).await.unwrap();
        let b = checksum(second.path(), 2).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn sidecar_is_excluded_from_digest() {
        let temp = tempdir().unwrap();
        populate(temp.path());

        let before = checksum(temp.path(), 2).await.unwrap();
        let saved = checksum_and_save(temp.path(), 2).await.unwrap();
        let after = checksum(temp.path(), 2).await.unwrap();

        assert_eq!(before, saved);
        assert_eq!(before, after);
        assert_eq!(read_sidecar(temp.path()).unwrap(), saved);
    }

    #[tokio::test]
    async fn nested_sidecar_is_ordinary_data() {
        let temp = tempdir().unwrap();
        populate(temp.path());
        let before = checksum(temp.path(), 2).await.unwrap();

        fs::write(temp.path().join("a").join(CHECKSUM_FILENAME), b"abc").unwrap();
        let after = checksum(temp.path(), 2).await.unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn read_sidecar_missing_is_state_error() {
        let temp = tempdir().unwrap();
        let err = read_sidecar(temp.path()).unwrap_err();
        assert!(matches!(err, Error::MissingChecksum { .. }));
    }

    #[tokio::test]
    async fn verify_detects_single_byte_change() {
        let origin = tempdir().unwrap();
        let copy = tempdir().unwrap();
        populate(origin.path());
        populate(copy.path());
        checksum_and_save(origin.path(), 4).await.unwrap();

        verify_against_sidecar(origin.path(), copy.path(), 4)
            .await
            .unwrap();

        let mut data = fs::read(copy.path().join("a/b/two.dat")).unwrap();
        data[100] ^= 0x01;
        fs::write(copy.path().join("a/b/two.dat"), data).unwrap();

        let err = verify_against_sidecar(origin.path(), copy.path(), 4)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn empty_directory_has_stable_checksum() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        assert_eq!(
            checksum(a.path(), 1).await.unwrap(),
            checksum(b.path(), 3).await.unwrap()
        );
    }
}
