//! Error taxonomy for session preprocessing.
//!
//! Every variant names the offending path or session and, where an operator
//! has to act, says what to do. Errors are grouped by [`ErrorKind`] so callers
//! can decide between retrying, prompting, and aborting.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Broad class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// On-disk state needs manual correction before anything can proceed.
    State,
    /// Data is not available yet; recoverable by waiting or operator action.
    Transient,
    /// Data may have been corrupted. Never retried automatically.
    Integrity,
    /// The instrument output format changed underneath us.
    FormatDrift,
    /// Plain filesystem failure.
    Io,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "log directory {} contains both compressed and uncompressed log files. \
         Back up and remove the existing archives, then rerun preprocessing",
        directory.display()
    )]
    MixedLogDirectory { directory: PathBuf },

    #[error(
        "unrecognized log file {}; expected '<source id>_<timestamp>.npy'",
        path.display()
    )]
    UnrecognizedLogFile { path: PathBuf },

    #[error("log archive {} is malformed: {message}", path.display())]
    MalformedLogArchive { path: PathBuf, message: String },

    #[error(
        "no session snapshot found at {}. The session was likely interrupted before \
         it acquired any data",
        path.display()
    )]
    MissingSnapshot { path: PathBuf },

    #[error("session snapshot {} is malformed: {message}", path.display())]
    MalformedSnapshot { path: PathBuf, message: String },

    #[error("hardware configuration {} is malformed: {message}", path.display())]
    MalformedHardwareConfiguration { path: PathBuf, message: String },

    #[error(
        "unable to create session {session}: none of the storage roots are reachable. \
         Check that the workstation, server, and archive volumes are mounted"
    )]
    NoReachableTier { session: String },

    #[error(
        "session {session} was never initialized by the acquisition runtime and holds no \
         data worth preprocessing. Purge it instead"
    )]
    UninitializedSession { session: String },

    #[error(
        "project {project} does not exist at {}. Create the project before moving subjects into it",
        path.display()
    )]
    MissingProject { project: String, path: PathBuf },

    #[error(
        "subject {subject} in project {project} still has sessions on the workstation that were \
         not pushed: {}. Preprocess them before migrating",
        sessions.join(", ")
    )]
    UnpushedSessions {
        subject: String,
        project: String,
        sessions: Vec<String>,
    },

    #[error("session directory {} already exists; refusing to overwrite it", path.display())]
    SessionExists { path: PathBuf },

    #[error(
        "session {session}: required capture files still missing after {attempts} attempts: {}. \
         Move the files into {} and rerun preprocessing",
        missing.join(", "),
        directory.display()
    )]
    RemoteFilesMissing {
        session: String,
        directory: PathBuf,
        attempts: u32,
        missing: Vec<String>,
    },

    #[error(
        "no checksum sidecar in {}. Seal the directory before transferring it",
        directory.display()
    )]
    MissingChecksum { directory: PathBuf },

    #[error(
        "checksum mismatch after copying {} to {} (expected {expected}, found {actual}). \
         The data was likely corrupted in transit; do not remove the source and \
         inspect the destination before retrying",
        origin.display(),
        destination.display()
    )]
    ChecksumMismatch {
        origin: PathBuf,
        destination: PathBuf,
        expected: String,
        actual: String,
    },

    #[error(
        "recompressed frame {frame} of {} does not match the original. \
         The source stack was left untouched",
        stack.display()
    )]
    RecompressionMismatch { stack: PathBuf, frame: usize },

    #[error(
        "unknown frame metadata key '{key}' in {}. The acquisition software format \
         has changed; teach the transcoder about this key before reprocessing",
        stack.display()
    )]
    UnknownMetadataKey { stack: PathBuf, key: String },

    #[error(
        "unsupported frame metadata key '{key}' in {} carries data ('{value}'). \
         Add parsing support for it before reprocessing",
        stack.display()
    )]
    UnhandledMetadataField {
        stack: PathBuf,
        key: String,
        value: String,
    },

    #[error("malformed value '{value}' for metadata key '{key}' in {}", stack.display())]
    MalformedMetadata {
        stack: PathBuf,
        key: String,
        value: String,
    },

    #[error("invalid image stack {}: {message}", path.display())]
    InvalidStack { path: PathBuf, message: String },

    #[error("TIFF codec error in {}: {source}", path.display())]
    Tiff {
        path: PathBuf,
        #[source]
        source: tiff::TiffError,
    },

    #[error("JSON error in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{stage} worker failed: {message}")]
    Worker { stage: &'static str, message: String },

    #[error("metadata sync failed for session {session}: {message}")]
    MetadataSync { session: String, message: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io { .. } | Error::Worker { .. } | Error::Tiff { .. } | Error::Json { .. } => {
                ErrorKind::Io
            }
            Error::MixedLogDirectory { .. }
            | Error::UnrecognizedLogFile { .. }
            | Error::MissingSnapshot { .. }
            | Error::MalformedSnapshot { .. }
            | Error::MalformedHardwareConfiguration { .. }
            | Error::NoReachableTier { .. }
            | Error::UninitializedSession { .. }
            | Error::MissingProject { .. }
            | Error::UnpushedSessions { .. }
            | Error::SessionExists { .. }
            | Error::MissingChecksum { .. }
            | Error::InvalidStack { .. }
            | Error::MetadataSync { .. } => ErrorKind::State,
            Error::RemoteFilesMissing { .. } => ErrorKind::Transient,
            Error::ChecksumMismatch { .. }
            | Error::RecompressionMismatch { .. }
            | Error::MalformedLogArchive { .. } => ErrorKind::Integrity,
            Error::UnknownMetadataKey { .. }
            | Error::UnhandledMetadataField { .. }
            | Error::MalformedMetadata { .. } => ErrorKind::FormatDrift,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn tiff(path: impl Into<PathBuf>, source: tiff::TiffError) -> Self {
        Error::Tiff {
            path: path.into(),
            source,
        }
    }
}

/// Attach the path an I/O call was operating on.
pub trait IoResultExt<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}
