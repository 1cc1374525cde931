//! Lossless recompression of the mesoscope frame stacks pulled from the
//! capture PC, plus extraction of their metadata.
//!
//! Stacks in a directory are treated as one continuous acquisition: each gets
//! a contiguous slice of global frame numbers starting at 1, in the order given
//! by the numeric groups at the end of its file name.

mod invariant;
mod metadata;
mod stack;

pub use invariant::{FrameInvariantMetadata, OpsConfig, Roi, RoiGeometry};
pub use metadata::{FrameKey, FrameVariantMetadata, is_frame_description, parse_epoch};
pub use stack::StackProbe;

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, info, warn};

use crate::core::workers;
use crate::error::{Error, IoResultExt, Result};

pub const FRAME_INVARIANT_FILENAME: &str = "frame_invariant_metadata.json";
pub const FRAME_VARIANT_FILENAME: &str = "frame_variant_metadata.json.gz";
pub const OPS_FILENAME: &str = "ops.json";

pub const MOTION_ESTIMATOR_FILENAME: &str = "MotionEstimator.me";
pub const FOV_FILENAME: &str = "fov.roi";
pub const ZSTACK_FILENAME: &str = "zstack_00000_00001.tif";
/// Name of the reference z-stack once relocated into the output directory.
pub const ZSTACK_OUTPUT_FILENAME: &str = "zstack.tiff";

/// Prefix shared by reference z-stacks, which are never transcoded.
const ZSTACK_PREFIX: &str = "zstack";

#[derive(Debug, Clone, Copy)]
pub struct TranscodeOptions {
    pub workers: usize,
    /// Frames held in memory per stack at a time.
    pub batch_size: usize,
    /// Re-read every written stack and compare it with its source.
    pub verify_integrity: bool,
    /// Remove the input directory once everything succeeded.
    pub remove_sources: bool,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 250,
            verify_integrity: true,
            remove_sources: true,
        }
    }
}

/// A stack's position in the session-wide frame sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackRange {
    pub source: PathBuf,
    pub pages: usize,
    pub first_frame: usize,
    pub last_frame: usize,
}

impl StackRange {
    pub fn output_name(&self) -> String {
        format!("mesoscope_{:06}_{:06}.tiff", self.first_frame, self.last_frame)
    }
}

#[derive(Debug, Default)]
pub struct TranscodeReport {
    pub stacks: Vec<StackRange>,
    pub frames: usize,
}

/// Sort key of a stack file: the name before the trailing numeric groups, then
/// those groups as numbers. `None` if the stem has no trailing `_<digits>`.
pub fn stack_sort_key(path: &Path) -> Option<(String, Vec<u64>)> {
    let stem = path.file_stem()?.to_str()?;
    let mut groups = Vec::new();
    let mut rest = stem;

    while let Some((head, tail)) = rest.rsplit_once('_') {
        if tail.is_empty() || !tail.bytes().all(|b| b.is_ascii_digit()) {
            break;
        }
        groups.push(tail.parse::<u64>().ok()?);
        rest = head;
    }

    if groups.is_empty() {
        return None;
    }
    groups.reverse();
    Some((rest.to_string(), groups))
}

/// Assign global frame ranges to already ordered stacks.
pub fn assign_ranges(stacks: Vec<StackProbe>) -> Vec<StackRange> {
    let mut next = 1;
    stacks
        .into_iter()
        .map(|probe| {
            let range = StackRange {
                source: probe.path,
                pages: probe.pages,
                first_frame: next,
                last_frame: next + probe.pages - 1,
            };
            next += probe.pages;
            range
        })
        .collect()
}

/// Transcode every frame stack in `input` into `output`.
///
/// Nothing is committed unless every stack succeeds: on failure the files
/// written by this run are removed and `input` is left untouched.
pub async fn transcode_directory(
    input: &Path,
    output: &Path,
    options: TranscodeOptions,
) -> Result<TranscodeReport> {
    if !input.exists() {
        debug!(input = %input.display(), "Nothing to transcode");
        return Ok(TranscodeReport::default());
    }

    let start = Instant::now();
    fs::create_dir_all(output).at(output)?;

    let candidates = {
        let input = input.to_path_buf();
        workers::run_blocking("transcode", move || list_candidates(&input)).await?
    };
    let probe_jobs: Vec<_> = candidates
        .into_iter()
        .map(|path| move || stack::probe(&path))
        .collect();
    let stacks: Vec<StackProbe> = workers::run_all("transcode", options.workers, probe_jobs)
        .await?
        .into_iter()
        .flatten()
        .collect();

    let ranges = assign_ranges(stacks);
    let frames = ranges.last().map_or(0, |r| r.last_frame);
    info!(
        input = %input.display(),
        stacks = ranges.len(),
        frames,
        workers = options.workers,
        "Transcoding frame stacks"
    );

    let mut written: Vec<PathBuf> = ranges
        .iter()
        .map(|range| output.join(range.output_name()))
        .collect();
    written.extend(
        [FRAME_INVARIANT_FILENAME, OPS_FILENAME, FRAME_VARIANT_FILENAME]
            .iter()
            .map(|name| output.join(name)),
    );

    if let Err(e) = transcode_stacks(&ranges, output, options).await {
        warn!(input = %input.display(), error = %e, "Transcoding failed, removing partial output");
        for path in &written {
            if let Err(cleanup) = fs::remove_file(path)
                && cleanup.kind() != ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %cleanup, "Failed to remove partial output");
            }
        }
        return Err(e);
    }

    relocate_references(input, output)?;

    if options.remove_sources {
        fs::remove_dir_all(input).at(input)?;
        debug!(input = %input.display(), "Removed transcoded sources");
    }

    info!(
        output = %output.display(),
        stacks = ranges.len(),
        frames,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Transcoding complete"
    );

    Ok(TranscodeReport {
        stacks: ranges,
        frames,
    })
}

/// Read back the merged per-frame metadata archive.
pub fn read_frame_variant_metadata(path: &Path) -> Result<FrameVariantMetadata> {
    let file = File::open(path).at(path)?;
    serde_json::from_reader(GzDecoder::new(BufReader::new(file))).map_err(|e| Error::Json {
        path: path.to_path_buf(),
        source: e,
    })
}

async fn transcode_stacks(
    ranges: &[StackRange],
    output: &Path,
    options: TranscodeOptions,
) -> Result<()> {
    let Some(first) = ranges.first() else {
        return Ok(());
    };

    {
        let first = first.source.clone();
        let output = output.to_path_buf();
        workers::run_blocking("transcode", move || write_invariant(&first, &output)).await?;
    }

    let jobs: Vec<_> = ranges
        .iter()
        .map(|range| {
            let source = range.source.clone();
            let target = output.join(range.output_name());
            let pages = range.pages;
            move || {
                let metadata = stack::recompress(&source, &target, pages, options.batch_size)?;
                if options.verify_integrity {
                    stack::verify(&source, &target, pages, options.batch_size)?;
                }
                debug!(stack = %source.display(), output = %target.display(), "Stack transcoded");
                Ok(metadata)
            }
        })
        .collect();

    let per_stack = workers::run_all("transcode", options.workers, jobs).await?;

    let mut merged = FrameVariantMetadata::default();
    for metadata in per_stack {
        merged.extend(metadata);
    }

    let archive = output.join(FRAME_VARIANT_FILENAME);
    workers::run_blocking("transcode", move || write_frame_variant(&archive, &merged)).await
}

fn write_invariant(first_stack: &Path, output: &Path) -> Result<()> {
    let (invariant, rows) = stack::read_invariant(first_stack)?;
    let ops = invariant.ops(first_stack, rows)?;
    write_json(&output.join(FRAME_INVARIANT_FILENAME), &invariant)?;
    write_json(&output.join(OPS_FILENAME), &ops)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).at(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value).map_err(|e| Error::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    writer.flush().at(path)
}

fn write_frame_variant(path: &Path, metadata: &FrameVariantMetadata) -> Result<()> {
    let file = File::create(path).at(path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    serde_json::to_writer(&mut encoder, metadata).map_err(|e| Error::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    encoder.finish().at(path)?.flush().at(path)
}

/// Frame stack candidates in acquisition order.
fn list_candidates(input: &Path) -> Result<Vec<PathBuf>> {
    let mut candidates = Vec::new();
    for entry in fs::read_dir(input).at(input)? {
        let path = entry.at(input)?.path();
        if !path.is_file() {
            continue;
        }
        let is_tiff = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"));
        let is_reference = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(ZSTACK_PREFIX));
        if !is_tiff || is_reference {
            continue;
        }
        match stack_sort_key(&path) {
            Some(key) => candidates.push((key, path)),
            None => debug!(path = %path.display(), "No numeric suffix, not a frame stack"),
        }
    }

    candidates.sort();
    Ok(candidates.into_iter().map(|(_, path)| path).collect())
}

/// Copy the motion reference, the field-of-view calibration and the reference
/// z-stack into the output directory, when the capture provided them.
fn relocate_references(input: &Path, output: &Path) -> Result<()> {
    for (name, target) in [
        (MOTION_ESTIMATOR_FILENAME, MOTION_ESTIMATOR_FILENAME),
        (FOV_FILENAME, FOV_FILENAME),
        (ZSTACK_FILENAME, ZSTACK_OUTPUT_FILENAME),
    ] {
        let source = input.join(name);
        if source.is_file() {
            let destination = output.join(target);
            fs::copy(&source, &destination).at(&destination)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_key_uses_all_trailing_groups() {
        let key = stack_sort_key(Path::new("Tyche-A7_2022_01_25_1_00001_00067.tif")).unwrap();
        assert_eq!(key.0, "Tyche-A7");
        assert_eq!(key.1, [2022, 1, 25, 1, 1, 67]);

        assert!(stack_sort_key(Path::new("session.tif")).is_none());
        assert!(stack_sort_key(Path::new("session_final.tif")).is_none());
    }

    #[test]
    fn numeric_order_beats_lexical_order() {
        let mut paths = vec![
            PathBuf::from("session_1_10.tif"),
            PathBuf::from("session_1_9.tif"),
            PathBuf::from("session_2_1.tif"),
        ];
        paths.sort_by_key(|p| stack_sort_key(p));
        assert_eq!(
            paths,
            [
                PathBuf::from("session_1_9.tif"),
                PathBuf::from("session_1_10.tif"),
                PathBuf::from("session_2_1.tif"),
            ]
        );
    }

    #[test]
    fn ranges_are_contiguous_from_one() {
        let probes = [10, 15, 7]
            .into_iter()
            .enumerate()
            .map(|(i, pages)| StackProbe {
                path: PathBuf::from(format!("session_{:05}.tif", i + 1)),
                pages,
            })
            .collect();

        let ranges = assign_ranges(probes);
        let spans: Vec<_> = ranges.iter().map(|r| (r.first_frame, r.last_frame)).collect();
        assert_eq!(spans, [(1, 10), (11, 25), (26, 32)]);
        assert_eq!(ranges[1].output_name(), "mesoscope_000011_000025.tiff");
    }
}
