//! Per-frame metadata carried in every page's ImageDescription.
//!
//! The acquisition software writes one `key = value` line per field. The set
//! of keys is closed: anything unrecognised means the instrument format moved
//! and processing must stop rather than silently drop data.

use std::path::Path;

use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Every key the frame metadata block may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKey {
    FrameNumbers,
    AcquisitionNumbers,
    FrameNumberAcquisition,
    EndOfAcquisition,
    EndOfAcquisitionMode,
    DcOverVoltage,
    FrameTimestamps,
    AcqTriggerTimestamps,
    NextFileMarkerTimestamps,
    Epoch,
    /// Known fields without parsing support. They must stay empty.
    Auxiliary,
}

impl FrameKey {
    pub fn parse(key: &str) -> Option<Self> {
        Some(match key {
            "frameNumbers" => Self::FrameNumbers,
            "acquisitionNumbers" => Self::AcquisitionNumbers,
            "frameNumberAcquisition" => Self::FrameNumberAcquisition,
            "endOfAcquisition" => Self::EndOfAcquisition,
            "endOfAcquisitionMode" => Self::EndOfAcquisitionMode,
            "dcOverVoltage" => Self::DcOverVoltage,
            "frameTimestamps_sec" => Self::FrameTimestamps,
            "acqTriggerTimestamps_sec" => Self::AcqTriggerTimestamps,
            "nextFileMarkerTimestamps_sec" => Self::NextFileMarkerTimestamps,
            "epoch" => Self::Epoch,
            "auxTrigger0" | "auxTrigger1" | "auxTrigger2" | "auxTrigger3" | "I2CData" => {
                Self::Auxiliary
            }
            _ => return None,
        })
    }
}

/// Longest value an auxiliary field may hold and still count as empty (`[]`).
const TRIVIAL_VALUE_LEN: usize = 2;

/// Column-oriented per-frame metadata for one or more stacks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameVariantMetadata {
    #[serde(rename = "frameNumbers")]
    pub frame_numbers: Vec<i32>,
    #[serde(rename = "acquisitionNumbers")]
    pub acquisition_numbers: Vec<i32>,
    #[serde(rename = "frameNumberAcquisition")]
    pub frame_number_acquisition: Vec<i32>,
    #[serde(rename = "endOfAcquisition")]
    pub end_of_acquisition: Vec<i32>,
    #[serde(rename = "endOfAcquisitionMode")]
    pub end_of_acquisition_mode: Vec<i32>,
    #[serde(rename = "dcOverVoltage")]
    pub dc_over_voltage: Vec<i32>,
    #[serde(rename = "frameTimestamps_sec")]
    pub frame_timestamps_sec: Vec<f64>,
    #[serde(rename = "acqTriggerTimestamps_sec")]
    pub acq_trigger_timestamps_sec: Vec<f64>,
    #[serde(rename = "nextFileMarkerTimestamps_sec")]
    pub next_file_marker_timestamps_sec: Vec<f64>,
    /// Frame acquisition time as microseconds since the UNIX epoch (UTC).
    #[serde(rename = "epochTimestamps_us")]
    pub epoch_timestamps_us: Vec<u64>,
}

impl FrameVariantMetadata {
    /// Zero-filled columns for `frames` frames.
    pub fn with_frames(frames: usize) -> Self {
        Self {
            frame_numbers: vec![0; frames],
            acquisition_numbers: vec![0; frames],
            frame_number_acquisition: vec![0; frames],
            end_of_acquisition: vec![0; frames],
            end_of_acquisition_mode: vec![0; frames],
            dc_over_voltage: vec![0; frames],
            frame_timestamps_sec: vec![0.0; frames],
            acq_trigger_timestamps_sec: vec![0.0; frames],
            next_file_marker_timestamps_sec: vec![0.0; frames],
            epoch_timestamps_us: vec![0; frames],
        }
    }

    pub fn len(&self) -> usize {
        self.frame_numbers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_numbers.is_empty()
    }

    /// Append another stack's columns after this one's.
    pub fn extend(&mut self, other: FrameVariantMetadata) {
        self.frame_numbers.extend(other.frame_numbers);
        self.acquisition_numbers.extend(other.acquisition_numbers);
        self.frame_number_acquisition
            .extend(other.frame_number_acquisition);
        self.end_of_acquisition.extend(other.end_of_acquisition);
        self.end_of_acquisition_mode
            .extend(other.end_of_acquisition_mode);
        self.dc_over_voltage.extend(other.dc_over_voltage);
        self.frame_timestamps_sec.extend(other.frame_timestamps_sec);
        self.acq_trigger_timestamps_sec
            .extend(other.acq_trigger_timestamps_sec);
        self.next_file_marker_timestamps_sec
            .extend(other.next_file_marker_timestamps_sec);
        self.epoch_timestamps_us.extend(other.epoch_timestamps_us);
    }

    /// Parse one page's description block into row `frame`.
    pub fn record(&mut self, stack: &Path, frame: usize, description: &str) -> Result<()> {
        for line in description.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() {
                continue;
            }

            let Some(parsed) = FrameKey::parse(key) else {
                return Err(Error::UnknownMetadataKey {
                    stack: stack.to_path_buf(),
                    key: key.to_string(),
                });
            };

            match parsed {
                FrameKey::FrameNumbers => self.frame_numbers[frame] = int(stack, key, value)?,
                FrameKey::AcquisitionNumbers => {
                    self.acquisition_numbers[frame] = int(stack, key, value)?
                }
                FrameKey::FrameNumberAcquisition => {
                    self.frame_number_acquisition[frame] = int(stack, key, value)?
                }
                FrameKey::EndOfAcquisition => {
                    self.end_of_acquisition[frame] = int(stack, key, value)?
                }
                FrameKey::EndOfAcquisitionMode => {
                    self.end_of_acquisition_mode[frame] = int(stack, key, value)?
                }
                FrameKey::DcOverVoltage => self.dc_over_voltage[frame] = int(stack, key, value)?,
                FrameKey::FrameTimestamps => {
                    self.frame_timestamps_sec[frame] = float(stack, key, value)?
                }
                FrameKey::AcqTriggerTimestamps => {
                    self.acq_trigger_timestamps_sec[frame] = float(stack, key, value)?
                }
                FrameKey::NextFileMarkerTimestamps => {
                    self.next_file_marker_timestamps_sec[frame] = float(stack, key, value)?
                }
                FrameKey::Epoch => self.epoch_timestamps_us[frame] = parse_epoch(stack, value)?,
                FrameKey::Auxiliary => {
                    if value.len() > TRIVIAL_VALUE_LEN {
                        return Err(Error::UnhandledMetadataField {
                            stack: stack.to_path_buf(),
                            key: key.to_string(),
                            value: value.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// True if a description looks like a frame metadata block.
pub fn is_frame_description(description: &str) -> bool {
    description
        .lines()
        .filter_map(|line| line.split_once('='))
        .any(|(key, _)| key.trim() == "frameNumbers")
}

/// Convert `[Y M D h m s.ffffff]` into microseconds since the UNIX epoch.
/// The acquisition clock is taken to be UTC.
pub fn parse_epoch(stack: &Path, value: &str) -> Result<u64> {
    let malformed = || Error::MalformedMetadata {
        stack: stack.to_path_buf(),
        key: "epoch".to_string(),
        value: value.to_string(),
    };

    let inner = value
        .trim()
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .ok_or_else(malformed)?;
    let parts: Vec<f64> = inner
        .split_whitespace()
        .map(str::parse::<f64>)
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| malformed())?;
    let [year, month, day, hour, minute, seconds] = parts[..] else {
        return Err(malformed());
    };

    let whole_seconds = seconds.trunc();
    let micros = ((seconds - whole_seconds) * 1_000_000.0).round() as u32;
    let datetime = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .and_then(|date| {
            date.and_hms_micro_opt(hour as u32, minute as u32, whole_seconds as u32, micros)
        })
        .ok_or_else(malformed)?;

    u64::try_from(Utc.from_utc_datetime(&datetime).timestamp_micros()).map_err(|_| malformed())
}

fn int(stack: &Path, key: &str, value: &str) -> Result<i32> {
    value.parse::<i32>().map_err(|_| Error::MalformedMetadata {
        stack: stack.to_path_buf(),
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn float(stack: &Path, key: &str, value: &str) -> Result<f64> {
    value.parse::<f64>().map_err(|_| Error::MalformedMetadata {
        stack: stack.to_path_buf(),
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTION: &str = "frameNumbers = 7\n\
        acquisitionNumbers = 1\n\
        frameNumberAcquisition = 7\n\
        frameTimestamps_sec = 0.216450\n\
        acqTriggerTimestamps_sec = -1.000000\n\
        nextFileMarkerTimestamps_sec = -1.000000\n\
        endOfAcquisition = 0\n\
        endOfAcquisitionMode = 0\n\
        dcOverVoltage = 0\n\
        epoch = [2024 3 1 12 30 5.250000]\n\
        auxTrigger0 = []\n\
        auxTrigger1 = []\n\
        auxTrigger2 = []\n\
        auxTrigger3 = []\n\
        I2CData = {}\n";

    fn stack() -> &'static Path {
        Path::new("/raw/session_00001_00001.tif")
    }

    #[test]
    fn parses_full_block() {
        let mut meta = FrameVariantMetadata::with_frames(2);
        meta.record(stack(), 1, DESCRIPTION).unwrap();

        assert_eq!(meta.frame_numbers, [0, 7]);
        assert_eq!(meta.acquisition_numbers[1], 1);
        assert_eq!(meta.frame_timestamps_sec[1], 0.21645);
        assert_eq!(meta.acq_trigger_timestamps_sec[1], -1.0);
        // 2024-03-01T12:30:05.25Z
        assert_eq!(meta.epoch_timestamps_us[1], 1_709_296_205_250_000);
    }

    #[test]
    fn skips_lines_without_key() {
        let mut meta = FrameVariantMetadata::with_frames(1);
        meta.record(stack(), 0, "no separator here\n = 5\nframeNumbers = 3")
            .unwrap();
        assert_eq!(meta.frame_numbers, [3]);
    }

    #[test]
    fn unknown_key_is_format_drift() {
        let mut meta = FrameVariantMetadata::with_frames(1);
        let err = meta.record(stack(), 0, "newCounter = 4").unwrap_err();
        assert!(matches!(err, Error::UnknownMetadataKey { ref key, .. } if key == "newCounter"));
    }

    #[test]
    fn populated_auxiliary_field_is_fatal() {
        let mut meta = FrameVariantMetadata::with_frames(1);
        let err = meta
            .record(stack(), 0, "auxTrigger2 = [0.125 0.250]")
            .unwrap_err();
        assert!(matches!(err, Error::UnhandledMetadataField { .. }));
    }

    #[test]
    fn malformed_values_are_reported() {
        let mut meta = FrameVariantMetadata::with_frames(1);
        assert!(matches!(
            meta.record(stack(), 0, "frameNumbers = seven").unwrap_err(),
            Error::MalformedMetadata { .. }
        ));
        assert!(parse_epoch(stack(), "[2024 3 1 12 30]").is_err());
        assert!(parse_epoch(stack(), "2024 3 1 12 30 5").is_err());
    }

    #[test]
    fn extend_concatenates_in_order() {
        let mut first = FrameVariantMetadata::with_frames(2);
        first.frame_numbers = vec![1, 2];
        let mut second = FrameVariantMetadata::with_frames(1);
        second.frame_numbers = vec![3];

        first.extend(second);
        assert_eq!(first.frame_numbers, [1, 2, 3]);
        assert_eq!(first.len(), 3);
        assert_eq!(first.epoch_timestamps_us.len(), 3);
    }

    #[test]
    fn recognises_frame_descriptions() {
        assert!(is_frame_description(DESCRIPTION));
        assert!(!is_frame_description("ImageJ=1.53\nimages=10"));
    }
}
