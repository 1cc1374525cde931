//! Acquisition-wide parameters and the ROI geometry derived from them.
//!
//! The first page of the first stack carries two documents: the `Software`
//! tag with one `SI.<path> = <value>` line per scanner setting, and the
//! `Artist` tag with the ROI definitions as JSON.

use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

const FRAME_RATE_KEY: &str = "SI.hRoiManager.scanVolumeRate";
const PLANE_COUNT_KEY: &str = "SI.hStackManager.actualNumSlices";
const ACTIVE_CHANNELS_KEY: &str = "SI.hChannels.channelsActive";

/// Contents of `frame_invariant_metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameInvariantMetadata {
    #[serde(rename = "FrameData")]
    pub frame_data: Map<String, Value>,
    #[serde(rename = "RoiGroups")]
    pub roi_groups: Value,
}

/// Contents of `ops.json`, the configuration handed to cell registration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpsConfig {
    pub frame_rate: f64,
    pub plane_number: i64,
    pub channel_number: i64,
    pub roi_number: usize,
    pub roi_x_coordinates: Vec<i64>,
    pub roi_y_coordinates: Vec<i64>,
    pub roi_lines: Vec<Vec<i64>>,
}

/// One imaging ROI as read from the scan field definition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi {
    /// Pixel resolution as (width, height).
    pub pixels: (f64, f64),
    /// Scan field centre as (x, y) in scanner units.
    pub center: (f64, f64),
    /// Scan field size as (x, y) in scanner units.
    pub size: (f64, f64),
}

impl FrameInvariantMetadata {
    pub fn parse(stack: &Path, software: &str, artist: &str) -> Result<Self> {
        let mut frame_data = Map::new();
        for line in software.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if !key.starts_with("SI.") {
                continue;
            }
            frame_data.insert(key.to_string(), matlab_value(value.trim()));
        }

        let artist: Value = serde_json::from_str(artist).map_err(|e| Error::Json {
            path: stack.to_path_buf(),
            source: e,
        })?;
        let roi_groups = artist.get("RoiGroups").cloned().ok_or_else(|| Error::InvalidStack {
            path: stack.to_path_buf(),
            message: "ROI definition lacks 'RoiGroups'".to_string(),
        })?;

        Ok(Self {
            frame_data,
            roi_groups,
        })
    }

    /// Derive the registration configuration. `frame_rows` is the row count of
    /// the first frame, which includes flyback lines between ROIs.
    pub fn ops(&self, stack: &Path, frame_rows: u32) -> Result<OpsConfig> {
        let frame_rate = self.number(stack, FRAME_RATE_KEY)?;
        let plane_number = self.number(stack, PLANE_COUNT_KEY)? as i64;
        let channel_number = match self.frame_data.get(ACTIVE_CHANNELS_KEY) {
            Some(Value::Array(channels)) => channels.len() as i64,
            _ => self.number(stack, ACTIVE_CHANNELS_KEY)? as i64,
        };

        let rois = self.rois(stack)?;
        let geometry = RoiGeometry::compute(&rois, frame_rows);

        Ok(OpsConfig {
            frame_rate,
            plane_number,
            channel_number,
            roi_number: rois.len(),
            roi_x_coordinates: geometry.x,
            roi_y_coordinates: geometry.y,
            roi_lines: geometry.lines,
        })
    }

    fn number(&self, stack: &Path, key: &str) -> Result<f64> {
        let value = self
            .frame_data
            .get(key)
            .ok_or_else(|| Error::InvalidStack {
                path: stack.to_path_buf(),
                message: format!("scanner settings lack '{key}'"),
            })?;
        value.as_f64().ok_or_else(|| Error::MalformedMetadata {
            stack: stack.to_path_buf(),
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// ROIs in definition order. A single ROI may be stored as a bare object.
    pub fn rois(&self, stack: &Path) -> Result<Vec<Roi>> {
        let invalid = |message: String| Error::InvalidStack {
            path: stack.to_path_buf(),
            message,
        };

        let rois = self
            .roi_groups
            .pointer("/imagingRoiGroup/rois")
            .ok_or_else(|| invalid("ROI definition lacks 'imagingRoiGroup.rois'".to_string()))?;
        let rois = match rois {
            Value::Array(items) => items.iter().collect::<Vec<_>>(),
            single @ Value::Object(_) => vec![single],
            _ => return Err(invalid("'rois' is neither a list nor an object".to_string())),
        };
        if rois.is_empty() {
            return Err(invalid("no imaging ROIs defined".to_string()));
        }

        rois.into_iter()
            .enumerate()
            .map(|(index, roi)| {
                let pair = |field: &str| -> Result<(f64, f64)> {
                    let values = roi
                        .pointer(&format!("/scanfields/{field}"))
                        .and_then(Value::as_array)
                        .filter(|v| v.len() == 2)
                        .ok_or_else(|| invalid(format!("ROI {index} lacks scanfields.{field}")))?;
                    match (values[0].as_f64(), values[1].as_f64()) {
                        (Some(a), Some(b)) => Ok((a, b)),
                        _ => Err(invalid(format!("ROI {index} has non-numeric {field}"))),
                    }
                };
                Ok(Roi {
                    pixels: pair("pixelResolutionXY")?,
                    center: pair("centerXY")?,
                    size: pair("sizeXY")?,
                })
            })
            .collect()
    }
}

/// Pixel offsets and row ranges of every ROI inside a stitched frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RoiGeometry {
    pub x: Vec<i64>,
    pub y: Vec<i64>,
    pub lines: Vec<Vec<i64>>,
}

impl RoiGeometry {
    pub fn compute(rois: &[Roi], frame_rows: u32) -> Self {
        // Work in (row, column) order: centres and sizes are given as (x, y).
        let mut corners: Vec<(f64, f64)> = rois
            .iter()
            .map(|roi| {
                (
                    roi.center.1 - roi.size.1 / 2.0,
                    roi.center.0 - roi.size.0 / 2.0,
                )
            })
            .collect();

        let min_row = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min);
        let min_col = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min);
        for corner in &mut corners {
            corner.0 -= min_row;
            corner.1 -= min_col;
        }

        let row_scale = median(rois.iter().map(|roi| roi.pixels.1 / roi.size.1).collect());
        let col_scale = median(rois.iter().map(|roi| roi.pixels.0 / roi.size.0).collect());

        let heights: Vec<i64> = rois.iter().map(|roi| roi.pixels.1 as i64).collect();
        let total_rows: i64 = heights.iter().sum();
        let gaps = (rois.len() as i64 - 1).max(1);
        let flyback = (frame_rows as i64 - total_rows).div_euclid(gaps);

        let mut lines = Vec::with_capacity(rois.len());
        let mut start = 0i64;
        for height in &heights {
            lines.push((start..start + height).collect());
            start += height + flyback;
        }

        Self {
            x: corners
                .iter()
                .map(|c| (c.1 * col_scale).ceil() as i64)
                .collect(),
            y: corners
                .iter()
                .map(|c| (c.0 * row_scale).ceil() as i64)
                .collect(),
            lines,
        }
    }
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    match values.len() {
        0 => 0.0,
        n if n % 2 == 1 => values[mid],
        _ => (values[mid - 1] + values[mid]) / 2.0,
    }
}

/// Interpret a MATLAB literal from the scanner settings dump.
fn matlab_value(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(number) = raw.parse::<f64>()
        && let Some(number) = serde_json::Number::from_f64(number)
    {
        return Value::Number(number);
    }
    if let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        let items: Vec<Value> = inner
            .split([';', ' ', ','])
            .filter(|item| !item.is_empty())
            .map(matlab_value)
            .collect();
        return Value::Array(items);
    }
    Value::String(raw.trim_matches('\'').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOFTWARE: &str = "SI.hRoiManager.scanVolumeRate = 9.5\n\
        SI.hStackManager.actualNumSlices = 1\n\
        SI.hChannels.channelsActive = 2\n\
        SI.acqState = 'grab'\n\
        SI.hFastZ.enable = false\n\
        not a setting";

    fn artist(rois: &str) -> String {
        format!(r#"{{"RoiGroups":{{"imagingRoiGroup":{{"rois":{rois}}}}}}}"#)
    }

    fn stack() -> &'static Path {
        Path::new("/raw/session_00001_00001.tif")
    }

    #[test]
    fn parses_scanner_settings() {
        let meta = FrameInvariantMetadata::parse(stack(), SOFTWARE, &artist("[]")).unwrap();
        assert_eq!(meta.frame_data["SI.hRoiManager.scanVolumeRate"], 9.5);
        assert_eq!(meta.frame_data["SI.acqState"], "grab");
        assert_eq!(meta.frame_data["SI.hFastZ.enable"], false);
        assert_eq!(meta.frame_data.len(), 5);
    }

    #[test]
    fn single_roi_object_is_accepted() {
        let roi = r#"{"scanfields":{"pixelResolutionXY":[64,32],"centerXY":[0,0],"sizeXY":[2,1]}}"#;
        let meta = FrameInvariantMetadata::parse(stack(), SOFTWARE, &artist(roi)).unwrap();
        let ops = meta.ops(stack(), 32).unwrap();

        assert_eq!(ops.roi_number, 1);
        assert_eq!(ops.roi_x_coordinates, [0]);
        assert_eq!(ops.roi_y_coordinates, [0]);
        assert_eq!(ops.roi_lines, [(0..32).collect::<Vec<_>>()]);
        assert_eq!(ops.channel_number, 2);
        assert_eq!(ops.frame_rate, 9.5);
    }

    #[test]
    fn side_by_side_rois_share_rows_via_flyback() {
        // Two 10x20 ROIs next to each other horizontally with 6 flyback lines.
        let rois = [
            Roi {
                pixels: (10.0, 20.0),
                center: (-0.5, 0.0),
                size: (1.0, 2.0),
            },
            Roi {
                pixels: (10.0, 20.0),
                center: (0.5, 0.0),
                size: (1.0, 2.0),
            },
        ];
        let geometry = RoiGeometry::compute(&rois, 46);

        assert_eq!(geometry.x, [0, 10]);
        assert_eq!(geometry.y, [0, 0]);
        assert_eq!(geometry.lines[0].first(), Some(&0));
        assert_eq!(geometry.lines[0].last(), Some(&19));
        assert_eq!(geometry.lines[1].first(), Some(&26));
        assert_eq!(geometry.lines[1].len(), 20);
    }

    #[test]
    fn flyback_uses_floor_division() {
        let roi = Roi {
            pixels: (4.0, 4.0),
            center: (0.0, 0.0),
            size: (1.0, 1.0),
        };
        // 13 rows, 3 ROIs of 4 rows: one spare row over two gaps floors to 0.
        let geometry = RoiGeometry::compute(&[roi, roi, roi], 13);
        assert_eq!(geometry.lines[1][0], 4);
        assert_eq!(geometry.lines[2][0], 8);

        // Fewer rows than ROI lines gives a negative flyback that floors down.
        let geometry = RoiGeometry::compute(&[roi, roi], 7);
        assert_eq!(geometry.lines[1][0], 3);
    }

    #[test]
    fn missing_rois_are_rejected() {
        let meta = FrameInvariantMetadata::parse(stack(), SOFTWARE, r#"{"RoiGroups":{}}"#).unwrap();
        assert!(matches!(
            meta.ops(stack(), 10).unwrap_err(),
            Error::InvalidStack { .. }
        ));
    }

    #[test]
    fn median_of_even_count_averages() {
        assert_eq!(median(vec![4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median(vec![5.0, 1.0, 3.0]), 3.0);
    }
}
