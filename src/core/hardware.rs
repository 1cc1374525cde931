use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Parameters of the acquisition hardware modules active during a session.
///
/// Written into `raw_data` by the runtime that drove the hardware. Every field
/// is optional; an unset field means the module was not used and its logs
/// need no parsing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfiguration {
    /// Virtual reality cue code to cue length in centimeters.
    pub cue_map: Option<BTreeMap<String, f64>>,
    pub cm_per_pulse: Option<f64>,
    pub maximum_break_strength: Option<f64>,
    pub minimum_break_strength: Option<f64>,
    pub lick_threshold: Option<i64>,
    pub scale_coefficient: Option<f64>,
    pub nonlinearity_exponent: Option<f64>,
    pub torque_per_adc_unit: Option<f64>,
    pub initially_on: Option<bool>,
    /// Whether the mesoscope frame trigger line was wired up.
    pub has_ttl: Option<bool>,
}

impl HardwareConfiguration {
    /// Load the configuration, or `None` if the session has none.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No hardware configuration recorded");
                return Ok(None);
            }
            Err(e) => return Err(Error::io(path, e)),
        };

        toml::from_str(&content)
            .map(Some)
            .map_err(|e| Error::MalformedHardwareConfiguration {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::MalformedHardwareConfiguration {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        fs::write(path, content).map_err(|e| Error::io(path, e))
    }

    /// Sessions run without the frame trigger produce no mesoscope data.
    pub fn expects_mesoscope_frames(&self) -> bool {
        self.has_ttl != Some(false)
    }
}

/// Whether a session is expected to have mesoscope frames, given its optional
/// hardware configuration. Absent configuration assumes everything was active.
pub fn expects_mesoscope_frames(configuration: Option<&HardwareConfiguration>) -> bool {
    configuration.is_none_or(HardwareConfiguration::expects_mesoscope_frames)
}
