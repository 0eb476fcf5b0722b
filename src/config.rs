//! Device settings.
//!
//! Settings are loaded with `figment` from three layers, later layers
//! overriding earlier ones:
//! 1. built-in defaults ([`DeviceSettings::default`])
//! 2. a TOML file
//! 3. environment variables prefixed with `GALVO_SCAN_`
//!    (e.g. `GALVO_SCAN_LINE_DELAY=80`)
//!
//! # Example
//! ```no_run
//! use galvo_scan::config::DeviceSettings;
//!
//! let settings = DeviceSettings::load_from("galvo-scan.toml")?;
//! println!("Device: {}", settings.device);
//! # Ok::<(), galvo_scan::error::ScanError>(())
//! ```

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

/// Environment variable prefix for settings overrides.
pub const ENV_PREFIX: &str = "GALVO_SCAN_";

/// Allowed line delay (undershoot) in pixels.
pub const LINE_DELAY_RANGE: (u32, u32) = (0, 200);
/// Allowed bin factor.
pub const BIN_FACTOR_RANGE: (u32, u32) = (1, 16);
/// Allowed detector buffer depth, in lines.
pub const BUFFER_LINES_RANGE: (u32, u32) = (1, 128);
/// Allowed galvo calibration offset, in volts.
pub const GALVO_OFFSET_RANGE: (f64, f64) = (-5.0, 5.0);

/// Which device range table the detector auto-detects its input range from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeTable {
    /// Analog-input ranges
    #[default]
    Input,
    /// Analog-output ranges (legacy behavior)
    Output,
}

/// What to do when the detector does not complete a frame in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameTimeoutPolicy {
    /// Log the timeout, deliver the partial frame and keep going
    #[default]
    LogAndContinue,
    /// End the acquisition with an error
    Abort,
}

/// Per-device settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Device name as reported by the driver
    pub device: String,
    /// Analog-output channels driving the X and Y galvos
    pub scanner_channels: String,
    /// Digital lines for line clock, FLIM line clock and FLIM frame clock
    pub clock_lines: String,
    /// Counter producing the line trigger pulse train
    pub counter: String,
    /// Terminal the counter output is wired to; triggers the detector
    pub line_trigger: String,
    /// Start trigger terminal of the scanner task
    pub ao_start_trigger: String,
    /// Number of analog-input channels exposed to the host
    pub max_channels: usize,
    /// Undershoot before the active pixels of each line, in pixels
    pub line_delay: u32,
    /// Raw samples averaged into one pixel
    pub bin_factor: u32,
    /// Detector input buffer depth, in lines
    pub buffer_lines: u32,
    /// Indices of enabled analog-input channels
    pub enabled_channels: Vec<usize>,
    /// Detector input range in volts; auto-detected when unset
    pub input_voltage_range: Option<f64>,
    /// Range table used for auto-detection
    pub range_table: RangeTable,
    /// Park position, in pixels
    pub park_x: i32,
    /// Park position, in pixels
    pub park_y: i32,
    /// Galvo calibration offset, in volts
    pub galvo_offset_x: f64,
    /// Galvo calibration offset, in volts
    pub galvo_offset_y: f64,
    /// Behavior on detector frame timeout
    pub frame_timeout_policy: FrameTimeoutPolicy,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            device: "Dev1".to_string(),
            scanner_channels: "ao0:1".to_string(),
            clock_lines: "port0/line0:2".to_string(),
            counter: "ctr0".to_string(),
            line_trigger: "PFI12".to_string(),
            ao_start_trigger: "ao/StartTrigger".to_string(),
            max_channels: 4,
            line_delay: 50,
            bin_factor: 1,
            buffer_lines: 16,
            enabled_channels: vec![0],
            input_voltage_range: None,
            range_table: RangeTable::Input,
            park_x: 0,
            park_y: 0,
            galvo_offset_x: 0.0,
            galvo_offset_y: 0.0,
            frame_timeout_policy: FrameTimeoutPolicy::LogAndContinue,
        }
    }
}

impl DeviceSettings {
    /// Load settings from a TOML file and `GALVO_SCAN_` environment variables.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_layered(path, ENV_PREFIX)
    }

    /// Load settings with a custom environment prefix.
    pub fn load_layered<P: AsRef<Path>>(path: P, env_prefix: &str) -> Result<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(env_prefix))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string over the defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ScanError::Config(e.to_string()))
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<()> {
        if self.device.trim().is_empty() {
            return Err(ScanError::setting("device", "must not be empty"));
        }
        check_range("line_delay", self.line_delay, LINE_DELAY_RANGE)?;
        check_range("bin_factor", self.bin_factor, BIN_FACTOR_RANGE)?;
        check_range("buffer_lines", self.buffer_lines, BUFFER_LINES_RANGE)?;
        check_offset("galvo_offset_x", self.galvo_offset_x)?;
        check_offset("galvo_offset_y", self.galvo_offset_y)?;

        if self.max_channels == 0 {
            return Err(ScanError::setting("max_channels", "must be at least 1"));
        }
        if self.enabled_channels.is_empty() {
            return Err(ScanError::setting(
                "enabled_channels",
                "at least one channel must be enabled",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for &ch in &self.enabled_channels {
            if ch >= self.max_channels {
                return Err(ScanError::setting(
                    "enabled_channels",
                    format!("channel {ch} out of range 0..{}", self.max_channels),
                ));
            }
            if !seen.insert(ch) {
                return Err(ScanError::setting(
                    "enabled_channels",
                    format!("channel {ch} listed twice"),
                ));
            }
        }
        if let Some(range) = self.input_voltage_range {
            if !(range.is_finite() && range > 0.0) {
                return Err(ScanError::setting(
                    "input_voltage_range",
                    format!("{range} is not a positive voltage"),
                ));
            }
        }
        Ok(())
    }
}

pub(crate) fn check_range(name: &'static str, value: u32, (min, max): (u32, u32)) -> Result<()> {
    if value < min || value > max {
        return Err(ScanError::setting(
            name,
            format!("{value} outside {min}..={max}"),
        ));
    }
    Ok(())
}

pub(crate) fn check_offset(name: &'static str, value: f64) -> Result<()> {
    let (min, max) = GALVO_OFFSET_RANGE;
    if !(min..=max).contains(&value) {
        return Err(ScanError::setting(
            name,
            format!("{value} V outside {min}..={max} V"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(DeviceSettings::default().validate().is_ok());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let settings = DeviceSettings::from_toml_str(
            r#"
            device = "Dev2"
            line_delay = 80
            enabled_channels = [0, 2]
            range_table = "output"
            frame_timeout_policy = "abort"
            "#,
        )
        .unwrap();
        assert_eq!(settings.device, "Dev2");
        assert_eq!(settings.line_delay, 80);
        assert_eq!(settings.enabled_channels, vec![0, 2]);
        assert_eq!(settings.range_table, RangeTable::Output);
        assert_eq!(settings.frame_timeout_policy, FrameTimeoutPolicy::Abort);
        assert_eq!(settings.bin_factor, 1);
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let mut settings = DeviceSettings {
            line_delay: 500,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ScanError::Setting { name: "line_delay", .. })
        ));

        settings.line_delay = 50;
        settings.enabled_channels = vec![0, 0];
        assert!(settings.validate().is_err());

        settings.enabled_channels = vec![7];
        assert!(settings.validate().is_err());

        settings.enabled_channels = vec![1];
        settings.galvo_offset_x = 6.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = DeviceSettings::from_toml_str("bin_factor = \"four\"").unwrap_err();
        assert!(matches!(err, ScanError::Config(_)));
    }
}
