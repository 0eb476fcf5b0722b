//! Device facade.
//!
//! [`GalvoScanner`] is the surface a host framework drives: open/close,
//! capability queries, the acquisition protocol and the setting mutators.
//! Every mutator validates its value, refuses while an acquisition is
//! running and marks exactly the configuration aspects it makes stale.

use std::sync::Arc;

use daqmx_hal::names::{parse_name_list, strip_device};
use daqmx_hal::DaqmxDriver;
use tracing::{info, warn};

use crate::acquisition::{Acquisition, ScanHardware};
use crate::config::{
    check_offset, check_range, DeviceSettings, FrameTimeoutPolicy, RangeTable,
    BIN_FACTOR_RANGE, BUFFER_LINES_RANGE, LINE_DELAY_RANGE,
};
use crate::error::{Result, ResultExt, ScanError};
use crate::session::AcquisitionSession;
use crate::tasks::{Pending, TaskConfig};

/// Pixel clock rates offered to the host, in Hz.
pub const PIXEL_RATES_HZ: [f64; 6] = [50.0e3, 100.0e3, 200.0e3, 250.0e3, 500.0e3, 1.0e6];

/// Full-frame resolutions offered to the host.
pub const RESOLUTIONS: [usize; 4] = [256, 512, 1024, 2048];

/// Continuous zoom range.
pub const ZOOM_RANGE: (f64, f64) = (1.0, 64.0);

/// Bytes per delivered pixel.
pub const BYTES_PER_SAMPLE: usize = 2;

/// A galvo scanner on one data-acquisition device.
pub struct GalvoScanner {
    acquisition: Acquisition,
    channel_count: usize,
}

impl GalvoScanner {
    /// Open the device named in `settings`.
    ///
    /// Fails if the device is not installed or has fewer analog inputs than
    /// `max_channels`. No task is created until the first arm.
    pub fn open(driver: Arc<dyn DaqmxDriver>, settings: DeviceSettings) -> Result<Self> {
        settings.validate()?;
        let device = settings.device.clone();

        let installed = parse_name_list(
            &driver
                .installed_devices()
                .context("Failed to list installed devices")?,
        );
        if !installed.iter().any(|name| *name == device) {
            return Err(ScanError::Channel(format!(
                "device {device} not installed (found: {})",
                installed.join(", ")
            )));
        }

        let ai_physical: Vec<String> = parse_name_list(
            &driver
                .device_ai_physical_chans(&device)
                .with_context(|| format!("Failed to list analog inputs of {device}"))?,
        )
        .iter()
        .map(|name| strip_device(name, &device).to_string())
        .collect();
        if ai_physical.len() < settings.max_channels {
            return Err(ScanError::Channel(format!(
                "device {device} has {} analog inputs, {} configured",
                ai_physical.len(),
                settings.max_channels
            )));
        }
        let channel_count = settings.max_channels;

        info!(device = %device, channels = channel_count, "Opened galvo scanner");
        let hardware = ScanHardware::new(driver, settings, ai_physical);
        Ok(Self {
            acquisition: Acquisition::new(hardware),
            channel_count,
        })
    }

    /// Stop any acquisition and release every task. Each task group is
    /// attempted; the first error is returned.
    pub fn close(&self) -> Result<()> {
        self.acquisition.stop();
        let result = self.acquisition.with_hardware(ScanHardware::shutdown_all);
        match &result {
            Ok(()) => info!("Closed galvo scanner"),
            Err(e) => warn!(error = %e.report(), "Close failed"),
        }
        result
    }

    /// Pixel rates, in Hz.
    pub fn pixel_rates(&self) -> &'static [f64] {
        &PIXEL_RATES_HZ
    }

    /// Full-frame resolutions.
    pub fn resolutions(&self) -> &'static [usize] {
        &RESOLUTIONS
    }

    /// Minimum and maximum zoom.
    pub fn zoom_range(&self) -> (f64, f64) {
        ZOOM_RANGE
    }

    /// Number of detector channels.
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Bytes per delivered pixel.
    pub fn bytes_per_sample(&self) -> usize {
        BYTES_PER_SAMPLE
    }

    /// Validate and configure everything for `session`.
    pub fn arm(&self, session: Arc<dyn AcquisitionSession>) -> Result<()> {
        self.acquisition.arm(session)
    }

    /// Start the armed acquisition.
    pub fn start(&self) -> Result<()> {
        self.acquisition.start()
    }

    /// Stop and block until idle.
    pub fn stop(&self) {
        self.acquisition.stop();
    }

    /// Whether an acquisition is armed or in flight.
    pub fn is_running(&self) -> bool {
        self.acquisition.is_running()
    }

    /// Block until idle.
    pub fn wait(&self) {
        self.acquisition.wait();
    }

    /// Cause chain of the last failed arm or run.
    pub fn last_error(&self) -> Option<String> {
        self.acquisition.last_error()
    }

    /// A copy of the current settings.
    pub fn settings(&self) -> DeviceSettings {
        self.acquisition.settings()
    }

    /// Voltages the galvos were last parked at.
    pub fn park_voltages(&self) -> (f64, f64) {
        self.acquisition.park_voltages()
    }

    /// Line delay (undershoot), in pixels.
    pub fn set_line_delay(&self, pixels: u32) -> Result<()> {
        check_range("line_delay", pixels, LINE_DELAY_RANGE)?;
        self.acquisition.with_idle_hardware("line delay", |hw| {
            if hw.settings.line_delay != pixels {
                hw.settings.line_delay = pixels;
                hw.clock.mark(Pending::TIMING | Pending::OUTPUT);
                hw.scanner.mark(Pending::TIMING | Pending::OUTPUT);
            }
            Ok(())
        })
    }

    /// Raw samples averaged into one pixel.
    pub fn set_bin_factor(&self, factor: u32) -> Result<()> {
        check_range("bin_factor", factor, BIN_FACTOR_RANGE)?;
        self.acquisition.with_idle_hardware("bin factor", |hw| {
            if hw.settings.bin_factor != factor {
                hw.settings.bin_factor = factor;
                hw.detector.mark(Pending::TIMING | Pending::CALLBACK);
            }
            Ok(())
        })
    }

    /// Detector input buffer depth, in lines.
    pub fn set_buffer_lines(&self, lines: u32) -> Result<()> {
        check_range("buffer_lines", lines, BUFFER_LINES_RANGE)?;
        self.acquisition.with_idle_hardware("buffer lines", |hw| {
            if hw.settings.buffer_lines != lines {
                hw.settings.buffer_lines = lines;
                hw.detector.mark(Pending::TIMING);
            }
            Ok(())
        })
    }

    /// Enable or disable one detector channel. At least one stays enabled.
    pub fn set_channel_enabled(&self, channel: usize, enabled: bool) -> Result<()> {
        if channel >= self.channel_count {
            return Err(ScanError::setting(
                "enabled_channels",
                format!("channel {channel} out of range 0..{}", self.channel_count),
            ));
        }
        self.acquisition.with_idle_hardware("channel enable", |hw| {
            let mut channels = hw.settings.enabled_channels.clone();
            let present = channels.contains(&channel);
            match (enabled, present) {
                (true, false) => {
                    channels.push(channel);
                    channels.sort_unstable();
                }
                (false, true) => channels.retain(|&c| c != channel),
                _ => return Ok(()),
            }
            if channels.is_empty() {
                return Err(ScanError::setting(
                    "enabled_channels",
                    "at least one channel must be enabled",
                ));
            }
            hw.settings.enabled_channels = channels;
            hw.detector.shutdown()
        })
    }

    /// Fixed detector input range in volts, or `None` to auto-detect.
    pub fn set_input_voltage_range(&self, volts: Option<f64>) -> Result<()> {
        if let Some(v) = volts {
            if !(v.is_finite() && v > 0.0) {
                return Err(ScanError::setting(
                    "input_voltage_range",
                    format!("{v} is not a positive voltage"),
                ));
            }
        }
        self.acquisition.with_idle_hardware("input voltage range", |hw| {
            if hw.settings.input_voltage_range == volts {
                return Ok(());
            }
            hw.settings.input_voltage_range = volts;
            hw.detector.shutdown()
        })
    }

    /// Device range table used to auto-detect the input range.
    pub fn set_range_table(&self, table: RangeTable) -> Result<()> {
        self.acquisition.with_idle_hardware("range table", |hw| {
            if hw.settings.range_table == table {
                return Ok(());
            }
            hw.settings.range_table = table;
            hw.detector.shutdown()
        })
    }

    /// Galvo calibration offsets, in volts.
    pub fn set_galvo_offsets(&self, x: f64, y: f64) -> Result<()> {
        check_offset("galvo_offset_x", x)?;
        check_offset("galvo_offset_y", y)?;
        self.acquisition.with_idle_hardware("galvo offsets", |hw| {
            hw.settings.galvo_offset_x = x;
            hw.settings.galvo_offset_y = y;
            hw.scanner.mark(Pending::OUTPUT);
            Ok(())
        })
    }

    /// Park position, in pixels. Park waveforms are computed per move.
    pub fn set_park_position(&self, x: i32, y: i32) -> Result<()> {
        self.acquisition.with_idle_hardware("park position", |hw| {
            hw.settings.park_x = x;
            hw.settings.park_y = y;
            Ok(())
        })
    }

    /// Behavior on detector frame timeout.
    pub fn set_frame_timeout_policy(&self, policy: FrameTimeoutPolicy) -> Result<()> {
        self.acquisition.with_idle_hardware("frame timeout policy", |hw| {
            hw.settings.frame_timeout_policy = policy;
            Ok(())
        })
    }
}

impl Drop for GalvoScanner {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e.report(), "Failed to close galvo scanner on drop");
        }
    }
}
