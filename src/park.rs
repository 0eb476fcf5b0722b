//! Park and unpark moves.
//!
//! Both moves run on the scanner task: it is reprogrammed for a finite
//! `X_RETRACE_LEN` sample generation, the move is written, started and waited
//! on synchronously, then stopped. The scanner's timing and output are left
//! stale so the next `set_up` restores the raster.

use std::time::Duration;

use tracing::debug;

use crate::error::{Result, ResultExt, ScanError};
use crate::tasks::{sample_duration, ScanContext, ScannerConfig, TaskConfig};
use crate::waveform::{
    generate_galvo_park_waveform, generate_galvo_unpark_waveform, last_samples,
};

/// Slack added to the doubled move duration when waiting for completion.
const MOVE_TIMEOUT_MARGIN: Duration = Duration::from_millis(100);

/// Move the galvos from the previous park voltages to the frame start.
pub fn unpark(scanner: &mut ScannerConfig, ctx: &ScanContext<'_>) -> Result<()> {
    let waveform = generate_galvo_unpark_waveform(ctx.params)?;
    debug!(
        from_x = ctx.params.prev_x_park_voltage,
        from_y = ctx.params.prev_y_park_voltage,
        "Unparking galvos"
    );
    run_move(scanner, ctx, &waveform).context("Failed to unpark galvos")
}

/// Move the galvos from the frame end to the park position.
///
/// Returns the last X/Y voltages written, which the next unpark starts from.
pub fn park(scanner: &mut ScannerConfig, ctx: &ScanContext<'_>) -> Result<(f64, f64)> {
    let waveform = generate_galvo_park_waveform(ctx.params)?;
    run_move(scanner, ctx, &waveform).context("Failed to park galvos")?;
    let last = last_samples(&waveform).unwrap_or(ctx.params.park_voltages());
    debug!(x = last.0, y = last.1, "Parked galvos");
    Ok(last)
}

fn run_move(scanner: &mut ScannerConfig, ctx: &ScanContext<'_>, waveform: &[f64]) -> Result<()> {
    let samples = ctx.params.park_waveform_size();
    let timeout = sample_duration(samples, ctx.pixel_rate)?
        .checked_mul(2)
        .and_then(|d| d.checked_add(MOVE_TIMEOUT_MARGIN))
        .ok_or_else(|| {
            ScanError::Waveform(format!("move timeout overflows at {} Hz", ctx.pixel_rate))
        })?;

    let result = drive_move(scanner, ctx, waveform, samples, timeout);
    if result.is_err() {
        scanner.force_shutdown();
    }
    result
}

fn drive_move(
    scanner: &mut ScannerConfig,
    ctx: &ScanContext<'_>,
    waveform: &[f64],
    samples: usize,
    timeout: Duration,
) -> Result<()> {
    scanner.ensure_created(ctx)?;
    scanner.load_move(ctx.pixel_rate, samples, waveform)?;
    scanner.start()?;
    scanner.wait_done(timeout)?;
    scanner.stop()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceSettings;
    use crate::tasks::Pending;
    use crate::waveform::WaveformParams;
    use daqmx_hal::{Op, SimulatedDaqmx};
    use std::sync::Arc;

    #[test]
    fn test_park_then_unpark_carries_voltage() {
        let sim = Arc::new(SimulatedDaqmx::new());
        let settings = DeviceSettings::default();
        let mut params = WaveformParams {
            x_park: -64,
            y_park: 10,
            ..WaveformParams::full_frame(64)
        };
        let mut scanner = ScannerConfig::new(sim.clone());

        let ctx = ScanContext {
            params: &params,
            pixel_rate: 1.0e6,
            settings: &settings,
            detector_channels: &[],
        };
        let (x, y) = park(&mut scanner, &ctx).unwrap();
        assert_eq!((x, y), params.park_voltages());
        assert!(scanner.pending().contains(Pending::TIMING | Pending::OUTPUT));

        params.prev_x_park_voltage = x;
        params.prev_y_park_voltage = y;
        let ctx = ScanContext {
            params: &params,
            pixel_rate: 1.0e6,
            settings: &settings,
            detector_channels: &[],
        };
        unpark(&mut scanner, &ctx).unwrap();
        let written = sim.last_analog_write("GalvoScan-Scanner").unwrap();
        assert_eq!(written.len(), 256);
        assert_eq!((written[0], written[128]), (x, y));
        assert_eq!(sim.count_ops(|op| op == Op::Start), 2);
        assert_eq!(sim.count_ops(|op| op == Op::Stop), 2);
    }

    #[test]
    fn test_failed_move_shuts_scanner_down() {
        let sim = Arc::new(SimulatedDaqmx::new());
        let settings = DeviceSettings::default();
        let params = WaveformParams::full_frame(16);
        let mut scanner = ScannerConfig::new(sim.clone());
        let ctx = ScanContext {
            params: &params,
            pixel_rate: 1.0e6,
            settings: &settings,
            detector_channels: &[],
        };
        sim.fail_on(Op::Wait, "Scanner", daqmx_hal::error::STATUS_WAIT_TIMEOUT);
        let err = unpark(&mut scanner, &ctx).unwrap_err();
        assert!(err.report().starts_with("Failed to unpark galvos: "));
        assert!(err.driver_error().unwrap().is_timeout());
        assert!(!scanner.is_created());
        assert_eq!(sim.live_tasks(), 0);
    }

    #[test]
    fn test_unrepresentable_move_time_is_an_error() {
        let sim = Arc::new(SimulatedDaqmx::new());
        let settings = DeviceSettings::default();
        let params = WaveformParams::full_frame(16);
        let mut scanner = ScannerConfig::new(sim.clone());
        let ctx = ScanContext {
            params: &params,
            pixel_rate: 1.0e-18,
            settings: &settings,
            detector_channels: &[],
        };
        let err = park(&mut scanner, &ctx).unwrap_err();
        assert!(matches!(err.root(), ScanError::Waveform(_)));
        assert_eq!(sim.count_ops(|op| op == Op::Start), 0);
    }
}
