//! Command-line entry point for galvo-scan.
//!
//! Runs acquisitions against the simulated driver and inspects the waveforms
//! the engine would program.
//!
//! ```bash
//! galvo-scan simulate --resolution 512 --frames 3
//! galvo-scan --log-format json waveform --resolution 256 --zoom 2
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use daqmx_hal::{SimDevice, SimulatedDaqmx};
use galvo_scan::logging::{self, LogFormat, LoggingConfig};
use galvo_scan::waveform::{generate_galvo_waveform_frame, WaveformParams};
use galvo_scan::{DeviceSettings, GalvoScanner, ScanRequest};
use serde_json::json;
use tracing::info;

#[derive(Parser)]
#[command(name = "galvo-scan")]
#[command(about = "Galvo scanning acquisition engine", long_about = None)]
struct Cli {
    /// Settings file (TOML); GALVO_SCAN_* environment variables override it
    #[arg(long, global = true, default_value = "galvo-scan.toml")]
    config: PathBuf,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire frames from the simulated driver
    Simulate {
        /// Full-frame resolution
        #[arg(long, default_value_t = 512)]
        resolution: usize,

        /// Frames to acquire
        #[arg(long, default_value_t = 3)]
        frames: u32,

        /// Pixel clock, in Hz
        #[arg(long, default_value_t = 1.0e6)]
        pixel_rate: f64,

        /// Zoom factor
        #[arg(long, default_value_t = 1.0)]
        zoom: f64,

        /// Scan lines the simulated inputs miss per frame
        #[arg(long, default_value_t = 0)]
        drop_lines: u32,
    },

    /// Print waveform sizes and the first scan line as JSON
    Waveform {
        /// Full-frame resolution
        #[arg(long, default_value_t = 512)]
        resolution: usize,

        /// Zoom factor
        #[arg(long, default_value_t = 1.0)]
        zoom: f64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = logging::parse_level(&cli.log_level)?;
    logging::init(&LoggingConfig::new(level).with_format(cli.log_format))?;

    let settings = DeviceSettings::load_from(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;

    match cli.command {
        Commands::Simulate {
            resolution,
            frames,
            pixel_rate,
            zoom,
            drop_lines,
        } => simulate(settings, resolution, frames, pixel_rate, zoom, drop_lines),
        Commands::Waveform { resolution, zoom } => print_waveform(&settings, resolution, zoom),
    }
}

fn simulate(
    settings: DeviceSettings,
    resolution: usize,
    frames: u32,
    pixel_rate: f64,
    zoom: f64,
    drop_lines: u32,
) -> Result<()> {
    let device = SimDevice::new(&settings.device, settings.max_channels.max(8));
    let sim = Arc::new(
        SimulatedDaqmx::new()
            .with_devices(vec![device])
            .with_signal(|channel, sample| {
                let phase = sample as f64 / 1000.0 + channel as f64;
                1.0 + 0.5 * phase.sin()
            }),
    );
    sim.set_dropped_lines(drop_lines);

    let scanner = GalvoScanner::open(sim.clone(), settings).context("Failed to open scanner")?;

    let delivered = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&delivered);
    let request = ScanRequest::new(resolution, pixel_rate)
        .with_frames(frames)
        .with_zoom(zoom)
        .with_sink(move |channel, pixels| {
            let (min, max) = pixels
                .iter()
                .fold((u16::MAX, 0u16), |(lo, hi), &p| (lo.min(p), hi.max(p)));
            let mean = pixels.iter().map(|&p| f64::from(p)).sum::<f64>() / pixels.len().max(1) as f64;
            let frame = counter.fetch_add(1, Ordering::SeqCst);
            info!(frame, channel, min, max, mean, "Frame delivered");
            true
        });

    scanner.arm(Arc::new(request))?;
    scanner.start()?;
    scanner.wait();

    if let Some(error) = scanner.last_error() {
        bail!("Acquisition failed: {error}");
    }
    let (park_x, park_y) = scanner.park_voltages();
    info!(
        channel_frames = delivered.load(Ordering::SeqCst),
        park_x, park_y, "Simulation finished"
    );
    scanner.close()?;
    Ok(())
}

fn print_waveform(settings: &DeviceSettings, resolution: usize, zoom: f64) -> Result<()> {
    let params = WaveformParams {
        zoom,
        undershoot: settings.line_delay as usize,
        galvo_offset_x: settings.galvo_offset_x,
        galvo_offset_y: settings.galvo_offset_y,
        x_park: settings.park_x,
        y_park: settings.park_y,
        ..WaveformParams::full_frame(resolution)
    };
    let frame = generate_galvo_waveform_frame(&params)?;
    let line = params.line_waveform_size();
    let samples = params.scanner_waveform_size();

    let report = json!({
        "resolution": resolution,
        "zoom": zoom,
        "line_samples": line,
        "scanner_samples": samples,
        "clock_samples": params.clock_waveform_size(),
        "park_samples": params.park_waveform_size(),
        "x": &frame[..line],
        "y": &frame[samples..samples + line],
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
