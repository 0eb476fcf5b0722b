//! Photodetector acquisition.
//!
//! An analog-input task on the enabled channels, sampling at
//! `pixel_rate × bin_factor`. Each line trigger from the clock counter
//! acquires `width × bin_factor` samples per channel; an every-N callback
//! with the same N reads them, bin-averages them into pixels and appends
//! them to the channel's frame buffer. The frame is complete once
//! `height × width × bin_factor` samples per channel have been read.

use std::sync::Arc;
use std::time::{Duration, Instant};

use daqmx_hal::names::{join_name_list, parse_range_table, qualify, widest_range};
use daqmx_hal::{DaqmxDriver, Edge, SampleMode, ScopedTask, TaskHandle, VoltageRange};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use super::{clear_task, create_task, Pending, ScanContext, TaskConfig};
use crate::config::RangeTable;
use crate::error::{Result, ScanError};

/// Full scale of a pixel value.
pub const PIXEL_FULL_SCALE: f64 = 32767.0;

/// Average `bin` consecutive raw samples into each pixel and scale to
/// `0..=32767` over `input_range` volts. Negative averages clamp to zero.
///
/// ```
/// use galvo_scan::tasks::detector::bin_average;
///
/// let mut pixels = [0u16; 1];
/// bin_average(&[1.0, 2.0, 3.0, 4.0], 4, 10.0, &mut pixels);
/// assert_eq!(pixels, [8191]);
/// ```
pub fn bin_average(raw: &[f64], bin: usize, input_range: f64, out: &mut [u16]) {
    let bin = bin.max(1);
    let scale = PIXEL_FULL_SCALE / input_range;
    for (pixel, chunk) in out.iter_mut().zip(raw.chunks_exact(bin)) {
        let mean = chunk.iter().sum::<f64>() / bin as f64;
        // `as` saturates to the u16 range.
        *pixel = (mean.max(0.0) * scale) as u16;
    }
}

/// Per-channel frame buffers shared with the every-N callback.
pub struct FrameBuffers {
    state: Mutex<FrameState>,
    complete: Condvar,
}

#[derive(Default)]
struct FrameState {
    channels: Vec<Vec<u16>>,
    pixels_per_frame: usize,
    samples_per_frame: u64,
    samples_read: u64,
    bin: usize,
    input_range: f64,
    done: bool,
}

impl Default for FrameBuffers {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffers {
    /// Empty buffers; sized by [`FrameBuffers::resize`].
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FrameState::default()),
            complete: Condvar::new(),
        }
    }

    /// Size buffers for `n_channels` frames of `pixels` pixels.
    pub fn resize(&self, n_channels: usize, pixels: usize, bin: usize, input_range: f64) {
        let mut state = self.state.lock();
        state.channels = vec![vec![0; pixels]; n_channels];
        state.pixels_per_frame = pixels;
        state.samples_per_frame = (pixels * bin) as u64;
        state.bin = bin;
        state.input_range = input_range;
        state.samples_read = 0;
        state.done = false;
    }

    /// Start a new frame. Previous contents are zeroed.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        for channel in state.channels.iter_mut() {
            channel.fill(0);
        }
        state.samples_read = 0;
        state.done = false;
    }

    /// Append one block of raw samples, grouped by channel, `n` per channel.
    pub fn append(&self, raw: &[f64], n: usize) {
        let mut state = self.state.lock();
        let bin = state.bin.max(1);
        let range = state.input_range;
        let offset = (state.samples_read / bin as u64) as usize;
        let pixels = n / bin;
        let end = offset + pixels;
        if end > state.pixels_per_frame {
            warn!(
                offset,
                pixels,
                frame = state.pixels_per_frame,
                "Detector samples beyond frame end dropped"
            );
        }
        let frame_len = state.pixels_per_frame;
        for (ch, channel) in state.channels.iter_mut().enumerate() {
            let Some(block) = raw.get(ch * n..(ch + 1) * n) else {
                break;
            };
            if offset < frame_len {
                let stop = end.min(frame_len);
                bin_average(block, bin, range, &mut channel[offset..stop]);
            }
        }
        state.samples_read += n as u64;
        trace!(read = state.samples_read, total = state.samples_per_frame, "Line acquired");
        if !state.done && state.samples_read >= state.samples_per_frame {
            state.done = true;
            self.complete.notify_all();
        }
    }

    /// Whether the current frame has been fully read.
    pub fn is_complete(&self) -> bool {
        self.state.lock().done
    }

    /// Raw samples read so far in the current frame, per channel.
    pub fn samples_read(&self) -> u64 {
        self.state.lock().samples_read
    }

    /// Wait until the frame completes or `timeout` elapses. Returns whether
    /// the frame completed.
    pub fn wait_complete(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.done {
            if self.complete.wait_until(&mut state, deadline).timed_out() {
                return state.done;
            }
        }
        true
    }

    /// Lend each channel's buffer to `f` in channel order. Stops early when
    /// `f` returns false, and returns false in that case.
    pub fn for_each_channel<F>(&self, mut f: F) -> bool
    where
        F: FnMut(usize, &[u16]) -> bool,
    {
        let state = self.state.lock();
        state
            .channels
            .iter()
            .enumerate()
            .all(|(ch, pixels)| f(ch, pixels))
    }

    /// Number of channel buffers.
    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }
}

/// Detector task group.
pub struct DetectorConfig {
    driver: Arc<dyn DaqmxDriver>,
    task: Option<ScopedTask>,
    pending: Pending,
    frames: Arc<FrameBuffers>,
    input_range: Option<VoltageRange>,
    callback_registered: bool,
}

impl DetectorConfig {
    /// An uncreated detector.
    pub fn new(driver: Arc<dyn DaqmxDriver>) -> Self {
        Self {
            driver,
            task: None,
            pending: Pending::all(),
            frames: Arc::new(FrameBuffers::new()),
            input_range: None,
            callback_registered: false,
        }
    }

    /// The frame buffers filled by the callback.
    pub fn frames(&self) -> &Arc<FrameBuffers> {
        &self.frames
    }

    /// The input range resolved at creation.
    pub fn input_range(&self) -> Option<VoltageRange> {
        self.input_range
    }

    fn handle(&self) -> Result<TaskHandle> {
        self.task
            .as_ref()
            .map(ScopedTask::handle)
            .ok_or_else(|| ScanError::Channel("detector task not created".into()))
    }

    /// Size the frame buffers for the current geometry.
    pub fn prepare_frames(&self, ctx: &ScanContext<'_>) -> Result<()> {
        let range = self
            .input_range
            .ok_or_else(|| ScanError::Channel("detector input range unresolved".into()))?;
        self.frames.resize(
            ctx.detector_channels.len(),
            ctx.params.width * ctx.params.height,
            ctx.settings.bin_factor as usize,
            range.max,
        );
        Ok(())
    }
}

/// Pick the detector input range: the configured value, or the device range
/// with the highest upper bound from the selected table.
pub fn resolve_input_range(
    driver: &dyn DaqmxDriver,
    device: &str,
    explicit: Option<f64>,
    table: RangeTable,
) -> Result<VoltageRange> {
    if let Some(v) = explicit {
        return Ok(VoltageRange { min: -v, max: v });
    }
    let flat = match table {
        RangeTable::Input => driver.device_ai_voltage_ranges(device)?,
        RangeTable::Output => driver.device_ao_voltage_ranges(device)?,
    };
    let range = widest_range(&parse_range_table(&flat)).ok_or_else(|| {
        ScanError::Channel(format!("device {device} reports no {table:?} voltage ranges"))
    })?;
    debug!(device, ?table, min = range.min, max = range.max, "Auto-detected input range");
    Ok(range)
}

impl TaskConfig for DetectorConfig {
    fn label(&self) -> &'static str {
        "detector"
    }

    fn pending(&self) -> Pending {
        self.pending
    }

    fn pending_mut(&mut self) -> &mut Pending {
        &mut self.pending
    }

    fn is_created(&self) -> bool {
        self.task.is_some()
    }

    fn create(&mut self, ctx: &ScanContext<'_>) -> Result<()> {
        if ctx.detector_channels.is_empty() {
            return Err(ScanError::Channel("no detector channels enabled".into()));
        }
        let settings = ctx.settings;
        let range = resolve_input_range(
            self.driver.as_ref(),
            &settings.device,
            settings.input_voltage_range,
            settings.range_table,
        )?;

        let task = create_task(&self.driver, "Detector")?;
        let physical: Vec<String> = ctx
            .detector_channels
            .iter()
            .map(|c| qualify(c, &settings.device, false))
            .collect();
        self.driver.create_ai_voltage_chan(
            task.handle(),
            &join_name_list(&physical),
            range.min,
            range.max,
        )?;
        self.task = Some(task);
        self.input_range = Some(range);
        self.callback_registered = false;
        Ok(())
    }

    fn configure_timing(&mut self, ctx: &ScanContext<'_>) -> Result<()> {
        let task = self.handle()?;
        let bin = u64::from(ctx.settings.bin_factor);
        let per_line = ctx.params.width as u64 * bin;
        self.driver.cfg_samp_clk_timing(
            task,
            "",
            ctx.pixel_rate * bin as f64,
            Edge::Rising,
            SampleMode::Finite(per_line),
        )?;
        self.driver
            .cfg_input_buffer(task, u64::from(ctx.settings.buffer_lines) * per_line)?;
        Ok(())
    }

    fn configure_triggers(&mut self, ctx: &ScanContext<'_>) -> Result<()> {
        let task = self.handle()?;
        let source = qualify(&ctx.settings.line_trigger, &ctx.settings.device, true);
        self.driver
            .cfg_dig_edge_start_trig(task, &source, Edge::Rising)?;
        self.driver.set_start_trig_retriggerable(task, true)?;
        Ok(())
    }

    fn register_callback(&mut self, ctx: &ScanContext<'_>) -> Result<()> {
        let task = self.handle()?;
        if self.callback_registered {
            self.driver.unregister_every_n_samples(task)?;
            self.callback_registered = false;
        }
        let n = ctx.params.width * ctx.settings.bin_factor as usize;
        let n_channels = ctx.detector_channels.len();
        let every_n = u32::try_from(n)
            .map_err(|_| ScanError::Channel(format!("line of {n} samples is too long")))?;

        let driver = Arc::clone(&self.driver);
        let frames = Arc::clone(&self.frames);
        let mut raw = vec![0.0; n * n_channels];
        self.driver.register_every_n_samples(
            task,
            every_n,
            Box::new(move |handle, samples| {
                let samples = samples as usize;
                raw.resize(samples * n_channels, 0.0);
                match driver.read_analog_f64(handle, samples, Duration::ZERO, &mut raw) {
                    Ok(read) => frames.append(&raw[..read * n_channels], read),
                    Err(e) => error!(error = %e, "Detector read failed"),
                }
            }),
        )?;
        self.callback_registered = true;
        Ok(())
    }

    fn tasks(&self) -> Vec<&ScopedTask> {
        self.task.iter().collect()
    }

    fn release(&mut self) -> Result<()> {
        self.callback_registered = false;
        clear_task(&mut self.task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceSettings;
    use crate::waveform::WaveformParams;
    use daqmx_hal::{Op, SimulatedDaqmx};

    #[test]
    fn test_bin_average_scales_and_clamps() {
        let mut out = [0u16; 3];
        bin_average(&[1.0, 2.0, 3.0, 4.0, -1.0, -3.0, 20.0, 20.0], 2, 10.0, &mut out);
        // 1.5 V, 3.5 V, -2 V; the last pair has no slot.
        assert_eq!(out, [4915, 11468, 0]);

        let mut saturated = [0u16; 1];
        bin_average(&[100.0], 1, 1.0, &mut saturated);
        assert_eq!(saturated, [u16::MAX]);
    }

    #[test]
    fn test_frame_buffers_complete_after_all_lines() {
        let frames = FrameBuffers::new();
        frames.resize(2, 4, 2, 10.0);
        for _ in 0..2 {
            // Two channels, four samples each: two pixels per line.
            frames.append(&[1.0, 1.0, 2.0, 2.0, 5.0, 5.0, 5.0, 5.0], 4);
        }
        assert!(frames.is_complete());
        assert!(frames.wait_complete(Duration::ZERO));

        let mut seen = Vec::new();
        frames.for_each_channel(|ch, pixels| {
            seen.push((ch, pixels.to_vec()));
            true
        });
        assert_eq!(seen[0].1, vec![3276, 6553, 3276, 6553]);
        assert_eq!(seen[1].1, vec![16383; 4]);

        frames.reset();
        assert!(!frames.is_complete());
        assert!(!frames.wait_complete(Duration::from_millis(5)));
    }

    #[test]
    fn test_for_each_channel_stops_on_false() {
        let frames = FrameBuffers::new();
        frames.resize(3, 1, 1, 1.0);
        let mut calls = 0;
        let all = frames.for_each_channel(|_, _| {
            calls += 1;
            false
        });
        assert!(!all);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_range_detection_uses_selected_table() {
        let sim = SimulatedDaqmx::new();
        let input = resolve_input_range(&sim, "Dev1", None, RangeTable::Input).unwrap();
        assert_eq!(input.max, 10.0);
        let explicit = resolve_input_range(&sim, "Dev1", Some(2.0), RangeTable::Input).unwrap();
        assert_eq!(explicit, VoltageRange { min: -2.0, max: 2.0 });

        sim.clear_calls();
        resolve_input_range(&sim, "Dev1", None, RangeTable::Output).unwrap();
        assert_eq!(sim.count_ops(|op| op == Op::Query), 1);
    }

    #[test]
    fn test_set_up_sizes_line_acquisition() {
        let sim = Arc::new(SimulatedDaqmx::new());
        let settings = DeviceSettings {
            bin_factor: 2,
            buffer_lines: 4,
            ..Default::default()
        };
        let channels = vec!["ai0".to_string(), "ai1".to_string()];
        let params = WaveformParams::full_frame(32);
        let ctx = ScanContext {
            params: &params,
            pixel_rate: 1.0e6,
            settings: &settings,
            detector_channels: &channels,
        };
        let mut detector = DetectorConfig::new(sim.clone());
        detector.set_up(&ctx).unwrap();

        let info = sim.task_info("GalvoScan-Detector").unwrap();
        assert_eq!(info.channels, ["Dev1/ai0", "Dev1/ai1"]);
        assert_eq!(info.rate, 2.0e6);
        assert_eq!(info.mode, Some(SampleMode::Finite(64)));
        assert_eq!(info.input_buffer, Some(256));
        assert_eq!(info.every_n, Some(64));
        assert_eq!(info.start_trigger.as_deref(), Some("/Dev1/PFI12"));
        assert!(info.retriggerable);

        // A callback change re-registers without a second callback.
        detector.mark(Pending::CALLBACK);
        detector.set_up(&ctx).unwrap();
        assert_eq!(sim.count_ops(|op| op == Op::UnregisterCallback), 1);
    }

    #[test]
    fn test_missing_channel_fails_clean() {
        let sim = Arc::new(SimulatedDaqmx::new());
        let settings = DeviceSettings::default();
        let channels = vec!["ai12".to_string()];
        let params = WaveformParams::full_frame(8);
        let ctx = ScanContext {
            params: &params,
            pixel_rate: 1.0e6,
            settings: &settings,
            detector_channels: &channels,
        };
        let mut detector = DetectorConfig::new(sim.clone());
        let err = detector.set_up(&ctx).unwrap_err();
        assert_eq!(err.to_string(), "Failed to create detector task");
        assert_eq!(sim.live_tasks(), 0);
    }
}
