//! Galvo and clock waveform synthesis.
//!
//! Pure computation, no hardware access. Every line of a frame has the same
//! layout:
//!
//! ```text
//! |<- undershoot ->|<------ width ------>|<- X_RETRACE_LEN ->|
//!   X ramps in        X ramps, pixels      X spline back
//!                     line clock high      FLIM line clock high
//! ```
//!
//! Analog buffers are laid out grouped by channel (`[X..., Y...]`), digital
//! streams one byte per sample.

use serde::Serialize;

use crate::error::{Result, ScanError};

/// Retrace samples appended to every line; also the length of park moves.
pub const X_RETRACE_LEN: usize = 128;

/// Volts to optical degrees of the galvo calibration offset.
const CALIBRATION_DIVISOR: f64 = 3.0;

/// Geometry of one acquisition, rebuilt before every configuration step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WaveformParams {
    /// Pixels per line (ROI width)
    pub width: usize,
    /// Scan lines (ROI height)
    pub height: usize,
    /// Full-frame resolution the ROI is taken from
    pub resolution: usize,
    /// Zoom factor
    pub zoom: f64,
    /// Line delay before the active pixels, in samples
    pub undershoot: usize,
    /// ROI origin, in pixels
    pub x_offset: usize,
    /// ROI origin, in pixels
    pub y_offset: usize,
    /// Galvo calibration offset, in volts
    pub galvo_offset_x: f64,
    /// Galvo calibration offset, in volts
    pub galvo_offset_y: f64,
    /// Park position, in pixels
    pub x_park: i32,
    /// Park position, in pixels
    pub y_park: i32,
    /// Last voltage written by the previous park move
    pub prev_x_park_voltage: f64,
    /// Last voltage written by the previous park move
    pub prev_y_park_voltage: f64,
}

impl WaveformParams {
    /// Full-frame parameters with no undershoot or offsets.
    pub fn full_frame(resolution: usize) -> Self {
        Self {
            width: resolution,
            height: resolution,
            resolution,
            zoom: 1.0,
            undershoot: 0,
            x_offset: 0,
            y_offset: 0,
            galvo_offset_x: 0.0,
            galvo_offset_y: 0.0,
            x_park: 0,
            y_park: 0,
            prev_x_park_voltage: 0.0,
            prev_y_park_voltage: 0.0,
        }
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.resolution == 0 {
            return Err(ScanError::Waveform(format!(
                "empty geometry: {}x{} of resolution {}",
                self.width, self.height, self.resolution
            )));
        }
        if !(self.zoom.is_finite() && self.zoom > 0.0) {
            return Err(ScanError::Waveform(format!("invalid zoom {}", self.zoom)));
        }
        if self.x_offset + self.width > self.resolution
            || self.y_offset + self.height > self.resolution
        {
            return Err(ScanError::Waveform(format!(
                "ROI {}x{}+{}+{} exceeds resolution {}",
                self.width, self.height, self.x_offset, self.y_offset, self.resolution
            )));
        }
        Ok(())
    }

    /// Samples per line: undershoot, active pixels and retrace.
    pub fn line_waveform_size(&self) -> usize {
        self.undershoot + self.width + X_RETRACE_LEN
    }

    /// Samples per channel of one frame of digital clocks.
    pub fn clock_waveform_size(&self) -> usize {
        self.line_waveform_size() * self.height
    }

    /// Samples per channel of one frame of galvo waveform.
    ///
    /// The Y retrace lives in the tail of the last line, so this equals the
    /// clock size.
    pub fn scanner_waveform_size(&self) -> usize {
        self.line_waveform_size() * self.height
    }

    /// Samples per channel of a park or unpark move.
    pub fn park_waveform_size(&self) -> usize {
        X_RETRACE_LEN
    }

    fn x_axis(&self) -> Axis {
        Axis::new(self.resolution, self.zoom, self.x_offset, self.width, self.galvo_offset_x)
    }

    fn y_axis(&self) -> Axis {
        Axis::new(self.resolution, self.zoom, self.y_offset, self.height, self.galvo_offset_y)
    }

    /// First X/Y sample of the frame waveform.
    pub fn frame_start(&self) -> (f64, f64) {
        let x = self.x_axis();
        let y = self.y_axis();
        (x.at(-(self.undershoot as f64)), y.at(0.0))
    }

    /// Last X/Y sample of the frame waveform.
    pub fn frame_end(&self) -> (f64, f64) {
        let x = self.x_axis();
        let y = self.y_axis();
        (x.at(-(self.undershoot as f64) - 1.0), y.at(0.0))
    }

    /// Park position converted to volts with the scan's pixel mapping.
    pub fn park_voltages(&self) -> (f64, f64) {
        (
            pixel_to_voltage(
                f64::from(self.x_park),
                self.resolution,
                self.zoom,
                self.galvo_offset_x,
            ),
            pixel_to_voltage(
                f64::from(self.y_park),
                self.resolution,
                self.zoom,
                self.galvo_offset_y,
            ),
        )
    }
}

/// Linear pixel to volt mapping of one axis.
#[derive(Debug, Clone, Copy)]
struct Axis {
    start: f64,
    step: f64,
    calibration: f64,
}

impl Axis {
    fn new(resolution: usize, zoom: f64, offset: usize, extent: usize, galvo_offset: f64) -> Self {
        let scale = zoom * resolution as f64;
        let start = (-0.5 * resolution as f64 + offset as f64) / scale;
        let end = start + extent as f64 / scale;
        Self {
            start,
            step: (end - start) / extent as f64,
            calibration: galvo_offset / CALIBRATION_DIVISOR,
        }
    }

    /// Voltage `steps` pixels after the scan start, calibration included.
    fn at(&self, steps: f64) -> f64 {
        self.start + steps * self.step + self.calibration
    }
}

/// Voltage of a pixel coordinate on the full-frame grid.
pub fn pixel_to_voltage(pixel: f64, resolution: usize, zoom: f64, galvo_offset: f64) -> f64 {
    (-0.5 * resolution as f64 + pixel) / (zoom * resolution as f64)
        + galvo_offset / CALIBRATION_DIVISOR
}

/// Fill `out` with a cubic joining `y_first` to `y_last`.
///
/// The cubic `c0·x³ + c1·x² + c2·x + c3` is solved in closed form on
/// `x ∈ [0, n-1]` so that its value and slope (per sample) match at both
/// ends. The first and last samples are exactly the endpoints.
///
/// ```
/// use galvo_scan::waveform::spline_interpolate;
///
/// let mut out = [0.0; 5];
/// spline_interpolate(0.0, 4.0, 1.0, 1.0, &mut out).unwrap();
/// assert_eq!(out, [0.0, 1.0, 2.0, 3.0, 4.0]);
/// ```
pub fn spline_interpolate(
    y_first: f64,
    y_last: f64,
    slope_first: f64,
    slope_last: f64,
    out: &mut [f64],
) -> Result<()> {
    let n = out.len();
    if n < 2 {
        return Err(ScanError::Waveform(format!(
            "spline needs at least 2 samples, got {n}"
        )));
    }
    let len = (n - 1) as f64;
    let rise = y_last - y_first;
    let c0 = (-2.0 * rise + (slope_first + slope_last) * len) / len.powi(3);
    let c1 = (3.0 * rise - (2.0 * slope_first + slope_last) * len) / len.powi(2);
    let c2 = slope_first;
    let c3 = y_first;

    for (i, y) in out.iter_mut().enumerate() {
        let x = i as f64;
        *y = ((c0 * x + c1) * x + c2) * x + c3;
    }
    out[0] = y_first;
    out[n - 1] = y_last;
    Ok(())
}

/// Line clock: high during the active pixels of every line.
pub fn generate_line_clock(params: &WaveformParams) -> Vec<u8> {
    let active = params.undershoot..params.undershoot + params.width;
    line_pattern(params, |_, i| active.contains(&i))
}

/// FLIM line clock: high during the retrace of every line.
pub fn generate_flim_line_clock(params: &WaveformParams) -> Vec<u8> {
    let retrace_from = params.undershoot + params.width;
    line_pattern(params, |_, i| i >= retrace_from)
}

/// FLIM frame clock: high during the retrace of the last line only.
pub fn generate_flim_frame_clock(params: &WaveformParams) -> Vec<u8> {
    let retrace_from = params.undershoot + params.width;
    let last = params.height.saturating_sub(1);
    line_pattern(params, |line, i| line == last && i >= retrace_from)
}

fn line_pattern<F>(params: &WaveformParams, high: F) -> Vec<u8>
where
    F: Fn(usize, usize) -> bool,
{
    let line_size = params.line_waveform_size();
    let mut out = Vec::with_capacity(params.clock_waveform_size());
    for line in 0..params.height {
        out.extend((0..line_size).map(|i| u8::from(high(line, i))));
    }
    out
}

/// Interleave digital streams sample-major for one multi-line channel.
///
/// Sample `k` of the result occupies `streams.len()` bytes: stream 0's
/// sample `k`, then stream 1's, and so on. Shorter streams are padded low.
pub fn interleave_digital_lines(streams: &[&[u8]]) -> Vec<u8> {
    let samples = streams.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut out = Vec::with_capacity(samples * streams.len());
    for k in 0..samples {
        out.extend(streams.iter().map(|s| s.get(k).copied().unwrap_or(0)));
    }
    out
}

/// The clock task buffer: line clock, FLIM line clock and FLIM frame clock
/// interleaved for three digital lines.
pub fn generate_clock_frame(params: &WaveformParams) -> Vec<u8> {
    let line = generate_line_clock(params);
    let flim_line = generate_flim_line_clock(params);
    let flim_frame = generate_flim_frame_clock(params);
    interleave_digital_lines(&[&line, &flim_line, &flim_frame])
}

/// One frame of galvo waveform, grouped by channel: `[X..., Y...]`.
///
/// X is a sawtooth: a linear ramp over undershoot and active pixels, then a
/// slope-matched spline back to one step before the next line's first
/// sample. Y holds one level per line and returns to its start with a
/// zero-slope spline over the last `X_RETRACE_LEN` samples of the frame.
pub fn generate_galvo_waveform_frame(params: &WaveformParams) -> Result<Vec<f64>> {
    params.validate()?;
    let line_size = params.line_waveform_size();
    let frame_size = params.scanner_waveform_size();
    let ramp_len = params.undershoot + params.width;
    let undershoot = params.undershoot as f64;
    let x = params.x_axis();
    let y = params.y_axis();

    let mut line = vec![0.0; line_size];
    for (i, v) in line[..ramp_len].iter_mut().enumerate() {
        *v = x.at(i as f64 - undershoot);
    }
    spline_interpolate(
        x.at(params.width as f64),
        x.at(-undershoot - 1.0),
        x.step,
        x.step,
        &mut line[ramp_len..],
    )?;

    let mut out = Vec::with_capacity(2 * frame_size);
    for _ in 0..params.height {
        out.extend_from_slice(&line);
    }
    for j in 0..params.height {
        let level = y.at(j as f64);
        out.extend(std::iter::repeat(level).take(line_size));
    }

    let last_level = y.at((params.height - 1) as f64);
    let tail = &mut out[2 * frame_size - X_RETRACE_LEN..];
    spline_interpolate(last_level, y.at(0.0), 0.0, 0.0, tail)?;
    Ok(out)
}

/// Move from the previous park voltages to the frame start, grouped by channel.
pub fn generate_galvo_unpark_waveform(params: &WaveformParams) -> Result<Vec<f64>> {
    params.validate()?;
    let (x_start, y_start) = params.frame_start();
    rest_to_rest(
        (params.prev_x_park_voltage, params.prev_y_park_voltage),
        (x_start, y_start),
        params.park_waveform_size(),
    )
}

/// Move from the frame end to the park position, grouped by channel.
///
/// The last X and Y samples are what the next unpark starts from.
pub fn generate_galvo_park_waveform(params: &WaveformParams) -> Result<Vec<f64>> {
    params.validate()?;
    rest_to_rest(
        params.frame_end(),
        params.park_voltages(),
        params.park_waveform_size(),
    )
}

fn rest_to_rest(from: (f64, f64), to: (f64, f64), len: usize) -> Result<Vec<f64>> {
    let mut out = vec![0.0; 2 * len];
    let (xs, ys) = out.split_at_mut(len);
    spline_interpolate(from.0, to.0, 0.0, 0.0, xs)?;
    spline_interpolate(from.1, to.1, 0.0, 0.0, ys)?;
    Ok(out)
}

/// Last X and Y samples of a grouped two-channel move.
pub fn last_samples(waveform: &[f64]) -> Option<(f64, f64)> {
    let half = waveform.len() / 2;
    if half == 0 {
        return None;
    }
    Some((waveform[half - 1], waveform[2 * half - 1]))
}
