//! Host acquisition session contract.
//!
//! The host framework describes each acquisition through an
//! [`AcquisitionSession`] and receives completed frames through
//! [`AcquisitionSession::deliver_frame`]. [`ScanRequest`] is a plain
//! implementation used by the CLI and tests.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Region of interest on the full-frame pixel grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// Left edge, in pixels
    pub x: usize,
    /// Top edge, in pixels
    pub y: usize,
    /// Width, in pixels
    pub width: usize,
    /// Height, in pixels
    pub height: usize,
}

impl Roi {
    /// The whole `resolution × resolution` frame.
    pub fn full(resolution: usize) -> Self {
        Self {
            x: 0,
            y: 0,
            width: resolution,
            height: resolution,
        }
    }
}

/// Source of the clock start trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TriggerSource {
    /// Started by software
    #[default]
    Software,
    /// Started by an external edge
    External,
}

/// Source of the pixel clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClockSource {
    /// Device internal timebase
    #[default]
    Internal,
    /// External clock input
    External,
}

/// One acquisition as described by the host.
pub trait AcquisitionSession: Send + Sync {
    /// Pixel clock, in Hz.
    fn pixel_rate(&self) -> f64;
    /// Full-frame resolution, in pixels.
    fn resolution(&self) -> usize;
    /// Zoom factor.
    fn zoom(&self) -> f64;
    /// Region of interest.
    fn roi(&self) -> Roi;
    /// Number of frames to acquire.
    fn frame_count(&self) -> u32;
    /// Whether clocks are requested.
    fn wants_clock(&self) -> bool;
    /// Whether galvo scanning is requested.
    fn wants_scanner(&self) -> bool;
    /// Whether detector acquisition is requested.
    fn wants_detector(&self) -> bool;
    /// Clock start trigger.
    fn clock_trigger(&self) -> TriggerSource;
    /// Pixel clock source.
    fn clock_source(&self) -> ClockSource;
    /// Hand one channel of a completed frame to the host.
    ///
    /// Returns `false` to request the acquisition to stop.
    fn deliver_frame(&self, channel: usize, pixels: &[u16]) -> bool;
}

/// Frame sink: `(channel, pixels) -> keep going`.
pub type FrameSink = Box<dyn Fn(usize, &[u16]) -> bool + Send + Sync>;

/// A concrete session with a boxed frame sink.
pub struct ScanRequest {
    /// Pixel clock, in Hz
    pub pixel_rate: f64,
    /// Full-frame resolution
    pub resolution: usize,
    /// Zoom factor
    pub zoom: f64,
    /// Region of interest
    pub roi: Roi,
    /// Frames to acquire
    pub frames: u32,
    /// Clocks requested
    pub clock: bool,
    /// Scanner requested
    pub scanner: bool,
    /// Detector requested
    pub detector: bool,
    /// Clock start trigger
    pub clock_trigger: TriggerSource,
    /// Pixel clock source
    pub clock_source: ClockSource,
    sink: FrameSink,
}

impl ScanRequest {
    /// One full frame at zoom 1 with every subsystem requested; frames are
    /// discarded.
    pub fn new(resolution: usize, pixel_rate: f64) -> Self {
        Self {
            pixel_rate,
            resolution,
            zoom: 1.0,
            roi: Roi::full(resolution),
            frames: 1,
            clock: true,
            scanner: true,
            detector: true,
            clock_trigger: TriggerSource::Software,
            clock_source: ClockSource::Internal,
            sink: Box::new(|_, _| true),
        }
    }

    /// Set the frame count.
    pub fn with_frames(mut self, frames: u32) -> Self {
        self.frames = frames;
        self
    }

    /// Set the zoom factor.
    pub fn with_zoom(mut self, zoom: f64) -> Self {
        self.zoom = zoom;
        self
    }

    /// Set the region of interest.
    pub fn with_roi(mut self, roi: Roi) -> Self {
        self.roi = roi;
        self
    }

    /// Scan without acquiring detector data.
    pub fn scanner_only(mut self) -> Self {
        self.detector = false;
        self
    }

    /// Deliver frames to `sink`.
    pub fn with_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(usize, &[u16]) -> bool + Send + Sync + 'static,
    {
        self.sink = Box::new(sink);
        self
    }
}

impl fmt::Debug for ScanRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanRequest")
            .field("pixel_rate", &self.pixel_rate)
            .field("resolution", &self.resolution)
            .field("zoom", &self.zoom)
            .field("roi", &self.roi)
            .field("frames", &self.frames)
            .field("detector", &self.detector)
            .finish_non_exhaustive()
    }
}

impl AcquisitionSession for ScanRequest {
    fn pixel_rate(&self) -> f64 {
        self.pixel_rate
    }

    fn resolution(&self) -> usize {
        self.resolution
    }

    fn zoom(&self) -> f64 {
        self.zoom
    }

    fn roi(&self) -> Roi {
        self.roi
    }

    fn frame_count(&self) -> u32 {
        self.frames
    }

    fn wants_clock(&self) -> bool {
        self.clock
    }

    fn wants_scanner(&self) -> bool {
        self.scanner
    }

    fn wants_detector(&self) -> bool {
        self.detector
    }

    fn clock_trigger(&self) -> TriggerSource {
        self.clock_trigger
    }

    fn clock_source(&self) -> ClockSource {
        self.clock_source
    }

    fn deliver_frame(&self, channel: usize, pixels: &[u16]) -> bool {
        (self.sink)(channel, pixels)
    }
}
