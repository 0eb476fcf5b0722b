//! # galvo-scan
//!
//! Acquisition engine for galvanometer-scanning microscopes on NI-DAQmx style
//! hardware. Per frame, it generates the X/Y galvo waveforms, the digital line
//! and frame clocks and a counter line trigger, and samples the photodetector
//! channels in step with the scanner.
//!
//! - **`waveform`**: galvo raster, park/unpark moves and clock buffers.
//! - **`tasks`**: the clock, scanner and detector task groups and their lazy
//!   reconfiguration state machine.
//! - **`reconfig`**: which configuration aspects a geometry change makes stale.
//! - **`park`**: moves between the park position and the frame start.
//! - **`acquisition`**: arm / start / stop / wait and the frame worker.
//! - **`device`**: the host-facing [`GalvoScanner`].
//! - **`session`**: the host acquisition contract.
//! - **`config`**, **`logging`**, **`error`**: settings, tracing setup, errors.
//!
//! The hardware itself is reached through the [`daqmx_hal::DaqmxDriver`]
//! capability trait; [`daqmx_hal::SimulatedDaqmx`] stands in for it in tests
//! and in the `galvo-scan simulate` command.

pub mod acquisition;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod park;
pub mod reconfig;
pub mod session;
pub mod tasks;
pub mod waveform;

pub use acquisition::{Acquisition, CancelToken, ScanHardware};
pub use config::{DeviceSettings, FrameTimeoutPolicy, RangeTable};
pub use device::GalvoScanner;
pub use error::{Result, ResultExt, ScanError};
pub use session::{AcquisitionSession, ClockSource, Roi, ScanRequest, TriggerSource};
pub use waveform::WaveformParams;
