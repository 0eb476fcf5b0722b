//! The driver capability trait.
//!
//! [`DaqmxDriver`] is the surface the scan engine needs from a DAQmx-style
//! vendor driver. A binding to the real C library implements it by calling
//! the corresponding entry point and passing the status through
//! [`check_status`](crate::error::check_status); [`SimulatedDaqmx`](crate::sim::SimulatedDaqmx)
//! implements it in-process.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::Result;

/// Opaque handle to a driver task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskHandle(pub u64);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Clock or trigger edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Edge {
    /// Rising edge
    #[default]
    Rising,
    /// Falling edge
    Falling,
}

/// Sample generation/acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SampleMode {
    /// Stop after a fixed number of samples per channel
    Finite(u64),
    /// Run until stopped
    Continuous,
}

impl SampleMode {
    /// Number of samples per channel for finite tasks.
    pub fn finite_samples(&self) -> Option<u64> {
        match self {
            Self::Finite(n) => Some(*n),
            Self::Continuous => None,
        }
    }
}

/// Task state transition requested through `task_control`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskAction {
    /// Verify attribute consistency
    Verify,
    /// Reserve resources and program the hardware
    Commit,
    /// Release reserved resources
    Unreserve,
}

/// Counter pulse shape, expressed as frequency and duty cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PulseSpec {
    /// Pulse frequency in Hz
    pub frequency: f64,
    /// Fraction of the period the output is high (0 < duty < 1)
    pub duty_cycle: f64,
    /// Delay before the first pulse after the trigger, in seconds
    pub initial_delay: f64,
}

/// Callback fired after every N samples have been acquired into the buffer.
///
/// Receives the task handle and N. Runs on a driver thread.
pub type EveryNSamplesCallback = Box<dyn FnMut(TaskHandle, u32) + Send>;

/// Capability interface of a DAQmx-style driver.
///
/// All methods take `&self`: implementations serialize access internally, the
/// same way the C library is safe to call from several threads.
pub trait DaqmxDriver: Send + Sync {
    /// Create a new, empty task.
    fn create_task(&self, name: &str) -> Result<TaskHandle>;
    /// Clear a task and release its resources. Stops it first if running.
    fn clear_task(&self, task: TaskHandle) -> Result<()>;

    /// Add analog-output voltage channels (e.g. `"Dev1/ao0:1"`).
    fn create_ao_voltage_chan(&self, task: TaskHandle, physical: &str, min: f64, max: f64)
        -> Result<()>;
    /// Add analog-input voltage channels (e.g. `"Dev1/ai0,Dev1/ai1"`).
    fn create_ai_voltage_chan(&self, task: TaskHandle, physical: &str, min: f64, max: f64)
        -> Result<()>;
    /// Add one digital-output channel spanning the given lines.
    fn create_do_chan(&self, task: TaskHandle, lines: &str) -> Result<()>;
    /// Add a counter-output pulse channel.
    fn create_co_pulse_chan(&self, task: TaskHandle, counter: &str, pulse: PulseSpec)
        -> Result<()>;

    /// Configure sample-clock timing.
    fn cfg_samp_clk_timing(
        &self,
        task: TaskHandle,
        source: &str,
        rate: f64,
        edge: Edge,
        mode: SampleMode,
    ) -> Result<()>;
    /// Configure implicit timing (counter tasks).
    fn cfg_implicit_timing(&self, task: TaskHandle, mode: SampleMode) -> Result<()>;
    /// Update the pulse shape of an existing counter-output channel.
    fn set_co_pulse(&self, task: TaskHandle, pulse: PulseSpec) -> Result<()>;
    /// Set the input buffer size in samples per channel.
    fn cfg_input_buffer(&self, task: TaskHandle, samples_per_chan: u64) -> Result<()>;

    /// Configure a digital-edge start trigger.
    fn cfg_dig_edge_start_trig(&self, task: TaskHandle, source: &str, edge: Edge) -> Result<()>;
    /// Make the start trigger retriggerable.
    fn set_start_trig_retriggerable(&self, task: TaskHandle, retriggerable: bool) -> Result<()>;

    /// Apply a task state transition.
    fn task_control(&self, task: TaskHandle, action: TaskAction) -> Result<()>;
    /// Start the task.
    fn start_task(&self, task: TaskHandle) -> Result<()>;
    /// Stop the task.
    fn stop_task(&self, task: TaskHandle) -> Result<()>;
    /// Block until a finite task has generated/acquired all samples.
    fn wait_until_done(&self, task: TaskHandle, timeout: Duration) -> Result<()>;

    /// Write analog samples laid out grouped by channel. Returns samples per channel written.
    fn write_analog_f64(&self, task: TaskHandle, samples_per_chan: usize, data: &[f64])
        -> Result<usize>;
    /// Write digital line states, one byte per line, sample-major. Returns samples written.
    fn write_digital_lines(&self, task: TaskHandle, samples_per_chan: usize, data: &[u8])
        -> Result<usize>;
    /// Read analog samples grouped by channel into `buf`. Returns samples per channel read.
    fn read_analog_f64(
        &self,
        task: TaskHandle,
        samples_per_chan: usize,
        timeout: Duration,
        buf: &mut [f64],
    ) -> Result<usize>;

    /// Register a callback fired every `n` acquired samples.
    fn register_every_n_samples(
        &self,
        task: TaskHandle,
        n: u32,
        callback: EveryNSamplesCallback,
    ) -> Result<()>;
    /// Remove a previously registered every-N callback.
    fn unregister_every_n_samples(&self, task: TaskHandle) -> Result<()>;

    /// Comma-separated names of installed devices.
    fn installed_devices(&self) -> Result<String>;
    /// Comma-separated analog-input physical channels of a device.
    fn device_ai_physical_chans(&self, device: &str) -> Result<String>;
    /// Flat `[min, max, min, max, ...]` analog-input voltage ranges.
    fn device_ai_voltage_ranges(&self, device: &str) -> Result<Vec<f64>>;
    /// Flat `[min, max, min, max, ...]` analog-output voltage ranges.
    fn device_ao_voltage_ranges(&self, device: &str) -> Result<Vec<f64>>;

    /// Extended description of the most recent failure or warning.
    fn extended_error_info(&self) -> String;
}
