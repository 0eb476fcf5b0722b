//! Capability layer over NI-DAQmx style task drivers.
//!
//! The vendor driver is task based: a task owns channels of one kind (analog
//! output, analog input, digital output or counter output), is configured
//! with timing and triggers, committed, started and stopped. This crate
//! captures that surface as a trait so the scan engine never talks to the
//! C library directly.
//!
//! # Architecture
//!
//! - [`DaqmxDriver`] - the capability trait (one method per driver entry point)
//! - [`DaqmxError`] / [`check_status`] - status code mapping; negative codes
//!   fail, positive codes are logged as warnings
//! - [`ScopedTask`] - owned task handle, cleared on drop
//! - [`names`] - parsing of comma separated name lists and range tables
//! - [`SimulatedDaqmx`] - in-process driver used by tests and the demo binary
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use daqmx_hal::{DaqmxDriver, ScopedTask, SimulatedDaqmx};
//!
//! # fn example() -> daqmx_hal::Result<()> {
//! let sim = Arc::new(SimulatedDaqmx::new());
//! let task = ScopedTask::create(sim.clone(), "scanner")?;
//! sim.create_ao_voltage_chan(task.handle(), "Dev1/ao0:1", -10.0, 10.0)?;
//! task.clear()?;
//! assert_eq!(sim.live_tasks(), 0);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

pub mod driver;
pub mod error;
pub mod names;
pub mod sim;
pub mod task;

pub use driver::{
    DaqmxDriver, Edge, EveryNSamplesCallback, PulseSpec, SampleMode, TaskAction, TaskHandle,
};
pub use error::{check_status, DaqmxError, Result};
pub use names::VoltageRange;
pub use sim::{DriverCall, Op, SimDevice, SimulatedDaqmx, TaskInfo};
pub use task::ScopedTask;
