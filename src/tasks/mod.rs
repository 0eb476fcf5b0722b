//! Hardware task configurations.
//!
//! Each task group (clock, scanner, detector) owns its driver task handles
//! and a [`Pending`] set of configuration aspects that are stale. All three
//! share one state machine, implemented once as provided methods of
//! [`TaskConfig`]:
//!
//! - `set_up`: create the tasks if needed (marking everything pending), then
//!   apply pending timing, trigger, output and callback steps in that order,
//!   clearing each flag as it succeeds, and commit if anything changed.
//! - `shutdown`: clear every task handle; idempotent.
//! - `start` / `stop`: pass through to the driver.
//!
//! Any failure in `set_up`, `start` or `stop` forces a shutdown so the next
//! `set_up` starts from freshly created tasks.

pub mod clock;
pub mod detector;
pub mod scanner;

use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use daqmx_hal::{DaqmxDriver, ScopedTask, TaskAction};
use tracing::{debug, warn};

use crate::config::DeviceSettings;
use crate::error::{Result, ResultExt, ScanError};
use crate::waveform::WaveformParams;

pub use clock::ClockConfig;
pub use detector::{DetectorConfig, FrameBuffers};
pub use scanner::ScannerConfig;

bitflags! {
    /// Configuration aspects that must be reapplied before the next use.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Pending: u8 {
        /// Sample clock, counter pulse and buffer sizing
        const TIMING = 1 << 0;
        /// Start triggers
        const TRIGGER = 1 << 1;
        /// Output buffer contents
        const OUTPUT = 1 << 2;
        /// Every-N samples callback
        const CALLBACK = 1 << 3;
    }
}

/// Everything a task needs to configure itself for one acquisition.
#[derive(Debug, Clone, Copy)]
pub struct ScanContext<'a> {
    /// Scan geometry
    pub params: &'a WaveformParams,
    /// Pixel clock, in Hz
    pub pixel_rate: f64,
    /// Device settings
    pub settings: &'a DeviceSettings,
    /// Physical analog-input channels to acquire
    pub detector_channels: &'a [String],
}

impl ScanContext<'_> {
    /// Estimated duration of one frame.
    pub fn frame_duration(&self) -> Result<Duration> {
        sample_duration(self.params.scanner_waveform_size(), self.pixel_rate)
    }
}

/// Time to clock out `samples` at `rate` Hz. Fails when the result does not
/// fit a [`Duration`].
pub fn sample_duration(samples: usize, rate: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(samples as f64 / rate)
        .map_err(|e| ScanError::Waveform(format!("{samples} samples at {rate} Hz: {e}")))
}

const STEPS: [(Pending, &str); 4] = [
    (Pending::TIMING, "timing"),
    (Pending::TRIGGER, "triggers"),
    (Pending::OUTPUT, "output"),
    (Pending::CALLBACK, "callback"),
];

/// One group of driver tasks with lazy, flag-driven reconfiguration.
pub trait TaskConfig {
    /// Short name used in logs and error context.
    fn label(&self) -> &'static str;

    /// Stale configuration aspects.
    fn pending(&self) -> Pending;

    /// Mutable access to the stale set.
    fn pending_mut(&mut self) -> &mut Pending;

    /// Whether the driver tasks exist.
    fn is_created(&self) -> bool;

    /// Create the driver tasks and their channels.
    fn create(&mut self, ctx: &ScanContext<'_>) -> Result<()>;

    /// Apply sample timing.
    fn configure_timing(&mut self, ctx: &ScanContext<'_>) -> Result<()>;

    /// Apply start triggers.
    fn configure_triggers(&mut self, _ctx: &ScanContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Write output buffers.
    fn write_output(&mut self, _ctx: &ScanContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Register sample callbacks.
    fn register_callback(&mut self, _ctx: &ScanContext<'_>) -> Result<()> {
        Ok(())
    }

    /// The owned tasks, in start order.
    fn tasks(&self) -> Vec<&ScopedTask>;

    /// Drop every owned task, clearing it on the driver.
    fn release(&mut self) -> Result<()>;

    /// Mark aspects stale.
    fn mark(&mut self, flags: Pending) {
        if !flags.is_empty() {
            debug!(task = self.label(), ?flags, "Marked pending");
        }
        *self.pending_mut() |= flags;
    }

    /// Bring the tasks in line with `ctx`, doing only the pending steps.
    fn set_up(&mut self, ctx: &ScanContext<'_>) -> Result<()> {
        let result = try_set_up(self, ctx);
        if result.is_err() {
            self.force_shutdown();
        }
        result
    }

    /// Clear all tasks. Calling it on uncreated tasks is a no-op.
    fn shutdown(&mut self) -> Result<()> {
        if !self.is_created() {
            return Ok(());
        }
        debug!(task = self.label(), "Shutting down");
        *self.pending_mut() = Pending::all();
        self.release()
            .with_context(|| format!("Failed to shut down {}", self.label()))
    }

    /// Start every task in order. The tasks must exist.
    fn start(&mut self) -> Result<()> {
        if !self.is_created() {
            return Err(ScanError::Channel(format!("{} tasks not created", self.label())));
        }
        let result = for_each_task(self, "start", |driver, task| driver.start_task(task));
        if result.is_err() {
            self.force_shutdown();
        }
        result
    }

    /// Stop every task. Each task is attempted; the first error is returned.
    fn stop(&mut self) -> Result<()> {
        let result = for_each_task(self, "stop", |driver, task| driver.stop_task(task));
        if result.is_err() {
            self.force_shutdown();
        }
        result
    }

    /// Shut down, logging instead of returning the error.
    fn force_shutdown(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(task = self.label(), error = %e.report(), "Forced shutdown failed");
        }
    }
}

fn try_set_up<T: TaskConfig + ?Sized>(config: &mut T, ctx: &ScanContext<'_>) -> Result<()> {
    let label = config.label();
    if !config.is_created() {
        debug!(task = label, "Creating tasks");
        config
            .create(ctx)
            .with_context(|| format!("Failed to create {label} task"))?;
        *config.pending_mut() = Pending::all();
    }

    let mut must_commit = false;
    for (flag, step) in STEPS {
        if !config.pending().contains(flag) {
            continue;
        }
        debug!(task = label, step, "Applying configuration step");
        let result = if flag == Pending::TIMING {
            config.configure_timing(ctx)
        } else if flag == Pending::TRIGGER {
            config.configure_triggers(ctx)
        } else if flag == Pending::OUTPUT {
            config.write_output(ctx)
        } else {
            config.register_callback(ctx)
        };
        result.with_context(|| format!("Failed to configure {step} for {label}"))?;
        config.pending_mut().remove(flag);
        must_commit = true;
    }

    if must_commit {
        for_each_task(config, "commit", |driver, task| {
            driver.task_control(task, TaskAction::Commit)
        })?;
    }
    Ok(())
}

/// Run `op` on every task of `config`, attempting all of them and keeping
/// the first error. Later errors are logged.
fn for_each_task<T, F>(config: &T, action: &'static str, op: F) -> Result<()>
where
    T: TaskConfig + ?Sized,
    F: Fn(&dyn DaqmxDriver, daqmx_hal::TaskHandle) -> daqmx_hal::Result<()>,
{
    let label = config.label();
    let mut first: Option<ScanError> = None;
    for task in config.tasks() {
        let result = op(task.driver().as_ref(), task.handle())
            .with_context(|| format!("Failed to {action} {label} task '{}'", task.name()));
        if let Err(e) = result {
            match first {
                None => first = Some(e),
                Some(_) => warn!(task = label, error = %e.report(), "Additional {action} failure"),
            }
        }
    }
    first.map_or(Ok(()), Err)
}

/// Keep the first error of a best-effort sequence, logging the rest.
pub(crate) fn keep_first(first: &mut Option<ScanError>, result: Result<()>) {
    if let Err(e) = result {
        match first {
            None => *first = Some(e),
            Some(_) => warn!(error = %e.report(), "Additional failure during teardown"),
        }
    }
}

/// Clear an optional task, reporting the error.
pub(crate) fn clear_task(slot: &mut Option<ScopedTask>) -> Result<()> {
    match slot.take() {
        Some(task) => task.clear().map_err(ScanError::from),
        None => Ok(()),
    }
}

/// Create a task with a name scoped to this engine.
pub(crate) fn create_task(driver: &Arc<dyn DaqmxDriver>, name: &str) -> Result<ScopedTask> {
    Ok(ScopedTask::create(Arc::clone(driver), &format!("GalvoScan-{name}"))?)
}
