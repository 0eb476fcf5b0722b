//! Galvo scanner output.
//!
//! One analog-output task on the X and Y galvo channels, clocked at the pixel
//! rate and generating one frame. It has no start trigger of its own: its
//! start trigger is the source the clock tasks wait on.

use std::sync::Arc;
use std::time::Duration;

use daqmx_hal::names::qualify;
use daqmx_hal::{DaqmxDriver, Edge, SampleMode, ScopedTask};

use super::{clear_task, create_task, Pending, ScanContext, TaskConfig};
use crate::error::{Result, ScanError};
use crate::waveform::generate_galvo_waveform_frame;

/// Galvo output voltage limits.
const GALVO_LIMIT_V: f64 = 10.0;

/// Scanner task group.
pub struct ScannerConfig {
    driver: Arc<dyn DaqmxDriver>,
    task: Option<ScopedTask>,
    pending: Pending,
}

impl ScannerConfig {
    /// An uncreated scanner.
    pub fn new(driver: Arc<dyn DaqmxDriver>) -> Self {
        Self {
            driver,
            task: None,
            pending: Pending::all(),
        }
    }

    fn handle(&self) -> Result<daqmx_hal::TaskHandle> {
        self.task
            .as_ref()
            .map(ScopedTask::handle)
            .ok_or_else(|| ScanError::Channel("scanner task not created".into()))
    }

    /// Create the task if it does not exist yet.
    pub fn ensure_created(&mut self, ctx: &ScanContext<'_>) -> Result<()> {
        if !self.is_created() {
            self.create(ctx)?;
            self.pending = Pending::all();
        }
        Ok(())
    }

    /// Reprogram the task for a finite move of `samples` per channel and
    /// write it. Leaves the raster configuration stale.
    pub fn load_move(&mut self, pixel_rate: f64, samples: usize, waveform: &[f64]) -> Result<()> {
        let task = self.handle()?;
        self.pending |= Pending::TIMING | Pending::OUTPUT;
        self.driver.cfg_samp_clk_timing(
            task,
            "",
            pixel_rate,
            Edge::Rising,
            SampleMode::Finite(samples as u64),
        )?;
        self.driver.write_analog_f64(task, samples, waveform)?;
        Ok(())
    }

    /// Block until the finite generation completes.
    pub fn wait_done(&self, timeout: Duration) -> Result<()> {
        let task = self.handle()?;
        Ok(self.driver.wait_until_done(task, timeout)?)
    }
}

impl TaskConfig for ScannerConfig {
    fn label(&self) -> &'static str {
        "scanner"
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
        let task = create_task(&self.driver, "Scanner")?;
        self.driver.create_ao_voltage_chan(
            task.handle(),
            &qualify(&ctx.settings.scanner_channels, &ctx.settings.device, false),
            -GALVO_LIMIT_V,
            GALVO_LIMIT_V,
        )?;
        self.task = Some(task);
        Ok(())
    }

    fn configure_timing(&mut self, ctx: &ScanContext<'_>) -> Result<()> {
        let task = self.handle()?;
        self.driver.cfg_samp_clk_timing(
            task,
            "",
            ctx.pixel_rate,
            Edge::Rising,
            SampleMode::Finite(ctx.params.scanner_waveform_size() as u64),
        )?;
        Ok(())
    }

    fn write_output(&mut self, ctx: &ScanContext<'_>) -> Result<()> {
        let task = self.handle()?;
        let waveform = generate_galvo_waveform_frame(ctx.params)?;
        self.driver
            .write_analog_f64(task, ctx.params.scanner_waveform_size(), &waveform)?;
        Ok(())
    }

    fn tasks(&self) -> Vec<&ScopedTask> {
        self.task.iter().collect()
    }

    fn release(&mut self) -> Result<()> {
        clear_task(&mut self.task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceSettings;
    use crate::waveform::WaveformParams;
    use daqmx_hal::error::STATUS_INVALID_ATTRIBUTE_VALUE;
    use daqmx_hal::{Op, SimulatedDaqmx};

    fn context<'a>(params: &'a WaveformParams, settings: &'a DeviceSettings) -> ScanContext<'a> {
        ScanContext {
            params,
            pixel_rate: 1.0e6,
            settings,
            detector_channels: &[],
        }
    }

    #[test]
    fn test_set_up_writes_raster() {
        let sim = Arc::new(SimulatedDaqmx::new());
        let settings = DeviceSettings::default();
        let params = WaveformParams::full_frame(16);
        let mut scanner = ScannerConfig::new(sim.clone());
        scanner.set_up(&context(&params, &settings)).unwrap();

        let written = sim.last_analog_write("GalvoScan-Scanner").unwrap();
        assert_eq!(written.len(), 2 * params.scanner_waveform_size());
        let info = sim.task_info("GalvoScan-Scanner").unwrap();
        assert_eq!(info.channels, ["Dev1/ao0", "Dev1/ao1"]);
        assert!(info.start_trigger.is_none());
    }

    #[test]
    fn test_output_only_change_skips_timing() {
        let sim = Arc::new(SimulatedDaqmx::new());
        let settings = DeviceSettings::default();
        let params = WaveformParams::full_frame(16);
        let mut scanner = ScannerConfig::new(sim.clone());
        scanner.set_up(&context(&params, &settings)).unwrap();

        sim.clear_calls();
        scanner.mark(Pending::OUTPUT);
        scanner.set_up(&context(&params, &settings)).unwrap();
        assert_eq!(sim.count_ops(|op| op == Op::CfgTiming), 0);
        assert_eq!(sim.count_ops(|op| op == Op::WriteAnalog), 1);
        assert_eq!(sim.count_ops(|op| op == Op::TaskControl), 1);
    }

    #[test]
    fn test_failed_step_forces_shutdown() {
        let sim = Arc::new(SimulatedDaqmx::new());
        let settings = DeviceSettings::default();
        let params = WaveformParams::full_frame(16);
        let mut scanner = ScannerConfig::new(sim.clone());

        sim.fail_on(Op::CfgTiming, "Scanner", STATUS_INVALID_ATTRIBUTE_VALUE);
        let err = scanner.set_up(&context(&params, &settings)).unwrap_err();
        assert_eq!(err.to_string(), "Failed to configure timing for scanner");
        assert!(!scanner.is_created());
        assert_eq!(sim.live_tasks(), 0);

        scanner.set_up(&context(&params, &settings)).unwrap();
        assert!(scanner.is_created());
    }
}
