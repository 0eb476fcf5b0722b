//! Line and frame clocks.
//!
//! Two cooperating tasks: a digital-output task on three lines carrying the
//! line clock, FLIM line clock and FLIM frame clock, and a counter-output
//! task whose pulse train is the detector's line trigger. Both generate one
//! frame and are retriggered by the scanner's start trigger, so clocks and
//! galvo motion begin on the same hardware edge.

use std::sync::Arc;

use daqmx_hal::names::qualify;
use daqmx_hal::{DaqmxDriver, Edge, PulseSpec, SampleMode, ScopedTask};
use tracing::debug;

use super::{clear_task, create_task, keep_first, Pending, ScanContext, TaskConfig};
use crate::error::{Result, ScanError};
use crate::waveform::generate_clock_frame;

/// Counter pulse for one line: high over the active pixels, delayed by the
/// undershoot.
pub fn line_pulse(ctx: &ScanContext<'_>) -> PulseSpec {
    let params = ctx.params;
    let line = params.line_waveform_size() as f64;
    PulseSpec {
        frequency: ctx.pixel_rate / line,
        duty_cycle: params.width as f64 / line,
        initial_delay: params.undershoot as f64 / ctx.pixel_rate,
    }
}

/// Clock task group.
pub struct ClockConfig {
    driver: Arc<dyn DaqmxDriver>,
    digital: Option<ScopedTask>,
    counter: Option<ScopedTask>,
    pending: Pending,
}

impl ClockConfig {
    /// An uncreated clock group.
    pub fn new(driver: Arc<dyn DaqmxDriver>) -> Self {
        Self {
            driver,
            digital: None,
            counter: None,
            pending: Pending::all(),
        }
    }

    fn handles(&self) -> Result<(&ScopedTask, &ScopedTask)> {
        match (&self.digital, &self.counter) {
            (Some(d), Some(c)) => Ok((d, c)),
            _ => Err(ScanError::Channel("clock tasks not created".into())),
        }
    }
}

impl TaskConfig for ClockConfig {
    fn label(&self) -> &'static str {
        "clock"
    }

    fn pending(&self) -> Pending {
        self.pending
    }

    fn pending_mut(&mut self) -> &mut Pending {
        &mut self.pending
    }

    fn is_created(&self) -> bool {
        self.digital.is_some() || self.counter.is_some()
    }

    fn create(&mut self, ctx: &ScanContext<'_>) -> Result<()> {
        let device = &ctx.settings.device;

        let digital = create_task(&self.driver, "Clock-DO")?;
        self.driver
            .create_do_chan(digital.handle(), &qualify(&ctx.settings.clock_lines, device, false))?;
        self.digital = Some(digital);

        let counter = create_task(&self.driver, "Clock-CO")?;
        self.driver.create_co_pulse_chan(
            counter.handle(),
            &qualify(&ctx.settings.counter, device, false),
            line_pulse(ctx),
        )?;
        self.counter = Some(counter);
        Ok(())
    }

    fn configure_timing(&mut self, ctx: &ScanContext<'_>) -> Result<()> {
        let (digital, counter) = self.handles()?;
        let params = ctx.params;
        let pulse = line_pulse(ctx);
        debug!(
            frequency = pulse.frequency,
            duty = pulse.duty_cycle,
            delay = pulse.initial_delay,
            lines = params.height,
            "Clock timing"
        );
        self.driver.cfg_samp_clk_timing(
            digital.handle(),
            "",
            ctx.pixel_rate,
            Edge::Rising,
            SampleMode::Finite(params.clock_waveform_size() as u64),
        )?;
        self.driver.set_co_pulse(counter.handle(), pulse)?;
        self.driver
            .cfg_implicit_timing(counter.handle(), SampleMode::Finite(params.height as u64))?;
        Ok(())
    }

    fn configure_triggers(&mut self, ctx: &ScanContext<'_>) -> Result<()> {
        let (digital, counter) = self.handles()?;
        let source = qualify(&ctx.settings.ao_start_trigger, &ctx.settings.device, true);
        for task in [digital, counter] {
            self.driver
                .cfg_dig_edge_start_trig(task.handle(), &source, Edge::Rising)?;
            self.driver.set_start_trig_retriggerable(task.handle(), true)?;
        }
        Ok(())
    }

    fn write_output(&mut self, ctx: &ScanContext<'_>) -> Result<()> {
        let (digital, _) = self.handles()?;
        let samples = ctx.params.clock_waveform_size();
        let buffer = generate_clock_frame(ctx.params);
        self.driver
            .write_digital_lines(digital.handle(), samples, &buffer)?;
        Ok(())
    }

    fn tasks(&self) -> Vec<&ScopedTask> {
        self.digital.iter().chain(self.counter.iter()).collect()
    }

    fn release(&mut self) -> Result<()> {
        let mut first = None;
        keep_first(&mut first, clear_task(&mut self.digital));
        keep_first(&mut first, clear_task(&mut self.counter));
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceSettings;
    use crate::waveform::WaveformParams;
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
    fn test_line_pulse() {
        let settings = DeviceSettings::default();
        let params = WaveformParams {
            undershoot: 50,
            ..WaveformParams::full_frame(512)
        };
        let pulse = line_pulse(&context(&params, &settings));
        assert!((pulse.frequency - 1.0e6 / 690.0).abs() < 1e-9);
        assert!((pulse.duty_cycle - 512.0 / 690.0).abs() < 1e-12);
        assert!((pulse.initial_delay - 50.0e-6).abs() < 1e-15);
    }

    #[test]
    fn test_set_up_programs_both_tasks() {
        let sim = Arc::new(SimulatedDaqmx::new());
        let settings = DeviceSettings::default();
        let params = WaveformParams {
            undershoot: 10,
            ..WaveformParams::full_frame(32)
        };
        let mut clock = ClockConfig::new(sim.clone());
        clock.set_up(&context(&params, &settings)).unwrap();

        assert!(clock.pending().is_empty());
        let digital = sim.task_info("GalvoScan-Clock-DO").unwrap();
        assert_eq!(digital.channels.len(), 3);
        assert_eq!(digital.start_trigger.as_deref(), Some("/Dev1/ao/StartTrigger"));
        assert!(digital.retriggerable && digital.committed);

        let counter = sim.task_info("GalvoScan-Clock-CO").unwrap();
        assert_eq!(counter.mode.and_then(|m| m.finite_samples()), Some(32));
        assert_eq!(
            sim.last_digital_write("GalvoScan-Clock-DO").unwrap().len(),
            3 * params.clock_waveform_size()
        );

        sim.clear_calls();
        clock.set_up(&context(&params, &settings)).unwrap();
        assert_eq!(sim.count_ops(Op::is_configuration), 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let sim = Arc::new(SimulatedDaqmx::new());
        let settings = DeviceSettings::default();
        let params = WaveformParams::full_frame(16);
        let mut clock = ClockConfig::new(sim.clone());
        clock.set_up(&context(&params, &settings)).unwrap();
        clock.shutdown().unwrap();
        clock.shutdown().unwrap();
        assert_eq!(sim.live_tasks(), 0);
        assert_eq!(clock.pending(), Pending::all());
    }
}
