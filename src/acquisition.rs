//! Acquisition orchestration.
//!
//! [`Acquisition`] runs the arm / start / stop / wait protocol against one
//! [`ScanHardware`]. Control calls synchronize through one mutex and one
//! condition variable, notified when `running` goes false. A started
//! acquisition runs on its own worker thread:
//!
//! 1. unpark the galvos to the frame start
//! 2. restore the scanner raster
//! 3. for each frame, unless a stop was requested: start detector, clock and
//!    scanner in that order, wait for the scanner and the detector frame,
//!    stop detector, clock and scanner in that order, deliver the frame
//! 4. park the galvos, whatever happened before
//! 5. clear `running` and wake every waiter
//!
//! The worker takes the hardware lock per step and releases it while the
//! host consumes a frame. The `running` and `armed` flags keep control-thread
//! configuration and the worker apart. Settings and park voltages are read
//! from a snapshot republished after every change, so they never wait on a
//! running acquisition.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use daqmx_hal::DaqmxDriver;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::{DeviceSettings, FrameTimeoutPolicy};
use crate::error::{Result, ResultExt, ScanError};
use crate::park;
use crate::reconfig::{invalidations, ScanGeometry};
use crate::session::{AcquisitionSession, ClockSource, TriggerSource};
use crate::tasks::{
    keep_first, ClockConfig, DetectorConfig, FrameBuffers, ScanContext, ScannerConfig, TaskConfig,
};
use crate::waveform::{WaveformParams, X_RETRACE_LEN};

/// Time to let in-flight generation finish before stopping the clock: the
/// retrace duration, rounded up to whole milliseconds.
pub fn settle_time(pixel_rate: f64) -> Duration {
    let retrace_ms = (X_RETRACE_LEN as f64 / pixel_rate * 1000.0).ceil();
    Duration::from_millis(retrace_ms.max(1.0) as u64)
}

/// Cooperative stop request, observed at frame boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Keep acquiring
    Continue,
    /// The host asked to stop
    Halt,
}

/// The three task groups plus everything that persists between acquisitions.
pub struct ScanHardware {
    pub(crate) settings: DeviceSettings,
    ai_physical: Vec<String>,
    pub(crate) clock: ClockConfig,
    pub(crate) scanner: ScannerConfig,
    pub(crate) detector: DetectorConfig,
    last_geometry: Option<ScanGeometry>,
    park_voltages: (f64, f64),
}

impl ScanHardware {
    /// Uncreated task groups on `driver`. `ai_physical` lists every analog
    /// input of the device; enabled channels index into it.
    pub fn new(driver: Arc<dyn DaqmxDriver>, settings: DeviceSettings, ai_physical: Vec<String>) -> Self {
        Self {
            settings,
            ai_physical,
            clock: ClockConfig::new(Arc::clone(&driver)),
            scanner: ScannerConfig::new(Arc::clone(&driver)),
            detector: DetectorConfig::new(driver),
            last_geometry: None,
            park_voltages: (0.0, 0.0),
        }
    }

    /// Current settings.
    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    /// Voltages the last park move ended on.
    pub fn park_voltages(&self) -> (f64, f64) {
        self.park_voltages
    }

    /// Geometry of the last successful configuration.
    pub fn last_geometry(&self) -> Option<&ScanGeometry> {
        self.last_geometry.as_ref()
    }

    /// Physical names of the enabled detector channels.
    pub fn detector_channels(&self) -> Result<Vec<String>> {
        self.settings
            .enabled_channels
            .iter()
            .map(|&i| {
                self.ai_physical.get(i).cloned().ok_or_else(|| {
                    ScanError::Channel(format!(
                        "channel {i} not available ({} inputs)",
                        self.ai_physical.len()
                    ))
                })
            })
            .collect()
    }

    /// Waveform parameters for `session` with the current settings.
    pub fn params_for(&self, session: &dyn AcquisitionSession) -> WaveformParams {
        let roi = session.roi();
        WaveformParams {
            width: roi.width,
            height: roi.height,
            resolution: session.resolution(),
            zoom: session.zoom(),
            undershoot: self.settings.line_delay as usize,
            x_offset: roi.x,
            y_offset: roi.y,
            galvo_offset_x: self.settings.galvo_offset_x,
            galvo_offset_y: self.settings.galvo_offset_y,
            x_park: self.settings.park_x,
            y_park: self.settings.park_y,
            prev_x_park_voltage: self.park_voltages.0,
            prev_y_park_voltage: self.park_voltages.1,
        }
    }

    /// Apply the geometry delta and set up clock, scanner and detector.
    pub fn configure(&mut self, session: &dyn AcquisitionSession) -> Result<()> {
        let geometry = ScanGeometry::from_session(session);
        let inv = invalidations(self.last_geometry.as_ref(), &geometry);
        if !inv.is_empty() {
            debug!(?inv, "Geometry invalidations");
        }
        self.clock.mark(inv.clock);
        self.scanner.mark(inv.scanner);
        self.detector.mark(inv.detector);

        let result = self.set_up_all(session);
        self.last_geometry = result.is_ok().then_some(geometry);
        result
    }

    fn set_up_all(&mut self, session: &dyn AcquisitionSession) -> Result<()> {
        let params = self.params_for(session);
        params.validate()?;
        let settings = self.settings.clone();
        let channels = self.detector_channels()?;
        let ctx = ScanContext {
            params: &params,
            pixel_rate: session.pixel_rate(),
            settings: &settings,
            detector_channels: &channels,
        };
        self.clock.set_up(&ctx)?;
        self.scanner.set_up(&ctx)?;
        if session.wants_detector() {
            self.detector.set_up(&ctx)?;
            self.detector.prepare_frames(&ctx)?;
        }
        Ok(())
    }

    /// Everything fixed for one run of `session` with the current settings.
    pub fn plan(&self, session: &dyn AcquisitionSession) -> Result<RunPlan> {
        Ok(RunPlan {
            params: self.params_for(session),
            settings: self.settings.clone(),
            channels: self.detector_channels()?,
            pixel_rate: session.pixel_rate(),
        })
    }

    /// Unpark the galvos and restore the scanner raster.
    pub fn begin(&mut self, plan: &RunPlan) -> Result<()> {
        let ctx = plan.ctx();
        park::unpark(&mut self.scanner, &ctx)?;
        self.scanner
            .set_up(&ctx)
            .context("Failed to restore scanner raster")
    }

    /// Acquire one frame. Returns the filled buffers when the detector ran;
    /// the caller delivers them.
    pub fn capture_frame(
        &mut self,
        plan: &RunPlan,
        detect: bool,
        frame: u32,
    ) -> Result<Option<Arc<FrameBuffers>>> {
        let ctx = plan.ctx();
        let timeout = ctx
            .frame_duration()?
            .checked_mul(2)
            .ok_or_else(|| ScanError::Waveform("frame timeout overflows".into()))?;
        let frames = Arc::clone(self.detector.frames());
        if detect {
            frames.reset();
        }

        let mut first = self.start_all(detect).err();
        let mut complete = true;
        if first.is_none() {
            match self.scanner.wait_done(timeout) {
                Ok(()) if detect => complete = frames.wait_complete(timeout),
                Ok(()) => {}
                Err(e) => first = Some(e),
            }
        }
        keep_first(&mut first, self.stop_all(detect, settle_time(ctx.pixel_rate)));
        if let Some(e) = first {
            return Err(e);
        }

        if !complete {
            error!(
                frame,
                ?timeout,
                samples = frames.samples_read(),
                "Detector frame timed out"
            );
            if plan.settings.frame_timeout_policy == FrameTimeoutPolicy::Abort {
                return Err(ScanError::FrameTimeout { frame, timeout });
            }
        }
        Ok(detect.then_some(frames))
    }

    /// Start detector (when acquiring), clock and scanner, in that order.
    fn start_all(&mut self, detect: bool) -> Result<()> {
        if detect {
            self.detector.start()?;
        }
        self.clock.start()?;
        self.scanner.start()
    }

    /// Stop detector, then clock and scanner after `settle`. Every group is
    /// attempted; the first error is returned.
    fn stop_all(&mut self, detect: bool, settle: Duration) -> Result<()> {
        let mut first = None;
        if detect {
            keep_first(&mut first, self.detector.stop());
        }
        thread::sleep(settle);
        keep_first(&mut first, self.clock.stop());
        keep_first(&mut first, self.scanner.stop());
        first.map_or(Ok(()), Err)
    }

    /// Park the galvos and remember where they ended.
    pub fn park_galvos(&mut self, session: &dyn AcquisitionSession) -> Result<()> {
        let params = self.params_for(session);
        let settings = self.settings.clone();
        let ctx = ScanContext {
            params: &params,
            pixel_rate: session.pixel_rate(),
            settings: &settings,
            detector_channels: &[],
        };
        self.park_voltages = park::park(&mut self.scanner, &ctx)?;
        Ok(())
    }

    /// Shut every task group down. Each is attempted; the first error is
    /// returned.
    pub fn shutdown_all(&mut self) -> Result<()> {
        let mut first = None;
        keep_first(&mut first, self.detector.shutdown());
        keep_first(&mut first, self.clock.shutdown());
        keep_first(&mut first, self.scanner.shutdown());
        first.map_or(Ok(()), Err)
    }
}

/// Reject configurations the engine cannot run. Never changes state.
pub fn check_supported(session: &dyn AcquisitionSession) -> Result<()> {
    if session.clock_trigger() != TriggerSource::Software {
        return Err(ScanError::Unsupported(
            "clock must be started by software trigger".into(),
        ));
    }
    if session.clock_source() != ClockSource::Internal {
        return Err(ScanError::Unsupported(
            "pixel clock must use the internal timebase".into(),
        ));
    }
    if !session.wants_clock() {
        return Err(ScanError::Unsupported("clock output is required".into()));
    }
    if !session.wants_scanner() {
        return Err(ScanError::Unsupported("galvo scanning is required".into()));
    }
    let rate = session.pixel_rate();
    if !(rate.is_finite() && rate > 0.0) {
        return Err(ScanError::Unsupported(format!("invalid pixel rate {rate}")));
    }
    Ok(())
}

/// Scan parameters captured when a run begins.
pub struct RunPlan {
    params: WaveformParams,
    settings: DeviceSettings,
    channels: Vec<String>,
    pixel_rate: f64,
}

impl RunPlan {
    fn ctx(&self) -> ScanContext<'_> {
        ScanContext {
            params: &self.params,
            pixel_rate: self.pixel_rate,
            settings: &self.settings,
            detector_channels: &self.channels,
        }
    }
}

/// Unpark, then acquire frames until done, cancelled, halted by the host or
/// failed. Returns the number of frames acquired.
///
/// The hardware lock is held for each hardware step and released while a
/// frame is delivered, so the sink may call back into the device.
pub fn run_frames(
    hardware: &Mutex<ScanHardware>,
    session: &dyn AcquisitionSession,
    cancel: &CancelToken,
) -> Result<u32> {
    let plan = {
        let mut hw = hardware.lock();
        let plan = hw.plan(session)?;
        hw.begin(&plan)?;
        plan
    };
    let detect = session.wants_detector();

    let mut acquired = 0;
    for frame in 0..session.frame_count() {
        if cancel.is_cancelled() {
            info!(frame, "Stop requested, ending acquisition");
            break;
        }
        let captured = hardware
            .lock()
            .capture_frame(&plan, detect, frame)
            .with_context(|| format!("Failed to acquire frame {frame}"))?;
        acquired += 1;
        debug!(frame, "Frame acquired");
        if let Some(frames) = captured {
            if deliver(&frames, session, frame)? == FrameOutcome::Halt {
                info!(frame, "Host requested stop");
                break;
            }
        }
    }
    Ok(acquired)
}

/// Hand every channel of a frame to the host. A panicking sink is an error.
fn deliver(
    frames: &FrameBuffers,
    session: &dyn AcquisitionSession,
    frame: u32,
) -> Result<FrameOutcome> {
    let keep_going = panic::catch_unwind(AssertUnwindSafe(|| {
        frames.for_each_channel(|ch, pixels| session.deliver_frame(ch, pixels))
    }))
    .map_err(|_| ScanError::SinkPanicked { frame })?;
    Ok(if keep_going {
        FrameOutcome::Continue
    } else {
        FrameOutcome::Halt
    })
}

struct ControlState {
    running: bool,
    armed: bool,
    started: bool,
    worker: Option<ThreadId>,
    session: Option<Arc<dyn AcquisitionSession>>,
    cancel: CancelToken,
    last_error: Option<String>,
}

impl ControlState {
    fn on_worker(&self) -> bool {
        self.worker == Some(thread::current().id())
    }
}

struct Shared {
    state: Mutex<ControlState>,
    idle: Condvar,
}

impl Shared {
    fn finish(&self, error: Option<String>) {
        let mut state = self.state.lock();
        state.running = false;
        state.armed = false;
        state.started = false;
        state.worker = None;
        state.session = None;
        if error.is_some() {
            state.last_error = error;
        }
        self.idle.notify_all();
    }
}

/// Settings and park voltages as last published by the hardware owner.
/// Readable at any time, including from a frame sink.
#[derive(Debug, Clone)]
struct HardwareView {
    settings: DeviceSettings,
    park_voltages: (f64, f64),
}

impl HardwareView {
    fn of(hw: &ScanHardware) -> Self {
        Self {
            settings: hw.settings.clone(),
            park_voltages: hw.park_voltages,
        }
    }
}

/// Marks the acquisition finished when the worker exits, unwinding included.
struct FinishGuard<'a> {
    shared: &'a Shared,
    failure: Option<String>,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("Acquisition worker panicked");
            self.failure
                .get_or_insert_with(|| "Acquisition worker panicked".into());
        }
        self.shared.finish(self.failure.take());
    }
}

/// Arm / start / stop / wait control over one [`ScanHardware`].
pub struct Acquisition {
    shared: Arc<Shared>,
    hardware: Arc<Mutex<ScanHardware>>,
    view: Arc<Mutex<HardwareView>>,
}

impl Acquisition {
    /// Control over `hardware`, initially idle.
    pub fn new(hardware: ScanHardware) -> Self {
        let view = HardwareView::of(&hardware);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ControlState {
                    running: false,
                    armed: false,
                    started: false,
                    worker: None,
                    session: None,
                    cancel: CancelToken::new(),
                    last_error: None,
                }),
                idle: Condvar::new(),
            }),
            hardware: Arc::new(Mutex::new(hardware)),
            view: Arc::new(Mutex::new(view)),
        }
    }

    /// Validate and configure everything for `session`.
    ///
    /// Fails with `AlreadyRunning` while another acquisition is in flight.
    /// Any configuration failure leaves the device idle and re-armable.
    pub fn arm(&self, session: Arc<dyn AcquisitionSession>) -> Result<()> {
        check_supported(session.as_ref())?;
        {
            let mut state = self.shared.state.lock();
            if state.running {
                return Err(ScanError::AlreadyRunning);
            }
            state.running = true;
            state.armed = false;
            state.started = false;
            state.session = Some(Arc::clone(&session));
            state.cancel = CancelToken::new();
            state.last_error = None;
        }
        info!(
            resolution = session.resolution(),
            pixel_rate = session.pixel_rate(),
            zoom = session.zoom(),
            frames = session.frame_count(),
            "Arming acquisition"
        );

        let result = self.hardware.lock().configure(session.as_ref());

        let mut state = self.shared.state.lock();
        match result {
            Ok(()) if state.running => {
                state.armed = true;
                Ok(())
            }
            Ok(()) => {
                info!("Stopped while arming");
                Ok(())
            }
            Err(e) => {
                let e = ScanError::Context {
                    context: "Failed to arm acquisition".into(),
                    source: Box::new(e),
                };
                error!(error = %e.report(), "Arm failed");
                state.running = false;
                state.session = None;
                state.last_error = Some(e.report());
                self.shared.idle.notify_all();
                Err(e)
            }
        }
    }

    /// Start the armed acquisition on a worker thread.
    pub fn start(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.started {
            return Err(ScanError::AlreadyRunning);
        }
        if !(state.running && state.armed) {
            return Err(ScanError::NotArmed);
        }
        let Some(session) = state.session.clone() else {
            return Err(ScanError::NotArmed);
        };
        let cancel = state.cancel.clone();
        let hardware = Arc::clone(&self.hardware);
        let shared = Arc::clone(&self.shared);
        let view = Arc::clone(&self.view);

        let worker = thread::Builder::new()
            .name("galvo-scan-acquisition".into())
            .spawn(move || run_worker(&hardware, &shared, &view, session.as_ref(), &cancel))
            .context("Failed to spawn acquisition worker")?;
        state.started = true;
        state.worker = Some(worker.thread().id());
        info!("Acquisition started");
        Ok(())
    }

    /// Stop and block until the device is idle.
    ///
    /// A started acquisition finishes its current frame, parks and exits; an
    /// armed one is released directly. Called from the frame sink, it only
    /// requests the stop.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if state.started {
            info!("Stop requested");
            state.cancel.cancel();
        } else if state.running {
            info!("Disarming acquisition");
            state.running = false;
            state.armed = false;
            state.session = None;
            self.shared.idle.notify_all();
        }
        if state.on_worker() {
            return;
        }
        while state.running {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Whether an acquisition is armed or in flight.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Whether the acquisition is armed.
    pub fn is_armed(&self) -> bool {
        self.shared.state.lock().armed
    }

    /// Block until no acquisition is running. Returns at once on the worker
    /// thread.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        if state.on_worker() {
            warn!("wait() called from the frame sink");
            return;
        }
        while state.running {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Full cause chain of the last failed arm or run.
    pub fn last_error(&self) -> Option<String> {
        self.shared.state.lock().last_error.clone()
    }

    /// A copy of the current settings. Never blocks on a running acquisition.
    pub fn settings(&self) -> DeviceSettings {
        self.view.lock().settings.clone()
    }

    /// Voltages the galvos were last parked at.
    pub fn park_voltages(&self) -> (f64, f64) {
        self.view.lock().park_voltages
    }

    /// Run `f` on the hardware, refusing while an acquisition is running.
    pub fn with_idle_hardware<T, F>(&self, setting: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut ScanHardware) -> Result<T>,
    {
        let state = self.shared.state.lock();
        if state.running {
            return Err(ScanError::Busy { setting });
        }
        let mut hardware = self.hardware.lock();
        let result = f(&mut hardware);
        *self.view.lock() = HardwareView::of(&hardware);
        drop(hardware);
        drop(state);
        result
    }

    /// Run `f` on the hardware without the idle check. Blocks while a worker
    /// is in a hardware step.
    pub fn with_hardware<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&mut ScanHardware) -> T,
    {
        f(&mut self.hardware.lock())
    }
}

fn run_worker(
    hardware: &Mutex<ScanHardware>,
    shared: &Shared,
    view: &Mutex<HardwareView>,
    session: &dyn AcquisitionSession,
    cancel: &CancelToken,
) {
    let mut guard = FinishGuard {
        shared,
        failure: None,
    };
    match run_frames(hardware, session, cancel) {
        Ok(frames) => info!(frames, "Frame loop finished"),
        Err(e) => {
            error!(error = %e.report(), "Acquisition ended early");
            guard.failure = Some(e.report());
        }
    }

    let mut hw = hardware.lock();
    if let Err(e) = hw.park_galvos(session) {
        warn!(error = %e.report(), "Parking failed");
        guard.failure.get_or_insert(e.report());
    }
    *view.lock() = HardwareView::of(&hw);
    drop(hw);
    drop(guard);
    info!("Acquisition finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ScanRequest;
    use daqmx_hal::SimulatedDaqmx;
    use std::sync::atomic::AtomicU32;
    use tracing_test::traced_test;

    fn hardware(sim: &Arc<SimulatedDaqmx>) -> ScanHardware {
        let inputs = (0..4).map(|i| format!("ai{i}")).collect();
        ScanHardware::new(sim.clone(), DeviceSettings::default(), inputs)
    }

    #[test]
    fn test_settle_time_rounds_up() {
        assert_eq!(settle_time(1.0e6), Duration::from_millis(1));
        assert_eq!(settle_time(1.0e4), Duration::from_millis(13));
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_unsupported_configurations() {
        let mut request = ScanRequest::new(64, 1.0e6);
        assert!(check_supported(&request).is_ok());

        request.clock_trigger = TriggerSource::External;
        assert!(matches!(check_supported(&request), Err(ScanError::Unsupported(_))));
        request.clock_trigger = TriggerSource::Software;

        request.clock_source = ClockSource::External;
        assert!(check_supported(&request).is_err());
        request.clock_source = ClockSource::Internal;

        request.scanner = false;
        assert!(check_supported(&request).is_err());
        request.scanner = true;
        request.clock = false;
        assert!(check_supported(&request).is_err());
    }

    #[test]
    #[traced_test]
    fn test_frame_timeout_logs_and_delivers_partial_frame() {
        let sim = Arc::new(SimulatedDaqmx::new());
        sim.set_dropped_lines(2);
        let mut hw = hardware(&sim);
        let delivered = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&delivered);
        let request = ScanRequest::new(16, 1.0e6)
            .with_frames(2)
            .with_sink(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            });

        hw.configure(&request).unwrap();
        let hw = Mutex::new(hw);
        assert_eq!(run_frames(&hw, &request, &CancelToken::new()).unwrap(), 2);
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert!(logs_contain("Detector frame timed out"));
    }

    #[test]
    fn test_cancelled_run_only_unparks() {
        let sim = Arc::new(SimulatedDaqmx::new());
        let mut hw = hardware(&sim);
        let request = ScanRequest::new(16, 1.0e6).with_frames(5);
        hw.configure(&request).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        sim.clear_calls();
        assert_eq!(run_frames(&Mutex::new(hw), &request, &cancel).unwrap(), 0);
        assert_eq!(sim.task_sequence(daqmx_hal::Op::Start), ["GalvoScan-Scanner"]);
    }

    #[test]
    fn test_configure_caches_geometry_on_success_only() {
        let sim = Arc::new(SimulatedDaqmx::new());
        let mut hw = hardware(&sim);
        let request = ScanRequest::new(16, 1.0e6);
        hw.configure(&request).unwrap();
        assert_eq!(hw.last_geometry().map(|g| g.resolution), Some(16));

        let bad = ScanRequest::new(0, 1.0e6);
        assert!(hw.configure(&bad).is_err());
        assert!(hw.last_geometry().is_none());
    }

    #[test]
    fn test_worker_panic_still_finishes() {
        let acquisition = Acquisition::new(hardware(&Arc::new(SimulatedDaqmx::new())));
        acquisition.shared.state.lock().running = true;
        let shared = Arc::clone(&acquisition.shared);
        let joined = thread::spawn(move || {
            let _guard = FinishGuard {
                shared: &shared,
                failure: None,
            };
            panic!("frame loop bug");
        })
        .join();

        assert!(joined.is_err());
        assert!(!acquisition.is_running());
        acquisition.wait();
        assert_eq!(
            acquisition.last_error().as_deref(),
            Some("Acquisition worker panicked")
        );
    }
}
