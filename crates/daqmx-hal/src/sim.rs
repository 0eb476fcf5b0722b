//! In-process simulated driver.
//!
//! [`SimulatedDaqmx`] implements [`DaqmxDriver`] without hardware. It keeps
//! enough task state to behave like a small DAQ card:
//!
//! - every call is recorded as a [`DriverCall`] so tests can assert ordering
//!   and count configuration calls;
//! - starting an analog-output task without a start trigger acts as the
//!   trigger source: every running, triggered counter task emits its finite
//!   pulse count, and every running, triggered analog-input task acquires one
//!   line per pulse and fires its every-N callback;
//! - faults can be injected per operation and task name, returning the given
//!   status code (negative codes fail, positive codes are warnings).
//!
//! Callbacks run on the thread that started the trigger source, after the
//! internal lock is released, so they may call back into the driver.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use crate::driver::{
    DaqmxDriver, Edge, EveryNSamplesCallback, PulseSpec, SampleMode, TaskAction, TaskHandle,
};
use crate::error::{
    check_status, DaqmxError, Result, STATUS_INVALID_ATTRIBUTE_VALUE, STATUS_INVALID_TASK,
    STATUS_PHYSICAL_CHAN_MISSING, STATUS_SAMPLES_NOT_AVAILABLE, STATUS_WAIT_TIMEOUT,
};
use crate::names::{expand_channel_list, join_name_list};

/// Operation recorded for every driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Op {
    CreateTask,
    ClearTask,
    CreateChannel,
    CfgTiming,
    CfgImplicitTiming,
    SetPulse,
    CfgInputBuffer,
    CfgTrigger,
    SetRetriggerable,
    TaskControl,
    Start,
    Stop,
    Wait,
    WriteAnalog,
    WriteDigital,
    ReadAnalog,
    RegisterCallback,
    UnregisterCallback,
    Query,
}

impl Op {
    /// Whether this operation changes a task's configuration.
    pub fn is_configuration(self) -> bool {
        matches!(
            self,
            Self::CreateChannel
                | Self::CfgTiming
                | Self::CfgImplicitTiming
                | Self::SetPulse
                | Self::CfgInputBuffer
                | Self::CfgTrigger
                | Self::SetRetriggerable
                | Self::TaskControl
                | Self::WriteAnalog
                | Self::WriteDigital
                | Self::RegisterCallback
                | Self::UnregisterCallback
        )
    }

    fn entry_point(self) -> &'static str {
        match self {
            Self::CreateTask => "DAQmxCreateTask",
            Self::ClearTask => "DAQmxClearTask",
            Self::CreateChannel => "DAQmxCreateChannel",
            Self::CfgTiming => "DAQmxCfgSampClkTiming",
            Self::CfgImplicitTiming => "DAQmxCfgImplicitTiming",
            Self::SetPulse => "DAQmxSetCOPulse",
            Self::CfgInputBuffer => "DAQmxCfgInputBuffer",
            Self::CfgTrigger => "DAQmxCfgDigEdgeStartTrig",
            Self::SetRetriggerable => "DAQmxSetStartTrigRetriggerable",
            Self::TaskControl => "DAQmxTaskControl",
            Self::Start => "DAQmxStartTask",
            Self::Stop => "DAQmxStopTask",
            Self::Wait => "DAQmxWaitUntilTaskDone",
            Self::WriteAnalog => "DAQmxWriteAnalogF64",
            Self::WriteDigital => "DAQmxWriteDigitalLines",
            Self::ReadAnalog => "DAQmxReadAnalogF64",
            Self::RegisterCallback => "DAQmxRegisterEveryNSamplesEvent",
            Self::UnregisterCallback => "DAQmxRegisterEveryNSamplesEvent",
            Self::Query => "DAQmxGetDeviceAttribute",
        }
    }
}

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverCall {
    /// Name of the task the call targeted (device name for queries)
    pub task: String,
    /// The operation
    pub op: Op,
}

/// A device the simulator reports as installed.
#[derive(Debug, Clone, Serialize)]
pub struct SimDevice {
    /// Device name, e.g. `"Dev1"`
    pub name: String,
    /// Analog-input physical channels
    pub ai_channels: Vec<String>,
    /// Flat analog-input range table
    pub ai_ranges: Vec<f64>,
    /// Flat analog-output range table
    pub ao_ranges: Vec<f64>,
}

impl SimDevice {
    /// A device with `n_ai` analog inputs and typical range tables.
    pub fn new(name: &str, n_ai: usize) -> Self {
        Self {
            name: name.to_string(),
            ai_channels: (0..n_ai).map(|i| format!("{name}/ai{i}")).collect(),
            ai_ranges: vec![-10.0, 10.0, -5.0, 5.0, -1.0, 1.0, -0.2, 0.2],
            ao_ranges: vec![-10.0, 10.0, -5.0, 5.0],
        }
    }
}

/// Signal generator for analog-input channels: `(channel, sample_index) -> volts`.
pub type SignalFn = Arc<dyn Fn(usize, u64) -> f64 + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
enum ChannelKind {
    AnalogOutput,
    AnalogInput,
    DigitalOutput,
    CounterOutput,
}

/// Serializable view of a simulated task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub name: String,
    pub channels: Vec<String>,
    pub rate: f64,
    pub mode: Option<SampleMode>,
    pub pulse: Option<PulseSpec>,
    pub start_trigger: Option<String>,
    pub retriggerable: bool,
    pub committed: bool,
    pub running: bool,
    pub input_buffer: Option<u64>,
    pub every_n: Option<u32>,
}

struct SimTask {
    name: String,
    kind: Option<ChannelKind>,
    channels: Vec<String>,
    rate: f64,
    mode: Option<SampleMode>,
    pulse: Option<PulseSpec>,
    start_trigger: Option<String>,
    retriggerable: bool,
    committed: bool,
    running: bool,
    input_buffer: Option<u64>,
    analog_written: Vec<f64>,
    digital_written: Vec<u8>,
    every_n: Option<u32>,
    callback: Option<EveryNSamplesCallback>,
    pending: Vec<VecDeque<f64>>,
    acquired: u64,
}

impl SimTask {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: None,
            channels: Vec::new(),
            rate: 0.0,
            mode: None,
            pulse: None,
            start_trigger: None,
            retriggerable: false,
            committed: false,
            running: false,
            input_buffer: None,
            analog_written: Vec::new(),
            digital_written: Vec::new(),
            every_n: None,
            callback: None,
            pending: Vec::new(),
            acquired: 0,
        }
    }

    fn info(&self) -> TaskInfo {
        TaskInfo {
            name: self.name.clone(),
            channels: self.channels.clone(),
            rate: self.rate,
            mode: self.mode,
            pulse: self.pulse,
            start_trigger: self.start_trigger.clone(),
            retriggerable: self.retriggerable,
            committed: self.committed,
            running: self.running,
            input_buffer: self.input_buffer,
            every_n: self.every_n,
        }
    }

    fn finite_samples(&self) -> u64 {
        self.mode.and_then(|m| m.finite_samples()).unwrap_or(0)
    }
}

struct Fault {
    op: Op,
    task: String,
    code: i32,
    remaining: u32,
}

struct SimState {
    next_handle: u64,
    tasks: HashMap<TaskHandle, SimTask>,
    calls: Vec<DriverCall>,
    faults: Vec<Fault>,
    last_error: String,
    wait_delay: Duration,
    dropped_lines: u32,
}

/// Simulated DAQmx driver. See the module documentation.
pub struct SimulatedDaqmx {
    state: Mutex<SimState>,
    devices: Vec<SimDevice>,
    signal: SignalFn,
}

impl Default for SimulatedDaqmx {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDaqmx {
    /// A simulator with one 8-input device `"Dev1"` and a constant 1 V signal.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_handle: 1,
                tasks: HashMap::new(),
                calls: Vec::new(),
                faults: Vec::new(),
                last_error: String::new(),
                wait_delay: Duration::ZERO,
                dropped_lines: 0,
            }),
            devices: vec![SimDevice::new("Dev1", 8)],
            signal: Arc::new(|_, _| 1.0),
        }
    }

    /// Replace the installed devices.
    pub fn with_devices(mut self, devices: Vec<SimDevice>) -> Self {
        self.devices = devices;
        self
    }

    /// Replace the analog-input signal generator.
    pub fn with_signal<F>(mut self, signal: F) -> Self
    where
        F: Fn(usize, u64) -> f64 + Send + Sync + 'static,
    {
        self.signal = Arc::new(signal);
        self
    }

    /// Delay applied by every `wait_until_done`. A delay above the caller's
    /// timeout makes the wait fail with a timeout status.
    pub fn set_wait_delay(&self, delay: Duration) {
        self.state.lock().wait_delay = delay;
    }

    /// Number of line triggers per frame the analog inputs miss.
    pub fn set_dropped_lines(&self, lines: u32) {
        self.state.lock().dropped_lines = lines;
    }

    /// Fail the next call of `op` on a task whose name contains `task`
    /// (empty matches any) with status `code`.
    pub fn fail_on(&self, op: Op, task: &str, code: i32) {
        self.fail_on_times(op, task, code, 1);
    }

    /// Like [`fail_on`](Self::fail_on), for the next `times` matching calls.
    pub fn fail_on_times(&self, op: Op, task: &str, code: i32, times: u32) {
        self.state.lock().faults.push(Fault {
            op,
            task: task.to_string(),
            code,
            remaining: times,
        });
    }

    /// All calls recorded so far.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of recorded calls whose operation matches.
    pub fn count_ops<P: Fn(Op) -> bool>(&self, pred: P) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c.op)).count()
    }

    /// Names of the tasks targeted by recorded `op` calls, in call order.
    pub fn task_sequence(&self, op: Op) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.task.clone())
            .collect()
    }

    /// Number of tasks created and not yet cleared.
    pub fn live_tasks(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Snapshot of the live task with the given name.
    pub fn task_info(&self, name: &str) -> Option<TaskInfo> {
        let state = self.state.lock();
        Self::find_by_name(&state, name).map(|(_, t)| t.info())
    }

    /// Last analog buffer written to the named task, grouped by channel.
    pub fn last_analog_write(&self, name: &str) -> Option<Vec<f64>> {
        let state = self.state.lock();
        Self::find_by_name(&state, name).map(|(_, t)| t.analog_written.clone())
    }

    /// Last digital buffer written to the named task.
    pub fn last_digital_write(&self, name: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        Self::find_by_name(&state, name).map(|(_, t)| t.digital_written.clone())
    }

    /// JSON dump of every live task.
    pub fn snapshot_json(&self) -> serde_json::Value {
        let state = self.state.lock();
        let mut tasks: Vec<(TaskHandle, TaskInfo)> =
            state.tasks.iter().map(|(h, t)| (*h, t.info())).collect();
        tasks.sort_by_key(|(h, _)| *h);
        serde_json::json!({
            "devices": self.devices,
            "tasks": tasks.into_iter().map(|(_, t)| t).collect::<Vec<_>>(),
            "calls": state.calls.len(),
        })
    }

    fn find_by_name<'a>(state: &'a SimState, name: &str) -> Option<(TaskHandle, &'a SimTask)> {
        state
            .tasks
            .iter()
            .filter(|(_, t)| t.name == name)
            .max_by_key(|(h, _)| **h)
            .map(|(h, t)| (*h, t))
    }

    fn device(&self, name: &str) -> Option<&SimDevice> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Record a call and apply any matching fault.
    fn record(state: &mut SimState, task: &str, op: Op) -> Result<()> {
        trace!(task, ?op, "Simulated call");
        state.calls.push(DriverCall {
            task: task.to_string(),
            op,
        });
        let hit = state.faults.iter_mut().find(|f| {
            f.remaining > 0 && f.op == op && (f.task.is_empty() || task.contains(&f.task))
        });
        if let Some(fault) = hit {
            fault.remaining -= 1;
            let code = fault.code;
            state.faults.retain(|f| f.remaining > 0);
            state.last_error = format!("Injected status {code} on {task}");
            let message = state.last_error.clone();
            check_status(code, op.entry_point(), || message)?;
        }
        Ok(())
    }

    fn fail(state: &mut SimState, code: i32, op: Op, message: String) -> DaqmxError {
        state.last_error = message.clone();
        DaqmxError::new(code, op.entry_point(), message)
    }

    /// Run `f` on the task after recording the call.
    fn with_task<T, F>(&self, task: TaskHandle, op: Op, f: F) -> Result<T>
    where
        F: FnOnce(&mut SimTask, &[SimDevice]) -> std::result::Result<T, (i32, String)>,
    {
        let mut state = self.state.lock();
        let name = match state.tasks.get(&task) {
            Some(t) => t.name.clone(),
            None => {
                state.calls.push(DriverCall {
                    task: task.to_string(),
                    op,
                });
                let message = format!("Unknown task handle {task}");
                return Err(Self::fail(&mut state, STATUS_INVALID_TASK, op, message));
            }
        };
        Self::record(&mut state, &name, op)?;
        let result = match state.tasks.get_mut(&task) {
            Some(t) => f(t, &self.devices),
            None => Err((STATUS_INVALID_TASK, format!("Unknown task handle {task}"))),
        };
        result.map_err(|(code, message)| Self::fail(&mut state, code, op, message))
    }

    fn create_channel(
        &self,
        task: TaskHandle,
        kind: ChannelKind,
        physical: &str,
    ) -> Result<()> {
        self.with_task(task, Op::CreateChannel, |t, devices| {
            let channels = expand_channel_list(physical);
            if channels.is_empty() {
                return Err((
                    STATUS_PHYSICAL_CHAN_MISSING,
                    format!("Empty physical channel list '{physical}'"),
                ));
            }
            for chan in &channels {
                let device = chan.trim_start_matches('/').split('/').next().unwrap_or("");
                let Some(dev) = devices.iter().find(|d| d.name == device) else {
                    return Err((
                        STATUS_PHYSICAL_CHAN_MISSING,
                        format!("Device '{device}' not found for channel '{chan}'"),
                    ));
                };
                if kind == ChannelKind::AnalogInput && !dev.ai_channels.contains(chan) {
                    return Err((
                        STATUS_PHYSICAL_CHAN_MISSING,
                        format!("Physical channel '{chan}' does not exist"),
                    ));
                }
            }
            if t.kind.is_some_and(|k| k != kind) {
                return Err((
                    STATUS_INVALID_ATTRIBUTE_VALUE,
                    "Cannot mix channel types in one task".to_string(),
                ));
            }
            t.kind = Some(kind);
            if kind == ChannelKind::AnalogInput {
                t.pending.extend(channels.iter().map(|_| VecDeque::new()));
            }
            t.channels.extend(channels);
            Ok(())
        })
    }

    /// Fire trigger-driven acquisitions after a trigger source started.
    fn fire_triggers(&self) {
        let targets: Vec<(TaskHandle, u32)> = {
            let mut state = self.state.lock();
            let pulses: u64 = state
                .tasks
                .values()
                .filter(|t| {
                    t.running
                        && t.kind == Some(ChannelKind::CounterOutput)
                        && t.start_trigger.is_some()
                })
                .map(SimTask::finite_samples)
                .max()
                .unwrap_or(0);
            let lines = pulses.saturating_sub(u64::from(state.dropped_lines));
            let signal = Arc::clone(&self.signal);
            let mut targets = Vec::new();
            for (handle, t) in state.tasks.iter_mut() {
                if !(t.running
                    && t.kind == Some(ChannelKind::AnalogInput)
                    && t.start_trigger.is_some())
                {
                    continue;
                }
                let per_line = t.finite_samples();
                for _ in 0..lines {
                    let base = t.acquired;
                    for (ch, queue) in t.pending.iter_mut().enumerate() {
                        queue.extend((0..per_line).map(|i| signal(ch, base + i)));
                    }
                    t.acquired += per_line;
                }
                if let Some(n) = t.every_n.filter(|n| *n > 0) {
                    let available = t.pending.first().map_or(0, VecDeque::len) as u64;
                    let fires = (available / u64::from(n)) as u32;
                    targets.push((*handle, fires));
                }
            }
            debug!(lines, targets = targets.len(), "Simulated line triggers");
            targets
        };

        for (handle, fires) in targets {
            for _ in 0..fires {
                let taken = {
                    let mut state = self.state.lock();
                    state
                        .tasks
                        .get_mut(&handle)
                        .and_then(|t| t.callback.take().map(|cb| (cb, t.every_n.unwrap_or(0))))
                };
                let Some((mut callback, n)) = taken else {
                    break;
                };
                callback(handle, n);
                let mut state = self.state.lock();
                if let Some(t) = state.tasks.get_mut(&handle) {
                    if t.callback.is_none() {
                        t.callback = Some(callback);
                    }
                }
            }
        }
    }
}

impl DaqmxDriver for SimulatedDaqmx {
    fn create_task(&self, name: &str) -> Result<TaskHandle> {
        let mut state = self.state.lock();
        Self::record(&mut state, name, Op::CreateTask)?;
        let handle = TaskHandle(state.next_handle);
        state.next_handle += 1;
        state.tasks.insert(handle, SimTask::new(name));
        Ok(handle)
    }

    fn clear_task(&self, task: TaskHandle) -> Result<()> {
        let mut state = self.state.lock();
        let name = state
            .tasks
            .get(&task)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| task.to_string());
        Self::record(&mut state, &name, Op::ClearTask)?;
        match state.tasks.remove(&task) {
            Some(_) => Ok(()),
            None => {
                let message = format!("Unknown task handle {task}");
                Err(Self::fail(&mut state, STATUS_INVALID_TASK, Op::ClearTask, message))
            }
        }
    }

    fn create_ao_voltage_chan(
        &self,
        task: TaskHandle,
        physical: &str,
        _min: f64,
        _max: f64,
    ) -> Result<()> {
        self.create_channel(task, ChannelKind::AnalogOutput, physical)
    }

    fn create_ai_voltage_chan(
        &self,
        task: TaskHandle,
        physical: &str,
        min: f64,
        max: f64,
    ) -> Result<()> {
        if !(min < max) {
            let mut state = self.state.lock();
            let message = format!("Invalid input limits [{min}, {max}]");
            return Err(Self::fail(
                &mut state,
                STATUS_INVALID_ATTRIBUTE_VALUE,
                Op::CreateChannel,
                message,
            ));
        }
        self.create_channel(task, ChannelKind::AnalogInput, physical)
    }

    fn create_do_chan(&self, task: TaskHandle, lines: &str) -> Result<()> {
        // One channel spanning all lines; keep the expanded lines for sizing.
        self.create_channel(task, ChannelKind::DigitalOutput, lines)
    }

    fn create_co_pulse_chan(&self, task: TaskHandle, counter: &str, pulse: PulseSpec) -> Result<()> {
        self.create_channel(task, ChannelKind::CounterOutput, counter)?;
        self.with_task(task, Op::SetPulse, |t, _| {
            t.pulse = Some(pulse);
            Ok(())
        })
    }

    fn cfg_samp_clk_timing(
        &self,
        task: TaskHandle,
        _source: &str,
        rate: f64,
        _edge: Edge,
        mode: SampleMode,
    ) -> Result<()> {
        self.with_task(task, Op::CfgTiming, |t, _| {
            if !(rate > 0.0) {
                return Err((STATUS_INVALID_ATTRIBUTE_VALUE, format!("Invalid rate {rate}")));
            }
            t.rate = rate;
            t.mode = Some(mode);
            t.committed = false;
            Ok(())
        })
    }

    fn cfg_implicit_timing(&self, task: TaskHandle, mode: SampleMode) -> Result<()> {
        self.with_task(task, Op::CfgImplicitTiming, |t, _| {
            t.mode = Some(mode);
            t.committed = false;
            Ok(())
        })
    }

    fn set_co_pulse(&self, task: TaskHandle, pulse: PulseSpec) -> Result<()> {
        self.with_task(task, Op::SetPulse, |t, _| {
            if !(pulse.duty_cycle > 0.0 && pulse.duty_cycle < 1.0) {
                return Err((
                    STATUS_INVALID_ATTRIBUTE_VALUE,
                    format!("Invalid duty cycle {}", pulse.duty_cycle),
                ));
            }
            t.pulse = Some(pulse);
            t.rate = pulse.frequency;
            Ok(())
        })
    }

    fn cfg_input_buffer(&self, task: TaskHandle, samples_per_chan: u64) -> Result<()> {
        self.with_task(task, Op::CfgInputBuffer, |t, _| {
            t.input_buffer = Some(samples_per_chan);
            Ok(())
        })
    }

    fn cfg_dig_edge_start_trig(&self, task: TaskHandle, source: &str, _edge: Edge) -> Result<()> {
        self.with_task(task, Op::CfgTrigger, |t, _| {
            t.start_trigger = Some(source.to_string());
            Ok(())
        })
    }

    fn set_start_trig_retriggerable(&self, task: TaskHandle, retriggerable: bool) -> Result<()> {
        self.with_task(task, Op::SetRetriggerable, |t, _| {
            t.retriggerable = retriggerable;
            Ok(())
        })
    }

    fn task_control(&self, task: TaskHandle, action: TaskAction) -> Result<()> {
        self.with_task(task, Op::TaskControl, |t, _| {
            match action {
                TaskAction::Commit => t.committed = true,
                TaskAction::Unreserve => t.committed = false,
                TaskAction::Verify => {}
            }
            Ok(())
        })
    }

    fn start_task(&self, task: TaskHandle) -> Result<()> {
        let is_trigger_source = self.with_task(task, Op::Start, |t, _| {
            t.running = true;
            for queue in t.pending.iter_mut() {
                queue.clear();
            }
            Ok(t.kind == Some(ChannelKind::AnalogOutput) && t.start_trigger.is_none())
        })?;
        if is_trigger_source {
            self.fire_triggers();
        }
        Ok(())
    }

    fn stop_task(&self, task: TaskHandle) -> Result<()> {
        self.with_task(task, Op::Stop, |t, _| {
            t.running = false;
            Ok(())
        })
    }

    fn wait_until_done(&self, task: TaskHandle, timeout: Duration) -> Result<()> {
        self.with_task(task, Op::Wait, |_, _| Ok(()))?;
        let delay = self.state.lock().wait_delay;
        if delay > timeout {
            thread::sleep(timeout);
            let mut state = self.state.lock();
            let message = format!("Wait timed out after {timeout:?}");
            return Err(Self::fail(&mut state, STATUS_WAIT_TIMEOUT, Op::Wait, message));
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok(())
    }

    fn write_analog_f64(&self, task: TaskHandle, samples_per_chan: usize, data: &[f64]) -> Result<usize> {
        self.with_task(task, Op::WriteAnalog, |t, _| {
            let needed = samples_per_chan * t.channels.len();
            if data.len() < needed {
                return Err((
                    STATUS_INVALID_ATTRIBUTE_VALUE,
                    format!("Write buffer holds {} samples, {needed} required", data.len()),
                ));
            }
            t.analog_written = data[..needed].to_vec();
            Ok(samples_per_chan)
        })
    }

    fn write_digital_lines(&self, task: TaskHandle, samples_per_chan: usize, data: &[u8]) -> Result<usize> {
        self.with_task(task, Op::WriteDigital, |t, _| {
            let needed = samples_per_chan * t.channels.len();
            if data.len() < needed {
                return Err((
                    STATUS_INVALID_ATTRIBUTE_VALUE,
                    format!("Write buffer holds {} lines, {needed} required", data.len()),
                ));
            }
            t.digital_written = data[..needed].to_vec();
            Ok(samples_per_chan)
        })
    }

    fn read_analog_f64(
        &self,
        task: TaskHandle,
        samples_per_chan: usize,
        _timeout: Duration,
        buf: &mut [f64],
    ) -> Result<usize> {
        self.with_task(task, Op::ReadAnalog, |t, _| {
            let n_chans = t.pending.len();
            if buf.len() < samples_per_chan * n_chans {
                return Err((
                    STATUS_INVALID_ATTRIBUTE_VALUE,
                    format!("Read buffer too small: {} < {}", buf.len(), samples_per_chan * n_chans),
                ));
            }
            if t.pending.iter().any(|q| q.len() < samples_per_chan) {
                return Err((
                    STATUS_SAMPLES_NOT_AVAILABLE,
                    format!("Requested {samples_per_chan} samples per channel, not yet available"),
                ));
            }
            for (ch, queue) in t.pending.iter_mut().enumerate() {
                let dest = &mut buf[ch * samples_per_chan..(ch + 1) * samples_per_chan];
                for (slot, value) in dest.iter_mut().zip(queue.drain(..samples_per_chan)) {
                    *slot = value;
                }
            }
            Ok(samples_per_chan)
        })
    }

    fn register_every_n_samples(
        &self,
        task: TaskHandle,
        n: u32,
        callback: EveryNSamplesCallback,
    ) -> Result<()> {
        self.with_task(task, Op::RegisterCallback, move |t, _| {
            if t.callback.is_some() {
                return Err((
                    STATUS_INVALID_ATTRIBUTE_VALUE,
                    "Every-N callback already registered".to_string(),
                ));
            }
            t.every_n = Some(n);
            t.callback = Some(callback);
            Ok(())
        })
    }

    fn unregister_every_n_samples(&self, task: TaskHandle) -> Result<()> {
        self.with_task(task, Op::UnregisterCallback, |t, _| {
            t.every_n = None;
            t.callback = None;
            Ok(())
        })
    }

    fn installed_devices(&self) -> Result<String> {
        let mut state = self.state.lock();
        Self::record(&mut state, "", Op::Query)?;
        let names: Vec<&str> = self.devices.iter().map(|d| d.name.as_str()).collect();
        Ok(join_name_list(&names))
    }

    fn device_ai_physical_chans(&self, device: &str) -> Result<String> {
        let mut state = self.state.lock();
        Self::record(&mut state, device, Op::Query)?;
        match self.device(device) {
            Some(d) => Ok(join_name_list(&d.ai_channels)),
            None => {
                let message = format!("Device '{device}' not found");
                Err(Self::fail(&mut state, STATUS_PHYSICAL_CHAN_MISSING, Op::Query, message))
            }
        }
    }

    fn device_ai_voltage_ranges(&self, device: &str) -> Result<Vec<f64>> {
        let mut state = self.state.lock();
        Self::record(&mut state, device, Op::Query)?;
        match self.device(device) {
            Some(d) => Ok(d.ai_ranges.clone()),
            None => {
                let message = format!("Device '{device}' not found");
                Err(Self::fail(&mut state, STATUS_PHYSICAL_CHAN_MISSING, Op::Query, message))
            }
        }
    }

    fn device_ao_voltage_ranges(&self, device: &str) -> Result<Vec<f64>> {
        let mut state = self.state.lock();
        Self::record(&mut state, device, Op::Query)?;
        match self.device(device) {
            Some(d) => Ok(d.ao_ranges.clone()),
            None => {
                let message = format!("Device '{device}' not found");
                Err(Self::fail(&mut state, STATUS_PHYSICAL_CHAN_MISSING, Op::Query, message))
            }
        }
    }

    fn extended_error_info(&self) -> String {
        self.state.lock().last_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn finite(n: u64) -> SampleMode {
        SampleMode::Finite(n)
    }

    #[test]
    fn test_unknown_handle_is_rejected() {
        let sim = SimulatedDaqmx::new();
        let err = sim.start_task(TaskHandle(42)).unwrap_err();
        assert_eq!(err.code, STATUS_INVALID_TASK);
    }

    #[test]
    fn test_missing_ai_channel_is_rejected() {
        let sim = SimulatedDaqmx::new();
        let task = sim.create_task("detector").unwrap();
        let err = sim
            .create_ai_voltage_chan(task, "Dev1/ai9", -10.0, 10.0)
            .unwrap_err();
        assert_eq!(err.code, STATUS_PHYSICAL_CHAN_MISSING);
        assert!(sim.extended_error_info().contains("ai9"));
    }

    #[test]
    fn test_injected_fault_fires_once() {
        let sim = SimulatedDaqmx::new();
        let task = sim.create_task("scanner").unwrap();
        sim.fail_on(Op::Start, "scan", -50_103);
        assert_eq!(sim.start_task(task).unwrap_err().code, -50_103);
        assert!(sim.start_task(task).is_ok());
    }

    #[test]
    fn test_injected_warning_succeeds() {
        let sim = SimulatedDaqmx::new();
        let task = sim.create_task("scanner").unwrap();
        sim.fail_on(Op::Start, "", 200_010);
        assert!(sim.start_task(task).is_ok());
    }

    #[test]
    fn test_trigger_source_drives_line_acquisitions() {
        let sim = Arc::new(SimulatedDaqmx::new().with_signal(|ch, i| ch as f64 + i as f64));

        let co = sim.create_task("counter").unwrap();
        sim.create_co_pulse_chan(
            co,
            "Dev1/ctr0",
            PulseSpec { frequency: 1000.0, duty_cycle: 0.5, initial_delay: 0.0 },
        )
        .unwrap();
        sim.cfg_implicit_timing(co, finite(3)).unwrap();
        sim.cfg_dig_edge_start_trig(co, "/Dev1/ao/StartTrigger", Edge::Rising).unwrap();

        let ai = sim.create_task("detector").unwrap();
        sim.create_ai_voltage_chan(ai, "Dev1/ai0:1", -10.0, 10.0).unwrap();
        sim.cfg_samp_clk_timing(ai, "", 1000.0, Edge::Rising, finite(4)).unwrap();
        sim.cfg_dig_edge_start_trig(ai, "/Dev1/PFI7", Edge::Rising).unwrap();

        let fired = Arc::new(AtomicU32::new(0));
        let reads = Arc::new(Mutex::new(Vec::new()));
        {
            let reader = Arc::clone(&sim);
            let fired = Arc::clone(&fired);
            let reads = Arc::clone(&reads);
            sim.register_every_n_samples(
                ai,
                4,
                Box::new(move |h, n| {
                    let mut buf = vec![0.0; 2 * n as usize];
                    reader.read_analog_f64(h, n as usize, Duration::ZERO, &mut buf).unwrap();
                    reads.lock().push(buf);
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        }

        let ao = sim.create_task("scanner").unwrap();
        sim.create_ao_voltage_chan(ao, "Dev1/ao0:1", -10.0, 10.0).unwrap();

        sim.start_task(ai).unwrap();
        sim.start_task(co).unwrap();
        sim.start_task(ao).unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 3);
        let reads = reads.lock();
        // Grouped by channel: ai0 samples then ai1 samples.
        assert_eq!(reads[0], vec![0.0, 1.0, 2.0, 3.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(reads[2][0], 8.0);
    }

    #[test]
    fn test_wait_longer_than_timeout_fails() {
        let sim = SimulatedDaqmx::new();
        let task = sim.create_task("scanner").unwrap();
        sim.set_wait_delay(Duration::from_millis(50));
        let err = sim
            .wait_until_done(task, Duration::from_millis(1))
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(sim.wait_until_done(task, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_snapshot_lists_tasks() {
        let sim = SimulatedDaqmx::new();
        let task = sim.create_task("clock").unwrap();
        sim.create_do_chan(task, "Dev1/port0/line0:2").unwrap();
        let snap = sim.snapshot_json();
        assert_eq!(snap["tasks"][0]["name"], "clock");
        assert_eq!(snap["tasks"][0]["channels"].as_array().unwrap().len(), 3);
    }
}
