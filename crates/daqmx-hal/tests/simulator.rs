//! Integration tests for the simulated driver through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use daqmx_hal::names::{parse_name_list, parse_range_table, widest_range};
use daqmx_hal::{
    DaqmxDriver, Edge, Op, PulseSpec, SampleMode, ScopedTask, SimDevice, SimulatedDaqmx,
    TaskAction,
};

#[test]
fn test_device_queries() {
    let sim = SimulatedDaqmx::new().with_devices(vec![
        SimDevice::new("Dev1", 2),
        SimDevice::new("Dev2", 4),
    ]);

    assert_eq!(parse_name_list(&sim.installed_devices().unwrap()), ["Dev1", "Dev2"]);
    assert_eq!(
        parse_name_list(&sim.device_ai_physical_chans("Dev2").unwrap()).len(),
        4
    );

    let ranges = parse_range_table(&sim.device_ai_voltage_ranges("Dev1").unwrap());
    assert_eq!(widest_range(&ranges).unwrap().max, 10.0);
    assert!(sim.device_ao_voltage_ranges("Dev9").is_err());
}

#[test]
fn test_configuration_is_recorded_in_order() {
    let sim = Arc::new(SimulatedDaqmx::new());
    let task = ScopedTask::create(sim.clone(), "scanner").unwrap();
    let h = task.handle();

    sim.create_ao_voltage_chan(h, "Dev1/ao0:1", -10.0, 10.0).unwrap();
    sim.cfg_samp_clk_timing(h, "", 1.0e6, Edge::Rising, SampleMode::Finite(64))
        .unwrap();
    sim.write_analog_f64(h, 64, &vec![0.5; 128]).unwrap();
    sim.task_control(h, TaskAction::Commit).unwrap();

    let ops: Vec<Op> = sim.calls().iter().map(|c| c.op).collect();
    assert_eq!(
        ops,
        [
            Op::CreateTask,
            Op::CreateChannel,
            Op::CfgTiming,
            Op::WriteAnalog,
            Op::TaskControl
        ]
    );
    assert_eq!(sim.count_ops(Op::is_configuration), 4);

    let info = sim.task_info("scanner").unwrap();
    assert!(info.committed);
    assert_eq!(info.channels, ["Dev1/ao0", "Dev1/ao1"]);
    assert_eq!(sim.last_analog_write("scanner").unwrap().len(), 128);
}

#[test]
fn test_short_write_is_rejected() {
    let sim = Arc::new(SimulatedDaqmx::new());
    let task = ScopedTask::create(sim.clone(), "scanner").unwrap();
    sim.create_ao_voltage_chan(task.handle(), "Dev1/ao0:1", -10.0, 10.0)
        .unwrap();
    assert!(sim.write_analog_f64(task.handle(), 64, &[0.0; 64]).is_err());
}

#[test]
fn test_dropped_lines_reduce_callbacks() {
    let sim = Arc::new(SimulatedDaqmx::new());
    sim.set_dropped_lines(2);

    let co = ScopedTask::create(sim.clone(), "clock-co").unwrap();
    sim.create_co_pulse_chan(
        co.handle(),
        "Dev1/ctr0",
        PulseSpec {
            frequency: 100.0,
            duty_cycle: 0.5,
            initial_delay: 0.0,
        },
    )
    .unwrap();
    sim.cfg_implicit_timing(co.handle(), SampleMode::Finite(5)).unwrap();
    sim.cfg_dig_edge_start_trig(co.handle(), "/Dev1/ao/StartTrigger", Edge::Rising)
        .unwrap();

    let ai = ScopedTask::create(sim.clone(), "detector").unwrap();
    sim.create_ai_voltage_chan(ai.handle(), "Dev1/ai0", -10.0, 10.0).unwrap();
    sim.cfg_samp_clk_timing(ai.handle(), "", 100.0, Edge::Rising, SampleMode::Finite(8))
        .unwrap();
    sim.cfg_dig_edge_start_trig(ai.handle(), "/Dev1/PFI7", Edge::Rising).unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    sim.register_every_n_samples(
        ai.handle(),
        8,
        Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();

    let ao = ScopedTask::create(sim.clone(), "scanner").unwrap();
    sim.create_ao_voltage_chan(ao.handle(), "Dev1/ao0", -10.0, 10.0).unwrap();

    sim.start_task(ai.handle()).unwrap();
    sim.start_task(co.handle()).unwrap();
    sim.start_task(ao.handle()).unwrap();
    sim.wait_until_done(ao.handle(), Duration::from_secs(1)).unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert_eq!(sim.task_sequence(Op::Start), ["detector", "clock-co", "scanner"]);
}
