//! Full-frame acquisitions against the simulated driver.

use std::sync::{Arc, Mutex};

use daqmx_hal::{Op, SimulatedDaqmx};
use galvo_scan::{DeviceSettings, GalvoScanner, Roi, ScanRequest};

#[test]
fn test_512_full_frame_sizing() {
    let sim = Arc::new(SimulatedDaqmx::new().with_signal(|_, _| 2.5));
    let settings = DeviceSettings {
        line_delay: 50,
        input_voltage_range: Some(5.0),
        ..DeviceSettings::default()
    };
    let pixels: Arc<Mutex<Vec<u16>>> = Arc::default();
    let sink = Arc::clone(&pixels);
    let request = ScanRequest::new(512, 1.0e6).with_sink(move |_, frame| {
        *sink.lock().unwrap() = frame.to_vec();
        true
    });

    let scanner = GalvoScanner::open(sim.clone(), settings).unwrap();
    scanner.arm(Arc::new(request)).unwrap();

    let galvo = sim.task_info("GalvoScan-Scanner").unwrap();
    assert_eq!(galvo.mode.and_then(|m| m.finite_samples()), Some(353_280));
    assert_eq!(galvo.rate, 1.0e6);
    assert_eq!(
        sim.last_analog_write("GalvoScan-Scanner").unwrap().len(),
        2 * 353_280
    );

    let digital = sim.task_info("GalvoScan-Clock-DO").unwrap();
    assert_eq!(digital.mode.and_then(|m| m.finite_samples()), Some(353_280));
    assert_eq!(
        sim.last_digital_write("GalvoScan-Clock-DO").unwrap().len(),
        3 * 353_280
    );

    let counter = sim.task_info("GalvoScan-Clock-CO").unwrap();
    assert_eq!(counter.mode.and_then(|m| m.finite_samples()), Some(512));
    let pulse = counter.pulse.unwrap();
    assert!((pulse.frequency - 1.0e6 / 690.0).abs() < 1e-9);

    let detector = sim.task_info("GalvoScan-Detector").unwrap();
    assert_eq!(detector.mode.and_then(|m| m.finite_samples()), Some(512));
    assert_eq!(detector.every_n, Some(512));
    assert_eq!(detector.input_buffer, Some(16 * 512));
    assert_eq!(detector.start_trigger.as_deref(), Some("/Dev1/PFI12"));

    scanner.start().unwrap();
    scanner.wait();
    assert!(scanner.last_error().is_none());

    let frame = pixels.lock().unwrap();
    assert_eq!(frame.len(), 512 * 512);
    let expected = (2.5 * (32767.0 / 5.0)) as u16;
    assert!(frame.iter().all(|&p| p == expected));
}

#[test]
fn test_bin_factor_scales_detector_rate() {
    let sim = Arc::new(SimulatedDaqmx::new());
    let scanner = GalvoScanner::open(sim.clone(), DeviceSettings::default()).unwrap();
    scanner.set_bin_factor(4).unwrap();
    scanner
        .arm(Arc::new(ScanRequest::new(64, 250.0e3)))
        .unwrap();
    let detector = sim.task_info("GalvoScan-Detector").unwrap();
    assert_eq!(detector.rate, 1.0e6);
    assert_eq!(detector.every_n, Some(256));
    scanner.start().unwrap();
    scanner.wait();
    assert!(scanner.last_error().is_none());
}

#[test]
fn test_repeat_arm_reprograms_nothing() {
    let sim = Arc::new(SimulatedDaqmx::new());
    let scanner = GalvoScanner::open(sim.clone(), DeviceSettings::default()).unwrap();
    scanner.arm(Arc::new(ScanRequest::new(64, 1.0e6))).unwrap();
    scanner.stop();

    sim.clear_calls();
    scanner.arm(Arc::new(ScanRequest::new(64, 1.0e6))).unwrap();
    scanner.stop();
    assert_eq!(sim.count_ops(Op::is_configuration), 0);
}

#[test]
fn test_zoom_change_rewrites_outputs_only() {
    let sim = Arc::new(SimulatedDaqmx::new());
    let scanner = GalvoScanner::open(sim.clone(), DeviceSettings::default()).unwrap();
    scanner.arm(Arc::new(ScanRequest::new(64, 1.0e6))).unwrap();
    scanner.stop();
    let before = sim.last_analog_write("GalvoScan-Scanner").unwrap();

    sim.clear_calls();
    scanner
        .arm(Arc::new(ScanRequest::new(64, 1.0e6).with_zoom(2.0)))
        .unwrap();
    scanner.stop();
    assert_eq!(sim.count_ops(|op| op == Op::CfgTiming), 0);
    assert_eq!(sim.count_ops(|op| op == Op::WriteAnalog), 1);
    assert_eq!(sim.count_ops(|op| op == Op::WriteDigital), 1);

    let after = sim.last_analog_write("GalvoScan-Scanner").unwrap();
    assert_eq!(after.len(), before.len());
    let span = |w: &[f64]| {
        let line = &w[..64];
        line.iter().copied().fold(f64::MIN, f64::max) - line.iter().copied().fold(f64::MAX, f64::min)
    };
    assert!(span(&after) < span(&before));
}

#[test]
fn test_roi_change_recreates_tasks() {
    let sim = Arc::new(SimulatedDaqmx::new());
    let scanner = GalvoScanner::open(sim.clone(), DeviceSettings::default()).unwrap();
    scanner.arm(Arc::new(ScanRequest::new(64, 1.0e6))).unwrap();
    scanner.stop();

    sim.clear_calls();
    let roi = Roi {
        x: 8,
        y: 8,
        width: 32,
        height: 16,
    };
    let pixels: Arc<Mutex<usize>> = Arc::default();
    let sink = Arc::clone(&pixels);
    let request = ScanRequest::new(64, 1.0e6)
        .with_roi(roi)
        .with_sink(move |_, frame| {
            *sink.lock().unwrap() = frame.len();
            true
        });
    scanner.arm(Arc::new(request)).unwrap();

    let galvo = sim.task_info("GalvoScan-Scanner").unwrap();
    assert_eq!(
        galvo.mode.and_then(|m| m.finite_samples()),
        Some((50 + 32 + 128) * 16)
    );
    assert_eq!(
        sim.task_info("GalvoScan-Detector").unwrap().every_n,
        Some(32)
    );

    scanner.start().unwrap();
    scanner.wait();
    assert!(scanner.last_error().is_none());
    assert_eq!(*pixels.lock().unwrap(), 32 * 16);
}

#[test]
fn test_park_voltages_carry_over() {
    let sim = Arc::new(SimulatedDaqmx::new());
    let scanner = GalvoScanner::open(sim.clone(), DeviceSettings::default()).unwrap();
    scanner.set_park_position(-300, 200).unwrap();
    scanner.arm(Arc::new(ScanRequest::new(64, 1.0e6))).unwrap();
    scanner.start().unwrap();
    scanner.wait();
    let parked = scanner.park_voltages();
    assert!(parked.0 < 0.0 && parked.1 > 0.0);

    assert!((parked.0 - (-32.0 - 300.0) / 64.0).abs() < 1e-12);
    assert!((parked.1 - (-32.0 + 200.0) / 64.0).abs() < 1e-12);

    // The second run unparks from these voltages and parks on them again.
    scanner.arm(Arc::new(ScanRequest::new(64, 1.0e6))).unwrap();
    scanner.start().unwrap();
    scanner.wait();
    assert_eq!(scanner.park_voltages(), parked);
}
