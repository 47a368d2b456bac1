//! Integration tests for the control panel loop
//!
//! These tests validate the panel workflow end to end:
//! - Event frames updating encoders and switches
//! - Faulty frames being logged and skipped
//! - Actions writing LEDs and capture settings through to the devices

mod common;

use common::sim_helpers::{fixed_scope, parse_line, quiet_panel, subscribe};
use common::wait_for;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tekscope_rs::backend::codec::DUMP_PAYLOAD_LEN;
use tekscope_rs::backend::{ScopeCommand, SimulatedPanel, SimulatedScope};
use tekscope_rs::config::{Calibration, CaptureConfig, CaptureState, PanelConfig};
use tekscope_rs::controls::{ControlRegistry, ControlUpdate, PanelStats, PanelWorker};
use tekscope_rs::types::{Channel, PreampGain};
use tekscope_rs::FanoutRegistry;

struct Bench {
    scope: SimulatedScope,
    panel: SimulatedPanel,
    capture: Arc<CaptureConfig>,
    fanout: Arc<FanoutRegistry>,
    running: Arc<AtomicBool>,
}

impl Bench {
    fn new() -> Self {
        let scope = fixed_scope(vec![0; DUMP_PAYLOAD_LEN], 4);
        let capture = CaptureConfig::new(
            CaptureState::default(),
            Calibration::default(),
            Box::new(scope.clone()),
        )
        .unwrap();
        Self {
            scope,
            panel: quiet_panel(),
            capture: Arc::new(capture),
            fanout: Arc::new(FanoutRegistry::new()),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    fn worker(&self) -> PanelWorker<SimulatedPanel> {
        let layout = PanelConfig::default();
        let registry = ControlRegistry::from_layout(
            &layout,
            &CaptureState::default(),
            Box::new(self.panel.clone()),
        )
        .unwrap();
        PanelWorker::new(
            self.panel.clone(),
            registry,
            Arc::clone(&self.capture),
            Arc::clone(&self.fanout),
            layout,
            Arc::clone(&self.running),
        )
    }
}

#[test]
fn test_encoder_and_switch_scenarios() {
    let bench = Bench::new();
    let echoes = subscribe(&bench.fanout, "ui");
    let mut worker = bench.worker();

    bench.panel.push_event(b"3R");
    assert_eq!(
        worker.poll_once().unwrap(),
        Some(ControlUpdate::Encoder { id: 3, value: 1 })
    );
    assert_eq!(worker.registry().encoder(3).unwrap().value(), 1);

    bench.panel.push_event(b"A1");
    assert_eq!(
        worker.poll_once().unwrap(),
        Some(ControlUpdate::Switch { id: 'A', value: true })
    );
    assert!(worker.registry().switch('A').unwrap().value());
    assert_eq!(bench.panel.led('A'), Some(true));

    // One echo per update
    let lines: Vec<_> = echoes.try_iter().map(|line| parse_line(&line)).collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["position_3"], 1);
    assert_eq!(lines[1]["led_a"], true);
}

#[test]
fn test_unknown_control_does_not_stop_loop() {
    let bench = Bench::new();
    let worker = bench.worker();
    bench.panel.push_event(b"Z1");
    bench.panel.push_event(b"3R");
    bench.panel.push_event(b"3R");

    let handle = thread::spawn(move || worker.run());
    assert!(wait_for(|| bench.panel.is_drained()));
    // Let the last frame be dispatched
    thread::sleep(Duration::from_millis(100));
    bench.running.store(false, Ordering::SeqCst);

    let stats = handle.join().unwrap().unwrap();
    assert_eq!(stats.events, 2);
    assert_eq!(stats.faults, 1);
}

#[test]
fn test_sample_rate_encoder_saturates() {
    let bench = Bench::new();
    let mut worker = bench.worker();

    // Encoder 1 starts at the configured divisor of 7
    for _ in 0..20 {
        bench.panel.push_event(b"1R");
        worker.poll_once().unwrap();
    }
    assert_eq!(worker.registry().encoder(1).unwrap().value(), 15);
    assert_eq!(bench.capture.snapshot().unwrap().sample_rate_divisor, 15);
    assert_eq!(bench.scope.register().sample_rate_divisor(), 15);

    // Every tick writes the register, also once the value is pinned at 15
    let writes = bench
        .scope
        .commands()
        .into_iter()
        .filter(|c| matches!(c, ScopeCommand::WriteRegister(_)))
        .count();
    assert_eq!(writes, 20);
}

#[test]
fn test_preamp_switch_updates_scope() {
    let bench = Bench::new();
    let mut worker = bench.worker();

    bench.panel.push_event(b"I0");
    worker.poll_once().unwrap();
    assert_eq!(bench.scope.preamp(Channel::B), PreampGain::Low);
    assert_eq!(bench.capture.snapshot().unwrap().preamp_b, PreampGain::Low);

    bench.panel.push_event(b"I1");
    worker.poll_once().unwrap();
    assert_eq!(bench.scope.preamp(Channel::B), PreampGain::High);
}

#[test]
fn test_garbage_stream_is_counted_not_fatal() {
    let bench = Bench::new();
    let mut worker = bench.worker();
    bench.panel.push_event(b"##3X1R");

    for _ in 0..4 {
        worker.poll_once().unwrap();
    }
    assert_eq!(
        worker.stats(),
        &PanelStats {
            events: 1,
            faults: 2,
            timeouts: 1,
        }
    );
}
