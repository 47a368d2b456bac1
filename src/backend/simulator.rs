//! In-memory scope and control panel for running without hardware
//!
//! [`SimulatedScope`] speaks the scope wire protocol: it parses the commands it
//! is sent, keeps the register/preamp/trigger state, answers `S G` with a ready
//! frame and `S B` with a full memory dump. [`SimulatedPanel`] replays event
//! frames pushed by a test and records the LED bytes written to it.
//!
//! Both are cheap handles over shared state, so a test can keep one clone for
//! inspection while the polling loop owns another.
//!
//! # Data Sources
//!
//! - [`MemorySource::Random`] - random 10-bit codes and a random end address,
//!   captured in roughly the time the configured sample rate would take
//! - [`MemorySource::Fixed`] - a given memory image and end address, returned
//!   immediately on every capture
//!
//! # Example
//!
//! ```ignore
//! use tekscope_rs::backend::simulator::{MemorySource, SimulatedScope};
//!
//! let scope = SimulatedScope::new(Some(Duration::from_millis(50)))
//!     .with_source(MemorySource::Fixed { memory: vec![0; 4096], end_address: 4 });
//! let inspector = scope.clone();
//! // hand `scope` to the acquisition loop, then:
//! assert_eq!(inspector.captures(), 1);
//! ```

use crate::backend::codec::{
    encode_ready, ControlRegister, ScopeCommand, TriggerCode, CODE_MAX, DUMP_PAYLOAD_LEN,
    DUMP_TAG,
};
use crate::backend::link::SerialLink;
use crate::error::Result;
use crate::types::{Channel, PreampGain, SAMPLES_PER_CAPTURE};
use rand::Rng;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Base sample clock of the scope in Hz
pub const BASE_SAMPLE_RATE_HZ: f64 = 20_000_000.0;

/// Where the simulated scope's memory comes from
#[derive(Debug, Clone, PartialEq)]
pub enum MemorySource {
    Random,
    Fixed { memory: Vec<u8>, end_address: u16 },
}

struct ScopeDevice {
    source: MemorySource,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
    hold_until: Option<Instant>,
    commands: Vec<ScopeCommand>,
    register: ControlRegister,
    preamp_a: PreampGain,
    preamp_b: PreampGain,
    trigger_code: TriggerCode,
    memory: Vec<u8>,
    captures: usize,
    realtime: bool,
}

impl ScopeDevice {
    fn sample_period(&self) -> Duration {
        let rate = BASE_SAMPLE_RATE_HZ / 2f64.powi(self.register.sample_rate_divisor() as i32);
        Duration::from_secs_f64(1.0 / rate)
    }

    fn accept(&mut self, bytes: &[u8]) {
        self.inbound.extend_from_slice(bytes);
        loop {
            if self.inbound.len() < 3 {
                return;
            }
            let Some(len) = ScopeCommand::encoded_len(&self.inbound) else {
                tracing::warn!("Simulated scope dropping stray byte {:#04X}", self.inbound[0]);
                self.inbound.remove(0);
                continue;
            };
            if self.inbound.len() < len {
                return;
            }
            let line: Vec<u8> = self.inbound.drain(..len).collect();
            match ScopeCommand::parse(&line) {
                Some(command) => self.execute(command),
                None => tracing::warn!("Simulated scope ignoring malformed command {:?}", line),
            }
        }
    }

    fn execute(&mut self, command: ScopeCommand) {
        self.commands.push(command);
        match command {
            ScopeCommand::BeginCapture => self.begin_capture(),
            ScopeCommand::RequestDump => {
                self.outbound.push_back(DUMP_TAG);
                self.outbound.extend(self.memory.iter().copied());
            }
            ScopeCommand::WriteRegister(register) => self.register = register,
            ScopeCommand::SetTriggerLevel(code) => self.trigger_code = code,
            ScopeCommand::SetPreamp { channel, gain } => match channel {
                Channel::A => self.preamp_a = gain,
                Channel::B => self.preamp_b = gain,
            },
        }
    }

    fn begin_capture(&mut self) {
        self.captures += 1;
        let end_address = match &self.source {
            MemorySource::Fixed {
                memory,
                end_address,
            } => {
                self.memory = memory.clone();
                self.memory.resize(DUMP_PAYLOAD_LEN, 0);
                *end_address
            }
            MemorySource::Random => {
                let mut rng = rand::thread_rng();
                for record in self.memory.chunks_exact_mut(2) {
                    let code: u16 = rng.gen_range(0..=CODE_MAX);
                    record.copy_from_slice(&code.to_be_bytes());
                }
                (rng.gen_range(0..SAMPLES_PER_CAPTURE) * 4) as u16
            }
        };

        if self.realtime {
            self.hold_until = Some(Instant::now() + self.sample_period() * SAMPLES_PER_CAPTURE as u32);
        }
        self.outbound.extend(encode_ready(end_address));
    }
}

struct ScopeShared {
    device: Mutex<ScopeDevice>,
    changed: Condvar,
}

/// In-memory scope
#[derive(Clone)]
pub struct SimulatedScope {
    shared: Arc<ScopeShared>,
    timeout: Option<Duration>,
}

impl SimulatedScope {
    /// Create a scope producing random captures; `None` blocks reads forever
    pub fn new(timeout: Option<Duration>) -> Self {
        let device = ScopeDevice {
            source: MemorySource::Random,
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            hold_until: None,
            commands: Vec::new(),
            register: ControlRegister::from_bits(0),
            preamp_a: PreampGain::High,
            preamp_b: PreampGain::High,
            trigger_code: TriggerCode::from_bytes(0x01, 0xFF),
            memory: vec![0; DUMP_PAYLOAD_LEN],
            captures: 0,
            realtime: false,
        };
        Self {
            shared: Arc::new(ScopeShared {
                device: Mutex::new(device),
                changed: Condvar::new(),
            }),
            timeout,
        }
    }

    pub fn with_source(self, source: MemorySource) -> Self {
        self.device().source = source;
        self
    }

    /// Delay ready frames by the time a real capture would take
    pub fn with_realtime_capture(self, realtime: bool) -> Self {
        self.device().realtime = realtime;
        self
    }

    fn device(&self) -> MutexGuard<'_, ScopeDevice> {
        self.shared
            .device
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue raw bytes as if the scope had sent them
    pub fn inject(&self, bytes: &[u8]) {
        self.device().outbound.extend(bytes.iter().copied());
        self.shared.changed.notify_all();
    }

    /// Every command received so far
    pub fn commands(&self) -> Vec<ScopeCommand> {
        self.device().commands.clone()
    }

    pub fn captures(&self) -> usize {
        self.device().captures
    }

    pub fn register(&self) -> ControlRegister {
        self.device().register
    }

    pub fn trigger_code(&self) -> TriggerCode {
        self.device().trigger_code
    }

    pub fn preamp(&self, channel: Channel) -> PreampGain {
        let device = self.device();
        match channel {
            Channel::A => device.preamp_a,
            Channel::B => device.preamp_b,
        }
    }
}

impl Read for SimulatedScope {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut device = self.device();

        loop {
            let now = Instant::now();
            let held_for = device
                .hold_until
                .and_then(|until| until.checked_duration_since(now))
                .filter(|d| !d.is_zero());

            if held_for.is_none() && !device.outbound.is_empty() {
                device.hold_until = None;
                let n = buf.len().min(device.outbound.len());
                for (slot, byte) in buf.iter_mut().zip(device.outbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(now));
            if remaining.is_some_and(|r| r.is_zero()) {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "simulated scope timeout"));
            }

            let wait = match (remaining, held_for) {
                (Some(r), Some(h)) => Some(r.min(h)),
                (r, h) => r.or(h),
            };
            device = match wait {
                Some(wait) => {
                    self.shared
                        .changed
                        .wait_timeout(device, wait)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
                None => self
                    .shared
                    .changed
                    .wait(device)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
    }
}

impl Write for SimulatedScope {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.device().accept(buf);
        self.shared.changed.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for SimulatedScope {
    fn try_clone_link(&self) -> Result<Box<dyn SerialLink>> {
        Ok(Box::new(self.clone()))
    }

    fn describe(&self) -> String {
        "simulated-scope".to_string()
    }
}

// ==================== Control Panel ====================

#[derive(Default)]
struct PanelDevice {
    events: VecDeque<u8>,
    written: Vec<u8>,
}

struct PanelShared {
    device: Mutex<PanelDevice>,
    changed: Condvar,
}

/// In-memory control surface
#[derive(Clone)]
pub struct SimulatedPanel {
    shared: Arc<PanelShared>,
    timeout: Duration,
}

impl SimulatedPanel {
    pub fn new(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(PanelShared {
                device: Mutex::new(PanelDevice::default()),
                changed: Condvar::new(),
            }),
            timeout,
        }
    }

    fn device(&self) -> MutexGuard<'_, PanelDevice> {
        self.shared
            .device
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an event frame such as `b"3R"` or `b"A1"`
    pub fn push_event(&self, frame: &[u8]) {
        self.device().events.extend(frame.iter().copied());
        self.shared.changed.notify_all();
    }

    /// Whether every queued event byte has been read
    pub fn is_drained(&self) -> bool {
        self.device().events.is_empty()
    }

    /// Every byte written to the panel
    pub fn written(&self) -> Vec<u8> {
        self.device().written.clone()
    }

    /// Last state written to an LED
    pub fn led(&self, id: char) -> Option<bool> {
        let device = self.device();
        device
            .written
            .chunks_exact(2)
            .rev()
            .find(|write| write[0] as char == id)
            .map(|write| write[1] == b'1')
    }
}

impl Read for SimulatedPanel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        let mut device = self.device();
        loop {
            if !device.events.is_empty() {
                let n = buf.len().min(device.events.len());
                for (slot, byte) in buf.iter_mut().zip(device.events.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "simulated panel timeout"));
            }
            device = self
                .shared
                .changed
                .wait_timeout(device, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }
}

impl Write for SimulatedPanel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.device().written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for SimulatedPanel {
    fn try_clone_link(&self) -> Result<Box<dyn SerialLink>> {
        Ok(Box::new(self.clone()))
    }

    fn describe(&self) -> String {
        "simulated-panel".to_string()
    }
}
