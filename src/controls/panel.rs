//! Control panel poll loop
//!
//! [`PanelWorker`] owns the read side of the panel link and the
//! [`ControlRegistry`] (which holds the write side for LEDs). It reads one
//! 2-byte frame per iteration and dispatches it. Bad input from the panel is
//! written to the fault log (`tekscope::fault` target) and the loop moves on to
//! the next frame; only a failing link ends it.

use crate::backend::link::FrameReader;
use crate::config::{CaptureConfig, PanelConfig};
use crate::controls::{ActionContext, ControlRegistry, ControlUpdate};
use crate::error::{Result, ScopeError};
use crate::fanout::FanoutRegistry;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Length of every panel event frame
pub const EVENT_FRAME_LEN: usize = 2;

/// Tracing target of the fault log
pub const FAULT_TARGET: &str = "tekscope::fault";

/// Counters reported when the poll loop exits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PanelStats {
    /// Frames that updated a control
    pub events: u64,
    /// Frames rejected or whose action failed
    pub faults: u64,
    /// Reads that returned no data in time
    pub timeouts: u64,
}

/// Blocking loop that turns panel frames into control updates
pub struct PanelWorker<R> {
    frames: FrameReader<R>,
    registry: ControlRegistry,
    capture: Arc<CaptureConfig>,
    fanout: Arc<FanoutRegistry>,
    panel: PanelConfig,
    running: Arc<AtomicBool>,
    stats: PanelStats,
}

impl<R: Read> PanelWorker<R> {
    pub fn new(
        reader: R,
        registry: ControlRegistry,
        capture: Arc<CaptureConfig>,
        fanout: Arc<FanoutRegistry>,
        panel: PanelConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            frames: FrameReader::new(reader),
            registry,
            capture,
            fanout,
            panel,
            running,
            stats: PanelStats::default(),
        }
    }

    pub fn registry(&self) -> &ControlRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &PanelStats {
        &self.stats
    }

    /// Poll until the running flag is cleared or the link fails
    pub fn run(mut self) -> Result<PanelStats> {
        tracing::info!("Control panel loop started");

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.poll_once() {
                tracing::error!("Control panel loop failed: {}", e);
                return Err(e);
            }
        }

        tracing::info!("Control panel loop stopped ({:?})", self.stats);
        Ok(self.stats)
    }

    /// Read and handle at most one frame
    ///
    /// Returns `Ok(None)` on a timeout or a faulty frame; only link errors are
    /// returned as `Err`.
    pub fn poll_once(&mut self) -> Result<Option<ControlUpdate>> {
        let frame = match self.frames.read_frame(EVENT_FRAME_LEN)? {
            Some(frame) => frame,
            None if self.frames.buffered().is_empty() => {
                self.stats.timeouts += 1;
                return Ok(None);
            }
            // A lone byte followed by silence is a short frame
            None => self.frames.take(EVENT_FRAME_LEN),
        };

        let ctx = ActionContext::new(&self.capture, &self.fanout, &self.panel);
        match self.registry.dispatch(&frame, &ctx) {
            Ok(update) => {
                self.stats.events += 1;
                Ok(Some(update))
            }
            Err(e) => {
                self.stats.faults += 1;
                report_fault(&e);
                Ok(None)
            }
        }
    }
}

fn report_fault(err: &ScopeError) {
    if err.is_control_fault() {
        tracing::warn!(target: FAULT_TARGET, "{}", err);
    } else {
        tracing::error!(target: FAULT_TARGET, "Control action failed: {}", err);
    }
}
