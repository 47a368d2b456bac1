//! Backend module for the scope and control panel links
//!
//! Both devices are driven by plain blocking loops, each on its own thread and
//! each owning the read side of its serial link. They share nothing but the
//! [`CaptureConfig`] (settings written through to the scope under a lock) and
//! the [`FanoutRegistry`] they publish to.
//!
//! # Components
//!
//! - [`codec`] - scope command encoding and frame parsing
//! - [`decoder`] - memory dump to calibrated [`Sample`](crate::types::Sample)
//! - [`link`] - [`SerialLink`] trait and the [`FrameReader`] used by both loops
//! - [`serial`] - [`PortLink`], a `serialport` backed link
//! - [`simulator`] - in-memory scope and panel for tests and `--simulate`
//! - [`policy`] - what to do with an unexpected frame
//! - [`AcquisitionWorker`] - the capture loop
//! - [`ScopeService`] - spawns both loops and stops them together
//!
//! # Example
//!
//! ```ignore
//! use tekscope_rs::backend::ScopeService;
//!
//! let fanout = Arc::new(FanoutRegistry::new());
//! let service = ScopeService::start(&config, scope_link, panel_link, fanout)?;
//! // ... until Ctrl-C
//! let report = service.stop();
//! ```

pub mod acquisition;
pub mod codec;
pub mod decoder;
pub mod link;
pub mod policy;
pub mod serial;
pub mod simulator;

pub use acquisition::{AcquisitionStats, AcquisitionWorker};
pub use codec::{ControlRegister, ScopeCommand, TriggerCode};
pub use decoder::{decode_sample, ChannelSteps, SampleDecoder};
pub use link::{FrameReader, SerialLink};
pub use policy::{AbortPolicy, ResyncPolicy, ViolationAction, ViolationPolicy, ViolationPolicyKind};
pub use serial::PortLink;
pub use simulator::{MemorySource, SimulatedPanel, SimulatedScope};

use crate::config::{CaptureConfig, ServiceConfig};
use crate::controls::{ControlRegistry, PanelStats, PanelWorker};
use crate::error::{Result, ResultExt, ScopeError};
use crate::fanout::FanoutRegistry;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Results of both loops after [`ScopeService::stop`]
#[derive(Debug)]
pub struct ServiceReport {
    pub acquisition: Result<AcquisitionStats>,
    pub panel: Result<PanelStats>,
}

/// Running acquisition and control panel loops
pub struct ScopeService {
    running: Arc<AtomicBool>,
    capture: Arc<CaptureConfig>,
    acquisition: JoinHandle<Result<AcquisitionStats>>,
    panel: JoinHandle<Result<PanelStats>>,
}

impl ScopeService {
    /// Push the startup capture settings and spawn both loops
    ///
    /// Each link is split into a read handle owned by its loop and a write
    /// handle: the scope's goes to the shared [`CaptureConfig`], the panel's
    /// to the LED bank.
    pub fn start(
        config: &ServiceConfig,
        scope: Box<dyn SerialLink>,
        panel: Box<dyn SerialLink>,
        fanout: Arc<FanoutRegistry>,
    ) -> Result<Self> {
        let scope_name = scope.describe();
        let panel_name = panel.describe();

        let capture = Arc::new(CaptureConfig::new(
            config.capture,
            config.calibration.clone(),
            Box::new(scope.try_clone_link()?),
        )?);
        capture
            .apply_all()
            .with_context(|| format!("Failed to apply capture settings to {}", scope_name))?;

        let registry =
            ControlRegistry::from_layout(&config.panel, &config.capture, Box::new(panel.try_clone_link()?))?;

        let running = Arc::new(AtomicBool::new(true));
        let policy = config
            .acquisition
            .violation_policy
            .build(config.acquisition.resync_limit);

        let acquisition_worker = AcquisitionWorker::new(
            scope,
            Arc::clone(&capture),
            Arc::clone(&fanout),
            policy,
            Arc::clone(&running),
        )
        .with_timeout_limit(config.acquisition.max_consecutive_timeouts);

        let panel_worker = PanelWorker::new(
            panel,
            registry,
            Arc::clone(&capture),
            fanout,
            config.panel.clone(),
            Arc::clone(&running),
        );

        let acquisition = thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || acquisition_worker.run())?;
        let panel = match thread::Builder::new()
            .name("control-panel".to_string())
            .spawn(move || panel_worker.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                let _ = acquisition.join();
                return Err(e.into());
            }
        };

        tracing::info!("Service started (scope {}, panel {})", scope_name, panel_name);
        Ok(Self {
            running,
            capture,
            acquisition,
            panel,
        })
    }

    /// Capture settings shared with both loops
    pub fn capture(&self) -> &Arc<CaptureConfig> {
        &self.capture
    }

    /// Whether either loop has exited on its own
    pub fn is_degraded(&self) -> bool {
        self.acquisition.is_finished() || self.panel.is_finished()
    }

    /// Clear the running flag, wait for both loops and report how they ended
    ///
    /// Each loop notices the flag after its current read returns or times
    /// out. The scope's write handle is released only after both have
    /// been joined.
    pub fn stop(self) -> ServiceReport {
        tracing::info!("Stopping service");
        self.running.store(false, Ordering::SeqCst);

        let report = ServiceReport {
            acquisition: join(self.acquisition, "acquisition"),
            panel: join(self.panel, "control panel"),
        };
        drop(self.capture);
        report
    }
}

fn join<T>(handle: JoinHandle<Result<T>>, name: &str) -> Result<T> {
    handle.join().unwrap_or_else(|_| {
        Err(ScopeError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("{} thread panicked", name),
        )))
    })
}
