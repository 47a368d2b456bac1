//! Capture settings shared between the control panel and the acquisition loop
//!
//! [`CaptureConfig`] is the single owner of the scope's command channel. Every
//! setter writes the matching device command before it returns and only then
//! updates the local copy, so the local state never claims something the scope
//! was not told. All commands, including the acquisition loop's own
//! begin-capture and dump requests, go through the same lock, which keeps a
//! setter called from the control panel thread from interleaving bytes with a
//! command the acquisition loop is writing.

use crate::backend::codec::{ControlRegister, ScopeCommand, TriggerCode, MAX_SAMPLE_RATE_DIVISOR};
use crate::config::Calibration;
use crate::error::{Result, ScopeError};
use crate::types::{Channel, PreampGain, TriggerEdge, TriggerSource};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Mutex;

/// Plain copy of every capture setting
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureState {
    /// 4-bit sample rate divisor
    pub sample_rate_divisor: u8,
    pub preamp_a: PreampGain,
    pub preamp_b: PreampGain,
    pub trigger_source: TriggerSource,
    pub trigger_edge: TriggerEdge,
    /// Trigger level in volts
    pub trigger_level: f64,
}

impl Default for CaptureState {
    fn default() -> Self {
        Self {
            sample_rate_divisor: 7,
            preamp_a: PreampGain::High,
            preamp_b: PreampGain::High,
            trigger_source: TriggerSource::A,
            trigger_edge: TriggerEdge::Rising,
            trigger_level: 0.0,
        }
    }
}

impl CaptureState {
    pub fn preamp(&self, channel: Channel) -> PreampGain {
        match channel {
            Channel::A => self.preamp_a,
            Channel::B => self.preamp_b,
        }
    }

    fn set_preamp(&mut self, channel: Channel, gain: PreampGain) {
        match channel {
            Channel::A => self.preamp_a = gain,
            Channel::B => self.preamp_b = gain,
        }
    }

    /// Control register byte for these settings
    pub fn register(&self) -> Result<ControlRegister> {
        ControlRegister::encode(
            self.sample_rate_divisor,
            self.trigger_source,
            self.trigger_edge,
        )
    }

    /// Device code for the trigger level under the current trigger channel's gain
    pub fn trigger_code(&self, calibration: &Calibration) -> TriggerCode {
        let step = calibration.step_size(self.preamp(self.trigger_source.calibration_channel()));
        TriggerCode::from_volts(self.trigger_level, step, calibration.trigger_gain)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate_divisor > MAX_SAMPLE_RATE_DIVISOR {
            return Err(ScopeError::InvalidSetting(format!(
                "Invalid sample rate divisor {}",
                self.sample_rate_divisor
            )));
        }
        if !self.trigger_level.is_finite() {
            return Err(ScopeError::InvalidSetting(
                "trigger level must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

struct CaptureInner {
    state: CaptureState,
    writer: Box<dyn Write + Send>,
}

impl CaptureInner {
    fn write(&mut self, command: &ScopeCommand) -> Result<()> {
        self.writer.write_all(&command.encode())?;
        self.writer.flush()?;
        tracing::trace!("Sent scope command {:?}", command);
        Ok(())
    }
}

/// Capture settings with write-through to the scope
pub struct CaptureConfig {
    calibration: Calibration,
    inner: Mutex<CaptureInner>,
}

impl CaptureConfig {
    /// Wrap the scope's command writer
    ///
    /// Nothing is sent until [`apply_all`](Self::apply_all) or a setter is
    /// called, so `state` must describe the device as it is (or is about to be
    /// made by `apply_all`).
    pub fn new(
        state: CaptureState,
        calibration: Calibration,
        writer: Box<dyn Write + Send>,
    ) -> Result<Self> {
        state.validate()?;
        Ok(Self {
            calibration,
            inner: Mutex::new(CaptureInner { state, writer }),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CaptureInner>> {
        self.inner
            .lock()
            .map_err(|e| ScopeError::Lock(format!("Failed to acquire capture lock: {}", e)))
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Copy of the current settings
    pub fn snapshot(&self) -> Result<CaptureState> {
        Ok(self.lock()?.state)
    }

    /// Send a command that does not change any setting
    pub fn send(&self, command: ScopeCommand) -> Result<()> {
        self.lock()?.write(&command)
    }

    /// Push every setting to the device
    pub fn apply_all(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let state = inner.state;
        for channel in [Channel::A, Channel::B] {
            inner.write(&ScopeCommand::SetPreamp {
                channel,
                gain: state.preamp(channel),
            })?;
        }
        inner.write(&ScopeCommand::WriteRegister(state.register()?))?;
        inner.write(&ScopeCommand::SetTriggerLevel(
            state.trigger_code(&self.calibration),
        ))?;
        tracing::debug!("Applied capture settings {:?}", state);
        Ok(())
    }

    pub fn set_sample_rate_divisor(&self, divisor: u8) -> Result<()> {
        self.update_register(|state| state.sample_rate_divisor = divisor)
    }

    pub fn set_trigger_edge(&self, edge: TriggerEdge) -> Result<()> {
        self.update_register(|state| state.trigger_edge = edge)
    }

    /// Change the trigger source
    ///
    /// The level is re-sent when the new source has a different calibration,
    /// so the device code keeps standing for the same voltage. Nothing is
    /// recorded unless both writes succeed, so retrying re-sends both.
    pub fn set_trigger_source(&self, source: TriggerSource) -> Result<()> {
        let mut inner = self.lock()?;
        let mut next = inner.state;
        next.trigger_source = source;
        inner.write(&ScopeCommand::WriteRegister(next.register()?))?;
        self.commit_with_level(&mut inner, next)
    }

    /// Change one channel's preamp gain
    ///
    /// When the channel feeds the trigger, the trigger level is re-sent under
    /// the new calibration. As with the trigger source, the state only changes
    /// once every write went through.
    pub fn set_preamp(&self, channel: Channel, gain: PreampGain) -> Result<()> {
        let mut inner = self.lock()?;
        let mut next = inner.state;
        next.set_preamp(channel, gain);
        inner.write(&ScopeCommand::SetPreamp { channel, gain })?;
        self.commit_with_level(&mut inner, next)
    }

    /// Re-send the trigger level if `next` changes its code, then store `next`
    fn commit_with_level(&self, inner: &mut CaptureInner, next: CaptureState) -> Result<()> {
        let before = inner.state.trigger_code(&self.calibration);
        let after = next.trigger_code(&self.calibration);
        if after != before {
            inner.write(&ScopeCommand::SetTriggerLevel(after))?;
        }
        inner.state = next;
        Ok(())
    }

    /// Set the trigger level, returning the code sent to the device
    pub fn set_trigger_level(&self, volts: f64) -> Result<TriggerCode> {
        if !volts.is_finite() {
            return Err(ScopeError::InvalidSetting(format!(
                "trigger level {} is not a number",
                volts
            )));
        }
        let mut inner = self.lock()?;
        let mut next = inner.state;
        next.trigger_level = volts;
        let code = next.trigger_code(&self.calibration);
        inner.write(&ScopeCommand::SetTriggerLevel(code))?;
        inner.state = next;
        Ok(code)
    }

    fn update_register(&self, change: impl FnOnce(&mut CaptureState)) -> Result<()> {
        let mut inner = self.lock()?;
        let mut next = inner.state;
        change(&mut next);
        let register = next.register()?;
        inner.write(&ScopeCommand::WriteRegister(register))?;
        inner.state = next;
        Ok(())
    }
}

impl std::fmt::Debug for CaptureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureConfig")
            .field("calibration", &self.calibration)
            .field("state", &self.snapshot().ok())
            .finish()
    }
}
