//! What each control does when it changes
//!
//! Every encoder and switch carries one action. The poll loop hands the
//! updated control, the capture settings and the fan-out registry to the
//! action explicitly through [`ActionContext`]; actions never capture state of
//! their own. An action may change a capture setting, write an LED, and
//! returns the echo record that tells subscribers about the new value.
//!
//! Actions are also the `action` entries of the panel layout in the config
//! file:
//!
//! ```toml
//! [[panel.encoders]]
//! id = 1
//! action = { kind = "sample_rate_divisor" }
//!
//! [[panel.switches]]
//! id = "H"
//! action = { kind = "preamp", channel = "A" }
//! ```

use crate::backend::codec::MAX_SAMPLE_RATE_DIVISOR;
use crate::config::{CaptureConfig, CaptureState, PanelConfig};
use crate::controls::{Encoder, LedBank, Switch};
use crate::error::Result;
use crate::fanout::FanoutRegistry;
use crate::types::{Channel, EchoValue, PreampGain, Record, TriggerEdge, TriggerSource};
use serde::{Deserialize, Serialize};

/// Action bound to an encoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncoderAction {
    Ignore,
    /// Publish the encoder value under `name`
    Echo { name: String },
    /// Encoder value is the sample rate divisor, clamped to 0..=15
    SampleRateDivisor,
    /// Encoder value counts trigger level steps
    TriggerLevel,
}

/// Action bound to a switch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SwitchAction {
    Ignore,
    /// Publish the switch state under `name`
    Echo { name: String },
    /// Toggle the LED with the same id on every press
    ToggleLed,
    /// Pressed selects high gain; the same-id LED follows if there is one
    Preamp { channel: Channel },
    /// Pressed selects the rising edge
    TriggerEdge,
    /// Pressed triggers on `channel`, released on the external input
    TriggerSource { channel: Channel },
}

/// Everything an action may touch besides the control itself
pub struct ActionContext<'a> {
    pub capture: &'a CaptureConfig,
    pub fanout: &'a FanoutRegistry,
    /// Volts per trigger level encoder tick
    pub trigger_step_volts: f64,
    /// Trigger level is kept within `[-limit, +limit]` volts
    pub trigger_level_limit: f64,
}

impl<'a> ActionContext<'a> {
    pub fn new(capture: &'a CaptureConfig, fanout: &'a FanoutRegistry, panel: &PanelConfig) -> Self {
        Self {
            capture,
            fanout,
            trigger_step_volts: panel.trigger_step_volts,
            trigger_level_limit: panel.trigger_level_limit,
        }
    }

    fn round(&self, value: f64) -> f64 {
        let scale = 10f64.powi(self.capture.calibration().decimals as i32);
        (value * scale).round() / scale
    }
}

/// Encoder ticks covering `[-limit, +limit]` volts
fn trigger_ticks(panel: &PanelConfig) -> i64 {
    (panel.trigger_level_limit / panel.trigger_step_volts + 1e-9).floor() as i64
}

impl EncoderAction {
    /// Clamp range the action always imposes, whatever the layout says
    pub fn forced_range(&self, panel: &PanelConfig) -> Option<(i64, i64)> {
        match self {
            EncoderAction::SampleRateDivisor => Some((0, MAX_SAMPLE_RATE_DIVISOR as i64)),
            EncoderAction::TriggerLevel => {
                let ticks = trigger_ticks(panel);
                Some((-ticks, ticks))
            }
            EncoderAction::Ignore | EncoderAction::Echo { .. } => None,
        }
    }

    /// Starting value matching the capture settings pushed at startup
    pub fn initial_value(&self, state: &CaptureState, panel: &PanelConfig) -> i64 {
        match self {
            EncoderAction::SampleRateDivisor => state.sample_rate_divisor as i64,
            EncoderAction::TriggerLevel => (state.trigger_level / panel.trigger_step_volts).round() as i64,
            EncoderAction::Ignore | EncoderAction::Echo { .. } => 0,
        }
    }

    pub fn apply(&self, encoder: &Encoder, ctx: &ActionContext<'_>) -> Result<Option<Record>> {
        match self {
            EncoderAction::Ignore => Ok(None),
            EncoderAction::Echo { name } => {
                Ok(Some(Record::echo(name.clone(), EchoValue::Integer(encoder.value()))))
            }
            EncoderAction::SampleRateDivisor => {
                let divisor = encoder.value().clamp(0, MAX_SAMPLE_RATE_DIVISOR as i64) as u8;
                ctx.capture.set_sample_rate_divisor(divisor)?;
                Ok(Some(Record::echo(
                    "sample_rate_divisor",
                    EchoValue::Integer(divisor as i64),
                )))
            }
            EncoderAction::TriggerLevel => {
                let limit = ctx.trigger_level_limit;
                let volts = ctx.round(encoder.value() as f64 * ctx.trigger_step_volts).clamp(-limit, limit);
                ctx.capture.set_trigger_level(volts)?;
                Ok(Some(Record::echo("trigger_level", EchoValue::Number(volts))))
            }
        }
    }
}

impl SwitchAction {
    pub fn apply(
        &self,
        switch: &Switch,
        leds: &mut LedBank,
        ctx: &ActionContext<'_>,
    ) -> Result<Option<Record>> {
        let pressed = switch.value();
        match self {
            SwitchAction::Ignore => Ok(None),
            SwitchAction::Echo { name } => {
                Ok(Some(Record::echo(name.clone(), EchoValue::Flag(pressed))))
            }
            SwitchAction::ToggleLed => {
                let lit = if pressed {
                    leds.toggle(switch.id())?
                } else {
                    leds.get(switch.id()).unwrap_or(false)
                };
                Ok(Some(Record::echo(
                    format!("led_{}", switch.id().to_ascii_lowercase()),
                    EchoValue::Flag(lit),
                )))
            }
            SwitchAction::Preamp { channel } => {
                let gain = if pressed {
                    PreampGain::High
                } else {
                    PreampGain::Low
                };
                ctx.capture.set_preamp(*channel, gain)?;
                if leds.contains(switch.id()) {
                    leds.set(switch.id(), pressed)?;
                }
                Ok(Some(Record::echo(
                    format!("preamp_{}", channel.letter().to_ascii_lowercase()),
                    EchoValue::Flag(pressed),
                )))
            }
            SwitchAction::TriggerEdge => {
                let edge = if pressed {
                    TriggerEdge::Rising
                } else {
                    TriggerEdge::Falling
                };
                ctx.capture.set_trigger_edge(edge)?;
                Ok(Some(Record::echo("trigger_rising", EchoValue::Flag(pressed))))
            }
            SwitchAction::TriggerSource { channel } => {
                let source = if pressed {
                    TriggerSource::from(*channel)
                } else {
                    TriggerSource::External
                };
                ctx.capture.set_trigger_source(source)?;
                Ok(Some(Record::echo(
                    format!("trigger_on_{}", channel.letter().to_ascii_lowercase()),
                    EchoValue::Flag(pressed),
                )))
            }
        }
    }
}

// ==================== Layout ====================

/// One encoder in the panel layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSpec {
    /// Decimal digit sent by the panel
    pub id: u8,
    pub action: EncoderAction,
    /// Inclusive clamp range `[low, high]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<[i64; 2]>,
}

impl EncoderSpec {
    pub fn new(id: u8, action: EncoderAction) -> Self {
        Self {
            id,
            action,
            range: None,
        }
    }

    /// Identifier as it appears on the wire, if it fits in one digit
    pub fn id_char(&self) -> Option<char> {
        char::from_digit(self.id as u32, 10)
    }
}

/// One switch in the panel layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchSpec {
    pub id: char,
    pub action: SwitchAction,
}

impl SwitchSpec {
    pub fn new(id: char, action: SwitchAction) -> Self {
        Self { id, action }
    }
}

fn echo_encoder(id: u8, name: &str) -> EncoderSpec {
    EncoderSpec::new(
        id,
        EncoderAction::Echo {
            name: format!("{}_{}", name, id),
        },
    )
}

/// Encoders of the stock panel
///
/// Encoders 1 and 2 drive capture settings; the rest echo or do nothing.
pub fn default_encoders() -> Vec<EncoderSpec> {
    vec![
        EncoderSpec::new(1, EncoderAction::SampleRateDivisor),
        EncoderSpec::new(2, EncoderAction::TriggerLevel),
        echo_encoder(3, "position"),
        echo_encoder(4, "scale"),
        echo_encoder(5, "position"),
        echo_encoder(6, "scale"),
        EncoderSpec::new(7, EncoderAction::Ignore),
    ]
}

/// Switches of the stock panel
pub fn default_switches() -> Vec<SwitchSpec> {
    let mut switches: Vec<SwitchSpec> = ['A', 'B', 'C', 'D', 'E']
        .into_iter()
        .map(|id| SwitchSpec::new(id, SwitchAction::ToggleLed))
        .collect();
    switches.extend([
        SwitchSpec::new('G', SwitchAction::TriggerEdge),
        SwitchSpec::new('H', SwitchAction::Preamp { channel: Channel::A }),
        SwitchSpec::new('I', SwitchAction::Preamp { channel: Channel::B }),
        SwitchSpec::new('J', SwitchAction::Ignore),
        SwitchSpec::new('P', SwitchAction::ToggleLed),
    ]);
    switches
}

/// LEDs of the stock panel
pub fn default_leds() -> Vec<char> {
    vec!['A', 'B', 'C', 'D', 'E', 'P']
}
