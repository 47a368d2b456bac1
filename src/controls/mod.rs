//! Control panel model: encoders, switches and LEDs
//!
//! The panel sends 2-byte event frames `[ID, MOD]`:
//!
//! | ID              | MOD          | Meaning                            |
//! |-----------------|--------------|------------------------------------|
//! | digit `0`-`9`   | `L` / `R`    | encoder turned one detent left/right |
//! | letter `A`-`Z`  | `1` / `0`    | switch pressed / released          |
//!
//! and accepts 2-byte LED writes `<ID><0|1>` with no acknowledgement.
//!
//! [`ControlRegistry`] keeps encoders, switches and LEDs in three separate
//! namespaces. Registering an identifier twice in one namespace fails with
//! [`ScopeError::DuplicateRegistration`]; that can only happen while the panel
//! is being set up. [`ControlRegistry::dispatch`] parses one frame, updates
//! the control and runs its action (see [`actions`]).

pub mod actions;
pub mod panel;

pub use actions::{
    default_encoders, default_leds, default_switches, ActionContext, EncoderAction, EncoderSpec,
    SwitchAction, SwitchSpec,
};
pub use panel::{PanelStats, PanelWorker};

use crate::config::{CaptureState, PanelConfig};
use crate::error::{ControlKind, Result, ScopeError};
use std::collections::BTreeMap;
use std::io::Write;

/// Rotary encoder with an integer value
#[derive(Debug, Clone, PartialEq)]
pub struct Encoder {
    id: u8,
    value: i64,
    range: Option<(i64, i64)>,
    action: EncoderAction,
}

impl Encoder {
    pub fn new(id: u8, action: EncoderAction) -> Self {
        Self {
            id,
            value: 0,
            range: None,
            action,
        }
    }

    /// Keep the value within `low..=high`
    pub fn with_range(mut self, low: i64, high: i64) -> Self {
        self.range = Some((low.min(high), low.max(high)));
        self.value = self.clamp(self.value);
        self
    }

    pub fn with_value(mut self, value: i64) -> Self {
        self.value = self.clamp(value);
        self
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn range(&self) -> Option<(i64, i64)> {
        self.range
    }

    pub fn action(&self) -> &EncoderAction {
        &self.action
    }

    fn clamp(&self, value: i64) -> i64 {
        match self.range {
            Some((low, high)) => value.clamp(low, high),
            None => value,
        }
    }

    /// Apply a signed delta and return the new value
    pub fn update(&mut self, delta: i64) -> i64 {
        self.value = self.clamp(self.value.saturating_add(delta));
        self.value
    }
}

/// Two-state switch
#[derive(Debug, Clone, PartialEq)]
pub struct Switch {
    id: char,
    value: bool,
    action: SwitchAction,
}

impl Switch {
    pub fn new(id: char, action: SwitchAction) -> Self {
        Self {
            id,
            value: false,
            action,
        }
    }

    pub fn id(&self) -> char {
        self.id
    }

    pub fn value(&self) -> bool {
        self.value
    }

    pub fn action(&self) -> &SwitchAction {
        &self.action
    }

    pub fn update(&mut self, pressed: bool) {
        self.value = pressed;
    }
}

/// Indicator light; its state only changes by writing it to the panel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Led {
    id: char,
    value: bool,
}

impl Led {
    pub fn id(&self) -> char {
        self.id
    }

    pub fn value(&self) -> bool {
        self.value
    }

    /// Bytes that set this LED to `value`
    pub fn command(id: char, value: bool) -> [u8; 2] {
        [id as u8, if value { b'1' } else { b'0' }]
    }
}

/// LEDs plus the write handle to the panel
pub struct LedBank {
    writer: Box<dyn Write + Send>,
    leds: BTreeMap<char, Led>,
}

impl LedBank {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer,
            leds: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, id: char) -> Result<()> {
        if !id.is_ascii_graphic() {
            return Err(ScopeError::InvalidSetting(format!(
                "LED id {:?} is not a printable ASCII character",
                id
            )));
        }
        if self.leds.contains_key(&id) {
            return Err(ScopeError::DuplicateRegistration {
                kind: ControlKind::Led,
                id,
            });
        }
        self.leds.insert(id, Led { id, value: false });
        Ok(())
    }

    pub fn contains(&self, id: char) -> bool {
        self.leds.contains_key(&id)
    }

    pub fn get(&self, id: char) -> Option<bool> {
        self.leds.get(&id).map(|led| led.value)
    }

    /// Write the LED state to the panel, then record it
    pub fn set(&mut self, id: char, value: bool) -> Result<()> {
        let led = self.leds.get_mut(&id).ok_or(ScopeError::UnknownControl {
            kind: ControlKind::Led,
            id,
        })?;
        self.writer.write_all(&Led::command(id, value))?;
        self.writer.flush()?;
        led.value = value;
        tracing::debug!("LED {} -> {}", id, value);
        Ok(())
    }

    /// Flip an LED and return its new state
    pub fn toggle(&mut self, id: char) -> Result<bool> {
        let next = !self.get(id).ok_or(ScopeError::UnknownControl {
            kind: ControlKind::Led,
            id,
        })?;
        self.set(id, next)?;
        Ok(next)
    }
}

/// Control that changed because of one event frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlUpdate {
    Encoder { id: u8, value: i64 },
    Switch { id: char, value: bool },
}

/// Registered controls of one panel
pub struct ControlRegistry {
    encoders: BTreeMap<u8, Encoder>,
    switches: BTreeMap<char, Switch>,
    leds: LedBank,
    encoder_step: i64,
}

impl ControlRegistry {
    /// Empty registry writing LED commands to `led_writer`
    pub fn new(led_writer: Box<dyn Write + Send>) -> Self {
        Self {
            encoders: BTreeMap::new(),
            switches: BTreeMap::new(),
            leds: LedBank::new(led_writer),
            encoder_step: 1,
        }
    }

    /// Detent size applied to every encoder event
    pub fn with_encoder_step(mut self, step: i64) -> Self {
        self.encoder_step = step;
        self
    }

    /// Build the registry described by the panel layout
    ///
    /// Encoders that drive a capture setting start at that setting's current
    /// value.
    pub fn from_layout(
        panel: &PanelConfig,
        state: &CaptureState,
        led_writer: Box<dyn Write + Send>,
    ) -> Result<Self> {
        let mut registry = Self::new(led_writer).with_encoder_step(panel.encoder_step);

        for id in &panel.leds {
            registry.add_led(*id)?;
        }

        for spec in &panel.encoders {
            let mut encoder = Encoder::new(spec.id, spec.action.clone());
            let range = spec
                .action
                .forced_range(panel)
                .or(spec.range.map(|[low, high]| (low, high)));
            if let Some((low, high)) = range {
                encoder = encoder.with_range(low, high);
            }
            let encoder = encoder.with_value(spec.action.initial_value(state, panel));
            registry.add_encoder(encoder)?;
        }

        for spec in &panel.switches {
            if spec.action == SwitchAction::ToggleLed && !registry.leds.contains(spec.id) {
                return Err(ScopeError::Config(format!(
                    "switch {} toggles LED {} which is not in the layout",
                    spec.id, spec.id
                )));
            }
            registry.add_switch(Switch::new(spec.id, spec.action.clone()))?;
        }

        tracing::info!(
            "Control panel layout: {} encoders, {} switches, {} LEDs",
            registry.encoders.len(),
            registry.switches.len(),
            panel.leds.len()
        );
        Ok(registry)
    }

    pub fn add_encoder(&mut self, encoder: Encoder) -> Result<()> {
        if encoder.id > 9 {
            return Err(ScopeError::InvalidSetting(format!(
                "encoder id {} is not a single digit",
                encoder.id
            )));
        }
        if self.encoders.contains_key(&encoder.id) {
            return Err(ScopeError::DuplicateRegistration {
                kind: ControlKind::Encoder,
                id: (b'0' + encoder.id) as char,
            });
        }
        self.encoders.insert(encoder.id, encoder);
        Ok(())
    }

    pub fn add_switch(&mut self, switch: Switch) -> Result<()> {
        if !switch.id.is_ascii_uppercase() {
            return Err(ScopeError::InvalidSetting(format!(
                "switch id {:?} is not an uppercase letter",
                switch.id
            )));
        }
        if self.switches.contains_key(&switch.id) {
            return Err(ScopeError::DuplicateRegistration {
                kind: ControlKind::Switch,
                id: switch.id,
            });
        }
        self.switches.insert(switch.id, switch);
        Ok(())
    }

    pub fn add_led(&mut self, id: char) -> Result<()> {
        self.leds.add(id)
    }

    pub fn encoder(&self, id: u8) -> Option<&Encoder> {
        self.encoders.get(&id)
    }

    pub fn switch(&self, id: char) -> Option<&Switch> {
        self.switches.get(&id)
    }

    pub fn led(&self, id: char) -> Option<bool> {
        self.leds.get(id)
    }

    pub fn set_led(&mut self, id: char, value: bool) -> Result<()> {
        self.leds.set(id, value)
    }

    pub fn toggle_led(&mut self, id: char) -> Result<bool> {
        self.leds.toggle(id)
    }

    /// Handle one event frame
    ///
    /// The identifier is looked up before the modifier is checked, so a frame
    /// for an unknown control is reported as such even if its modifier is
    /// also bad. When the action fails the control goes back to its previous
    /// value, so it never disagrees with the setting it drives.
    pub fn dispatch(&mut self, frame: &[u8], ctx: &ActionContext<'_>) -> Result<ControlUpdate> {
        let malformed = || ScopeError::MalformedMessage {
            raw: frame.to_vec(),
        };
        let &[id, modifier] = frame else {
            return Err(malformed());
        };

        let (update, record) = if id.is_ascii_digit() {
            let encoder = self
                .encoders
                .get_mut(&(id - b'0'))
                .ok_or(ScopeError::UnknownControl {
                    kind: ControlKind::Encoder,
                    id: id as char,
                })?;
            let delta = match modifier {
                b'L' => -self.encoder_step,
                b'R' => self.encoder_step,
                _ => return Err(malformed()),
            };
            let previous = encoder.value;
            let value = encoder.update(delta);
            tracing::debug!("Encoder {} -> {}", encoder.id, value);

            let record = match encoder.action.apply(encoder, ctx) {
                Ok(record) => record,
                Err(e) => {
                    encoder.value = previous;
                    return Err(e);
                }
            };
            (
                ControlUpdate::Encoder {
                    id: encoder.id,
                    value,
                },
                record,
            )
        } else if id.is_ascii_uppercase() {
            let switch = self
                .switches
                .get_mut(&(id as char))
                .ok_or(ScopeError::UnknownControl {
                    kind: ControlKind::Switch,
                    id: id as char,
                })?;
            let pressed = match modifier {
                b'1' => true,
                b'0' => false,
                _ => return Err(malformed()),
            };
            let previous = switch.value;
            switch.update(pressed);
            tracing::debug!("Switch {} -> {}", switch.id, pressed);

            let record = match switch.action.apply(switch, &mut self.leds, ctx) {
                Ok(record) => record,
                Err(e) => {
                    switch.value = previous;
                    return Err(e);
                }
            };
            (
                ControlUpdate::Switch {
                    id: switch.id,
                    value: pressed,
                },
                record,
            )
        } else {
            return Err(malformed());
        };

        if let Some(record) = record {
            ctx.fanout.publish(&record)?;
        }
        Ok(update)
    }
}

impl std::fmt::Debug for ControlRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlRegistry")
            .field("encoders", &self.encoders)
            .field("switches", &self.switches)
            .field("leds", &self.leds.leds)
            .field("encoder_step", &self.encoder_step)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaptureConfig, Calibration};
    use crate::fanout::{ChannelSubscriber, FanoutRegistry};
    use crate::types::{Channel, PreampGain, TriggerEdge};
    use crossbeam_channel::Receiver;
    use std::sync::{Arc, Mutex};

    /// Shared byte sink standing in for a serial port
    #[derive(Clone, Default)]
    struct Wire(Arc<Mutex<Vec<u8>>>);

    impl Wire {
        fn bytes(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Write for Wire {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Unplugged;

    impl Write for Unplugged {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        capture: CaptureConfig,
        scope: Wire,
        fanout: FanoutRegistry,
        echoes: Receiver<Vec<u8>>,
        panel: PanelConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let scope = Wire::default();
            let capture = CaptureConfig::new(
                CaptureState::default(),
                Calibration::default(),
                Box::new(scope.clone()),
            )
            .unwrap();
            let fanout = FanoutRegistry::new();
            let (subscriber, echoes) = ChannelSubscriber::pair("echo");
            fanout.subscribe(Arc::new(subscriber));
            Self {
                capture,
                scope,
                fanout,
                echoes,
                panel: PanelConfig::default(),
            }
        }

        fn ctx(&self) -> ActionContext<'_> {
            ActionContext::new(&self.capture, &self.fanout, &self.panel)
        }

        fn echoes(&self) -> Vec<String> {
            self.echoes
                .try_iter()
                .map(|line| String::from_utf8(line).unwrap())
                .collect()
        }
    }

    fn echo(name: &str) -> EncoderAction {
        EncoderAction::Echo {
            name: name.to_string(),
        }
    }

    #[test]
    fn test_encoder_right_increments_and_echoes_once() {
        let fixture = Fixture::new();
        let mut registry = ControlRegistry::new(Box::new(Wire::default()));
        registry.add_encoder(Encoder::new(3, echo("encoder_3"))).unwrap();

        let update = registry.dispatch(b"3R", &fixture.ctx()).unwrap();
        assert_eq!(update, ControlUpdate::Encoder { id: 3, value: 1 });
        assert_eq!(registry.encoder(3).unwrap().value(), 1);
        assert_eq!(fixture.echoes(), vec!["{\"encoder_3\":1}\n".to_string()]);

        registry.dispatch(b"3L", &fixture.ctx()).unwrap();
        registry.dispatch(b"3L", &fixture.ctx()).unwrap();
        assert_eq!(registry.encoder(3).unwrap().value(), -1);
    }

    #[test]
    fn test_switch_press_and_release() {
        let fixture = Fixture::new();
        let mut registry = ControlRegistry::new(Box::new(Wire::default()));
        registry
            .add_switch(Switch::new(
                'A',
                SwitchAction::Echo {
                    name: "run".to_string(),
                },
            ))
            .unwrap();

        let update = registry.dispatch(b"A1", &fixture.ctx()).unwrap();
        assert_eq!(update, ControlUpdate::Switch { id: 'A', value: true });
        assert!(registry.switch('A').unwrap().value());
        assert_eq!(fixture.echoes(), vec!["{\"run\":true}\n".to_string()]);

        registry.dispatch(b"A0", &fixture.ctx()).unwrap();
        assert!(!registry.switch('A').unwrap().value());
    }

    #[test]
    fn test_error_taxonomy() {
        let fixture = Fixture::new();
        let mut registry = ControlRegistry::new(Box::new(Wire::default()));
        registry.add_encoder(Encoder::new(1, EncoderAction::Ignore)).unwrap();
        registry.add_switch(Switch::new('B', SwitchAction::Ignore)).unwrap();
        let ctx = fixture.ctx();

        assert!(matches!(
            registry.dispatch(b"Z1", &ctx),
            Err(ScopeError::UnknownControl {
                kind: ControlKind::Switch,
                id: 'Z'
            })
        ));
        assert!(matches!(
            registry.dispatch(b"9R", &ctx),
            Err(ScopeError::UnknownControl {
                kind: ControlKind::Encoder,
                id: '9'
            })
        ));
        // Unknown id wins over a bad modifier
        assert!(matches!(
            registry.dispatch(b"9X", &ctx),
            Err(ScopeError::UnknownControl { .. })
        ));
        let frames: [&[u8]; 7] = [b"1X", b"B2", b"#1", b"b1", b"1", b"1RR", b""];
        for frame in frames {
            let err = registry.dispatch(frame, &ctx).unwrap_err();
            assert!(
                matches!(err, ScopeError::MalformedMessage { ref raw } if raw == frame),
                "{:?} gave {}",
                frame,
                err
            );
        }
        assert_eq!(registry.encoder(1).unwrap().value(), 0);
    }

    #[test]
    fn test_duplicate_registration_per_namespace() {
        let mut registry = ControlRegistry::new(Box::new(Wire::default()));
        registry.add_encoder(Encoder::new(1, EncoderAction::Ignore)).unwrap();
        registry.add_switch(Switch::new('A', SwitchAction::Ignore)).unwrap();
        // Same letter in another namespace is fine
        registry.add_led('A').unwrap();

        assert!(matches!(
            registry.add_encoder(Encoder::new(1, EncoderAction::Ignore)),
            Err(ScopeError::DuplicateRegistration {
                kind: ControlKind::Encoder,
                id: '1'
            })
        ));
        assert!(matches!(
            registry.add_switch(Switch::new('A', SwitchAction::Ignore)),
            Err(ScopeError::DuplicateRegistration {
                kind: ControlKind::Switch,
                ..
            })
        ));
        assert!(registry.add_led('A').is_err());
        assert!(registry.add_encoder(Encoder::new(12, EncoderAction::Ignore)).is_err());
        assert!(registry.add_switch(Switch::new('a', SwitchAction::Ignore)).is_err());
    }

    #[test]
    fn test_encoder_clamp_holds_at_limit() {
        let fixture = Fixture::new();
        let mut registry = ControlRegistry::new(Box::new(Wire::default()));
        registry
            .add_encoder(Encoder::new(4, EncoderAction::Ignore).with_range(0, 15))
            .unwrap();

        for _ in 0..20 {
            registry.dispatch(b"4R", &fixture.ctx()).unwrap();
        }
        assert_eq!(registry.encoder(4).unwrap().value(), 15);
    }

    #[test]
    fn test_led_write_through_and_toggle() {
        let leds = Wire::default();
        let fixture = Fixture::new();
        let mut registry = ControlRegistry::new(Box::new(leds.clone()));
        registry.add_led('P').unwrap();
        registry
            .add_switch(Switch::new('P', SwitchAction::ToggleLed))
            .unwrap();

        registry.dispatch(b"P1", &fixture.ctx()).unwrap();
        registry.dispatch(b"P0", &fixture.ctx()).unwrap();
        registry.dispatch(b"P1", &fixture.ctx()).unwrap();

        // Only presses toggle
        assert_eq!(leds.bytes(), b"P1P0");
        assert_eq!(registry.led('P'), Some(false));
        assert_eq!(
            fixture.echoes(),
            vec!["{\"led_p\":true}\n", "{\"led_p\":true}\n", "{\"led_p\":false}\n"]
        );

        assert!(matches!(
            registry.set_led('Q', true),
            Err(ScopeError::UnknownControl {
                kind: ControlKind::Led,
                ..
            })
        ));
    }

    #[test]
    fn test_sample_rate_encoder_writes_register() {
        let fixture = Fixture::new();
        let panel = PanelConfig {
            encoders: vec![EncoderSpec::new(1, EncoderAction::SampleRateDivisor)],
            ..PanelConfig::default()
        };
        let mut registry =
            ControlRegistry::from_layout(&panel, &CaptureState::default(), Box::new(Wire::default()))
                .unwrap();
        assert_eq!(registry.encoder(1).unwrap().value(), 7);

        for _ in 0..20 {
            registry.dispatch(b"1R", &fixture.ctx()).unwrap();
        }
        assert_eq!(registry.encoder(1).unwrap().value(), 15);
        assert_eq!(fixture.capture.snapshot().unwrap().sample_rate_divisor, 15);

        // Rising edge, trigger on A, divisor 15
        let wire = fixture.scope.bytes();
        assert!(wire.ends_with(b"S R \x2F\r\n"));
        assert_eq!(fixture.echoes().last().unwrap(), "{\"sample_rate_divisor\":15}\n");
    }

    #[test]
    fn test_trigger_level_encoder_is_clamped_in_volts() {
        let mut fixture = Fixture::new();
        fixture.panel.trigger_level_limit = 0.1;
        let panel = PanelConfig {
            encoders: vec![EncoderSpec::new(2, EncoderAction::TriggerLevel)],
            ..fixture.panel.clone()
        };
        let mut registry =
            ControlRegistry::from_layout(&panel, &CaptureState::default(), Box::new(Wire::default()))
                .unwrap();

        for _ in 0..5 {
            registry.dispatch(b"2R", &fixture.ctx()).unwrap();
        }
        assert_eq!(registry.encoder(2).unwrap().value(), 2);
        assert_eq!(fixture.capture.snapshot().unwrap().trigger_level, 0.1);
        assert_eq!(fixture.echoes().last().unwrap(), "{\"trigger_level\":0.1}\n");
    }

    #[test]
    fn test_switch_actions_drive_capture_settings() {
        let fixture = Fixture::new();
        let mut registry =
            ControlRegistry::from_layout(&fixture.panel, &CaptureState::default(), Box::new(Wire::default()))
                .unwrap();

        registry.dispatch(b"H0", &fixture.ctx()).unwrap();
        registry.dispatch(b"G0", &fixture.ctx()).unwrap();

        let state = fixture.capture.snapshot().unwrap();
        assert_eq!(state.preamp_a, PreampGain::Low);
        assert_eq!(state.trigger_edge, TriggerEdge::Falling);
        assert_eq!(
            fixture.echoes(),
            vec!["{\"preamp_a\":false}\n", "{\"trigger_rising\":false}\n"]
        );
    }

    #[test]
    fn test_failed_action_restores_control_value() {
        let mut fixture = Fixture::new();
        fixture.capture = CaptureConfig::new(
            CaptureState::default(),
            Calibration::default(),
            Box::new(Unplugged),
        )
        .unwrap();
        let mut registry = ControlRegistry::new(Box::new(Wire::default()));
        registry
            .add_encoder(
                Encoder::new(1, EncoderAction::SampleRateDivisor)
                    .with_range(0, 15)
                    .with_value(7),
            )
            .unwrap();
        registry
            .add_switch(Switch::new('H', SwitchAction::Preamp { channel: Channel::A }))
            .unwrap();

        assert!(registry.dispatch(b"1R", &fixture.ctx()).is_err());
        assert_eq!(registry.encoder(1).unwrap().value(), 7);
        assert_eq!(fixture.capture.snapshot().unwrap().sample_rate_divisor, 7);

        assert!(registry.dispatch(b"H1", &fixture.ctx()).is_err());
        assert!(!registry.switch('H').unwrap().value());
        assert!(fixture.echoes().is_empty());
    }

    #[test]
    fn test_layout_rejects_toggle_without_led() {
        let panel = PanelConfig {
            leds: vec![],
            ..PanelConfig::default()
        };
        let err = ControlRegistry::from_layout(&panel, &CaptureState::default(), Box::new(Wire::default()))
            .unwrap_err();
        assert!(matches!(err, ScopeError::Config(_)));
    }
}
