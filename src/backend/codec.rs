//! Scope wire format
//!
//! Outbound commands are ASCII lines terminated by CRLF. Arguments that the
//! device reads as binary (the control register byte and the two trigger
//! level bytes) are written as raw bytes after the separating space.
//!
//! | Command          | Meaning                                   |
//! |------------------|-------------------------------------------|
//! | `S G`            | begin a capture                           |
//! | `S B`            | request the memory dump                   |
//! | `S R <n>`        | write the control register                |
//! | `S T <hi> <lo>`  | set the trigger level code                |
//! | `S P <A|a|B|b>`  | set a channel preamp (uppercase = high)   |
//!
//! Inbound frames are fixed length and tagged by their first byte:
//!
//! - Ready: `'A'` followed by the big-endian end address of the last record,
//!   a multiple of 4 no greater than [`MAX_END_ADDRESS`]
//! - Dump: `'D'` followed by exactly [`DUMP_PAYLOAD_LEN`] bytes

use crate::error::{ProtocolError, Result, ScopeError};
use crate::types::{Channel, PreampGain, TriggerEdge, TriggerSource};

/// Terminator appended to every command
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Tag of the capture-complete frame
pub const READY_TAG: u8 = b'A';

/// Total length of the capture-complete frame including its tag
pub const READY_FRAME_LEN: usize = 3;

/// Tag preceding the memory dump
pub const DUMP_TAG: u8 = b'D';

/// Size of the scope's circular sample memory
pub const DUMP_PAYLOAD_LEN: usize = 4096;

/// Address of the last record slot in the dump
pub const MAX_END_ADDRESS: u16 = (DUMP_PAYLOAD_LEN - 4) as u16;

/// Largest sample-rate divisor the control register can hold
pub const MAX_SAMPLE_RATE_DIVISOR: u8 = 0x0F;

/// Zero-volt code of the 10-bit signed-offset representation
pub const CODE_CENTER: i32 = 511;

/// Largest 10-bit code
pub const CODE_MAX: u16 = 0x03FF;

const TRIGGER_ON_B: u8 = 1 << 4;
const TRIGGER_RISING: u8 = 1 << 5;
const TRIGGER_EXTERNAL: u8 = 1 << 6;

/// Contents of the scope's control register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRegister(u8);

impl ControlRegister {
    /// Pack the sample rate and trigger settings into the register byte
    pub fn encode(divisor: u8, source: TriggerSource, edge: TriggerEdge) -> Result<Self> {
        if divisor > MAX_SAMPLE_RATE_DIVISOR {
            return Err(ScopeError::InvalidSetting(format!(
                "sample rate divisor {} exceeds {}",
                divisor, MAX_SAMPLE_RATE_DIVISOR
            )));
        }

        let mut bits = divisor;
        match source {
            TriggerSource::A => {}
            TriggerSource::B => bits |= TRIGGER_ON_B,
            TriggerSource::External => bits |= TRIGGER_EXTERNAL,
        }
        if edge == TriggerEdge::Rising {
            bits |= TRIGGER_RISING;
        }
        Ok(Self(bits))
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn sample_rate_divisor(&self) -> u8 {
        self.0 & MAX_SAMPLE_RATE_DIVISOR
    }

    pub fn trigger_source(&self) -> TriggerSource {
        if self.0 & TRIGGER_EXTERNAL != 0 {
            TriggerSource::External
        } else if self.0 & TRIGGER_ON_B != 0 {
            TriggerSource::B
        } else {
            TriggerSource::A
        }
    }

    pub fn trigger_edge(&self) -> TriggerEdge {
        if self.0 & TRIGGER_RISING != 0 {
            TriggerEdge::Rising
        } else {
            TriggerEdge::Falling
        }
    }
}

/// 10-bit signed-offset trigger level as the device stores it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerCode(u16);

impl TriggerCode {
    /// `code = 511 - round(gain * volts / step)`, saturated to 10 bits
    pub fn from_volts(volts: f64, step: f64, gain: f64) -> Self {
        let counts = (gain * volts / step).round();
        let code = (CODE_CENTER as f64 - counts).clamp(0.0, CODE_MAX as f64);
        Self(code as u16)
    }

    pub fn from_bytes(high: u8, low: u8) -> Self {
        Self(u16::from_be_bytes([high, low]) & CODE_MAX)
    }

    pub fn value(&self) -> u16 {
        self.0
    }

    /// High and low byte as sent after `S T`
    pub fn bytes(&self) -> (u8, u8) {
        let [high, low] = self.0.to_be_bytes();
        (high, low)
    }

    /// Voltage this code stands for under the given calibration
    pub fn to_volts(&self, step: f64, gain: f64) -> f64 {
        (CODE_CENTER - self.0 as i32) as f64 * step / gain
    }
}

/// Command sent to the scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeCommand {
    /// `S G`
    BeginCapture,
    /// `S B`
    RequestDump,
    /// `S R <n>`
    WriteRegister(ControlRegister),
    /// `S T <hi> <lo>`
    SetTriggerLevel(TriggerCode),
    /// `S P <A|a|B|b>`
    SetPreamp { channel: Channel, gain: PreampGain },
}

impl ScopeCommand {
    /// Bytes written to the port, terminator included
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(b"S ");
        match self {
            ScopeCommand::BeginCapture => out.push(b'G'),
            ScopeCommand::RequestDump => out.push(b'B'),
            ScopeCommand::WriteRegister(register) => {
                out.extend_from_slice(b"R ");
                out.push(register.bits());
            }
            ScopeCommand::SetTriggerLevel(code) => {
                let (high, low) = code.bytes();
                out.extend_from_slice(b"T ");
                out.push(high);
                out.push(b' ');
                out.push(low);
            }
            ScopeCommand::SetPreamp { channel, gain } => {
                out.extend_from_slice(b"P ");
                out.push(preamp_letter(*channel, *gain));
            }
        }
        out.extend_from_slice(LINE_TERMINATOR);
        out
    }

    /// Parse one command line (terminator included); used by the scope simulator
    pub fn parse(line: &[u8]) -> Option<Self> {
        let body = line.strip_suffix(LINE_TERMINATOR)?;
        match body {
            b"S G" => Some(ScopeCommand::BeginCapture),
            b"S B" => Some(ScopeCommand::RequestDump),
            [b'S', b' ', b'R', b' ', bits] => {
                Some(ScopeCommand::WriteRegister(ControlRegister::from_bits(*bits)))
            }
            [b'S', b' ', b'T', b' ', high, b' ', low] => {
                Some(ScopeCommand::SetTriggerLevel(TriggerCode::from_bytes(*high, *low)))
            }
            [b'S', b' ', b'P', b' ', letter] => {
                let (channel, gain) = match letter {
                    b'A' => (Channel::A, PreampGain::High),
                    b'a' => (Channel::A, PreampGain::Low),
                    b'B' => (Channel::B, PreampGain::High),
                    b'b' => (Channel::B, PreampGain::Low),
                    _ => return None,
                };
                Some(ScopeCommand::SetPreamp { channel, gain })
            }
            _ => None,
        }
    }

    /// Length of a command given its first four bytes, if they form a known prefix
    pub fn encoded_len(prefix: &[u8]) -> Option<usize> {
        match prefix.get(..3)? {
            b"S G" | b"S B" => Some(5),
            b"S R" | b"S P" => Some(7),
            b"S T" => Some(9),
            _ => None,
        }
    }
}

fn preamp_letter(channel: Channel, gain: PreampGain) -> u8 {
    match (channel, gain) {
        (Channel::A, PreampGain::High) => b'A',
        (Channel::A, PreampGain::Low) => b'a',
        (Channel::B, PreampGain::High) => b'B',
        (Channel::B, PreampGain::Low) => b'b',
    }
}

/// Extract the end address from a ready frame
///
/// An address that does not point at a record slot is rejected like a wrong
/// tag, so a stray `'A'` byte cannot pass as a frame.
pub fn parse_ready(frame: &[u8]) -> std::result::Result<u16, ProtocolError> {
    match frame {
        [READY_TAG, high, low] => {
            let end_address = u16::from_be_bytes([*high, *low]);
            check_end_address(end_address).map_err(|_| ProtocolError::new(READY_TAG, frame))?;
            Ok(end_address)
        }
        _ => Err(ProtocolError::new(READY_TAG, frame)),
    }
}

/// Check that an end address names a record slot
pub fn check_end_address(end_address: u16) -> std::result::Result<(), ProtocolError> {
    if end_address <= MAX_END_ADDRESS && end_address % 4 == 0 {
        Ok(())
    } else {
        Err(ProtocolError::new(READY_TAG, encode_ready(end_address).to_vec()))
    }
}

/// Build a ready frame; used by the scope simulator
pub fn encode_ready(end_address: u16) -> [u8; READY_FRAME_LEN] {
    let [high, low] = end_address.to_be_bytes();
    [READY_TAG, high, low]
}

/// Check the tag byte that precedes a dump payload
pub fn check_dump_tag(tag: u8) -> std::result::Result<(), ProtocolError> {
    if tag == DUMP_TAG {
        Ok(())
    } else {
        Err(ProtocolError::new(DUMP_TAG, vec![tag]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_commands() {
        assert_eq!(ScopeCommand::BeginCapture.encode(), b"S G\r\n");
        assert_eq!(ScopeCommand::RequestDump.encode(), b"S B\r\n");
    }

    #[test]
    fn test_preamp_commands() {
        let high_a = ScopeCommand::SetPreamp {
            channel: Channel::A,
            gain: PreampGain::High,
        };
        let low_b = ScopeCommand::SetPreamp {
            channel: Channel::B,
            gain: PreampGain::Low,
        };
        assert_eq!(high_a.encode(), b"S P A\r\n");
        assert_eq!(low_b.encode(), b"S P b\r\n");
    }

    #[test]
    fn test_register_bits() {
        let reg = ControlRegister::encode(7, TriggerSource::A, TriggerEdge::Falling).unwrap();
        assert_eq!(reg.bits(), 0x07);

        let reg = ControlRegister::encode(3, TriggerSource::B, TriggerEdge::Rising).unwrap();
        assert_eq!(reg.bits(), 0x03 | 0x10 | 0x20);

        let reg = ControlRegister::encode(15, TriggerSource::External, TriggerEdge::Falling)
            .unwrap();
        assert_eq!(reg.bits(), 0x0F | 0x40);
        assert_eq!(reg.trigger_source(), TriggerSource::External);
        assert_eq!(reg.sample_rate_divisor(), 15);
    }

    #[test]
    fn test_register_encoding_is_idempotent() {
        let first = ControlRegister::encode(9, TriggerSource::B, TriggerEdge::Rising).unwrap();
        let second = ControlRegister::encode(9, TriggerSource::B, TriggerEdge::Rising).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            ScopeCommand::WriteRegister(first).encode(),
            ScopeCommand::WriteRegister(second).encode()
        );
    }

    #[test]
    fn test_register_rejects_wide_divisor() {
        let err = ControlRegister::encode(16, TriggerSource::A, TriggerEdge::Rising).unwrap_err();
        assert!(matches!(err, ScopeError::InvalidSetting(_)));
    }

    #[test]
    fn test_register_command_is_raw_byte() {
        let reg = ControlRegister::encode(7, TriggerSource::A, TriggerEdge::Rising).unwrap();
        assert_eq!(ScopeCommand::WriteRegister(reg).encode(), b"S R \x27\r\n");
    }

    #[test]
    fn test_trigger_code_conversion() {
        assert_eq!(TriggerCode::from_volts(0.0, 0.01, 1.0).value(), 511);
        assert_eq!(TriggerCode::from_volts(1.0, 0.01, 1.0).value(), 411);
        assert_eq!(TriggerCode::from_volts(-1.0, 0.01, 1.0).value(), 611);
        // Saturates instead of wrapping
        assert_eq!(TriggerCode::from_volts(100.0, 0.01, 1.0).value(), 0);
        assert_eq!(TriggerCode::from_volts(-100.0, 0.01, 1.0).value(), 1023);

        let code = TriggerCode::from_volts(-2.0, 0.01, 1.0);
        assert_eq!(code.value(), 711);
        assert_eq!(code.bytes(), (0x02, 0xC7));
        assert_eq!(
            ScopeCommand::SetTriggerLevel(code).encode(),
            b"S T \x02 \xC7\r\n"
        );
        assert!((code.to_volts(0.01, 1.0) + 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_command_parse_round_trip_for_simulator() {
        let commands = [
            ScopeCommand::BeginCapture,
            ScopeCommand::RequestDump,
            ScopeCommand::WriteRegister(ControlRegister::from_bits(0x2D)),
            ScopeCommand::SetTriggerLevel(TriggerCode::from_bytes(0x01, 0xFF)),
            ScopeCommand::SetPreamp {
                channel: Channel::B,
                gain: PreampGain::High,
            },
        ];
        for command in commands {
            let encoded = command.encode();
            assert_eq!(ScopeCommand::encoded_len(&encoded), Some(encoded.len()));
            assert_eq!(ScopeCommand::parse(&encoded), Some(command));
        }
        assert_eq!(ScopeCommand::parse(b"S X\r\n"), None);
    }

    #[test]
    fn test_ready_frame() {
        assert_eq!(parse_ready(b"A\x00\x04"), Ok(4));
        assert_eq!(parse_ready(&encode_ready(4092)), Ok(4092));

        let err = parse_ready(b"Z\x00\x04").unwrap_err();
        assert_eq!(err.expected, b'A');
        assert_eq!(err.raw, b"Z\x00\x04");
    }

    #[test]
    fn test_ready_frame_rejects_addresses_outside_memory() {
        assert_eq!(parse_ready(b"A\x00\x00"), Ok(0));
        assert_eq!(parse_ready(b"A\x0F\xFC"), Ok(MAX_END_ADDRESS));

        // Past the last slot, or not on a record boundary
        for frame in [&b"A\xFF\xFF"[..], b"A\x10\x00", b"A\x0F\xFE", b"A\x00\x02"] {
            let err = parse_ready(frame).unwrap_err();
            assert_eq!(err.expected, READY_TAG);
            assert_eq!(err.raw, frame);
        }
    }

    #[test]
    fn test_dump_tag() {
        assert!(check_dump_tag(b'D').is_ok());
        let err = check_dump_tag(b'A').unwrap_err();
        assert_eq!(err.expected, b'D');
        assert_eq!(err.raw, vec![b'A']);
    }
}
