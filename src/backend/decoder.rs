//! Sample buffer reconstruction
//!
//! The scope's memory is a circular log of interleaved 4-byte records
//! `[A_hi, A_lo, B_hi, B_lo]`. The ready frame reports the address of the
//! most recently written record, so the oldest record starts right after it.
//! The end address must name a record slot; anything else would pair the bytes
//! of two neighbouring records and swap the channels.

use crate::backend::codec::{check_end_address, CODE_CENTER, CODE_MAX, DUMP_PAYLOAD_LEN};
use crate::config::Calibration;
use crate::config::capture::CaptureState;
use crate::error::{Result, ScopeError};
use crate::types::{Channel, Sample, SAMPLES_PER_CAPTURE};

/// Bytes per interleaved record
pub const RECORD_LEN: usize = 4;

/// Volts-per-count for both channels at decode time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSteps {
    pub a: f64,
    pub b: f64,
}

impl ChannelSteps {
    /// Steps for the preamp gains currently configured
    pub fn for_state(state: &CaptureState, calibration: &Calibration) -> Self {
        Self {
            a: calibration.step_size(state.preamp(Channel::A)),
            b: calibration.step_size(state.preamp(Channel::B)),
        }
    }

    pub fn uniform(step: f64) -> Self {
        Self { a: step, b: step }
    }
}

/// Decodes memory dumps into calibrated samples
#[derive(Debug, Clone, Copy)]
pub struct SampleDecoder {
    steps: ChannelSteps,
    scale: f64,
}

impl SampleDecoder {
    /// Create a decoder rounding to `decimals` digits
    pub fn new(steps: ChannelSteps, decimals: u32) -> Self {
        Self {
            steps,
            scale: 10f64.powi(decimals as i32),
        }
    }

    /// Reconstruct both channels in chronological order
    pub fn decode(&self, payload: &[u8], end_address: u16) -> Result<Sample> {
        if payload.len() != DUMP_PAYLOAD_LEN {
            return Err(ScopeError::InvalidBufferSize {
                expected: DUMP_PAYLOAD_LEN,
                actual: payload.len(),
            });
        }
        check_end_address(end_address)?;

        let start = end_address as usize + RECORD_LEN;
        let mut channel_a = Vec::with_capacity(SAMPLES_PER_CAPTURE);
        let mut channel_b = Vec::with_capacity(SAMPLES_PER_CAPTURE);

        for i in 0..SAMPLES_PER_CAPTURE {
            let idx = start + RECORD_LEN * i;
            let byte = |offset: usize| payload[(idx + offset) % DUMP_PAYLOAD_LEN];

            let a = raw_code(byte(0), byte(1));
            let b = raw_code(byte(2), byte(3));
            channel_a.push(self.to_volts(a, self.steps.a));
            channel_b.push(self.to_volts(b, self.steps.b));
        }

        Ok(Sample::new(channel_a, channel_b))
    }

    fn to_volts(&self, code: u16, step: f64) -> f64 {
        let volts = (CODE_CENTER - code as i32) as f64 * step;
        (volts * self.scale).round() / self.scale
    }
}

fn raw_code(high: u8, low: u8) -> u16 {
    u16::from_be_bytes([high, low]) & CODE_MAX
}

/// Decode with the calibration of the given capture state
pub fn decode_sample(
    payload: &[u8],
    end_address: u16,
    state: &CaptureState,
    calibration: &Calibration,
) -> Result<Sample> {
    SampleDecoder::new(ChannelSteps::for_state(state, calibration), calibration.decimals)
        .decode(payload, end_address)
}
