//! Core data types shared between the acquisition, control and fan-out paths
//!
//! This module defines the values that flow through the service:
//!
//! - [`Channel`], [`PreampGain`], [`TriggerSource`], [`TriggerEdge`] - scope settings
//! - [`Sample`] - one decoded capture (1024 calibrated values per channel)
//! - [`Record`] - the newline-delimited JSON shapes pushed to subscribers

use crate::error::{Result, ScopeError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of records in one scope memory dump
pub const SAMPLES_PER_CAPTURE: usize = 1024;

/// Analog input channel of the scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    A,
    B,
}

impl Channel {
    /// Letter used on the wire and in record field names
    pub fn letter(&self) -> char {
        match self {
            Channel::A => 'A',
            Channel::B => 'B',
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Preamp setting of one channel
///
/// High gain gives finer resolution (smaller voltage per count).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreampGain {
    #[default]
    High,
    Low,
}

/// Source the scope triggers on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    #[default]
    A,
    B,
    External,
}

impl TriggerSource {
    /// Analog channel whose calibration applies to the trigger level
    ///
    /// The external input has no preamp of its own, it shares channel A's.
    pub fn calibration_channel(&self) -> Channel {
        match self {
            TriggerSource::B => Channel::B,
            TriggerSource::A | TriggerSource::External => Channel::A,
        }
    }
}

impl From<Channel> for TriggerSource {
    fn from(channel: Channel) -> Self {
        match channel {
            Channel::A => TriggerSource::A,
            Channel::B => TriggerSource::B,
        }
    }
}

/// Edge of the trigger signal that starts a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEdge {
    #[default]
    Rising,
    Falling,
}

/// One completed capture, oldest value first
///
/// Immutable once produced; serializes as `{"A": [...], "B": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    #[serde(rename = "A")]
    channel_a: Vec<f64>,
    #[serde(rename = "B")]
    channel_b: Vec<f64>,
}

impl Sample {
    pub(crate) fn new(channel_a: Vec<f64>, channel_b: Vec<f64>) -> Self {
        Self {
            channel_a,
            channel_b,
        }
    }

    /// Voltages of one channel in chronological order
    pub fn channel(&self, channel: Channel) -> &[f64] {
        match channel {
            Channel::A => &self.channel_a,
            Channel::B => &self.channel_b,
        }
    }

    /// Number of values per channel
    pub fn len(&self) -> usize {
        self.channel_a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel_a.is_empty()
    }
}

/// Value carried by a UI parameter echo
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EchoValue {
    Integer(i64),
    Number(f64),
    Flag(bool),
}

/// Record published to every subscriber
///
/// Neither shape carries a sequence number or schema version.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// A full capture
    Sample(Sample),
    /// A single UI parameter change: `{"<name>": <value>}`
    Echo { name: String, value: EchoValue },
}

impl Record {
    pub fn echo(name: impl Into<String>, value: EchoValue) -> Self {
        Record::Echo {
            name: name.into(),
            value,
        }
    }

    /// Serialize as one newline-terminated JSON line
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut line = match self {
            Record::Sample(sample) => serde_json::to_vec(sample)?,
            Record::Echo { name, value } => {
                let mut map = serde_json::Map::with_capacity(1);
                map.insert(name.clone(), serde_json::to_value(value)?);
                serde_json::to_vec(&map)?
            }
        };
        if line.contains(&b'\n') {
            return Err(ScopeError::Serialization(
                "record serialized across multiple lines".to_string(),
            ));
        }
        line.push(b'\n');
        Ok(line)
    }
}

impl From<Sample> for Record {
    fn from(sample: Sample) -> Self {
        Record::Sample(sample)
    }
}
