//! Error handling for the TekScope service
//!
//! This module defines the crate-wide error type and a Result alias for use
//! throughout the acquisition, control panel and fan-out components.
//!
//! # Taxonomy
//!
//! - [`ScopeError::Protocol`] - unexpected or malformed frame from the scope. Whether the
//!   reader resynchronizes or gives up is decided by a
//!   [`ViolationPolicy`](crate::backend::ViolationPolicy), never here.
//! - [`ScopeError::InvalidBufferSize`] - a memory dump of the wrong length.
//!   Always fatal; it means framing is broken upstream.
//! - [`ScopeError::UnknownControl`] / [`ScopeError::MalformedMessage`] - bad
//!   input from the control surface. Logged to the fault log, never fatal.
//! - [`ScopeError::DuplicateRegistration`] - setup-time only.

use std::fmt;
use thiserror::Error;

/// Raw frame that did not carry the tag the reader was waiting for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    /// Tag byte the reader expected (`b'A'` or `b'D'`)
    pub expected: u8,
    /// Bytes that were actually received
    pub raw: Vec<u8>,
}

impl ProtocolError {
    pub fn new(expected: u8, raw: impl Into<Vec<u8>>) -> Self {
        Self {
            expected,
            raw: raw.into(),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw.first() == Some(&self.expected) {
            write!(
                f,
                "malformed '{}' frame [{}]",
                self.expected as char,
                hex_bytes(&self.raw)
            )
        } else {
            write!(
                f,
                "expected frame tag '{}', received [{}]",
                self.expected as char,
                hex_bytes(&self.raw)
            )
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Which namespace of the control registry an identifier belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    Encoder,
    Switch,
    Led,
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlKind::Encoder => write!(f, "encoder"),
            ControlKind::Switch => write!(f, "switch"),
            ControlKind::Led => write!(f, "LED"),
        }
    }
}

/// Main error type for TekScope operations
#[derive(Error, Debug)]
pub enum ScopeError {
    /// Unexpected or malformed frame from the scope
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Memory dump with the wrong payload length
    #[error("Invalid buffer size: expected {expected} bytes, got {actual}")]
    InvalidBufferSize { expected: usize, actual: usize },

    /// Event for a control that was never registered
    #[error("Message received for unhandled {kind} {id}")]
    UnknownControl { kind: ControlKind, id: char },

    /// Control surface frame that matches no known shape
    #[error("Malformed control message [{}]", hex_bytes(.raw))]
    MalformedMessage { raw: Vec<u8> },

    /// Identifier registered twice in the same namespace
    #[error("{kind} {id} was already added to the control panel")]
    DuplicateRegistration { kind: ControlKind, id: char },

    /// Setting outside the range the device accepts
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    /// A lock was poisoned by a panicking thread
    #[error("Lock error: {0}")]
    Lock(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Errors opening or configuring a serial port
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<ScopeError>,
    },
}

impl ScopeError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        ScopeError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip any context wrappers and return the underlying error
    pub fn root(&self) -> &ScopeError {
        match self {
            ScopeError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Errors that end the loop that hit them
    ///
    /// A protocol error only reaches a caller once the violation policy chose
    /// to abort, so it counts as fatal here.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            ScopeError::Protocol(_)
                | ScopeError::InvalidBufferSize { .. }
                | ScopeError::DuplicateRegistration { .. }
                | ScopeError::Serial(_)
                | ScopeError::Io(_)
                | ScopeError::Lock(_)
        )
    }

    /// Faults from the control surface that must not stop the poll loop
    pub fn is_control_fault(&self) -> bool {
        matches!(
            self.root(),
            ScopeError::UnknownControl { .. } | ScopeError::MalformedMessage { .. }
        )
    }
}

impl From<serde_json::Error> for ScopeError {
    fn from(err: serde_json::Error) -> Self {
        ScopeError::Serialization(err.to_string())
    }
}

/// Result type alias for TekScope operations
pub type Result<T> = std::result::Result<T, ScopeError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<ScopeError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}

pub(crate) fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
