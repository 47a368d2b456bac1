//! Protocol violation policies
//!
//! When the scope sends a frame whose tag is not the one the acquisition loop
//! is waiting for, the loop asks its [`ViolationPolicy`] what to do. The
//! policy never touches the bytes; it only picks between dropping one byte and
//! reading again ([`ViolationAction::Resync`]) or ending the loop with the
//! error ([`ViolationAction::Abort`]).
//!
//! Any `FnMut(&ProtocolError) -> ViolationAction` closure is a policy, which
//! keeps tests and custom deployments free to swap behaviour in.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Decision for one protocol violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationAction {
    /// Discard the first unread byte and try the read again
    Resync,
    /// Stop acquisition with the protocol error
    Abort,
}

/// Decides how the acquisition loop reacts to an unexpected frame
pub trait ViolationPolicy: Send {
    fn on_violation(&mut self, error: &ProtocolError) -> ViolationAction;

    /// Called after a well-formed frame has been read
    fn reset(&mut self) {}
}

impl<F> ViolationPolicy for F
where
    F: FnMut(&ProtocolError) -> ViolationAction + Send,
{
    fn on_violation(&mut self, error: &ProtocolError) -> ViolationAction {
        self(error)
    }
}

/// Built-in policy selected from the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationPolicyKind {
    #[default]
    Resync,
    Abort,
}

impl ViolationPolicyKind {
    /// Build the policy; `limit` caps consecutive resyncs
    pub fn build(self, limit: Option<usize>) -> Box<dyn ViolationPolicy> {
        match self {
            ViolationPolicyKind::Resync => Box::new(ResyncPolicy::new(limit)),
            ViolationPolicyKind::Abort => Box::new(AbortPolicy),
        }
    }
}

/// Skip one byte and retry, optionally giving up after too many in a row
#[derive(Debug, Clone, Default)]
pub struct ResyncPolicy {
    limit: Option<usize>,
    consecutive: usize,
}

impl ResyncPolicy {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            consecutive: 0,
        }
    }
}

impl ViolationPolicy for ResyncPolicy {
    fn on_violation(&mut self, error: &ProtocolError) -> ViolationAction {
        self.consecutive += 1;
        match self.limit {
            Some(limit) if self.consecutive > limit => {
                tracing::error!(
                    "Giving up after {} consecutive protocol violations: {}",
                    self.consecutive - 1,
                    error
                );
                ViolationAction::Abort
            }
            _ => ViolationAction::Resync,
        }
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// Treat every violation as fatal
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortPolicy;

impl ViolationPolicy for AbortPolicy {
    fn on_violation(&mut self, _error: &ProtocolError) -> ViolationAction {
        ViolationAction::Abort
    }
}
