//! Simulator construction helpers

use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::Duration;
use tekscope_rs::backend::{MemorySource, SimulatedPanel, SimulatedScope};
use tekscope_rs::fanout::{ChannelSubscriber, FanoutRegistry};

/// Scope returning `memory` with `end_address` on every capture
pub fn fixed_scope(memory: Vec<u8>, end_address: u16) -> SimulatedScope {
    SimulatedScope::new(Some(Duration::from_millis(20))).with_source(MemorySource::Fixed {
        memory,
        end_address,
    })
}

/// Panel with no pending events
pub fn quiet_panel() -> SimulatedPanel {
    SimulatedPanel::new(Duration::from_millis(20))
}

/// Register an in-memory subscriber and return its queue
pub fn subscribe(registry: &FanoutRegistry, name: &str) -> Receiver<Vec<u8>> {
    let (subscriber, queue) = ChannelSubscriber::pair(name);
    registry.subscribe(Arc::new(subscriber));
    queue
}

/// Parse a received line as JSON
pub fn parse_line(line: &[u8]) -> serde_json::Value {
    assert_eq!(line.last(), Some(&b'\n'), "record must end with a newline");
    serde_json::from_slice(line).expect("record is valid JSON")
}
