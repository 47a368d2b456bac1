//! Fan-out of records to live subscribers
//!
//! [`FanoutRegistry`] holds the set of connected subscribers and republishes
//! every record (decoded samples and control echoes) to all of them. It is
//! created once by the process entry point and shared by handle with both
//! polling loops and the network server; there is no global instance.
//!
//! # Delivery guarantees
//!
//! - A record is serialized once and the same line is handed to every
//!   subscriber.
//! - A subscriber whose delivery fails is removed; the others still receive
//!   the record and the error never reaches the publisher.
//! - `publish` holds a read lock for the whole delivery, so `subscribe` and
//!   `unsubscribe` wait for an in-flight publish to finish. A subscriber that
//!   joins during a publish misses that record. Once `unsubscribe` returns,
//!   nothing is delivered to that subscriber again.
//! - There is no flow control. [`ChannelSubscriber`] queues are unbounded, so
//!   a consumer that stops reading grows its queue without limit.

pub mod server;

pub use server::SubscriberServer;

use crate::error::{Result, ScopeError};
use crate::types::Record;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Handle returned by [`FanoutRegistry::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outbound side of one subscriber connection
#[cfg_attr(test, mockall::automock)]
pub trait Subscriber: Send + Sync {
    /// Hand over one newline-terminated record; must not block
    fn deliver(&self, line: &[u8]) -> Result<()>;

    fn describe(&self) -> String;
}

/// Outcome of one publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Subscribers removed because delivery failed
    pub dropped: Vec<SubscriberId>,
}

/// Thread-safe set of subscribers
pub struct FanoutRegistry {
    subscribers: RwLock<BTreeMap<SubscriberId, Arc<dyn Subscriber>>>,
    next_id: AtomicU64,
}

impl Default for FanoutRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FanoutRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = subscriber.describe();
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, subscriber);
        tracing::info!("Subscriber {} joined ({})", id, name);
        id
    }

    /// Remove a subscriber; returns false if it was already gone
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
        if let Some(subscriber) = &removed {
            tracing::info!("Subscriber {} left ({})", id, subscriber.describe());
        }
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize a record and deliver it to every subscriber
    pub fn publish(&self, record: &Record) -> Result<PublishReport> {
        let line = record.to_line()?;
        Ok(self.publish_line(&line))
    }

    /// Deliver an already serialized line to every subscriber
    pub fn publish_line(&self, line: &[u8]) -> PublishReport {
        let mut report = PublishReport::default();
        {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for (id, subscriber) in subscribers.iter() {
                match subscriber.deliver(line) {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        tracing::warn!("Dropping subscriber {} ({}): {}", id, subscriber.describe(), e);
                        report.dropped.push(*id);
                    }
                }
            }
        }

        for id in &report.dropped {
            self.unsubscribe(*id);
        }
        report
    }
}

impl fmt::Debug for FanoutRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutRegistry")
            .field("subscribers", &self.len())
            .finish()
    }
}

/// Subscriber backed by an unbounded crossbeam queue
pub struct ChannelSubscriber {
    name: String,
    tx: Sender<Vec<u8>>,
}

impl ChannelSubscriber {
    /// Create the subscriber and the receiving end of its queue
    pub fn pair(name: impl Into<String>) -> (Self, Receiver<Vec<u8>>) {
        let (tx, rx) = unbounded();
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }
}

impl Subscriber for ChannelSubscriber {
    fn deliver(&self, line: &[u8]) -> Result<()> {
        self.tx.send(line.to_vec()).map_err(|_| {
            ScopeError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("queue for {} is closed", self.name),
            ))
        })
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}
