// src/changes.rs
// Change-feed publisher: a broadcast stream of `EventBulk` values. One
// emission per committed `bulkWrite`/`bulkAddRevisions` transaction.

use serde_json::Value;
use uuid::Uuid;

use crate::{log_trace, log_warn};

/// The kind of change a `ChangeEvent` describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// One document's worth of change within a bulk.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub id: String,
    pub operation: Operation,
    /// The prior document state, or `None` for a fresh insert/resurrect.
    pub previous: Option<Value>,
    /// The new document state, or `None` for a delete.
    pub doc: Option<Value>,
    pub start_time: i64,
    pub end_time: i64,
}

/// A set of change events committed atomically by one write transaction.
#[derive(Debug, Clone)]
pub struct EventBulk {
    /// Random token identifying the bulk; replicators use it to dedupe.
    pub id: String,
    pub events: Vec<ChangeEvent>,
}

impl EventBulk {
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        EventBulk {
            id: Uuid::new_v4().to_string(),
            events,
        }
    }
}

/// Broadcast publisher for `EventBulk`s. Subscribers see every bulk
/// published after they subscribed; no backlog is retained for a new
/// subscriber.
pub struct ChangePublisher {
    sender: async_broadcast::Sender<std::sync::Arc<EventBulk>>,
    /// Kept alive so the channel isn't torn down when no reader is
    /// currently subscribed - mirrors how a database keeps its own
    /// internal listener so in-flight bulks are never dropped as "no
    /// receivers."
    _keepalive: async_broadcast::InactiveReceiver<std::sync::Arc<EventBulk>>,
}

impl ChangePublisher {
    pub fn new() -> Self {
        let (sender, receiver) = async_broadcast::broadcast(1024);
        ChangePublisher {
            sender,
            _keepalive: receiver.deactivate(),
        }
    }

    /// Subscribe to future bulks. The returned receiver sees nothing
    /// published before this call.
    pub fn subscribe(&self) -> async_broadcast::Receiver<std::sync::Arc<EventBulk>> {
        self.sender.new_receiver()
    }

    /// Publish a bulk. Non-blocking with respect to the caller's
    /// transaction: publication happens after commit, outside the
    /// transaction's critical section.
    pub fn publish(&self, bulk: EventBulk) {
        if bulk.events.is_empty() {
            log_trace!("suppressing empty EventBulk {}", bulk.id);
            return;
        }
        let bulk = std::sync::Arc::new(bulk);
        if let Err(err) = self.sender.try_broadcast(bulk) {
            log_warn!("change stream overflow or closed: {err}");
        }
    }

    /// Complete the stream - no further bulks will be published. Used by
    /// `close()`.
    pub fn close(&self) {
        self.sender.close();
    }
}

impl Default for ChangePublisher {
    fn default() -> Self {
        Self::new()
    }
}
