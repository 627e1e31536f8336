//! Progress events delivered to the serving layer.
//!
//! The engine never talks to a socket directly; it pushes typed events into
//! an [`EventSink`] and the transport decides how to ship them. Delivery is
//! best-effort: a sink whose receiver is gone drops events silently.

use crate::tree::TreeSnapshot;
use serde::Serialize;
use tokio::sync::mpsc;

/// Outbound event emitted while exploration or generation runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Incremental tree update after an expansion completes.
    Update {
        /// Serialized subtree rooted at the explored node.
        tree: TreeSnapshot,
    },
    /// Final tree for a generation request.
    TreeResult {
        /// Request correlation id.
        request_id: String,
        /// Serialized result tree.
        tree: TreeSnapshot,
    },
    /// Model lifecycle status change.
    ModelStatus {
        /// Request correlation id.
        request_id: String,
        /// One of `unloaded`, `loading`, `loaded`, `error`, `critical_error`.
        status: String,
        /// Human-readable detail.
        message: String,
        /// Load progress percentage, when meaningful.
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
    },
    /// Fine-grained load progress.
    LoadingStatus {
        /// Request correlation id.
        request_id: String,
        /// Progress percentage.
        progress: u8,
        /// Human-readable detail.
        message: String,
    },
    /// Generation started/finished notices.
    GenerationStatus {
        /// Request correlation id.
        request_id: String,
        /// `started` or `finished`.
        status: String,
        /// Human-readable detail.
        message: String,
    },
}

/// Best-effort outbound channel for [`Event`]s.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl EventSink {
    /// Create a sink and the receiver that drains it.
    pub fn channel() -> (EventSink, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything.
    pub fn null() -> EventSink {
        EventSink { tx: None }
    }

    /// Send an event, ignoring a missing or closed receiver.
    pub fn send(&self, event: Event) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
