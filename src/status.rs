//! Observational status events
//!
//! Components report what they are doing to a [`StatusSink`]; nothing flows
//! back. A host renders the events (status dots, dashboards); the crate ships
//! a [`TracingSink`] and lets an unbounded channel sender act as a sink.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::connection::ConnectionEvent;

/// Connection or per-transaction status of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail")]
pub enum NodeStatus {
    /// Node created, waiting for the first connection event
    Initiating,
    Connecting,
    /// Link up; `rate` describes the default loop, if any
    Connected { rate: Option<String> },
    Disconnected,
    /// Read transaction in flight
    Polling,
    /// Last read succeeded, waiting for the next tick
    Waiting,
    Written,
    Error(String),
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initiating => f.write_str("Initiating"),
            Self::Connecting => f.write_str("Connecting"),
            Self::Connected { rate: Some(rate) } => write!(f, "Connected: Rate: {}", rate),
            Self::Connected { rate: None } => f.write_str("Connected"),
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Polling => f.write_str("Polling"),
            Self::Waiting => f.write_str("Waiting"),
            Self::Written => f.write_str("Successfully Written"),
            Self::Error(message) => write!(f, "Error: {}", message),
        }
    }
}

impl From<&ConnectionEvent> for NodeStatus {
    fn from(event: &ConnectionEvent) -> Self {
        match event {
            ConnectionEvent::Connected => Self::Connected { rate: None },
            ConnectionEvent::Disconnected(_) => Self::Disconnected,
            ConnectionEvent::TransportError(message) => Self::Error(message.clone()),
        }
    }
}

/// A status change of a named node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub node: String,
    pub status: NodeStatus,
    pub at: DateTime<Utc>,
}

/// Receiver of status events. Must not block.
pub trait StatusSink: Send + Sync {
    fn report(&self, event: StatusEvent);
}

/// Logs every status event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn report(&self, event: StatusEvent) {
        match &event.status {
            NodeStatus::Error(_) => warn!(node = %event.node, "{}", event.status),
            _ => info!(node = %event.node, "{}", event.status),
        }
    }
}

impl StatusSink for mpsc::UnboundedSender<StatusEvent> {
    fn report(&self, event: StatusEvent) {
        // Receiver gone means nobody renders status any more
        let _ = self.send(event);
    }
}

/// Binds a node name to a sink.
#[derive(Clone)]
pub(crate) struct StatusReporter {
    node: String,
    sink: Arc<dyn StatusSink>,
}

impl StatusReporter {
    pub(crate) fn new(node: impl Into<String>, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            node: node.into(),
            sink,
        }
    }

    pub(crate) fn report(&self, status: NodeStatus) {
        self.sink.report(StatusEvent {
            node: self.node.clone(),
            status,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_texts() {
        assert_eq!(
            NodeStatus::Connected {
                rate: Some("5 s".to_string())
            }
            .to_string(),
            "Connected: Rate: 5 s"
        );
        assert_eq!(NodeStatus::Written.to_string(), "Successfully Written");
        assert_eq!(
            NodeStatus::Error("timeout".to_string()).to_string(),
            "Error: timeout"
        );
    }

    #[test]
    fn test_channel_sink_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = StatusReporter::new("reader", Arc::new(tx));
        reporter.report(NodeStatus::Polling);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.node, "reader");
        assert_eq!(event.status, NodeStatus::Polling);
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        tx.report(StatusEvent {
            node: "n".to_string(),
            status: NodeStatus::Waiting,
            at: Utc::now(),
        });
    }

    #[test]
    fn test_from_connection_event() {
        assert_eq!(
            NodeStatus::from(&ConnectionEvent::Connected),
            NodeStatus::Connected { rate: None }
        );
        assert_eq!(
            NodeStatus::from(&ConnectionEvent::Disconnected("eof".to_string())),
            NodeStatus::Disconnected
        );
        assert_eq!(
            NodeStatus::from(&ConnectionEvent::TransportError("reset".to_string())),
            NodeStatus::Error("reset".to_string())
        );
    }

    #[test]
    fn test_serialize_shape() {
        let value = serde_json::to_value(NodeStatus::Error("x".to_string())).unwrap();
        assert_eq!(value, serde_json::json!({"status": "Error", "detail": "x"}));
    }
}
