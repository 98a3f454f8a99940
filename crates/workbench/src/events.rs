//! Event types for reporting session changes
//!
//! Events are sent from the session store to a front end (or any consumer)
//! so file views, status indicators and error panels can refresh.

use action_parser::ActionKind;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::store::SandboxStatus;

/// Trait for sending workbench events
///
/// This abstracts over the transport mechanism (UI channel, mpsc, log, etc.).
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be sent (e.g., channel closed)
    fn send(&self, event: WorkbenchEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone, thiserror::Error)]
#[error("Event error: {message}")]
pub struct EventError {
    pub message: String,
}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Events emitted as the session changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkbenchEvent {
    /// Sandbox boot status changed
    #[serde(rename_all = "camelCase")]
    StatusChanged { status: SandboxStatus },

    /// A file table entry was created or replaced
    #[serde(rename_all = "camelCase")]
    FileWritten { path: String },

    /// An action was appended to the history
    #[serde(rename_all = "camelCase")]
    ActionRecorded { index: usize, kind: ActionKind },

    /// A dev server became reachable
    #[serde(rename_all = "camelCase")]
    ServerReady { url: String },

    /// Process output matched a failure signature
    #[serde(rename_all = "camelCase")]
    BuildErrorDetected { rule: String, message: String },

    /// Session state was wiped for a new generation
    #[serde(rename_all = "camelCase")]
    SessionCleared { generation: u64 },
}

/// A no-op event sink that discards all events
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: WorkbenchEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// An event sink that collects events into a vector (useful for testing)
#[derive(Default)]
pub struct VecEventSink {
    events: Mutex<Vec<WorkbenchEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WorkbenchEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: WorkbenchEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Forwards events into a tokio channel
pub struct ChannelEventSink {
    tx: tokio::sync::mpsc::UnboundedSender<WorkbenchEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<WorkbenchEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: WorkbenchEvent) -> Result<(), EventError> {
        self.tx.send(event).map_err(|_| EventError::channel_closed())
    }
}
