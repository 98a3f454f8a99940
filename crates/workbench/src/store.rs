//! Session store
//!
//! The single shared mutable resource of a workbench: the file table, action
//! history, sandbox status, server URL, terminal attachment and build-error
//! log. Every mutation goes through a method here, under one lock that is
//! never held across an `.await`. Changes are reported to the configured
//! [`EventSink`] after the lock is released.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use action_parser::Action;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::classifier::BuildError;
use crate::events::{EventSink, NullEventSink, WorkbenchEvent};
use crate::terminal::{TerminalSink, TerminalSize};

/// Relative path to latest content; the authoritative project snapshot
pub type FileTable = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    #[default]
    Unbooted,
    Booting,
    Ready,
}

/// What happened when an action was dispatched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ActionOutcome {
    /// File table updated (and sandbox write queued when ready)
    Applied,
    /// Long-running process left in the foreground
    Running { pid: u32 },
    /// Short-running process finished
    Exited { code: Option<i32> },
    /// Nothing to run against
    Skipped { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub action: Action,
    pub outcome: ActionOutcome,
    pub generation: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Serializable copy of the store contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub generation: u64,
    pub status: SandboxStatus,
    pub server_url: Option<String>,
    pub files: FileTable,
    pub actions: Vec<ActionRecord>,
    pub build_errors: Vec<BuildError>,
}

#[derive(Default)]
struct StoreState {
    files: FileTable,
    actions: Vec<ActionRecord>,
    status: SandboxStatus,
    server_url: Option<String>,
    terminal: Option<Weak<dyn TerminalSink>>,
    build_errors: Vec<BuildError>,
    generation: u64,
}

pub struct SessionStore {
    state: RwLock<StoreState>,
    events: Arc<dyn EventSink>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_events(Arc::new(NullEventSink))
    }

    pub fn with_events(events: Arc<dyn EventSink>) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            events,
        }
    }

    fn emit(&self, event: WorkbenchEvent) {
        if let Err(e) = self.events.send(event) {
            log::debug!("Dropped workbench event: {}", e);
        }
    }

    /// Current generation; bumped by every reset
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    // ------------------------------------------------------------------
    // File table
    // ------------------------------------------------------------------

    /// Create or replace a file table entry
    pub fn upsert_file(&self, path: &str, content: &str) {
        self.state
            .write()
            .files
            .insert(path.to_string(), content.to_string());
        self.emit(WorkbenchEvent::FileWritten {
            path: path.to_string(),
        });
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state.read().files.get(path).cloned()
    }

    pub fn files(&self) -> FileTable {
        self.state.read().files.clone()
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.state.read().files.keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Action history
    // ------------------------------------------------------------------

    /// Append to the action history, returning the entry's index
    pub fn record_action(&self, action: Action, outcome: ActionOutcome) -> usize {
        let kind = action.kind();
        let index = {
            let mut state = self.state.write();
            let generation = state.generation;
            state.actions.push(ActionRecord {
                action,
                outcome,
                generation,
                recorded_at: Utc::now(),
            });
            state.actions.len() - 1
        };
        self.emit(WorkbenchEvent::ActionRecorded { index, kind });
        index
    }

    pub fn actions(&self) -> Vec<ActionRecord> {
        self.state.read().actions.clone()
    }

    // ------------------------------------------------------------------
    // Sandbox status and server URL
    // ------------------------------------------------------------------

    pub fn status(&self) -> SandboxStatus {
        self.state.read().status
    }

    pub fn set_status(&self, status: SandboxStatus) {
        let changed = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.status, status) != status
        };
        if changed {
            log::debug!("Sandbox status: {:?}", status);
            self.emit(WorkbenchEvent::StatusChanged { status });
        }
    }

    pub fn server_url(&self) -> Option<String> {
        self.state.read().server_url.clone()
    }

    pub fn set_server_url(&self, url: &str) {
        self.state.write().server_url = Some(url.to_string());
        self.emit(WorkbenchEvent::ServerReady {
            url: url.to_string(),
        });
    }

    pub fn clear_server_url(&self) {
        self.state.write().server_url = None;
    }

    // ------------------------------------------------------------------
    // Terminal attachment
    // ------------------------------------------------------------------

    /// Route output to `terminal`. Only a weak reference is kept.
    pub fn attach_terminal(&self, terminal: &Arc<dyn TerminalSink>) {
        self.state.write().terminal = Some(Arc::downgrade(terminal));
    }

    pub fn detach_terminal(&self) {
        self.state.write().terminal = None;
    }

    /// The attached terminal, if it is still alive
    pub fn terminal(&self) -> Option<Arc<dyn TerminalSink>> {
        self.state.read().terminal.as_ref().and_then(Weak::upgrade)
    }

    /// Weak handle for output pumps that outlive this call
    pub fn terminal_weak(&self) -> Option<Weak<dyn TerminalSink>> {
        self.state.read().terminal.clone()
    }

    pub fn terminal_size(&self) -> Option<TerminalSize> {
        self.terminal().map(|terminal| terminal.size())
    }

    // ------------------------------------------------------------------
    // Build-error log
    // ------------------------------------------------------------------

    pub fn push_build_error(&self, error: BuildError) {
        let event = WorkbenchEvent::BuildErrorDetected {
            rule: error.rule.clone(),
            message: error.message.clone(),
        };
        self.state.write().build_errors.push(error);
        self.emit(event);
    }

    pub fn build_errors(&self) -> Vec<BuildError> {
        self.state.read().build_errors.clone()
    }

    // ------------------------------------------------------------------
    // Reset and snapshot
    // ------------------------------------------------------------------

    /// Wipe the file table, action history, build-error log and server URL,
    /// and start a new generation.
    ///
    /// Returns the new generation and the paths that were tracked, so the
    /// caller can remove them from the sandbox.
    pub fn reset_for_new_generation(&self) -> (u64, Vec<String>) {
        self.wipe(true)
    }

    /// Empty the file table, history and error log for a freshly booted
    /// sandbox. The generation counter is unchanged.
    pub fn reset_for_boot(&self) -> Vec<String> {
        self.wipe(false).1
    }

    fn wipe(&self, next_generation: bool) -> (u64, Vec<String>) {
        let (generation, removed) = {
            let mut state = self.state.write();
            let files = std::mem::take(&mut state.files);
            state.actions.clear();
            state.build_errors.clear();
            state.server_url = None;
            if next_generation {
                state.generation += 1;
            }
            (state.generation, files.into_keys().collect::<Vec<_>>())
        };
        self.emit(WorkbenchEvent::SessionCleared { generation });
        (generation, removed)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read();
        SessionSnapshot {
            generation: state.generation,
            status: state.status,
            server_url: state.server_url.clone(),
            files: state.files.clone(),
            actions: state.actions.clone(),
            build_errors: state.build_errors.clone(),
        }
    }
}
