//! Pixelforge workbench
//!
//! Applies streamed model output to a live, rebuildable sandbox. Fragments of
//! a model response are fed through the `action-parser` crate; every
//! completed action is dispatched against the current sandbox session, and
//! process output is multiplexed to an attached terminal while being scanned
//! for build failures.
//!
//! ```text
//! fragments -> ActionParser -> ActionDispatcher -> { file table + sandbox FS,
//!                                                    sandbox process }
//!                                                        |
//!                                  OutputMultiplexer -> { terminal, error log }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use workbench::{sandbox::memory::MemorySandboxRuntime, Workbench, WorkbenchConfig};
//!
//! let workbench = Workbench::new(Arc::new(MemorySandboxRuntime::new()), WorkbenchConfig::default())?;
//! workbench.boot().await?;
//! let report = workbench.run_stream(response_stream).await?;
//! println!("{} actions applied", report.dispatched);
//! ```

pub mod classifier;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod export;
pub mod feedback;
pub mod generation;
pub mod output;
pub mod provider;
pub mod sandbox;
pub mod session;
pub mod store;
pub mod terminal;
mod workbench;

pub use action_parser::{Action, ActionKind, ActionParser};
pub use classifier::{BuildError, OutputClassifier, PatternRule, RuleClassifier, Severity};
pub use config::{ConfigError, WorkbenchConfig};
pub use dispatcher::{ActionDispatcher, FsWriteQueue};
pub use error::{SessionError, WorkbenchError};
pub use events::{EventSink, NullEventSink, VecEventSink, WorkbenchEvent};
pub use export::{ExportError, FileTreeNode, NodeKind};
pub use generation::{GenerationError, GenerationReport, GenerationRunner};
pub use output::OutputMultiplexer;
pub use provider::{
    ApplicationFramework, CodeModel, CodeRequest, FragmentStream, ImageData, PromptRequest,
    ProviderError,
};
pub use sandbox::{SandboxEnvironment, SandboxError, SandboxRuntime};
pub use session::SandboxSessionManager;
pub use store::{ActionOutcome, FileTable, SandboxStatus, SessionStore};
pub use terminal::{TerminalSink, TerminalSize, VecTerminal};
pub use workbench::Workbench;
