//! Workbench errors

use thiserror::Error;

use crate::export::ExportError;
use crate::generation::GenerationError;
use crate::provider::ProviderError;
use crate::sandbox::SandboxError;

/// Errors from the sandbox session lifecycle
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Sandbox boot failed: {0}")]
    BootFailed(#[source] SandboxError),

    #[error("Sandbox is not ready")]
    NotReady,

    #[error("No interactive shell is running")]
    NoShell,

    #[error("Process I/O failed: {0}")]
    Process(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Top-level error for [`Workbench`](crate::Workbench) operations
#[derive(Debug, Error)]
pub enum WorkbenchError {
    #[error("Invalid build-error pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Export(#[from] ExportError),
}
