//! Sandbox capability abstraction
//!
//! The workbench never implements a sandbox itself. It drives one through
//! [`SandboxRuntime`] (boot) and [`SandboxEnvironment`] (filesystem and
//! processes), so the same orchestration runs against:
//! - [`memory::MemorySandboxRuntime`], a virtual filesystem with scripted
//!   processes, for tests and dry runs
//! - `local::LocalSandboxRuntime` (feature `local-runtime`), a host directory
//!   driven with `tokio::process`
//!
//! # Example
//!
//! ```rust,ignore
//! use workbench::sandbox::{BootOptions, ProcessEvent, SandboxRuntime, SpawnOptions};
//!
//! let booted = runtime.boot(&BootOptions::default()).await?;
//! let (mut rx, handle) = booted
//!     .environment
//!     .spawn("sh", &["-c", "npm install"], SpawnOptions::default())
//!     .await?;
//!
//! while let Some(event) = rx.recv().await {
//!     match event {
//!         ProcessEvent::Output(data) => print!("{}", String::from_utf8_lossy(&data)),
//!         ProcessEvent::Exited(code) => break,
//!         _ => {}
//!     }
//! }
//! ```

pub mod memory;

#[cfg(feature = "local-runtime")]
pub mod local;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::constants::sandbox::WORKDIR_NAME;
use crate::terminal::TerminalSize;

/// Sandbox errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandboxError {
    #[error("Boot failed: {0}")]
    Boot(String),

    #[error("Filesystem operation on '{path}' failed: {message}")]
    Filesystem { path: String, message: String },

    #[error("Path escapes the sandbox: {0}")]
    PathNotAllowed(String),

    #[error("Failed to spawn '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("Sandbox environment has been torn down")]
    TornDown,
}

/// Output event from a sandboxed process
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// Combined terminal output
    Output(Vec<u8>),
    /// Process error after spawning (e.g., broken pipe)
    Error(String),
    /// Process exited with optional exit code (`None` when killed)
    Exited(Option<i32>),
}

/// Options for spawning a process
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpawnOptions {
    pub terminal: TerminalSize,
}

/// Options for removing a path
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RemoveOptions {
    /// Ignore a missing path
    pub force: bool,
    /// Remove directories with their contents
    pub recursive: bool,
}

/// A dev server inside the sandbox became reachable
#[derive(Debug, Clone, PartialEq)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}

/// Handle to a spawned process
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID
    fn pid(&self) -> u32;
    /// Write to the process input
    fn write_input(&self, data: &[u8]) -> Result<(), String>;
    /// Resize the process terminal
    fn resize(&self, size: TerminalSize) -> Result<(), String>;
    /// Kill the process
    fn kill(&self) -> Result<(), String>;
}

/// Event receiver plus control handle for a spawned process
pub type SpawnedProcess = (mpsc::Receiver<ProcessEvent>, Box<dyn ProcessHandle>);

/// Filesystem and process capabilities of a booted sandbox
///
/// Paths are relative to the sandbox work directory.
#[async_trait]
pub trait SandboxEnvironment: Send + Sync {
    /// Spawn a process
    ///
    /// # Arguments
    /// * `program` - Program to run (e.g., "sh")
    /// * `args` - Command line arguments
    /// * `options` - Terminal geometry for the process
    async fn spawn(
        &self,
        program: &str,
        args: &[&str],
        options: SpawnOptions,
    ) -> Result<SpawnedProcess, SandboxError>;

    /// Create a directory. With `recursive`, succeeds if it already exists.
    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SandboxError>;

    /// Create or replace a file
    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;

    /// Remove a file or directory
    async fn remove(&self, path: &str, options: RemoveOptions) -> Result<(), SandboxError>;

    /// Release the environment. Later calls fail with [`SandboxError::TornDown`].
    async fn shutdown(&self) -> Result<(), SandboxError>;
}

/// Options for booting a sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct BootOptions {
    pub workdir_name: String,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            workdir_name: WORKDIR_NAME.to_string(),
        }
    }
}

/// A freshly booted environment and its "server ready" notifications
pub struct BootedSandbox {
    pub environment: Arc<dyn SandboxEnvironment>,
    pub server_ready: mpsc::UnboundedReceiver<ServerReady>,
}

/// Factory for sandbox environments
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Runtime name for logs
    fn name(&self) -> &'static str;

    /// Boot a new environment
    async fn boot(&self, options: &BootOptions) -> Result<BootedSandbox, SandboxError>;
}

/// Validate a sandbox-relative path: non-empty, relative, no `..` segments
pub(crate) fn check_relative_path(path: &str) -> Result<(), SandboxError> {
    if !action_parser::is_relative_path(path) {
        return Err(SandboxError::PathNotAllowed(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_check() {
        assert!(check_relative_path("src/App.jsx").is_ok());
        assert!(check_relative_path("./index.html").is_ok());
        assert!(check_relative_path("/etc/passwd").is_err());
        assert!(check_relative_path("src/../../x").is_err());
        assert!(check_relative_path("").is_err());
    }
}
