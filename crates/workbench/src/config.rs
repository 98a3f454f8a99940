//! Workbench configuration storage
//!
//! Persistent settings for the sandbox, command classification, build-error
//! detection, generation requests and export.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::constants::{export, generation, paths, sandbox, terminal};
use crate::provider::ApplicationFramework;
use crate::terminal::TerminalSize;

/// Sandbox boot and process settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxConfig {
    /// Work directory name requested when booting the sandbox
    #[serde(default = "default_workdir_name")]
    pub workdir_name: String,
    /// Shell program used for commands and the interactive session
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Terminal size used when no terminal is attached
    #[serde(default)]
    pub default_terminal: TerminalSize,
}

fn default_workdir_name() -> String {
    sandbox::WORKDIR_NAME.to_string()
}

fn default_shell() -> String {
    sandbox::SHELL.to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workdir_name: default_workdir_name(),
            shell: default_shell(),
            default_terminal: TerminalSize::new(terminal::DEFAULT_COLS, terminal::DEFAULT_ROWS),
        }
    }
}

/// Command classification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandConfig {
    /// A command containing any of these substrings is kept running in the
    /// foreground instead of being awaited
    #[serde(default = "default_long_running_markers")]
    pub long_running_markers: Vec<String>,
}

fn default_long_running_markers() -> Vec<String> {
    sandbox::LONG_RUNNING_MARKERS
        .iter()
        .map(|marker| marker.to_string())
        .collect()
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            long_running_markers: default_long_running_markers(),
        }
    }
}

impl CommandConfig {
    pub fn is_long_running(&self, command: &str) -> bool {
        self.long_running_markers
            .iter()
            .any(|marker| command.contains(marker.as_str()))
    }
}

/// Build-error detection
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DetectionConfig {
    /// Extra case-insensitive regular expressions checked after the built-in
    /// signatures
    #[serde(default)]
    pub extra_error_patterns: Vec<String>,
}

/// Model request defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    #[serde(default)]
    pub framework: ApplicationFramework,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Send the source image along with the generated prompt
    #[serde(default)]
    pub code_with_image: bool,
}

fn default_temperature() -> f32 {
    generation::TEMPERATURE
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            framework: ApplicationFramework::default(),
            temperature: default_temperature(),
            code_with_image: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportConfig {
    #[serde(default = "default_archive_name")]
    pub archive_name: String,
}

fn default_archive_name() -> String {
    export::ARCHIVE_NAME.to_string()
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            archive_name: default_archive_name(),
        }
    }
}

/// Full workbench configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct WorkbenchConfig {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

impl WorkbenchConfig {
    /// Default location: `<config dir>/pixelforge/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(paths::APP_DIR).join(paths::CONFIG_FILE))
    }

    /// Load configuration from disk, falling back to defaults when the file
    /// does not exist
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if !fs::try_exists(path).await.map_err(ConfigError::Io)? {
            log::debug!("No configuration at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).await.map_err(ConfigError::Io)?;

        serde_json::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save configuration to disk
    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(ConfigError::Io)?;
        }

        let contents = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        fs::write(path, contents).await.map_err(ConfigError::Io)?;

        log::info!("Configuration saved to {:?}", path);
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(serde_json::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(serde_json::Error),
}
