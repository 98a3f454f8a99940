//! Structured actions carried inside model output

use serde::{Deserialize, Serialize};

/// Kind of an action block, taken from its `type` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    File,
    Shell,
}

impl ActionKind {
    /// Map a `type` attribute value to a kind. Values are case-sensitive.
    pub fn from_type_attr(value: &str) -> Option<Self> {
        match value {
            "file" => Some(Self::File),
            "shell" => Some(Self::Shell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Shell => "shell",
        }
    }
}

/// One instruction extracted from a model response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Action {
    /// Replace the content of `file_path` (relative to the project root)
    #[serde(rename = "file", rename_all = "camelCase")]
    FileWrite { file_path: String, content: String },

    /// Run `command` through the sandbox shell
    #[serde(rename = "shell")]
    ShellCommand { command: String },
}

impl Action {
    pub fn file(file_path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::FileWrite {
            file_path: file_path.into(),
            content: content.into(),
        }
    }

    pub fn shell(command: impl Into<String>) -> Self {
        Self::ShellCommand {
            command: command.into(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Self::FileWrite { .. } => ActionKind::File,
            Self::ShellCommand { .. } => ActionKind::Shell,
        }
    }

    /// Short single-line description for logs
    pub fn summary(&self) -> String {
        match self {
            Self::FileWrite { file_path, content } => {
                format!("file {} ({} bytes)", file_path, content.len())
            }
            Self::ShellCommand { command } => format!("shell `{}`", command),
        }
    }
}
/// True for a non-empty path that stays inside the project root: not
/// absolute and without `..` segments.
pub fn is_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.starts_with('\\')
        && !path.split(['/', '\\']).any(|segment| segment == "..")
}
