//! Workbench-wide constants
//!
//! Single source of truth for defaults used by the configuration layer and
//! the session manager.

/// Terminal geometry used when no terminal is attached
pub mod terminal {
    pub const DEFAULT_COLS: u16 = 80;
    pub const DEFAULT_ROWS: u16 = 50;
    /// Full terminal reset (RIS)
    pub const RESET_SEQUENCE: &[u8] = b"\x1bc";
}

/// Sandbox defaults
pub mod sandbox {
    /// Work directory name requested at boot
    pub const WORKDIR_NAME: &str = "projects";
    /// Shell used for both commands (`sh -c ...`) and the interactive session
    pub const SHELL: &str = "sh";
    /// Command substrings that mark a process as a long-lived dev server
    pub const LONG_RUNNING_MARKERS: &[&str] = &["npm run dev", "npm start"];
}

/// Defaults for model requests
pub mod generation {
    pub const TEMPERATURE: f32 = 0.2;
}

/// Export defaults
pub mod export {
    pub const ARCHIVE_NAME: &str = "project.zip";
}

/// Configuration file location
pub mod paths {
    /// Directory under the platform config dir
    pub const APP_DIR: &str = "pixelforge";
    pub const CONFIG_FILE: &str = "config.json";
}
