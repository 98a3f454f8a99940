//! Terminal output sink
//!
//! The workbench never owns the terminal. Front ends implement
//! [`TerminalSink`] and attach it to the session store, which keeps only a
//! weak reference; output written after the terminal has been dropped is
//! discarded.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::constants::terminal::{DEFAULT_COLS, DEFAULT_ROWS, RESET_SEQUENCE};

/// Terminal geometry in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(DEFAULT_COLS, DEFAULT_ROWS)
    }
}

/// Destination for process output
pub trait TerminalSink: Send + Sync {
    /// Write raw bytes (ANSI sequences included) to the terminal
    fn write(&self, data: &[u8]);

    /// Current terminal geometry
    fn size(&self) -> TerminalSize;

    /// Reset the terminal to a blank screen
    fn reset(&self) {
        self.write(RESET_SEQUENCE);
    }
}

/// Terminal that records everything written to it
#[derive(Debug, Default)]
pub struct VecTerminal {
    output: Mutex<Vec<u8>>,
    size: TerminalSize,
}

impl VecTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(size: TerminalSize) -> Self {
        Self {
            output: Mutex::new(Vec::new()),
            size,
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.output.lock().clone()
    }

    /// Output decoded lossily as UTF-8
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.output.lock()).into_owned()
    }
}

impl TerminalSink for VecTerminal {
    fn write(&self, data: &[u8]) {
        self.output.lock().extend_from_slice(data);
    }

    fn size(&self) -> TerminalSize {
        self.size
    }
}
