//! Stdout terminal and report printing

use std::io::Write;

use workbench::{FileTreeNode, NodeKind, TerminalSink, TerminalSize};

/// Terminal sink that writes process output straight to stdout
pub struct StdoutTerminal {
    size: TerminalSize,
}

impl StdoutTerminal {
    /// Size from `COLUMNS`/`LINES`, falling back to the default geometry
    pub fn from_env() -> Self {
        let dimension = |name: &str| std::env::var(name).ok().and_then(|v| v.parse().ok());
        let default = TerminalSize::default();
        Self {
            size: TerminalSize::new(
                dimension("COLUMNS").unwrap_or(default.cols),
                dimension("LINES").unwrap_or(default.rows),
            ),
        }
    }
}

impl TerminalSink for StdoutTerminal {
    fn write(&self, data: &[u8]) {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(data).and_then(|_| stdout.flush()) {
            log::debug!("Terminal write failed: {}", e);
        }
    }

    fn size(&self) -> TerminalSize {
        self.size
    }

    // Leave the user's scrollback alone
    fn reset(&self) {}
}

pub fn print_tree(nodes: &[FileTreeNode]) {
    fn walk(nodes: &[FileTreeNode], depth: usize) {
        for node in nodes {
            let suffix = if node.kind == NodeKind::Directory { "/" } else { "" };
            println!("{}{}{}", "  ".repeat(depth), node.name, suffix);
            walk(&node.children, depth + 1);
        }
    }
    walk(nodes, 0);
}
