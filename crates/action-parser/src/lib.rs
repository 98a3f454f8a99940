//! Streaming action protocol parser
//!
//! Model responses interleave free-form commentary with embedded action blocks:
//!
//! ```text
//! <boltAction type="file" filePath="src/App.jsx">
//! ...file content...
//! </boltAction>
//!
//! <boltAction type="shell">
//! npm install
//! </boltAction>
//! ```
//!
//! The response arrives as arbitrarily sized fragments. [`ActionParser`] buffers
//! them and yields each [`Action`] as soon as its closing marker has been
//! received, keeping any partially received tail for the next fragment.
//!
//! # Example
//!
//! ```rust
//! use action_parser::{Action, ActionParser};
//!
//! let mut parser = ActionParser::new();
//! assert!(parser.feed("<boltAction type=\"file\" filePath=\"a.txt\">").is_empty());
//! assert!(parser.feed("hello").is_empty());
//!
//! let actions = parser.feed("</boltAction>");
//! assert_eq!(actions, vec![Action::file("a.txt", "hello")]);
//! ```

pub mod accumulator;
pub mod action;
pub mod scanner;

pub use accumulator::FragmentAccumulator;
pub use action::{is_relative_path, Action, ActionKind};
pub use scanner::{extract_all, ActionParser, CLOSE_MARKER, OPEN_MARKER};
