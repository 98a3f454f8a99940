//! Incremental action block scanner
//!
//! The scanner is a three-state machine over the accumulated buffer: outside
//! any block, inside an opening tag, inside a block body. A cursor records
//! where scanning resumes, so commentary that has already been rejected is
//! never examined again when the next fragment arrives.
//!
//! Blocks are only surfaced once their closing marker is in the buffer. A
//! marker split across fragments, or an opening tag whose quoted attribute is
//! still open, is simply "not complete yet".

use crate::accumulator::FragmentAccumulator;
use crate::action::{is_relative_path, Action, ActionKind};

/// Opening marker of an action block
pub const OPEN_MARKER: &str = "<boltAction";
/// Closing marker of an action block
pub const CLOSE_MARKER: &str = "</boltAction>";

/// Parsed opening tag
#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockHeader {
    File { path: String },
    Shell,
    /// Recognised marker with unusable attributes; the block is consumed and dropped
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum ScanState {
    #[default]
    Outside,
    OpenTag {
        start: usize,
    },
    Body {
        header: BlockHeader,
        body_start: usize,
    },
}

/// Streaming extractor for action blocks.
///
/// Feed fragments with [`push`](Self::push) and drain completed actions with
/// [`next_action`](Self::next_action), which yields at most one action per
/// call. The consumed prefix (everything up to the end of the yielded block)
/// is removed from the buffer.
#[derive(Debug, Default)]
pub struct ActionParser {
    buffer: FragmentAccumulator,
    state: ScanState,
    cursor: usize,
    emitted: usize,
    dropped: usize,
}

impl ActionParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment without extracting anything
    pub fn push(&mut self, fragment: &str) {
        self.buffer.push(fragment);
    }

    /// Append a fragment and drain every action it completed
    pub fn feed(&mut self, fragment: &str) -> Vec<Action> {
        self.push(fragment);
        self.drain()
    }

    /// Extract every action that is complete in the current buffer
    pub fn drain(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        while let Some(action) = self.next_action() {
            actions.push(action);
        }
        actions
    }

    /// Extract the next complete action, if any.
    ///
    /// Malformed blocks whose closing marker has arrived are dropped silently
    /// and scanning continues with the text after them.
    pub fn next_action(&mut self) -> Option<Action> {
        loop {
            match std::mem::take(&mut self.state) {
                ScanState::Outside => {
                    let buf = self.buffer.as_str();
                    let Some(found) = buf[self.cursor..].find(OPEN_MARKER) else {
                        self.cursor = resume_point(buf, self.cursor, OPEN_MARKER);
                        return None;
                    };
                    let start = self.cursor + found;
                    let after = start + OPEN_MARKER.len();
                    match buf[after..].chars().next() {
                        // Cannot tell `<boltAction ` from `<boltActionFoo` yet
                        None => {
                            self.cursor = start;
                            return None;
                        }
                        Some(c) if c.is_whitespace() || c == '>' || c == '/' => {
                            self.state = ScanState::OpenTag { start };
                            self.cursor = after;
                        }
                        Some(_) => self.cursor = after,
                    }
                }
                ScanState::OpenTag { start } => {
                    let buf = self.buffer.as_str();
                    let attrs_start = start + OPEN_MARKER.len();
                    let Some(offset) = find_tag_end(&buf[attrs_start..]) else {
                        self.state = ScanState::OpenTag { start };
                        return None;
                    };
                    let tag_end = attrs_start + offset;
                    let inner = &buf[attrs_start..tag_end];
                    if inner.trim_end().ends_with('/') {
                        self.drop_block(tag_end + 1, "self-closing action tag");
                        continue;
                    }
                    let header = parse_header(inner);
                    self.state = ScanState::Body {
                        header,
                        body_start: tag_end + 1,
                    };
                    self.cursor = tag_end + 1;
                }
                ScanState::Body { header, body_start } => {
                    let buf = self.buffer.as_str();
                    let Some(found) = buf[self.cursor..].find(CLOSE_MARKER) else {
                        self.cursor = resume_point(buf, self.cursor, CLOSE_MARKER);
                        self.state = ScanState::Body { header, body_start };
                        return None;
                    };
                    let close = self.cursor + found;
                    let block_end = close + CLOSE_MARKER.len();
                    match build_action(header, &buf[body_start..close]) {
                        Ok(action) => {
                            self.finish_block(block_end);
                            self.emitted += 1;
                            return Some(action);
                        }
                        Err(reason) => self.drop_block(block_end, reason),
                    }
                }
            }
        }
    }

    /// Unconsumed buffer contents: commentary plus any partial block
    pub fn pending(&self) -> &str {
        self.buffer.as_str()
    }

    /// Whether an opening marker has been seen whose block is not complete
    pub fn is_inside_block(&self) -> bool {
        !matches!(self.state, ScanState::Outside)
    }

    /// Number of actions yielded so far
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Number of malformed blocks dropped so far
    pub fn dropped_blocks(&self) -> usize {
        self.dropped
    }

    /// Number of fragments pushed so far
    pub fn fragments(&self) -> usize {
        self.buffer.fragments()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn finish_block(&mut self, block_end: usize) {
        self.buffer.consume(block_end);
        self.cursor = 0;
        self.state = ScanState::Outside;
    }

    fn drop_block(&mut self, block_end: usize, reason: &'static str) {
        log::debug!("Dropping malformed action block: {}", reason);
        self.dropped += 1;
        self.finish_block(block_end);
    }
}

/// Extract every complete action from a fully buffered response.
///
/// Returns the actions in stream order and the unconsumed suffix.
pub fn extract_all(buffer: &str) -> (Vec<Action>, String) {
    let mut parser = ActionParser::new();
    let actions = parser.feed(buffer);
    (actions, parser.pending().to_string())
}

/// Where to resume searching for `marker` when it was not found after `from`.
///
/// Keeps the last `marker.len() - 1` bytes in view so a marker split across
/// fragments is still found.
fn resume_point(buf: &str, from: usize, marker: &str) -> usize {
    let mut point = buf.len().saturating_sub(marker.len() - 1).max(from);
    while !buf.is_char_boundary(point) {
        point -= 1;
    }
    point
}

/// Offset of the `>` that ends an opening tag, ignoring `>` inside quotes
fn find_tag_end(attrs: &str) -> Option<usize> {
    let mut in_quotes = false;
    for (i, byte) in attrs.bytes().enumerate() {
        match byte {
            b'"' => in_quotes = !in_quotes,
            b'>' if !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_header(inner: &str) -> BlockHeader {
    let Some(attrs) = parse_attributes(inner) else {
        return BlockHeader::Malformed("unparseable attributes");
    };

    match attribute(&attrs, "type").map(ActionKind::from_type_attr) {
        None => BlockHeader::Malformed("missing type attribute"),
        Some(None) => BlockHeader::Malformed("unknown action type"),
        Some(Some(ActionKind::File)) => match attribute(&attrs, "filePath") {
            Some(path) if !path.trim().is_empty() => {
                if is_relative_path(path) {
                    BlockHeader::File {
                        path: path.to_string(),
                    }
                } else {
                    BlockHeader::Malformed("filePath outside the project root")
                }
            }
            _ => BlockHeader::Malformed("file action without filePath"),
        },
        Some(Some(ActionKind::Shell)) => BlockHeader::Shell,
    }
}

/// Parse `name="value"` pairs. Returns `None` on any syntax error.
fn parse_attributes(inner: &str) -> Option<Vec<(&str, &str)>> {
    let mut attrs = Vec::new();
    let mut rest = inner.trim_start();

    while !rest.is_empty() {
        let name_end = rest
            .find(|c: char| c == '=' || c.is_whitespace())
            .unwrap_or(rest.len());
        let name = &rest[..name_end];
        if name.is_empty() {
            return None;
        }

        rest = rest[name_end..].trim_start();
        rest = rest.strip_prefix('=')?.trim_start();
        rest = rest.strip_prefix('"')?;
        let value_end = rest.find('"')?;
        attrs.push((name, &rest[..value_end]));
        rest = rest[value_end + 1..].trim_start();
    }

    Some(attrs)
}

/// First value for `name`; later duplicates are ignored
fn attribute<'a>(attrs: &[(&str, &'a str)], name: &str) -> Option<&'a str> {
    attrs.iter().find(|(key, _)| *key == name).map(|(_, value)| *value)
}

fn build_action(header: BlockHeader, body: &str) -> Result<Action, &'static str> {
    match header {
        BlockHeader::File { path } => Ok(Action::FileWrite {
            file_path: path,
            content: body.trim().to_string(),
        }),
        BlockHeader::Shell => {
            if body.contains(OPEN_MARKER) {
                return Err("nested opening marker in shell action");
            }
            let command = body.trim();
            if command.is_empty() {
                return Err("empty shell command");
            }
            Ok(Action::shell(command))
        }
        BlockHeader::Malformed(reason) => Err(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE_BLOCK: &str =
        "<boltAction type=\"file\" filePath=\"src/App.jsx\">\nexport default () => <div>hi</div>;\n</boltAction>";

    fn feed_in_chunks(input: &str, chars_per_chunk: usize) -> Vec<Action> {
        let chars: Vec<char> = input.chars().collect();
        let mut parser = ActionParser::new();
        let mut actions = Vec::new();
        for chunk in chars.chunks(chars_per_chunk) {
            let fragment: String = chunk.iter().collect();
            actions.extend(parser.feed(&fragment));
        }
        actions
    }

    #[test]
    fn test_fragments_of_single_file_block() {
        let mut parser = ActionParser::new();
        assert!(parser
            .feed("<boltAction type=\"file\" filePath=\"a.txt\">")
            .is_empty());
        assert!(parser.feed("hello").is_empty());
        assert!(parser.is_inside_block());

        let actions = parser.feed("</boltAction>");
        assert_eq!(actions, vec![Action::file("a.txt", "hello")]);
        assert!(!parser.is_inside_block());
        assert_eq!(parser.pending(), "");
    }

    #[test]
    fn test_every_two_way_split_yields_same_action() {
        let (expected, _) = extract_all(FILE_BLOCK);
        assert_eq!(expected.len(), 1);

        let boundaries: Vec<usize> = FILE_BLOCK.char_indices().map(|(i, _)| i).skip(1).collect();
        for split in boundaries {
            let mut parser = ActionParser::new();
            let mut actions = parser.feed(&FILE_BLOCK[..split]);
            actions.extend(parser.feed(&FILE_BLOCK[split..]));
            assert_eq!(actions, expected, "split at byte {}", split);
        }
    }

    #[test]
    fn test_every_chunk_size_yields_same_action() {
        let (expected, _) = extract_all(FILE_BLOCK);
        for size in 1..=FILE_BLOCK.chars().count() {
            assert_eq!(feed_in_chunks(FILE_BLOCK, size), expected, "chunk size {}", size);
        }
    }

    #[test]
    fn test_blocks_yield_in_stream_order() {
        let input = "Sure, here is the project.\n\
            <boltAction type=\"file\" filePath=\"package.json\">{\"name\":\"demo\"}</boltAction>\n\
            Now install dependencies:\n\
            <boltAction type=\"shell\">npm install</boltAction>\n\
            <boltAction type=\"file\" filePath=\"src/main.jsx\">import './index.css'</boltAction>\n\
            <boltAction type=\"shell\">npm run dev</boltAction>\n\
            Done!";

        let expected = vec![
            Action::file("package.json", "{\"name\":\"demo\"}"),
            Action::shell("npm install"),
            Action::file("src/main.jsx", "import './index.css'"),
            Action::shell("npm run dev"),
        ];
        for size in [1, 3, 7, 64, input.len()] {
            assert_eq!(feed_in_chunks(input, size), expected, "chunk size {}", size);
        }
    }

    #[test]
    fn test_one_action_per_call() {
        let mut parser = ActionParser::new();
        parser.push(
            "<boltAction type=\"shell\">echo A</boltAction>tail<boltAction type=\"shell\">echo B</boltAction>",
        );

        assert_eq!(parser.next_action(), Some(Action::shell("echo A")));
        assert_eq!(
            parser.pending(),
            "tail<boltAction type=\"shell\">echo B</boltAction>"
        );
        assert_eq!(parser.next_action(), Some(Action::shell("echo B")));
        assert_eq!(parser.next_action(), None);
        assert_eq!(parser.emitted(), 2);
    }

    #[test]
    fn test_incomplete_block_leaves_buffer_intact() {
        let mut parser = ActionParser::new();
        let partial = "intro <boltAction type=\"file\" filePath=\"a.txt\">partial con";
        assert!(parser.feed(partial).is_empty());
        assert_eq!(parser.pending(), partial);
    }

    #[test]
    fn test_unterminated_quote_waits_for_next_fragment() {
        let mut parser = ActionParser::new();
        assert!(parser.feed("<boltAction type=\"fi").is_empty());
        assert!(parser.feed("le\" filePath=\"a>b.txt").is_empty());
        let actions = parser.feed("\">x</boltAction>");
        assert_eq!(actions, vec![Action::file("a>b.txt", "x")]);
        assert_eq!(parser.dropped_blocks(), 0);
    }

    #[test]
    fn test_split_closing_marker() {
        let mut parser = ActionParser::new();
        assert!(parser
            .feed("<boltAction type=\"shell\">npm test</bolt")
            .is_empty());
        assert_eq!(parser.feed("Action>"), vec![Action::shell("npm test")]);
    }

    #[test]
    fn test_split_opening_marker() {
        let mut parser = ActionParser::new();
        assert!(parser.feed("text <bolt").is_empty());
        assert!(parser.feed("Action").is_empty());
        assert_eq!(
            parser.feed(" type=\"shell\">ls</boltAction>"),
            vec![Action::shell("ls")]
        );
    }

    #[test]
    fn test_missing_file_path_is_dropped() {
        let input = "<boltAction type=\"file\">orphan</boltAction><boltAction type=\"shell\">ls</boltAction>";
        let mut parser = ActionParser::new();
        assert_eq!(parser.feed(input), vec![Action::shell("ls")]);
        assert_eq!(parser.dropped_blocks(), 1);
    }

    #[test]
    fn test_escaping_file_paths_are_dropped() {
        let input = concat!(
            "<boltAction type=\"file\" filePath=\"../../evil.sh\">rm -rf ~</boltAction>",
            "<boltAction type=\"file\" filePath=\"/etc/abs\">x</boltAction>",
            "<boltAction type=\"file\" filePath=\"src/ok.js\">ok</boltAction>",
        );
        let mut parser = ActionParser::new();
        assert_eq!(parser.feed(input), vec![Action::file("src/ok.js", "ok")]);
        assert_eq!(parser.dropped_blocks(), 2);
    }

    #[test]
    fn test_unknown_type_is_dropped() {
        let (actions, rest) = extract_all("<boltAction type=\"start\">npm run dev</boltAction> tail");
        assert!(actions.is_empty());
        assert_eq!(rest, " tail");
    }

    #[test]
    fn test_shell_with_nested_marker_is_dropped() {
        let input = "<boltAction type=\"shell\">npm i <boltAction type=\"file\" filePath=\"x\">abc</boltAction>";
        let mut parser = ActionParser::new();
        assert!(parser.feed(input).is_empty());
        assert_eq!(parser.dropped_blocks(), 1);
        assert_eq!(parser.pending(), "");
    }

    #[test]
    fn test_similar_tag_names_are_not_markers() {
        let input = "<boltActions> <boltArtifact id=\"x\"><boltAction type=\"shell\">ls</boltAction></boltArtifact>";
        let (actions, rest) = extract_all(input);
        assert_eq!(actions, vec![Action::shell("ls")]);
        assert_eq!(rest, "</boltArtifact>");
    }

    #[test]
    fn test_attribute_order_and_whitespace() {
        let (actions, _) = extract_all(
            "<boltAction   filePath = \"src/index.css\"\n type=\"file\" >\n  body { margin: 0 }\n\n</boltAction>",
        );
        assert_eq!(actions, vec![Action::file("src/index.css", "body { margin: 0 }")]);
    }

    #[test]
    fn test_file_content_keeps_inner_lines() {
        let (actions, _) = extract_all(FILE_BLOCK);
        assert_eq!(
            actions,
            vec![Action::file("src/App.jsx", "export default () => <div>hi</div>;")]
        );
    }

    #[test]
    fn test_self_closing_tag_is_dropped() {
        let (actions, rest) =
            extract_all("<boltAction type=\"shell\"/>after<boltAction type=\"shell\">pwd</boltAction>");
        assert_eq!(actions, vec![Action::shell("pwd")]);
        assert_eq!(rest, "");
    }

    #[test]
    fn test_closing_marker_inside_file_content_ends_block_early() {
        // Known protocol limitation: the first closing marker always ends the block.
        let (actions, rest) = extract_all(
            "<boltAction type=\"file\" filePath=\"doc.md\">use </boltAction> to close</boltAction>",
        );
        assert_eq!(actions, vec![Action::file("doc.md", "use")]);
        assert_eq!(rest, " to close</boltAction>");
    }

    #[test]
    fn test_multibyte_content_split_per_char() {
        let input = "<boltAction type=\"file\" filePath=\"i18n/zh.json\">{\"title\":\"你好，世界\"}</boltAction>";
        assert_eq!(
            feed_in_chunks(input, 1),
            vec![Action::file("i18n/zh.json", "{\"title\":\"你好，世界\"}")]
        );
    }

    #[test]
    fn test_commentary_is_retained_until_block_consumed() {
        let mut parser = ActionParser::new();
        parser.feed("Here is the plan. ");
        assert_eq!(parser.pending(), "Here is the plan. ");
        parser.feed("<boltAction type=\"shell\">ls</boltAction>");
        assert_eq!(parser.pending(), "");
    }
}
