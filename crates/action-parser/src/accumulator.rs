//! Fragment buffering

/// Growing buffer of received fragments.
///
/// Holds no protocol knowledge; the scanner decides how much of the front of
/// the buffer has been consumed.
#[derive(Debug, Default, Clone)]
pub struct FragmentAccumulator {
    buffer: String,
    fragments: usize,
    received_bytes: usize,
}

impl FragmentAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one fragment to the end of the buffer.
    pub fn push(&mut self, fragment: &str) {
        self.buffer.push_str(fragment);
        self.fragments += 1;
        self.received_bytes += fragment.len();
    }

    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop the first `len` bytes. `len` must lie on a char boundary.
    pub fn consume(&mut self, len: usize) {
        let len = len.min(self.buffer.len());
        self.buffer.drain(..len);
    }

    /// Number of fragments pushed since creation or the last [`clear`](Self::clear)
    pub fn fragments(&self) -> usize {
        self.fragments
    }

    /// Total bytes pushed, including bytes already consumed
    pub fn received_bytes(&self) -> usize {
        self.received_bytes
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.fragments = 0;
        self.received_bytes = 0;
    }
}
