//! Delimiter-based fragment splitter
//!
//! The system prompt asks the model to place a delimiter between short
//! phrases. Deltas are buffered and cut after each delimiter so synthesis can
//! start on the first phrase while the rest of the reply is still streaming.
//! Fragments keep their delimiter: concatenating every emitted fragment gives
//! back the full generated text.

/// Splits streamed text into speakable fragments
#[derive(Debug, Clone)]
pub struct FragmentSplitter {
    delimiter: String,
    buffer: String,
    /// Bytes of `buffer` already known to hold nothing speakable
    scanned: usize,
}

impl FragmentSplitter {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
            buffer: String::new(),
            scanned: 0,
        }
    }

    /// Append a delta, returning every fragment it completes
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);
        let mut fragments = Vec::new();

        while let Some(offset) = self.buffer[self.scanned..].find(&self.delimiter) {
            let end = self.scanned + offset + self.delimiter.len();
            if self.is_speakable(&self.buffer[..end]) {
                fragments.push(self.buffer.drain(..end).collect());
                self.scanned = 0;
            } else {
                // Leading delimiters ride along with the next phrase
                self.scanned = end;
            }
        }

        fragments
    }

    /// Emit whatever remains once the reply is complete
    pub fn flush(&mut self) -> Option<String> {
        self.scanned = 0;
        let rest = std::mem::take(&mut self.buffer);
        if self.is_speakable(&rest) {
            Some(rest)
        } else {
            None
        }
    }

    fn is_speakable(&self, text: &str) -> bool {
        !text.replace(&self.delimiter, "").trim().is_empty()
    }
}

impl Default for FragmentSplitter {
    fn default() -> Self {
        Self::new("•")
    }
}
