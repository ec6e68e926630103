//! Read framing - split an incoming byte stream into frames
//!
//! The framer owns the bytes that arrived but have not been handed out yet.
//! Chunks are appended as they arrive and frames are cut one at a time, each
//! under the rule in force when it is asked for, so a rule change made after
//! one frame applies to the bytes already buffered behind it.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

/// Caller-supplied frame detector
///
/// Given the unconsumed bytes, returns `Some(len)` when the first `len`
/// bytes form a complete frame.
pub type Predicate = Arc<dyn Fn(&[u8]) -> Option<usize> + Send + Sync>;

/// What ends one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// A literal delimiter
    #[default]
    Delimiter,
    /// The delimiter twice in a row (e.g. the blank line after HTTP headers)
    DoubleDelimiter,
    /// A regular expression match
    Pattern,
    /// A predicate over the unconsumed bytes
    Predicate,
    /// A fixed number of bytes
    FillBuffer,
}

/// Frame boundary rule for a single read
#[derive(Clone)]
pub enum FrameRule {
    Delimiter(Bytes),
    DoubleDelimiter(Bytes),
    Pattern(Regex),
    Predicate(Predicate),
    FillBuffer(usize),
}

impl fmt::Debug for FrameRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delimiter(d) => f.debug_tuple("Delimiter").field(d).finish(),
            Self::DoubleDelimiter(d) => f.debug_tuple("DoubleDelimiter").field(d).finish(),
            Self::Pattern(re) => f.debug_tuple("Pattern").field(&re.as_str()).finish(),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
            Self::FillBuffer(n) => f.debug_tuple("FillBuffer").field(n).finish(),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Incremental frame splitter
#[derive(Debug, Default)]
pub struct ReadFramer {
    buf: BytesMut,
    /// Offset before which `scan_needle` cannot start
    scanned: usize,
    scan_needle: Vec<u8>,
}

impl ReadFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for a frame boundary
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append a chunk behind the bytes already buffered
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Cut the oldest complete frame under `rule`, if there is one
    pub fn next_frame(&mut self, rule: &FrameRule) -> Option<Bytes> {
        let len = self.next_frame_len(rule)?;
        self.scanned = 0;
        Some(self.buf.split_to(len).freeze())
    }

    /// Hand back everything still buffered (end-of-stream)
    pub fn finish(&mut self) -> Bytes {
        self.scanned = 0;
        self.buf.split().freeze()
    }

    fn next_frame_len(&mut self, rule: &FrameRule) -> Option<usize> {
        if self.buf.is_empty() {
            return None;
        }
        match rule {
            FrameRule::Delimiter(delim) => self.find_literal(delim),
            FrameRule::DoubleDelimiter(delim) => {
                let mut doubled = BytesMut::with_capacity(delim.len() * 2);
                doubled.extend_from_slice(delim);
                doubled.extend_from_slice(delim);
                self.find_literal(&doubled)
            }
            FrameRule::Pattern(re) => re.find(&self.buf[..]).map(|m| m.end()).filter(|end| *end > 0),
            FrameRule::Predicate(pred) => pred(&self.buf[..]).filter(|len| *len > 0 && *len <= self.buf.len()),
            FrameRule::FillBuffer(size) => {
                let size = (*size).max(1);
                (self.buf.len() >= size).then_some(size)
            }
        }
    }

    fn find_literal(&mut self, needle: &[u8]) -> Option<usize> {
        if self.scan_needle != needle {
            self.scan_needle = needle.to_vec();
            self.scanned = 0;
        }
        // A delimiter split across chunks may start just before the old end
        let start = self.scanned.saturating_sub(needle.len().saturating_sub(1));
        match find(&self.buf[start..], needle) {
            Some(pos) => Some(start + pos + needle.len()),
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }
}
