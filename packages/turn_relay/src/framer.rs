//! Line framer for server-sent event streams.
//!
//! Wire convention:
//!
//! ```text
//! : keep-alive            -> Frame::Comment
//! data: {"choices":...}   -> Frame::Data(payload)
//! data: [DONE]            -> Frame::Terminal
//! <blank line>            -> Frame::Boundary
//! event: message          -> Frame::Field
//! ```
//!
//! The framer works on bytes, so a line (or a multi-byte character) split
//! across two reads is held until its newline arrives.

use tracing::warn;

use crate::error::FramingError;

/// Default upper bound for a single line (1 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Payload of the data line that ends the stream.
pub const TERMINAL_SENTINEL: &str = "[DONE]";

const COMMENT_PREFIX: char = ':';
const DATA_PREFIX: &str = "data:";

/// One decoded line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload of a `data:` line, prefix stripped.
    Data(String),
    /// Comment / keep-alive line.
    Comment,
    /// Blank line: event boundary.
    Boundary,
    /// Any other field line (`event:`, `id:`, `retry:`).
    Field,
    /// The terminal sentinel.
    Terminal,
}

/// Incremental decoder from raw bytes to [`Frame`]s.
pub struct LineFramer {
    pending: Vec<u8>,
    max_line_bytes: usize,
    /// Set while skipping the remainder of an oversized line.
    discarding: bool,
    malformed: u64,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line_bytes,
            discarding: false,
            malformed: 0,
        }
    }

    /// Feed one read's worth of bytes, returning every frame completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let head = &rest[..pos];
            rest = &rest[pos + 1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }

            if self.pending.len() + head.len() > self.max_line_bytes {
                self.pending.clear();
                self.reject(FramingError::LineTooLong {
                    max: self.max_line_bytes,
                });
                continue;
            }

            let decoded = if self.pending.is_empty() {
                decode_line(head)
            } else {
                self.pending.extend_from_slice(head);
                let line = std::mem::take(&mut self.pending);
                decode_line(&line)
            };

            match decoded {
                Ok(frame) => frames.push(frame),
                Err(e) => self.reject(e),
            }
        }

        if !rest.is_empty() && !self.discarding {
            if self.pending.len() + rest.len() > self.max_line_bytes {
                self.pending.clear();
                self.discarding = true;
                self.reject(FramingError::LineTooLong {
                    max: self.max_line_bytes,
                });
            } else {
                self.pending.extend_from_slice(rest);
            }
        }

        frames
    }

    /// Decode an unterminated trailing line at end of input.
    pub fn finish(&mut self) -> Option<Frame> {
        self.discarding = false;
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        match decode_line(&line) {
            Ok(frame) => Some(frame),
            Err(e) => {
                self.reject(e);
                None
            }
        }
    }

    /// Number of lines skipped as malformed so far.
    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }

    fn reject(&mut self, err: FramingError) {
        self.malformed += 1;
        warn!(error = %err, "skipping malformed frame");
    }
}

fn decode_line(raw: &[u8]) -> Result<Frame, FramingError> {
    let line =
        std::str::from_utf8(raw).map_err(|_| FramingError::InvalidUtf8 { len: raw.len() })?;
    Ok(classify(line))
}

/// Classify a single line (without its `\n`).
pub fn classify(line: &str) -> Frame {
    let line = line.strip_suffix('\r').unwrap_or(line);

    if line.is_empty() {
        return Frame::Boundary;
    }
    if line.starts_with(COMMENT_PREFIX) {
        return Frame::Comment;
    }
    match line.strip_prefix(DATA_PREFIX) {
        Some(payload) => {
            let payload = payload.strip_prefix(' ').unwrap_or(payload);
            if payload == TERMINAL_SENTINEL {
                Frame::Terminal
            } else {
                Frame::Data(payload.to_string())
            }
        }
        None => Frame::Field,
    }
}
