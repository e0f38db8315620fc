//! Marker scanner.
//!
//! Separates the reassembled text into plain text (forwarded live) and marker
//! spans (captured, never forwarded). The automaton:
//!
//! - `Plain` - no marker in progress
//! - `Candidate` - the tail of the text is a strict prefix of some opener and is held
//! - `Capturing` - an opener was seen; bytes accumulate until the closer
//!
//! Held context is bounded: a candidate never exceeds the longest opener, and a
//! capture that outgrows `max_marker_bytes` stops buffering and is discarded once
//! its closer arrives. Each captured byte is examined once; the capture keeps a
//! cursor and the escape state at that cursor.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::marker::{MarkerKind, RawMarker, longest_opener_len};

/// Default upper bound for one marker body.
pub const DEFAULT_MAX_MARKER_BYTES: usize = 1024;

/// Output of the scanner, in stream order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanEvent {
    /// Plain text, safe to forward
    Text(String),
    /// A self-closing marker that stays visible to the client
    Hint(RawMarker),
    /// A completed marker, to be dispatched
    Marker(RawMarker),
    /// A marker that was detected but never completed
    Dropped(DroppedMarker),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedMarker {
    pub kind: MarkerKind,
    pub reason: DropReason,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Stream ended before the closer
    Truncated,
    /// Body exceeded the size bound
    Oversized,
}

/// Observable automaton state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScannerState {
    Plain,
    Candidate,
    Capturing,
}

enum State {
    Plain,
    Candidate(String),
    Capturing(Capture),
}

struct Capture {
    kind: MarkerKind,
    closer: char,
    span: String,
    /// Bytes of `span` already examined
    cursor: usize,
    escaped: bool,
    /// Bytes dropped from `span` after the bound was hit
    discarded: usize,
    overflowed: bool,
}

struct Completion {
    /// `None` when the body was too large to keep
    body: Option<String>,
    rest: String,
}

impl Capture {
    fn new(kind: MarkerKind, closer: char) -> Self {
        Self {
            kind,
            closer,
            span: String::new(),
            cursor: 0,
            escaped: false,
            discarded: 0,
            overflowed: false,
        }
    }

    fn feed(&mut self, text: &str, max_bytes: usize) -> Option<Completion> {
        self.span.push_str(text);

        let mut found = None;
        for (i, c) in self.span[self.cursor..].char_indices() {
            if self.escaped {
                self.escaped = false;
                continue;
            }
            if c == '\\' {
                self.escaped = true;
                continue;
            }
            if c == self.closer {
                found = Some(self.cursor + i);
                break;
            }
        }

        match found {
            Some(idx) => {
                let rest = self.span[idx + self.closer.len_utf8()..].to_string();
                self.span.truncate(idx);
                let body = if self.overflowed || self.discarded + idx > max_bytes {
                    None
                } else {
                    Some(std::mem::take(&mut self.span))
                };
                Some(Completion { body, rest })
            }
            None => {
                self.cursor = self.span.len();
                if self.discarded + self.span.len() > max_bytes {
                    if !self.overflowed {
                        warn!(marker = self.kind.name(), max_bytes, "marker body exceeds bound, discarding");
                    }
                    self.overflowed = true;
                    self.discarded += self.span.len();
                    self.span.clear();
                    self.cursor = 0;
                }
                None
            }
        }
    }
}

/// Incremental marker scanner for one stream.
pub struct MarkerScanner {
    state: State,
    max_marker_bytes: usize,
    /// Safety valve for held candidate text
    max_hold: usize,
}

impl Default for MarkerScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkerScanner {
    pub fn new() -> Self {
        Self::with_max_marker_bytes(DEFAULT_MAX_MARKER_BYTES)
    }

    pub fn with_max_marker_bytes(max_marker_bytes: usize) -> Self {
        Self {
            state: State::Plain,
            max_marker_bytes,
            max_hold: longest_opener_len(),
        }
    }

    pub fn state(&self) -> ScannerState {
        match self.state {
            State::Plain => ScannerState::Plain,
            State::Candidate(_) => ScannerState::Candidate,
            State::Capturing(_) => ScannerState::Capturing,
        }
    }

    /// Feed reassembled text.
    pub fn push(&mut self, text: &str) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        let mut input = text.to_string();

        loop {
            match std::mem::replace(&mut self.state, State::Plain) {
                State::Plain => match self.scan_plain(&input, &mut events) {
                    Some(rest) => input = rest,
                    None => break,
                },
                State::Candidate(mut held) => {
                    if held.len() > self.max_hold {
                        warn!(bytes = held.len(), "held candidate exceeds bound, flushing as text");
                        emit_text(&mut events, &held);
                    } else {
                        held.push_str(&input);
                        input = held;
                    }
                }
                State::Capturing(mut capture) => {
                    match capture.feed(&input, self.max_marker_bytes) {
                        Some(Completion { body, rest }) => {
                            match body {
                                Some(body) => {
                                    debug!(marker = capture.kind.name(), "marker complete");
                                    events.push(ScanEvent::Marker(RawMarker::new(
                                        capture.kind,
                                        body,
                                    )));
                                }
                                None => events.push(ScanEvent::Dropped(DroppedMarker {
                                    kind: capture.kind,
                                    reason: DropReason::Oversized,
                                })),
                            }
                            input = rest;
                        }
                        None => {
                            self.state = State::Capturing(capture);
                            break;
                        }
                    }
                }
            }
        }

        events
    }

    /// Stream end. A held candidate is plain text; an open capture is discarded.
    pub fn finish(&mut self) -> Vec<ScanEvent> {
        match std::mem::replace(&mut self.state, State::Plain) {
            State::Plain => Vec::new(),
            State::Candidate(held) => {
                let mut events = Vec::new();
                emit_text(&mut events, &held);
                events
            }
            State::Capturing(capture) => {
                warn!(
                    marker = capture.kind.name(),
                    held_bytes = capture.discarded + capture.span.len(),
                    "stream ended inside a marker, dropping it"
                );
                vec![ScanEvent::Dropped(DroppedMarker {
                    kind: capture.kind,
                    reason: DropReason::Truncated,
                })]
            }
        }
    }

    /// Discard all held state without emitting anything (cancellation).
    pub fn abandon(&mut self) {
        self.state = State::Plain;
    }

    /// Scan `text` in the plain state. Returns the remainder to keep processing
    /// when a marker opener was consumed, `None` once the text is exhausted.
    fn scan_plain(&mut self, text: &str, events: &mut Vec<ScanEvent>) -> Option<String> {
        if let Some((pos, kind)) = find_opener(text) {
            emit_text(events, &text[..pos]);
            let rest = text[pos + kind.opener().len()..].to_string();
            match kind.closer() {
                Some(closer) => self.state = State::Capturing(Capture::new(kind, closer)),
                None => events.push(ScanEvent::Hint(RawMarker::new(kind, ""))),
            }
            return Some(rest);
        }

        match candidate_start(text, self.max_hold) {
            Some(i) => {
                emit_text(events, &text[..i]);
                self.state = State::Candidate(text[i..].to_string());
            }
            None => emit_text(events, text),
        }
        None
    }
}

fn emit_text(events: &mut Vec<ScanEvent>, text: &str) {
    if text.is_empty() {
        return;
    }
    // Coalesce adjacent text so consumers see one segment per push
    if let Some(ScanEvent::Text(prev)) = events.last_mut() {
        prev.push_str(text);
    } else {
        events.push(ScanEvent::Text(text.to_string()));
    }
}

/// Earliest full opener in `text`.
fn find_opener(text: &str) -> Option<(usize, MarkerKind)> {
    MarkerKind::ALL
        .iter()
        .filter_map(|&kind| text.find(kind.opener()).map(|pos| (pos, kind)))
        .min_by_key(|(pos, _)| *pos)
}

/// Start of the longest suffix of `text` that is a strict prefix of an opener.
fn candidate_start(text: &str, max_hold: usize) -> Option<usize> {
    let from = text.len().saturating_sub(max_hold.saturating_sub(1));
    (from..text.len())
        .filter(|&i| text.is_char_boundary(i))
        .find(|&i| {
            let suffix = &text[i..];
            MarkerKind::ALL
                .iter()
                .any(|k| k.opener().len() > suffix.len() && k.opener().starts_with(suffix))
        })
}
