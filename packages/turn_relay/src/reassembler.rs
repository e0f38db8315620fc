//! Payload reassembly.
//!
//! Upstream sometimes splits one JSON record over several `data:` lines. Each
//! payload is tried on its own first; on failure it is carried and the
//! concatenation is retried as more payloads arrive. An event boundary while a
//! fragment is still carried abandons it.

use serde_json::Value;
use tracing::{debug, warn};

/// Default upper bound for a carried fragment (256 KiB).
pub const DEFAULT_MAX_REASSEMBLY_BYTES: usize = 256 * 1024;

/// The fields the relay cares about in one chat-completion chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /// `choices[0].delta.content`
    pub delta: Option<String>,
    /// `choices[0].finish_reason`, the terminal-value payload
    pub finish_reason: Option<String>,
    /// Top-level `error`, reported by the upstream itself
    pub error: Option<String>,
}

impl Record {
    pub fn from_value(value: &Value) -> Self {
        let error = value.get("error").and_then(|e| match e {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(
                other
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown upstream error")
                    .to_string(),
            ),
        });

        let choice = value
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first());

        let delta = choice
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string);

        let finish_reason = choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(|f| f.as_str())
            .map(str::to_string);

        Self {
            delta,
            finish_reason,
            error,
        }
    }
}

/// Carry-buffer for one active stream.
pub struct Reassembler {
    carry: String,
    max_bytes: usize,
    abandoned: u64,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_max_bytes(DEFAULT_MAX_REASSEMBLY_BYTES)
    }

    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            carry: String::new(),
            max_bytes,
            abandoned: 0,
        }
    }

    /// Feed one data payload. Returns a record once a parseable unit is formed.
    pub fn push(&mut self, payload: &str) -> Option<Record> {
        if payload.is_empty() {
            return None;
        }

        if self.carry.is_empty() {
            if let Some(record) = parse_record(payload) {
                return Some(record);
            }
            self.carry.push_str(payload);
        } else {
            self.carry.push_str(payload);
            if let Some(record) = parse_record(&self.carry) {
                debug!(bytes = self.carry.len(), "reassembled fragmented payload");
                self.carry.clear();
                return Some(record);
            }
        }

        if self.carry.len() > self.max_bytes {
            self.abandon("carry buffer exceeded its bound");
        }
        None
    }

    /// Event boundary: a fragment still carried here will never complete.
    pub fn boundary(&mut self) {
        if !self.carry.is_empty() {
            self.abandon("event boundary reached with incomplete payload");
        }
    }

    /// True while a fragment is being carried.
    pub fn is_carrying(&self) -> bool {
        !self.carry.is_empty()
    }

    /// Number of fragments dropped so far.
    pub fn abandoned_count(&self) -> u64 {
        self.abandoned
    }

    fn abandon(&mut self, reason: &str) {
        warn!(bytes = self.carry.len(), reason, "abandoning unparseable payload");
        self.carry.clear();
        self.abandoned += 1;
    }
}

/// Only JSON objects count as records; bare scalars are fragments.
fn parse_record(text: &str) -> Option<Record> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Some(Record::from_value(&value)),
        _ => None,
    }
}
