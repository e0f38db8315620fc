//! Marker vocabulary and argument grammar.
//!
//! A marker is an invisible command embedded in generated text:
//!
//! ```text
//! [PERFIL:profession_specialization=Dentista,city=Madrid]
//! [GRUPO:id=g-42]
//! [GRUPO_NUEVO:name=Dentistas Centro,location=Madrid]
//! [CONFLICTO:group=g-42,incumbent=u-7,specialization=Dentista]
//! [SUGERENCIAS]
//! ```
//!
//! Bodies are `key=value` pairs separated by `,`. A backslash escapes the next
//! character, so values may contain `\,` `\]` `\=` and `\\`.

use serde::{Deserialize, Serialize};

use crate::error::MarkerError;

/// The closed marker vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MarkerKind {
    ProfileFieldUpdate,
    GroupAssign,
    GroupCreate,
    ConflictCaseOpen,
    /// Self-closing rendering hint, forwarded to the client verbatim
    UiHintToken,
}

impl MarkerKind {
    pub const ALL: [MarkerKind; 5] = [
        MarkerKind::ProfileFieldUpdate,
        MarkerKind::GroupAssign,
        MarkerKind::GroupCreate,
        MarkerKind::ConflictCaseOpen,
        MarkerKind::UiHintToken,
    ];

    pub const fn opener(self) -> &'static str {
        match self {
            MarkerKind::ProfileFieldUpdate => "[PERFIL:",
            MarkerKind::GroupAssign => "[GRUPO:",
            MarkerKind::GroupCreate => "[GRUPO_NUEVO:",
            MarkerKind::ConflictCaseOpen => "[CONFLICTO:",
            MarkerKind::UiHintToken => "[SUGERENCIAS]",
        }
    }

    /// `None` for self-closing markers.
    pub const fn closer(self) -> Option<char> {
        match self {
            MarkerKind::UiHintToken => None,
            _ => Some(']'),
        }
    }

    pub const fn takes_arguments(self) -> bool {
        self.closer().is_some()
    }

    /// Marker kinds whose effects are forwarded to the client instead of stripped.
    pub const fn is_client_visible(self) -> bool {
        matches!(self, MarkerKind::UiHintToken)
    }

    pub fn name(self) -> &'static str {
        match self {
            MarkerKind::ProfileFieldUpdate => "profile_field_update",
            MarkerKind::GroupAssign => "group_assign",
            MarkerKind::GroupCreate => "group_create",
            MarkerKind::ConflictCaseOpen => "conflict_case_open",
            MarkerKind::UiHintToken => "ui_hint",
        }
    }
}

/// Byte length of the longest opener; bounds the scanner's held context.
pub fn longest_opener_len() -> usize {
    MarkerKind::ALL
        .iter()
        .map(|k| k.opener().len())
        .max()
        .unwrap_or(0)
}

/// A completed marker as captured by the scanner: opener plus raw body.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawMarker {
    pub kind: MarkerKind,
    /// Text between opener and closer, escapes still in place
    pub body: String,
}

impl RawMarker {
    pub fn new(kind: MarkerKind, body: impl Into<String>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    /// The marker exactly as it appeared in the stream.
    pub fn to_wire(&self) -> String {
        match self.kind.closer() {
            Some(closer) => format!("{}{}{}", self.kind.opener(), self.body, closer),
            None => self.kind.opener().to_string(),
        }
    }
}

/// Split a marker body into ordered `(key, value)` pairs.
pub fn parse_args(body: &str) -> Result<Vec<(String, String)>, MarkerError> {
    let mut pairs = Vec::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut escaped = false;

    for c in body.chars() {
        if escaped {
            if in_value { value.push(c) } else { key.push(c) }
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' if !in_value => in_value = true,
            ',' => {
                finish_segment(&mut pairs, &mut key, &mut value, in_value)?;
                in_value = false;
            }
            _ => {
                if in_value { value.push(c) } else { key.push(c) }
            }
        }
    }

    if escaped {
        return Err(MarkerError::DanglingEscape);
    }
    finish_segment(&mut pairs, &mut key, &mut value, in_value)?;
    Ok(pairs)
}

fn finish_segment(
    pairs: &mut Vec<(String, String)>,
    key: &mut String,
    value: &mut String,
    in_value: bool,
) -> Result<(), MarkerError> {
    let raw_key = std::mem::take(key);
    let raw_value = std::mem::take(value);

    if !in_value {
        // Blank segments (trailing comma, empty body) are tolerated
        if raw_key.trim().is_empty() {
            return Ok(());
        }
        return Err(MarkerError::MissingEquals(raw_key));
    }

    let normalized = raw_key.trim().to_ascii_lowercase();
    if normalized.is_empty() || !normalized.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
        return Err(MarkerError::InvalidKey(raw_key));
    }
    pairs.push((normalized, raw_value.trim().to_string()));
    Ok(())
}

/// Escape a value so it can be embedded in a marker body.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | ',' | ']' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Typed command decoded from a completed marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Ordered pairs; validated against the allow-list at dispatch time
    ProfileUpdate(Vec<(String, String)>),
    GroupAssign {
        group_id: String,
    },
    GroupCreate {
        name: String,
        location: Option<String>,
    },
    ConflictCaseOpen {
        group_id: String,
        incumbent_id: String,
        specialization: String,
    },
    UiHint,
}

impl Command {
    pub fn from_marker(marker: &RawMarker) -> Result<Self, MarkerError> {
        if !marker.kind.takes_arguments() {
            if !marker.body.is_empty() {
                return Err(MarkerError::UnexpectedArguments);
            }
            return Ok(Command::UiHint);
        }

        let pairs = parse_args(&marker.body)?;
        match marker.kind {
            MarkerKind::ProfileFieldUpdate => Ok(Command::ProfileUpdate(pairs)),
            MarkerKind::GroupAssign => Ok(Command::GroupAssign {
                group_id: required(&pairs, "id")?,
            }),
            MarkerKind::GroupCreate => Ok(Command::GroupCreate {
                name: required(&pairs, "name")?,
                location: optional(&pairs, "location"),
            }),
            MarkerKind::ConflictCaseOpen => Ok(Command::ConflictCaseOpen {
                group_id: required(&pairs, "group")?,
                incumbent_id: required(&pairs, "incumbent")?,
                specialization: required(&pairs, "specialization")?,
            }),
            MarkerKind::UiHintToken => Ok(Command::UiHint),
        }
    }
}

/// Last non-empty occurrence wins.
fn optional(pairs: &[(String, String)], key: &str) -> Option<String> {
    pairs
        .iter()
        .rev()
        .find(|(k, v)| k == key && !v.is_empty())
        .map(|(_, v)| v.clone())
}

fn required(pairs: &[(String, String)], key: &'static str) -> Result<String, MarkerError> {
    optional(pairs, key).ok_or(MarkerError::MissingArgument(key))
}
