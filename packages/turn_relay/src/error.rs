//! Error taxonomy for the relay.
//!
//! Everything below the transport is contained locally: framing, reassembly and
//! marker grammar failures are logged and counted, never surfaced to the client.
//! Only [`RelayError`] ends a turn.

use serde::{Deserialize, Serialize};

/// A line the framer could not decode. The line is skipped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("line is not valid UTF-8 ({len} bytes)")]
    InvalidUtf8 { len: usize },

    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },
}

/// A recognised marker whose arguments could not be turned into a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarkerError {
    #[error("argument segment without '=': {0:?}")]
    MissingEquals(String),

    #[error("invalid argument key: {0:?}")]
    InvalidKey(String),

    #[error("dangling escape at end of marker body")]
    DanglingEscape,

    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),

    #[error("marker takes no arguments")]
    UnexpectedArguments,
}

impl MarkerError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::MissingEquals(_) => "missing_equals",
            Self::InvalidKey(_) => "invalid_key",
            Self::DanglingEscape => "dangling_escape",
            Self::MissingArgument(_) => "missing_argument",
            Self::UnexpectedArguments => "unexpected_arguments",
        }
    }
}

/// Failures that end the current turn.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("upstream disconnected: {0}")]
    UpstreamDisconnect(String),

    #[error("upstream rejected the request: {0}")]
    UpstreamRejected(String),

    #[error("upstream reported an error: {0}")]
    UpstreamReported(String),

    #[error("store failure: {0}")]
    Store(String),

    #[error("turn cancelled")]
    Cancelled,
}

impl RelayError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::UpstreamDisconnect(_) => "upstream_disconnect",
            Self::UpstreamRejected(_) => "upstream_rejected",
            Self::UpstreamReported(_) => "upstream_reported",
            Self::Store(_) => "store_failure",
            Self::Cancelled => "cancelled",
        }
    }

    /// Wrap a collaborator error, keeping its context chain in the message.
    pub fn store(err: anyhow::Error) -> Self {
        Self::Store(format!("{:#}", err))
    }
}

/// The only error text a client ever sees.
pub const APOLOGY_MESSAGE: &str =
    "Lo siento, ha ocurrido un problema al generar la respuesta. Por favor, inténtalo de nuevo.";

/// Serializable error frame for the client channel. Carries no internals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientError {
    pub error: String,
}

impl From<&RelayError> for ClientError {
    fn from(_: &RelayError) -> Self {
        Self {
            error: APOLOGY_MESSAGE.to_string(),
        }
    }
}
