//! # Error Definitions
//!
//! The central ledger of all operational and protocol failures.

use serde_json::Value;

/// Operational failures within the RPC mechanism itself.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The frame body was not valid JSON, or could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),
    /// An unknown top-level frame shape was encountered.
    #[error("unknown frame: {0}")]
    UnknownVariant(String),
    /// The internal structure of the message was malformed (e.g., missing id).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// A specialized Result type for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons for an RPC failure (The "Err" side of a Reply).
///
/// These are distinct from `Error`; these represent the *remote* system failing,
/// whereas `Error` represents the *framing* failing.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// The frame could not be parsed at all.
    ParseError,
    /// The frame parsed but is not a well-formed call.
    InvalidRequest,
    /// The method does not exist on the endpoint.
    MethodNotFound(String),
    /// The params did not have the shape the method expects.
    InvalidParams(String),
    /// The endpoint failed for reasons of its own.
    Internal(String),
    /// The invoked target reported a failure; `data` is the target's error value.
    Application { message: String, data: Option<Value> },
}

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const APPLICATION_ERROR: i64 = -32000;

impl FailureReason {
    pub fn code(&self) -> i64 {
        match self {
            Self::ParseError => PARSE_ERROR,
            Self::InvalidRequest => INVALID_REQUEST,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::Internal(_) => INTERNAL_ERROR,
            Self::Application { .. } => APPLICATION_ERROR,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::ParseError => "Parse error".into(),
            Self::InvalidRequest => "Invalid Request".into(),
            Self::MethodNotFound(method) => format!("Method not found: {}", method),
            Self::InvalidParams(details) => format!("Invalid params: {}", details),
            Self::Internal(details) => format!("Internal error: {}", details),
            Self::Application { message, .. } => message.clone(),
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Application { data, .. } => data.as_ref(),
            _ => None,
        }
    }

    /// Rebuilds a reason from the wire triple. Codes outside the reserved
    /// range are treated as application failures.
    pub fn from_wire(code: i64, message: String, data: Option<Value>) -> Self {
        match code {
            PARSE_ERROR => Self::ParseError,
            INVALID_REQUEST => Self::InvalidRequest,
            METHOD_NOT_FOUND => Self::MethodNotFound(strip_prefix(message, "Method not found: ")),
            INVALID_PARAMS => Self::InvalidParams(strip_prefix(message, "Invalid params: ")),
            INTERNAL_ERROR => Self::Internal(strip_prefix(message, "Internal error: ")),
            _ => Self::Application { message, data },
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

fn strip_prefix(message: String, prefix: &str) -> String {
    match message.strip_prefix(prefix) {
        Some(rest) => rest.to_string(),
        None => message,
    }
}
