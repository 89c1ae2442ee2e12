//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Truncated or otherwise malformed wire data.
    #[error("decode failed: {0}")]
    Decode(String),

    /// A value could not be written.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The envelope carried none of `method`, `result` or `error`.
    #[error("unrecognized message: no method, result or error key")]
    UnrecognizedMessage,

    /// `params` was neither an array, a map nor nil.
    #[error("expected map or array of arguments, found {found}")]
    InvalidArguments { found: String },

    /// A required envelope field was absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// No formatter resolved for a value's type.
    #[error("no formatter registered for type {0}")]
    UnsupportedType(&'static str),

    /// Input buffer exceeds the configured limit.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The out-of-band channel facility refused or failed an operation.
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// IO error while reading or writing raw bytes.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Creates a decode error.
    pub fn decode(message: impl std::fmt::Display) -> Self {
        Self::Decode(message.to_string())
    }

    /// Creates an encode error.
    pub fn encode(message: impl std::fmt::Display) -> Self {
        Self::Encode(message.to_string())
    }

    /// Creates an error for data that ended in the middle of a value.
    pub fn truncated(needed: usize, remaining: usize) -> Self {
        Self::Decode(format!(
            "unexpected end of input: needed {} bytes, {} remaining",
            needed, remaining
        ))
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::encode(err)
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::decode(err)
    }
}

/// Outcome of a failed deferred decode.
///
/// `NotFound` and `Mismatch` are routine: a dispatcher trying several
/// overloads expects them. `Completed` and `Busy` signal host misuse.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No argument at that name or position.
    #[error("argument not found")]
    NotFound,

    /// The captured bytes do not decode as the requested type.
    #[error("cannot decode as {type_name}: {reason}")]
    Mismatch {
        type_name: &'static str,
        reason: String,
    },

    /// The payload is an in-memory value rather than captured bytes.
    #[error("payload was not captured from the wire")]
    Materialized,

    /// `deserialization_complete` already released the input buffer.
    #[error("deserialization already completed for this message")]
    Completed,

    /// Another message decode is in flight on the same formatter.
    #[error("formatter is already decoding message {0}")]
    Busy(String),
}

impl ResolveError {
    /// Returns true when the failure is a type mismatch.
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::Mismatch { .. })
    }

    pub(crate) fn mismatch(type_name: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Mismatch {
            type_name,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_message_mentions_counts() {
        let err = ProtocolError::truncated(4, 1);
        let text = err.to_string();
        assert!(text.contains("needed 4"));
        assert!(text.contains("1 remaining"));
    }

    #[test]
    fn invalid_arguments_display() {
        let err = ProtocolError::InvalidArguments {
            found: "string".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "expected map or array of arguments, found string"
        );
    }

    #[test]
    fn mismatch_is_distinguishable() {
        let err = ResolveError::mismatch("i64", "invalid type");
        assert!(err.is_mismatch());
        assert!(!ResolveError::NotFound.is_mismatch());
        assert!(!ResolveError::Completed.is_mismatch());
    }
}
