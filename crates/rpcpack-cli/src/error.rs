//! CLI error types.

use thiserror::Error;

use rpcpack_protocol::ProtocolError;

use crate::tracing::TracingError;

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

/// Errors that can occur in the CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Input was not valid hex.
    #[error("invalid hex input: {0}")]
    Hex(#[from] hex::FromHexError),

    /// The message could not be decoded or rendered.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Logging could not be initialized.
    #[error(transparent)]
    Tracing(#[from] TracingError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_keep_their_message() {
        let err = CliError::from(ProtocolError::UnrecognizedMessage);
        assert_eq!(
            err.to_string(),
            "protocol error: unrecognized message: no method, result or error key"
        );
    }

    #[test]
    fn hex_errors_convert() {
        let err: CliError = hex::decode("zz").unwrap_err().into();
        assert!(err.to_string().starts_with("invalid hex input"));
    }
}
