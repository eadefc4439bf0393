//! Error types for s7wire-client.

use thiserror::Error;

/// Main error type for all S7 operations.
#[derive(Debug, Error)]
pub enum S7Error {
    /// The connection is not open, or it dropped while the request was pending.
    #[error("Not connected")]
    NotConnected,

    /// No response arrived within the configured timeout.
    #[error("Read timeout for PDU reference {reference}")]
    ReadTimeout {
        /// PDU reference of the request that timed out.
        reference: u16,
    },

    /// The outgoing bytes could not be handed to the transport.
    #[error("Send failure")]
    SendFailure,

    /// A response could not be interpreted as the expected message kind.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The caller cancelled the pending wait.
    #[error("Cancelled")]
    Cancelled,

    /// The PLC answered with a non-zero error class/code.
    #[error("PLC error: class 0x{class:02X}, code 0x{code:02X}")]
    Plc {
        /// Error class from the ack header (or high byte of the userdata error code).
        class: u8,
        /// Error code from the ack header (or low byte of the userdata error code).
        code: u8,
    },

    /// A data item inside an otherwise successful response failed.
    #[error("Item failed with return code 0x{return_code:02X}")]
    ItemFailed {
        /// Return code of the failing item.
        return_code: u8,
    },

    /// Protocol violation (bad TPKT, unexpected COTP, oversized request, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid client configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl S7Error {
    /// Creates a `MalformedResponse` error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedResponse(reason.into())
    }

    /// Creates a `Protocol` error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    /// Returns true for errors that mean the session is gone.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::NotConnected | Self::SendFailure | Self::Io(_))
    }
}

/// Result type alias using S7Error.
pub type Result<T> = std::result::Result<T, S7Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(S7Error::NotConnected.to_string(), "Not connected");
        assert_eq!(
            S7Error::ReadTimeout { reference: 7 }.to_string(),
            "Read timeout for PDU reference 7"
        );
        assert_eq!(
            S7Error::Plc {
                class: 0x81,
                code: 0x04
            }
            .to_string(),
            "PLC error: class 0x81, code 0x04"
        );
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(S7Error::NotConnected.is_connection_error());
        assert!(S7Error::SendFailure.is_connection_error());
        assert!(!S7Error::Cancelled.is_connection_error());
        assert!(!S7Error::malformed("short").is_connection_error());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: S7Error = io.into();
        assert!(matches!(err, S7Error::Io(_)));
    }
}
