use thiserror::Error;

use crate::types::Decimal;

/// HTTP error classification
#[derive(Error, Debug, Clone)]
pub enum HttpErrorKind {
    #[error("Client error: {message}")]
    Client { message: String },
    #[error("Server error: {message}")]
    Server { message: String },
}

/// Main SDK error type
#[derive(Error, Debug, Clone)]
pub enum Error {
    // === Caller errors ===
    /// Operation is not valid in the current state (precondition violation).
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Redemption amount resolves to nothing redeemable.
    #[error("Amount too low to redeem (try at least {minimum})")]
    AmountTooSmall { minimum: Decimal },

    /// A user-scoped read was made without an address and the connection has none.
    #[error("No user address configured for this connection")]
    NoUserAddress,

    /// Position change parameters are contradictory or empty.
    #[error("Invalid position change: {0}")]
    InvalidPositionChange(String),

    /// Decimal string could not be parsed.
    #[error("Invalid decimal: {0}")]
    InvalidDecimal(String),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    // === Transport errors ===
    /// HTTP error with status code and classification
    #[error("HTTP error (status {status}): {kind}")]
    Http { status: u16, kind: HttpErrorKind },

    /// Error object returned by the JSON-RPC endpoint
    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<String>,
    },

    /// Generic request error (connection refused, timeout, ...)
    #[error("Generic request error: {0}")]
    GenericRequest(String),

    /// WebSocket connection error
    #[error("Websocket error: {0}")]
    Websocket(String),

    /// Remote answered with something that violates the call contract.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    // === Parsing errors ===
    /// JSON parse error
    #[error("Json parse error: {0}")]
    JsonParse(String),

    /// ABI decoding of a call result failed
    #[error("ABI decode error: {0}")]
    AbiDecode(String),
}

// Convenience constructors for common error patterns
impl Error {
    /// Create an HTTP client error
    pub fn client_error(status: u16, message: String) -> Self {
        Error::Http {
            status,
            kind: HttpErrorKind::Client { message },
        }
    }

    /// Create an HTTP server error
    pub fn server_error(status: u16, message: String) -> Self {
        Error::Http {
            status,
            kind: HttpErrorKind::Server { message },
        }
    }

    /// Create a JSON parse error
    pub fn json_parse(msg: impl Into<String>) -> Self {
        Error::JsonParse(msg.into())
    }

    /// Create a WebSocket connection error
    pub fn ws_connection(msg: impl Into<String>) -> Self {
        Error::Websocket(msg.into())
    }

    /// Whether this error came from talking to the remote (as opposed to a
    /// precondition violation on the caller's side).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Http { .. }
                | Error::Rpc { .. }
                | Error::GenericRequest(_)
                | Error::Websocket(_)
                | Error::InvalidResponse(_)
                | Error::JsonParse(_)
                | Error::AbiDecode(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(Error::GenericRequest("timeout".to_string()).is_transport());
        assert!(Error::server_error(503, "unavailable".to_string()).is_transport());
        assert!(!Error::UnsupportedOperation("increase".to_string()).is_transport());
        assert!(!Error::AmountTooSmall {
            minimum: Decimal::from(180u64)
        }
        .is_transport());
    }

    #[test]
    fn test_amount_too_small_display() {
        let err = Error::AmountTooSmall {
            minimum: Decimal::from(180u64),
        };
        assert_eq!(err.to_string(), "Amount too low to redeem (try at least 180)");
    }
}
