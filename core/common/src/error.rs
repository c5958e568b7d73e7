//! Common error types for FilenVault.

use thiserror::Error;

/// Top-level error type for FilenVault operations.
///
/// The variants follow how far a failure reaches: `Auth` ends the session,
/// key and decrypt failures end the single transfer, and `Network`/`Timeout`
/// are transient and may be retried.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad credentials or expired session. Requires a fresh login.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A wrapped key could not be unwrapped.
    ///
    /// The message never says why padding validation failed.
    #[error("Key unwrap failed: {0}")]
    KeyUnwrap(String),

    /// Ciphertext could not be decrypted with the given key.
    #[error("Decryption failed: {0}")]
    Decrypt(String),

    /// The service answered with a payload missing required fields.
    #[error("Protocol error from {endpoint}: {message}")]
    Protocol {
        /// Endpoint path that produced the payload.
        endpoint: String,
        /// What was wrong with it.
        message: String,
    },

    /// The service reported `status: false`.
    #[error("Request to {endpoint} rejected: {message}")]
    Api {
        /// Endpoint path.
        endpoint: String,
        /// Server-supplied message.
        message: String,
    },

    /// The upload prepare step failed.
    #[error("Upload prepare failed: {0}")]
    Prepare(String),

    /// A chunk could not be delivered.
    #[error("Upload of chunk {index} failed: {message}")]
    ChunkUpload {
        /// 1-based chunk index as sent on the wire.
        index: u64,
        /// Underlying failure.
        message: String,
    },

    /// A single listing entry could not be decrypted. Only produced by
    /// the directory resolver and never propagated past it.
    #[error("Entry {uuid} left undecrypted: {message}")]
    PartialDecrypt {
        /// Entry identifier.
        uuid: String,
        /// Underlying failure.
        message: String,
    },

    /// Transport failure (connection, 5xx).
    #[error("Network error: {0}")]
    Network(String),

    /// A single HTTP call exceeded its timeout.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether the failure is worth retrying with the same inputs.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }

    /// Build a protocol error for a missing field.
    pub fn missing_field(endpoint: &str, field: &str) -> Self {
        Error::Protocol {
            endpoint: endpoint.to_string(),
            message: format!("missing field `{}`", field),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("reset".to_string()).is_transient());
        assert!(Error::Timeout("/v3/upload".to_string()).is_transient());
        assert!(!Error::Decrypt("bad".to_string()).is_transient());
        assert!(!Error::Auth("expired".to_string()).is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn test_missing_field_message() {
        let err = Error::missing_field("/v3/login", "masterKeys");
        assert_eq!(
            err.to_string(),
            "Protocol error from /v3/login: missing field `masterKeys`"
        );
    }
}
