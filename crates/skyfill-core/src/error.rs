//! Error types shared across the skyfill pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling records and wire messages.
#[derive(Error, Debug)]
pub enum Error {
    /// A record key is not a well-formed TID.
    #[error("invalid record key '{key}': {reason}")]
    InvalidKey {
        /// The offending key.
        key: String,
        /// Description of what's wrong.
        reason: &'static str,
    },

    /// A record URI could not be parsed.
    #[error("invalid record URI '{0}'")]
    InvalidUri(String),

    /// A content identifier could not be parsed.
    #[error("invalid CID '{cid}': {reason}")]
    InvalidCid {
        /// The string that failed to parse.
        cid: String,
        /// Parser error message.
        reason: String,
    },

    /// A wire message is missing a required field or has an unknown shape.
    #[error("invalid commit message: {0}")]
    InvalidMessage(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_key_display() {
        let err = Error::InvalidKey {
            key: "self".to_string(),
            reason: "wrong length",
        };
        let msg = err.to_string();
        assert!(msg.contains("self"));
        assert!(msg.contains("wrong length"));
    }

    #[test]
    fn test_invalid_cid_display() {
        let err = Error::InvalidCid {
            cid: "bafy???".to_string(),
            reason: "unknown multibase".to_string(),
        };
        assert!(err.to_string().contains("bafy???"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().contains("JSON error"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
