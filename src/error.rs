//! WolfStore Error Types

use thiserror::Error;

/// Result type alias for WolfStore operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfStore error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid part size {part_size}: must be at least {minimum} bytes")]
    InvalidPartSize { part_size: u64, minimum: u64 },

    #[error("Payload of {payload_len} bytes needs {parts} parts, more than the maximum of {max_parts}")]
    TooManyParts { payload_len: u64, parts: u64, max_parts: u64 },

    // Backend errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage backend returned {status} {code}: {message}")]
    Backend { status: u16, code: String, message: String },

    #[error("Malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("Signing error: {0}")]
    Signing(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    // Multipart upload errors
    #[error("Failed to initiate multipart upload for {key}: {source}")]
    Initiation {
        key: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to upload part {part_number} of {key}: {source}")]
    PartUpload {
        key: String,
        part_number: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to complete multipart upload {upload_id} for {key}: {source}")]
    Completion {
        key: String,
        upload_id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to abort multipart upload {upload_id} for {key}: {source}")]
    Abort {
        key: String,
        upload_id: String,
        #[source]
        source: Box<Error>,
    },

    // Session errors
    #[error("Invalid upload session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Part {0} already recorded")]
    DuplicatePart(u32),

    #[error("Missing parts for completion: {0:?}")]
    MissingParts(Vec<u32>),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Check if this error is worth retrying against the backend
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout(_) => true,
            Error::Backend { status, code, .. } => {
                *status >= 500 || *status == 429 || code == "SlowDown" || code == "RequestTimeout"
            }
            _ => false,
        }
    }

    /// Short machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG_ERROR",
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::InvalidPartSize { .. } => "INVALID_PART_SIZE",
            Error::TooManyParts { .. } => "TOO_MANY_PARTS",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Backend { .. } => "BACKEND_ERROR",
            Error::MalformedResponse(_) => "MALFORMED_RESPONSE",
            Error::Signing(_) => "SIGNING_ERROR",
            Error::Network(_) => "NETWORK_ERROR",
            Error::Timeout(_) => "TIMEOUT",
            Error::Initiation { .. } => "INITIATION_FAILED",
            Error::PartUpload { .. } => "PART_UPLOAD_FAILED",
            Error::Completion { .. } => "COMPLETION_FAILED",
            Error::Abort { .. } => "ABORT_FAILED",
            Error::InvalidTransition { .. } | Error::DuplicatePart(_) | Error::MissingParts(_) => {
                "SESSION_ERROR"
            }
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Cancelled => "CANCELLED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::Timeout("upload part 3".into()).is_retryable());
        assert!(Error::Backend {
            status: 503,
            code: "SlowDown".into(),
            message: "reduce your request rate".into(),
        }
        .is_retryable());
        assert!(!Error::Backend {
            status: 400,
            code: "InvalidPart".into(),
            message: "part not found".into(),
        }
        .is_retryable());
        assert!(!Error::NotFound("key".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_nested_source_is_kept() {
        let err = Error::PartUpload {
            key: "video.mp4".into(),
            part_number: 2,
            source: Box::new(Error::Network("connection reset".into())),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Network error: connection reset"));
        assert_eq!(err.code(), "PART_UPLOAD_FAILED");
    }
}
