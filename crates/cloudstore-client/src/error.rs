//! Client error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Error reported by the object store
    #[error("S3 error ({code}, status {status}): {message}")]
    S3Error {
        status: u16,
        code: String,
        message: String,
        request_id: Option<String>,
    },

    /// Bad caller input
    #[error("Usage error: {0}")]
    Usage(String),

    /// Digest mismatch at part or object level
    #[error("Bad hash for {scope}: expected {expected}, got {actual}")]
    BadHash {
        scope: String,
        expected: String,
        actual: String,
    },

    /// Object lacks the metadata this engine writes
    #[error("Object {bucket}/{key} was not uploaded by this tool")]
    NotUploadedByThisTool { bucket: String, key: String },

    /// Object written by an incompatible version
    #[error("Unsupported object version: {0}")]
    UnsupportedVersion(String),

    /// Truncated or malformed ciphertext
    #[error("Corrupt stream: {0}")]
    CorruptStream(String),

    /// Stream ended before the expected number of bytes
    #[error("Unexpected end of stream: expected {expected} bytes, got {actual}")]
    UnexpectedEof { expected: u64, actual: u64 },

    /// Object not found
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid response
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Failure raised by a fault injector
    #[error("Injected fault: {0}")]
    InjectedFault(String),

    /// Cryptographic error
    #[error("Crypto error: {0}")]
    Crypto(#[from] cloudstore_crypto::CryptoError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Some objects of a directory operation failed
    #[error("{failed} of {total} objects failed, first error: {first}")]
    Batch {
        failed: usize,
        total: usize,
        first: Box<ClientError>,
    },

    /// Background task failed to complete
    #[error("Task failed: {0}")]
    Join(String),
}

impl ClientError {
    /// Parse an S3 error from XML response
    pub fn from_s3_xml(xml: &str, status: u16) -> Self {
        let code = extract_xml_element(xml, "Code").unwrap_or_else(|| format!("HTTP{}", status));
        let message =
            extract_xml_element(xml, "Message").unwrap_or_else(|| "Unknown error".to_string());
        let request_id = extract_xml_element(xml, "RequestId");

        Self::S3Error {
            status,
            code,
            message,
            request_id,
        }
    }

    /// Shorthand for an S3-style service error
    pub fn service(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::S3Error {
            status,
            code: code.into(),
            message: message.into(),
            request_id: None,
        }
    }

    /// HTTP status carried by this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::S3Error { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
            || matches!(self, Self::S3Error { code, .. } if code == "NoSuchKey" || code == "NoSuchUpload")
            || self.status() == Some(404)
    }

    /// Service-reported rate limiting
    pub fn is_throttling(&self) -> bool {
        matches!(self, Self::S3Error { code, .. } if code == "SlowDown" || code == "Throttling" || code == "TooManyRequests")
            || self.status() == Some(429)
    }

    /// Missing, mismatched or unusable key material
    pub fn is_key_error(&self) -> bool {
        matches!(self, Self::Crypto(e) if e.is_key_error())
    }

    /// Bad caller input
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::Usage(_) | Self::Crypto(cloudstore_crypto::CryptoError::Usage(_))
        )
    }

    /// Digest mismatch
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, Self::BadHash { .. })
    }
}

pub(crate) fn extract_xml_element(xml: &str, element: &str) -> Option<String> {
    let start_tag = format!("<{}>", element);
    let end_tag = format!("</{}>", element);

    let start = xml.find(&start_tag)? + start_tag.len();
    let end = xml[start..].find(&end_tag)? + start;

    if start < end {
        Some(xml[start..end].to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_error() {
        let xml = r#"<?xml version="1.0"?>
<Error>
    <Code>NoSuchKey</Code>
    <Message>The specified key does not exist.</Message>
    <RequestId>abc123</RequestId>
</Error>"#;

        let error = ClientError::from_s3_xml(xml, 404);
        assert!(error.is_not_found());

        match error {
            ClientError::S3Error {
                status,
                code,
                message,
                request_id,
            } => {
                assert_eq!(status, 404);
                assert_eq!(code, "NoSuchKey");
                assert_eq!(message, "The specified key does not exist.");
                assert_eq!(request_id, Some("abc123".to_string()));
            }
            _ => panic!("Expected S3Error"),
        }
    }

    #[test]
    fn test_throttling_detection() {
        assert!(ClientError::service(503, "SlowDown", "reduce your request rate").is_throttling());
        assert!(ClientError::service(429, "Other", "too many").is_throttling());
        assert!(!ClientError::service(500, "InternalError", "oops").is_throttling());
    }

    #[test]
    fn test_key_and_usage_classification() {
        let err = ClientError::from(cloudstore_crypto::CryptoError::NoSuchKey("k".into()));
        assert!(err.is_key_error());
        assert!(!err.is_usage_error());

        let err = ClientError::from(cloudstore_crypto::CryptoError::Usage("too many".into()));
        assert!(err.is_usage_error());
        assert!(ClientError::Usage("x".into()).is_usage_error());
    }
}
