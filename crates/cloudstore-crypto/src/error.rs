//! Error types for the cloudstore-crypto crate

use thiserror::Error;

/// Result type alias using `CryptoError`
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The named recipient has no public key the provider can locate
    #[error("no encryption key named '{0}'")]
    NoEncryptionKey(String),

    /// The named private key is not available locally
    #[error("no private key named '{0}'")]
    NoSuchKey(String),

    /// The local key does not match the hash recorded on the object
    #[error("key '{name}' does not match the object: expected hash {expected}, got {actual}")]
    KeyMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// None of the recipients of an envelope can be opened locally
    #[error("no usable private key for any of: {0}")]
    MissingDecryptionKey(String),

    /// Bad caller input
    #[error("{0}")]
    Usage(String),

    /// Truncated or malformed ciphertext stream
    #[error("corrupt stream: {0}")]
    CorruptStream(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Invalid key format or length
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// An etag or digest string is not a hex MD5 digest
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Envelope fields are malformed
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Encryption failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption failed
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Base64 decode error
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

impl CryptoError {
    /// Key errors indicate a request that can never succeed
    pub fn is_key_error(&self) -> bool {
        matches!(
            self,
            Self::NoEncryptionKey(_)
                | Self::NoSuchKey(_)
                | Self::KeyMismatch { .. }
                | Self::MissingDecryptionKey(_)
        )
    }
}
