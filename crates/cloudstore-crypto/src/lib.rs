//! # Cloudstore Crypto
//!
//! Client-side cryptography for cloudstore transfers.
//!
//! This crate provides:
//! - **Envelope encryption**: a random AES-256 content key per object, RSA-sealed
//!   for up to four named recipients
//! - **Part cipher**: AES-256-CBC with an inline IV, applied to every part
//!   independently so parts can be range-fetched and decrypted on their own
//! - **Digests**: streaming MD5 and multipart etag computation
//! - **Key providers**: in-memory and PEM-directory key lookup
//!
//! ## Example
//!
//! ```rust,ignore
//! use cloudstore_crypto::{EnvelopeKeyManager, DirectoryKeyProvider, encrypt_part, decrypt_part};
//! use std::sync::Arc;
//!
//! let manager = EnvelopeKeyManager::new(Arc::new(DirectoryKeyProvider::new("/home/me/.keys")));
//!
//! // Seal a fresh content key for "alice"
//! let (key, envelope) = manager.create("alice")?;
//! let ciphertext = encrypt_part(&key, b"Hello, World!")?;
//!
//! // Anyone holding alice's private key can recover it
//! let key = manager.open(&envelope, "alice")?;
//! let plaintext = decrypt_part(&key, &ciphertext)?;
//! ```

pub mod cipher;
pub mod envelope;
pub mod error;
pub mod hashing;
pub mod keys;

pub use cipher::{ciphertext_len, decrypt_part, encrypt_part, PartDecryptor, PartEncryptor, BLOCK_SIZE};
pub use envelope::{EncryptionEnvelope, EnvelopeKeyManager, SealedKey, MAX_RECIPIENTS};
pub use error::{CryptoError, Result};
pub use hashing::{
    digest_from_hex, md5_hex, multipart_etag, DigestHandle, Digester, HashingStream, Md5Digest,
};
pub use keys::{
    ContentKey, DirectoryKeyProvider, KeyPair, KeyProvider, MemoryKeyProvider, PrivateKey,
    PublicKey,
};
