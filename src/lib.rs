//! # Cloudstore
//!
//! Umbrella crate re-exporting the cloudstore client engine and its crypto
//! primitives.

pub use cloudstore_client as client;
pub use cloudstore_crypto as crypto;

pub use cloudstore_client::{
    BatchResult, ClientError, CloudStoreClient, Config, CopyOptions, DownloadOptions,
    MemoryStore, S3HttpTransport, StoreFile, UploadOptions,
};
pub use cloudstore_crypto::{CryptoError, DirectoryKeyProvider, KeyPair, MemoryKeyProvider};
