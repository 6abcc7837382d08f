//! # Cloudstore Client
//!
//! Reliable, encrypted, chunked transfers to S3-compatible object stores.
//!
//! ## Features
//!
//! - **Chunked transfers**: files are split into parts that are uploaded,
//!   downloaded and copied concurrently
//! - **Client-side encryption**: every part is encrypted under a per-object
//!   content key sealed for up to four RSA recipients
//! - **End-to-end integrity**: part and object etags are checked against
//!   locally computed MD5 digests
//! - **Retries**: every remote call is retried with exponential backoff, and
//!   throttling responses back off further with full jitter
//! - **Directory operations**: upload, download, copy, rename and delete
//!   whole trees with bounded concurrency
//!
//! ## Example
//!
//! ```rust,ignore
//! use cloudstore_client::{CloudStoreClient, Config, DownloadOptions, UploadOptions};
//! use cloudstore_crypto::DirectoryKeyProvider;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = CloudStoreClient::builder(Config::from_env()?)
//!         .key_provider(Arc::new(DirectoryKeyProvider::new("/home/me/.keys")))
//!         .build()?;
//!
//!     // Upload, encrypted for "alice"
//!     let options = UploadOptions::default().with_encryption_key("alice");
//!     let stored = client.upload("backup.tar", "my-bucket", "backup.tar", options).await?;
//!     println!("uploaded {} ({:?})", stored.uri(), stored.etag);
//!
//!     // Anyone holding alice's private key can download it
//!     client
//!         .download("my-bucket", "backup.tar", "restored.tar", DownloadOptions::default())
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod copy;
mod directory;
mod download;
mod error;
mod fault;
mod http;
mod memory;
mod pending;
mod plan;
mod recipients;
mod retry;
mod session;
mod transport;
mod types;
mod upload;

pub use client::{ClientBuilder, CloudStoreClient};
pub use config::Config;
pub use copy::CopySession;
pub use directory::BatchResult;
pub use download::DownloadSession;
pub use error::{ClientError, Result};
pub use fault::{FailFirst, FaultInjector, FaultPoint, NoFaults};
pub use http::S3HttpTransport;
pub use memory::{CallCounts, MemoryStore};
pub use plan::{default_chunk_size, PartSpec, TransferPlan, DEFAULT_CHUNK_SIZE, MAX_PARTS};
pub use recipients::RecipientChange;
pub use retry::{ErrorClass, RetryEvent, RetryExecutor, RetryHook, RetryPolicy};
pub use session::{Session, SessionState};
pub use transport::{ByteRange, ByteStream, Lister, Transport};
pub use types::*;
pub use upload::UploadSession;
