//! Main client implementation

use crate::copy::{rename, CopySession};
use crate::directory::{self, BatchResult};
use crate::download::DownloadSession;
use crate::fault::{FaultInjector, NoFaults};
use crate::http::S3HttpTransport;
use crate::pending;
use crate::recipients::{rotate, RecipientChange};
use crate::retry::{RetryEvent, RetryExecutor, RetryHook, RetryPolicy};
use crate::session::Engine;
use crate::transport::{Lister, Transport};
use crate::types::{
    CopyOptions, DownloadOptions, MultipartHandle, ObjectMetadata, StoreFile, UploadOptions,
};
use crate::upload::UploadSession;
use crate::{ClientError, Config, Result};
use chrono::{DateTime, Utc};
use cloudstore_crypto::{EnvelopeKeyManager, KeyProvider};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument};

/// Builder for [`CloudStoreClient`]
pub struct ClientBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    lister: Option<Arc<dyn Lister>>,
    keys: Option<Arc<dyn KeyProvider>>,
    faults: Arc<dyn FaultInjector>,
    on_retry: Option<RetryHook>,
}

impl ClientBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            transport: None,
            lister: None,
            keys: None,
            faults: Arc::new(NoFaults),
            on_retry: None,
        }
    }

    /// Use a store that serves both object transfers and listings
    pub fn store<S: Transport + Lister + 'static>(mut self, store: Arc<S>) -> Self {
        let transport: Arc<dyn Transport> = store.clone();
        let lister: Arc<dyn Lister> = store;
        self.transport = Some(transport);
        self.lister = Some(lister);
        self
    }

    /// Use a specific transport
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a specific lister
    pub fn lister(mut self, lister: Arc<dyn Lister>) -> Self {
        self.lister = Some(lister);
        self
    }

    /// Where encryption keys are looked up
    pub fn key_provider(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Inject failures before remote calls
    pub fn fault_injector(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    /// Observe every retry
    pub fn on_retry(mut self, hook: impl Fn(&RetryEvent) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Build the client; without a transport the S3 HTTP transport is used
    pub fn build(self) -> Result<CloudStoreClient> {
        self.config.validate()?;

        let (transport, lister) = match self.transport {
            Some(transport) => (transport, self.lister),
            None => {
                let http = Arc::new(S3HttpTransport::new(self.config.clone())?);
                let transport: Arc<dyn Transport> = http.clone();
                let lister: Arc<dyn Lister> = http;
                (transport, Some(self.lister.unwrap_or(lister)))
            }
        };

        let mut executor = RetryExecutor::new(RetryPolicy::from_config(&self.config));
        if let Some(hook) = self.on_retry {
            executor = executor.with_retry_hook(hook);
        }

        let engine = Engine {
            transport,
            lister,
            keys: self.keys.map(EnvelopeKeyManager::new),
            executor,
            requests: Arc::new(Semaphore::new(self.config.max_concurrent_requests)),
            transfers: Arc::new(Semaphore::new(self.config.max_concurrent_transfers)),
            faults: self.faults,
            config: self.config,
        };
        Ok(CloudStoreClient {
            engine: Arc::new(engine),
        })
    }
}

/// Client for chunked, encrypted transfers
#[derive(Clone)]
pub struct CloudStoreClient {
    engine: Arc<Engine>,
}

impl CloudStoreClient {
    /// Create a client talking S3 over HTTP
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start building a client
    pub fn builder(config: Config) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.engine.config
    }

    // ==================== Sessions ====================

    /// Prepare an upload whose state can be observed and which can be aborted
    pub fn upload_session(
        &self,
        source: impl Into<PathBuf>,
        bucket: &str,
        key: &str,
        options: UploadOptions,
    ) -> UploadSession {
        UploadSession::new(Arc::clone(&self.engine), source, bucket, key, options)
    }

    /// Prepare a download whose state can be observed
    pub fn download_session(
        &self,
        bucket: &str,
        key: &str,
        dest: impl Into<PathBuf>,
        options: DownloadOptions,
    ) -> DownloadSession {
        DownloadSession::new(Arc::clone(&self.engine), bucket, key, dest, options)
    }

    /// Prepare a server-side copy whose state can be observed and which can be aborted
    pub fn copy_session(
        &self,
        source: (&str, &str),
        dest: (&str, &str),
        options: CopyOptions,
    ) -> CopySession {
        CopySession::new(Arc::clone(&self.engine), source, dest, options)
    }

    // ==================== Object Operations ====================

    /// Upload a local file
    pub async fn upload(
        &self,
        source: impl AsRef<Path>,
        bucket: &str,
        key: &str,
        options: UploadOptions,
    ) -> Result<StoreFile> {
        self.upload_session(source.as_ref(), bucket, key, options)
            .run()
            .await
    }

    /// Download an object to a local file
    pub async fn download(
        &self,
        bucket: &str,
        key: &str,
        dest: impl AsRef<Path>,
        options: DownloadOptions,
    ) -> Result<StoreFile> {
        self.download_session(bucket, key, dest.as_ref(), options)
            .run()
            .await
    }

    /// Copy an object server-side
    pub async fn copy(
        &self,
        source: (&str, &str),
        dest: (&str, &str),
        options: CopyOptions,
    ) -> Result<StoreFile> {
        self.copy_session(source, dest, options).run().await
    }

    /// Move an object to a destination that does not exist yet: copy, then delete the source
    pub async fn rename(
        &self,
        source: (&str, &str),
        dest: (&str, &str),
        options: CopyOptions,
    ) -> Result<StoreFile> {
        rename(Arc::clone(&self.engine), source, dest, options).await
    }

    /// Check if an object exists
    #[instrument(skip(self))]
    pub async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        match self.engine.head(bucket, key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Parsed metadata of an object
    #[instrument(skip(self))]
    pub async fn metadata(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        self.engine.head(bucket, key).await.map(|(_, metadata)| metadata)
    }

    /// Delete an object
    #[instrument(skip(self))]
    pub async fn delete(&self, bucket: &str, key: &str, dry_run: bool) -> Result<()> {
        if dry_run || self.engine.config.dry_run {
            info!("dry run: would delete");
            return Ok(());
        }
        let engine = &self.engine;
        engine
            .remote(None, &format!("delete {}/{}", bucket, key), || {
                engine.transport.delete_object(bucket, key)
            })
            .await?;
        debug!("deleted");
        Ok(())
    }

    // ==================== Recipients ====================

    /// Allow another key to decrypt an encrypted object
    pub async fn add_encryption_key(
        &self,
        bucket: &str,
        key: &str,
        name: &str,
        dry_run: bool,
    ) -> Result<StoreFile> {
        let change = RecipientChange::Add(name.to_string());
        rotate(Arc::clone(&self.engine), bucket, key, change, dry_run).await
    }

    /// Stop a key from decrypting an encrypted object
    pub async fn remove_encryption_key(
        &self,
        bucket: &str,
        key: &str,
        name: &str,
        dry_run: bool,
    ) -> Result<StoreFile> {
        let change = RecipientChange::Remove(name.to_string());
        rotate(Arc::clone(&self.engine), bucket, key, change, dry_run).await
    }

    // ==================== Pending Uploads ====================

    /// Multipart writes that were started but never completed or aborted
    pub async fn list_pending_uploads(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<MultipartHandle>> {
        pending::list(&self.engine, bucket, prefix).await
    }

    /// Abort one pending multipart write
    pub async fn abort_pending_upload(&self, handle: &MultipartHandle, dry_run: bool) -> Result<()> {
        pending::abort(&self.engine, handle, dry_run).await
    }

    /// Abort pending multipart writes initiated before `before`
    pub async fn abort_old_pending_uploads(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        before: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<Vec<MultipartHandle>> {
        pending::abort_older_than(&self.engine, bucket, prefix, before, dry_run).await
    }

    // ==================== Directory Operations ====================

    /// Upload a local directory tree under a key prefix
    pub async fn upload_directory(
        &self,
        root: impl AsRef<Path>,
        bucket: &str,
        prefix: &str,
        options: UploadOptions,
    ) -> Result<BatchResult> {
        directory::upload_dir(Arc::clone(&self.engine), root.as_ref(), bucket, prefix, options)
            .await
    }

    /// Download every object under a prefix into a local directory
    pub async fn download_directory(
        &self,
        bucket: &str,
        prefix: &str,
        root: impl AsRef<Path>,
        options: DownloadOptions,
    ) -> Result<BatchResult> {
        directory::download_dir(Arc::clone(&self.engine), bucket, prefix, root.as_ref(), options)
            .await
    }

    /// Copy every object under a prefix
    pub async fn copy_directory(
        &self,
        source: (&str, &str),
        dest: (&str, &str),
        options: CopyOptions,
    ) -> Result<BatchResult> {
        directory::copy_dir(Arc::clone(&self.engine), source, dest, options).await
    }

    /// Move every object under a prefix
    pub async fn rename_directory(
        &self,
        source: (&str, &str),
        dest: (&str, &str),
        options: CopyOptions,
    ) -> Result<BatchResult> {
        directory::rename_dir(Arc::clone(&self.engine), source, dest, options).await
    }

    /// Delete every object under a prefix
    pub async fn delete_directory(
        &self,
        bucket: &str,
        prefix: &str,
        force: bool,
        dry_run: bool,
    ) -> Result<BatchResult> {
        directory::delete_dir(Arc::clone(&self.engine), bucket, prefix, force, dry_run).await
    }
}

impl std::fmt::Debug for CloudStoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudStoreClient")
            .field("endpoint", &self.engine.config.endpoint)
            .field("encryption", &self.engine.keys.is_some())
            .finish()
    }
}
