//! Server-side multipart copy
//!
//! Stored bytes are copied range by range with the source's own part layout,
//! so encrypted objects are copied without being decrypted. Objects that
//! were stored without chunk metadata get it synthesized on the copy.

use crate::fault::FaultPoint;
use crate::plan::{default_chunk_size, TransferPlan};
use crate::session::{join_parts, Engine, Session, SessionState};
use crate::types::{CopyOptions, MultipartHandle, ObjectMetadata, StoreFile, FORMAT_VERSION};
use crate::{ClientError, Result};
use cloudstore_crypto::EncryptionEnvelope;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, instrument};

/// Copy of one object to another location in the store
pub struct CopySession {
    engine: Arc<Engine>,
    source_bucket: String,
    source_key: String,
    dest_bucket: String,
    dest_key: String,
    options: CopyOptions,
    envelope: Option<EncryptionEnvelope>,
    handle: OnceLock<MultipartHandle>,
    session: OnceLock<Arc<Session>>,
}

impl CopySession {
    pub(crate) fn new(
        engine: Arc<Engine>,
        source: (&str, &str),
        dest: (&str, &str),
        options: CopyOptions,
    ) -> Self {
        Self {
            engine,
            source_bucket: source.0.to_string(),
            source_key: source.1.to_string(),
            dest_bucket: dest.0.to_string(),
            dest_key: dest.1.to_string(),
            options,
            envelope: None,
            handle: OnceLock::new(),
            session: OnceLock::new(),
        }
    }

    /// Write this envelope on the destination instead of the source's
    pub(crate) fn with_envelope(mut self, envelope: EncryptionEnvelope) -> Self {
        self.envelope = Some(envelope);
        self
    }

    /// Session state, once the multipart write has been initiated
    pub fn state(&self) -> Option<SessionState> {
        self.session.get().map(|s| s.state())
    }

    /// Session, once the multipart write has been initiated
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.get()
    }

    /// Remote multipart handle, once initiated
    pub fn handle(&self) -> Option<&MultipartHandle> {
        self.handle.get()
    }

    fn source_uri(&self) -> String {
        format!("{}/{}", self.source_bucket, self.source_key)
    }

    fn dest_uri(&self) -> String {
        format!("{}/{}", self.dest_bucket, self.dest_key)
    }

    /// Run the copy to completion
    #[instrument(skip(self), fields(source = %self.source_uri(), dest = %self.dest_uri()))]
    pub async fn run(&self) -> Result<StoreFile> {
        if self.session.get().is_some() {
            return Err(ClientError::Usage(format!(
                "copy to {} already started",
                self.dest_uri()
            )));
        }

        let mut result = StoreFile::new(&self.dest_bucket, &self.dest_key);
        if self.options.dry_run || self.engine.config.dry_run {
            info!("dry run: would copy");
            return Ok(result);
        }

        let (remote, source) = self
            .engine
            .head(&self.source_bucket, &self.source_key)
            .await?;
        let source = self.backfill(source, remote.content_length)?;
        let (chunk_size, file_length) = source.layout(&self.source_bucket, &self.source_key)?;
        let plan = if source.is_encrypted() {
            TransferPlan::encrypted(file_length, chunk_size)?
        } else {
            TransferPlan::plain(file_length, chunk_size)?
        };

        let envelope = self.envelope.clone().or(source.envelope.clone());
        let mut dest = ObjectMetadata::for_upload(chunk_size, file_length, envelope);
        match &self.options.user_metadata {
            Some(user) => {
                for (k, v) in user {
                    dest = dest.with_user(k.as_str(), v.as_str());
                }
            }
            None => dest.user = source.user.clone(),
        }
        let metadata = dest.to_map();

        let engine = &self.engine;
        let acl = self.options.acl.as_deref();
        let handle = engine
            .remote(Some(FaultPoint::Initiate), &self.dest_uri(), || {
                engine
                    .transport
                    .initiate_multipart(&self.dest_bucket, &self.dest_key, &metadata, acl)
            })
            .await?;
        let handle = self.handle.get_or_init(|| handle).clone();
        let session = self
            .session
            .get_or_init(|| Arc::new(Session::new(&handle.upload_id)))
            .clone();
        info!(
            upload_id = %handle.upload_id,
            bytes = file_length,
            parts = plan.part_count(),
            encrypted = plan.is_encrypted(),
            "copy initiated"
        );

        match self
            .transfer(&handle, &session, &plan, remote.content_length)
            .await
        {
            Ok(etag) => {
                info!(upload_id = %handle.upload_id, etag = %etag, "copy complete");
                result.etag = Some(etag);
                result.size = Some(file_length);
                Ok(result)
            }
            Err(e) => {
                session.fail();
                error!(upload_id = %handle.upload_id, error = %e, "copy failed");
                Err(e)
            }
        }
    }

    /// Give objects stored without chunk metadata a single-pass layout
    fn backfill(&self, mut metadata: ObjectMetadata, content_length: u64) -> Result<ObjectMetadata> {
        if metadata.is_self_describing() {
            return Ok(metadata);
        }
        if metadata.is_encrypted() {
            return Err(ClientError::NotUploadedByThisTool {
                bucket: self.source_bucket.clone(),
                key: self.source_key.clone(),
            });
        }
        let chunk_size = self
            .engine
            .config
            .chunk_size
            .unwrap_or_else(|| default_chunk_size(content_length));
        debug!(chunk_size, content_length, "synthesizing layout metadata");
        metadata.version = Some(FORMAT_VERSION.to_string());
        metadata.chunk_size = Some(chunk_size);
        metadata.file_length = Some(content_length);
        Ok(metadata)
    }

    async fn transfer(
        &self,
        handle: &MultipartHandle,
        session: &Arc<Session>,
        plan: &TransferPlan,
        object_length: u64,
    ) -> Result<String> {
        session.transition(SessionState::PartsInFlight)?;

        let tasks: Vec<_> = plan
            .parts()
            .iter()
            .map(|part| {
                let engine = Arc::clone(&self.engine);
                let session = Arc::clone(session);
                let handle = handle.clone();
                let source_bucket = self.source_bucket.clone();
                let source_key = self.source_key.clone();
                let range = plan.remote_range(part, object_length);
                let index = part.index;
                let part_number = part.part_number();
                async move {
                    let id = format!("{}/{}#{}", handle.bucket, handle.key, part_number);
                    debug!(part = %id, ?range, "copying part");
                    let etag = engine
                        .remote(Some(FaultPoint::CopyPart), &id, || {
                            engine.transport.copy_part_range(
                                &source_bucket,
                                &source_key,
                                &handle,
                                part_number,
                                range,
                            )
                        })
                        .await?;
                    session.record_part(index, etag.trim_matches('"').to_ascii_lowercase())
                }
            })
            .collect();
        join_parts(tasks).await?;

        self.engine
            .complete(handle, session, plan.part_count())
            .await
    }

    /// Abort the multipart write
    #[instrument(skip(self), fields(dest = %self.dest_uri()))]
    pub async fn abort(&self) -> Result<()> {
        match (self.handle.get(), self.session.get()) {
            (Some(handle), Some(session)) => self.engine.abort(handle, session).await,
            _ => Err(ClientError::Usage(format!(
                "copy to {} was never initiated",
                self.dest_uri()
            ))),
        }
    }
}

/// Whether an object exists; a missing object is an answer, not a failure
async fn object_exists(engine: &Engine, bucket: &str, key: &str) -> Result<bool> {
    engine
        .remote(None, &format!("head {}/{}", bucket, key), || {
            let lookup = engine.transport.get_metadata(bucket, key);
            async move {
                match lookup.await {
                    Ok(_) => Ok(true),
                    Err(e) if e.is_not_found() => Ok(false),
                    Err(e) => Err(e),
                }
            }
        })
        .await
}

/// Copy an object to a new location, then delete the source.
///
/// The destination must not exist yet. When the copied object fails
/// verification after being committed, the destination is deleted again and
/// the source is left in place.
#[instrument(skip(engine, options))]
pub(crate) async fn rename(
    engine: Arc<Engine>,
    source: (&str, &str),
    dest: (&str, &str),
    options: CopyOptions,
) -> Result<StoreFile> {
    if source == dest {
        return Err(ClientError::Usage(format!(
            "cannot rename {}/{} onto itself",
            source.0, source.1
        )));
    }
    if !object_exists(&engine, source.0, source.1).await? {
        return Err(ClientError::Usage(format!(
            "source object {}/{} does not exist",
            source.0, source.1
        )));
    }
    if object_exists(&engine, dest.0, dest.1).await? {
        return Err(ClientError::Usage(format!(
            "cannot overwrite existing destination object {}/{}",
            dest.0, dest.1
        )));
    }
    let dry_run = options.dry_run || engine.config.dry_run;

    let copy = CopySession::new(Arc::clone(&engine), source, dest, options);
    let copied = match copy.run().await {
        Ok(copied) => copied,
        Err(e) => {
            if matches!(e, ClientError::BadHash { .. }) {
                let removed = engine
                    .remote(None, &format!("delete {}/{}", dest.0, dest.1), || {
                        engine.transport.delete_object(dest.0, dest.1)
                    })
                    .await;
                if let Err(cleanup) = removed {
                    error!(error = %cleanup, "could not delete unverified copy");
                }
            }
            return Err(e);
        }
    };
    if dry_run {
        return Ok(copied);
    }

    engine
        .remote(None, &format!("delete {}/{}", source.0, source.1), || {
            engine.transport.delete_object(source.0, source.1)
        })
        .await?;
    info!("renamed");
    Ok(copied)
}
