//! Chunked, optionally encrypted multipart upload
//!
//! An upload initiates a multipart write carrying the object metadata, sends
//! every planned part concurrently and completes the write once all parts
//! are in. Each part is read from the file, encrypted when a recipient is
//! given, digested on the way out and checked against the etag the store
//! returns. A mismatch fails that attempt and the whole part is re-read,
//! re-encrypted under a fresh IV and sent again.

use crate::fault::FaultPoint;
use crate::plan::{default_chunk_size, PartSpec, TransferPlan};
use crate::session::{join_parts, Engine, Session, SessionState};
use crate::types::{MultipartHandle, ObjectMetadata, StoreFile, UploadOptions};
use crate::{ClientError, Result};
use bytes::Bytes;
use cloudstore_crypto::{ciphertext_len, ContentKey, HashingStream, PartEncryptor};
use futures::{Stream, StreamExt};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, error, info, instrument};

/// Size of the reads feeding a part body
const READ_BUFFER: usize = 64 * 1024;

/// Upload of one local file to one object
pub struct UploadSession {
    engine: Arc<Engine>,
    source: PathBuf,
    bucket: String,
    key: String,
    options: UploadOptions,
    handle: OnceLock<MultipartHandle>,
    session: OnceLock<Arc<Session>>,
}

impl UploadSession {
    pub(crate) fn new(
        engine: Arc<Engine>,
        source: impl Into<PathBuf>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        options: UploadOptions,
    ) -> Self {
        Self {
            engine,
            source: source.into(),
            bucket: bucket.into(),
            key: key.into(),
            options,
            handle: OnceLock::new(),
            session: OnceLock::new(),
        }
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

    fn uri(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }

    /// Run the upload to completion
    #[instrument(skip(self), fields(source = %self.source.display(), dest = %self.uri()))]
    pub async fn run(&self) -> Result<StoreFile> {
        if self.session.get().is_some() {
            return Err(ClientError::Usage(format!(
                "upload to {} already started",
                self.uri()
            )));
        }

        let stat = tokio::fs::metadata(&self.source).await?;
        if !stat.is_file() {
            return Err(ClientError::Usage(format!(
                "{} is not a regular file",
                self.source.display()
            )));
        }
        let file_length = stat.len();
        let chunk_size = self
            .options
            .chunk_size
            .or(self.engine.config.chunk_size)
            .unwrap_or_else(|| default_chunk_size(file_length));

        let mut result = StoreFile::new(&self.bucket, &self.key);
        result.size = Some(file_length);
        result.local_file = Some(self.source.clone());

        if self.options.dry_run || self.engine.config.dry_run {
            info!(
                bytes = file_length,
                chunk_size,
                encrypt_for = ?self.options.encryption_key,
                "dry run: would upload"
            );
            return Ok(result);
        }

        let (content_key, envelope) = match &self.options.encryption_key {
            Some(recipient) => {
                let (key, envelope) = self.engine.key_manager()?.create(recipient)?;
                (Some(key), Some(envelope))
            }
            None => (None, None),
        };
        let plan = if content_key.is_some() {
            TransferPlan::encrypted(file_length, chunk_size)?
        } else {
            TransferPlan::plain(file_length, chunk_size)?
        };

        let mut metadata = ObjectMetadata::for_upload(chunk_size, file_length, envelope);
        for (k, v) in &self.options.metadata {
            metadata = metadata.with_user(k.as_str(), v.as_str());
        }
        let metadata = metadata.to_map();

        let engine = &self.engine;
        let acl = self.options.acl.as_deref();
        let handle = engine
            .remote(Some(FaultPoint::Initiate), &self.uri(), || {
                engine
                    .transport
                    .initiate_multipart(&self.bucket, &self.key, &metadata, acl)
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
            "upload initiated"
        );

        match self.transfer(&handle, &session, &plan, content_key).await {
            Ok(etag) => {
                info!(upload_id = %handle.upload_id, etag = %etag, "upload complete");
                result.etag = Some(etag);
                Ok(result)
            }
            Err(e) => {
                session.fail();
                error!(upload_id = %handle.upload_id, error = %e, "upload failed");
                Err(e)
            }
        }
    }

    async fn transfer(
        &self,
        handle: &MultipartHandle,
        session: &Arc<Session>,
        plan: &TransferPlan,
        content_key: Option<ContentKey>,
    ) -> Result<String> {
        session.transition(SessionState::PartsInFlight)?;

        let tasks: Vec<_> = plan
            .parts()
            .iter()
            .map(|part| {
                let engine = Arc::clone(&self.engine);
                let session = Arc::clone(session);
                let handle = handle.clone();
                let source = self.source.clone();
                let content_key = content_key.clone();
                let part = *part;
                async move {
                    let etag =
                        upload_part(&engine, &handle, &source, part, content_key.as_ref()).await?;
                    session.record_part(part.index, etag)
                }
            })
            .collect();
        join_parts(tasks).await?;

        self.engine
            .complete(handle, session, plan.part_count())
            .await
    }

    /// Abort the multipart write; parts already sent are discarded by the store
    #[instrument(skip(self), fields(dest = %self.uri()))]
    pub async fn abort(&self) -> Result<()> {
        match (self.handle.get(), self.session.get()) {
            (Some(handle), Some(session)) => self.engine.abort(handle, session).await,
            _ => Err(ClientError::Usage(format!(
                "upload to {} was never initiated",
                self.uri()
            ))),
        }
    }
}

/// Send one part, retrying the whole part on any retryable failure
async fn upload_part(
    engine: &Engine,
    handle: &MultipartHandle,
    source: &Path,
    part: PartSpec,
    content_key: Option<&ContentKey>,
) -> Result<String> {
    let id = format!("{}/{}#{}", handle.bucket, handle.key, part.part_number());
    let length = match content_key {
        Some(_) => ciphertext_len(part.plaintext_len),
        None => part.plaintext_len,
    };
    debug!(part = %id, offset = part.plaintext_start, length, "uploading part");

    engine
        .remote(Some(FaultPoint::UploadPart), &id, || async move {
            let encryptor = content_key.map(PartEncryptor::new).transpose()?;
            let body = part_body(source, part, encryptor).await?;
            let (body, digest) = HashingStream::new(body);

            let etag = engine
                .transport
                .upload_part(handle, part.part_number(), body.boxed(), length)
                .await?;
            let etag = etag.trim_matches('"').to_ascii_lowercase();

            let local = digest
                .finalize()
                .map(hex::encode)
                .ok_or_else(|| ClientError::InvalidResponse("part digest already taken".into()))?;
            if etag != local {
                return Err(ClientError::BadHash {
                    scope: format!("part {} of {}/{}", part.part_number(), handle.bucket, handle.key),
                    expected: local,
                    actual: etag,
                });
            }
            Ok(etag)
        })
        .await
}

struct PartReader {
    file: File,
    expected: u64,
    read: u64,
    encryptor: Option<PartEncryptor>,
    finished: bool,
}

impl PartReader {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if self.read == self.expected {
                self.finished = true;
                return Ok(self.encryptor.take().map(|e| Bytes::from(e.finalize())));
            }

            let want = (self.expected - self.read).min(READ_BUFFER as u64) as usize;
            let mut buf = vec![0u8; want];
            let n = self.file.read(&mut buf).await?;
            if n == 0 {
                return Err(ClientError::UnexpectedEof {
                    expected: self.expected,
                    actual: self.read,
                });
            }
            buf.truncate(n);
            self.read += n as u64;

            let out = match self.encryptor.as_mut() {
                Some(encryptor) => encryptor.update(&buf),
                None => buf,
            };
            if !out.is_empty() {
                return Ok(Some(Bytes::from(out)));
            }
        }
    }
}

/// Stream the bytes of one part, encrypting them when an encryptor is given
async fn part_body(
    source: &Path,
    part: PartSpec,
    encryptor: Option<PartEncryptor>,
) -> Result<impl Stream<Item = Result<Bytes>> + Send + 'static> {
    let mut file = File::open(source).await?;
    file.seek(SeekFrom::Start(part.plaintext_start)).await?;

    let reader = PartReader {
        file,
        expected: part.plaintext_len,
        read: 0,
        encryptor,
        finished: false,
    };
    Ok(futures::stream::try_unfold(reader, |mut reader| async move {
        let chunk = reader.next_chunk().await?;
        Ok::<_, ClientError>(chunk.map(|chunk| (chunk, reader)))
    }))
}
