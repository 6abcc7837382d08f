//! Concurrent ranged download with per-part decryption
//!
//! The part layout is rebuilt from the chunk size and length recorded on the
//! object, so any part can be fetched on its own. Parts are written straight
//! to their offset in the destination file and may finish in any order.

use crate::fault::FaultPoint;
use crate::plan::{PartSpec, TransferPlan};
use crate::session::{join_parts, Engine, Session, SessionState};
use crate::types::{DownloadOptions, StoreFile};
use crate::{ClientError, Result};
use cloudstore_crypto::{ContentKey, Digester, PartDecryptor};
use futures::StreamExt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, instrument, warn};

/// Download of one object to one local file
pub struct DownloadSession {
    engine: Arc<Engine>,
    bucket: String,
    key: String,
    dest: PathBuf,
    options: DownloadOptions,
    session: OnceLock<Arc<Session>>,
}

impl DownloadSession {
    pub(crate) fn new(
        engine: Arc<Engine>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        dest: impl Into<PathBuf>,
        options: DownloadOptions,
    ) -> Self {
        Self {
            engine,
            bucket: bucket.into(),
            key: key.into(),
            dest: dest.into(),
            options,
            session: OnceLock::new(),
        }
    }

    /// Session state, once parts have been planned
    pub fn state(&self) -> Option<SessionState> {
        self.session.get().map(|s| s.state())
    }

    /// Session, once parts have been planned
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.get()
    }

    fn uri(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }

    /// Run the download to completion
    #[instrument(skip(self), fields(source = %self.uri(), dest = %self.dest.display()))]
    pub async fn run(&self) -> Result<StoreFile> {
        if self.session.get().is_some() {
            return Err(ClientError::Usage(format!(
                "download of {} already started",
                self.uri()
            )));
        }
        if !self.options.overwrite && tokio::fs::try_exists(&self.dest).await? {
            return Err(ClientError::Usage(format!(
                "{} already exists",
                self.dest.display()
            )));
        }

        let mut result = StoreFile::new(&self.bucket, &self.key);
        result.local_file = Some(self.dest.clone());

        if self.options.dry_run || self.engine.config.dry_run {
            info!("dry run: would download");
            return Ok(result);
        }

        let (remote, metadata) = self.engine.head(&self.bucket, &self.key).await?;
        let (chunk_size, file_length) = metadata.layout(&self.bucket, &self.key)?;

        let content_key = match &metadata.envelope {
            Some(envelope) => Some(self.engine.key_manager()?.open_any(envelope)?),
            None => None,
        };
        let plan = if content_key.is_some() {
            TransferPlan::encrypted(file_length, chunk_size)?
        } else {
            TransferPlan::plain(file_length, chunk_size)?
        };
        if remote.content_length < plan.remote_length() {
            warn!(
                stored = remote.content_length,
                planned = plan.remote_length(),
                "object is shorter than its recorded layout"
            );
        }

        let session = self
            .session
            .get_or_init(|| Arc::new(Session::new(uuid::Uuid::new_v4().to_string())))
            .clone();
        info!(
            session = %session.id(),
            bytes = file_length,
            parts = plan.part_count(),
            encrypted = plan.is_encrypted(),
            "download started"
        );

        result.size = Some(file_length);
        result.etag = remote.etag.clone();

        let outcome = self
            .transfer(&session, &plan, content_key, remote.content_length, remote.etag.as_deref())
            .await;
        match outcome {
            Ok(()) => {
                info!(session = %session.id(), "download complete");
                Ok(result)
            }
            Err(e) => {
                session.fail();
                error!(session = %session.id(), error = %e, "download failed");
                if let Err(cleanup) = tokio::fs::remove_file(&self.dest).await {
                    debug!(error = %cleanup, "could not remove partial download");
                }
                Err(e)
            }
        }
    }

    async fn transfer(
        &self,
        session: &Arc<Session>,
        plan: &TransferPlan,
        content_key: Option<ContentKey>,
        object_length: u64,
        etag: Option<&str>,
    ) -> Result<()> {
        if let Some(parent) = self.dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&self.dest).await?;
        file.set_len(plan.file_length()).await?;
        drop(file);

        session.transition(SessionState::PartsInFlight)?;
        let tasks: Vec<_> = plan
            .parts()
            .iter()
            .map(|part| {
                let engine = Arc::clone(&self.engine);
                let session = Arc::clone(session);
                let bucket = self.bucket.clone();
                let key = self.key.clone();
                let dest = self.dest.clone();
                let content_key = content_key.clone();
                let range = plan.remote_range(part, object_length);
                let part = *part;
                async move {
                    let target = PartTarget {
                        bucket: &bucket,
                        key: &key,
                        dest: &dest,
                    };
                    let digest =
                        download_part(&engine, target, part, range, content_key.as_ref()).await?;
                    session.record_part(part.index, digest)
                }
            })
            .collect();
        join_parts(tasks).await?;

        session.transition(SessionState::Completing)?;
        // A single unencrypted part was fetched whole, so its digest is the object's
        if plan.part_count() == 1 && !plan.is_encrypted() {
            if let (Some(etag), Some(local)) = (etag, session.part_result(0)) {
                let etag = etag.trim_matches('"').to_ascii_lowercase();
                if !etag.contains('-') && etag != local {
                    return Err(ClientError::BadHash {
                        scope: format!("object {}", self.uri()),
                        expected: etag,
                        actual: local,
                    });
                }
            }
        }
        session.transition(SessionState::Complete)?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct PartTarget<'a> {
    bucket: &'a str,
    key: &'a str,
    dest: &'a Path,
}

/// Fetch, decrypt and write one part, returning the MD5 hex of the fetched bytes
async fn download_part(
    engine: &Engine,
    target: PartTarget<'_>,
    part: PartSpec,
    range: Option<(u64, u64)>,
    content_key: Option<&ContentKey>,
) -> Result<String> {
    let id = format!("{}/{}#{}", target.bucket, target.key, part.part_number());
    debug!(part = %id, ?range, "downloading part");

    engine
        .remote(Some(FaultPoint::DownloadPart), &id, || async move {
            let mut file = OpenOptions::new().write(true).open(target.dest).await?;
            file.seek(SeekFrom::Start(part.plaintext_start)).await?;

            let mut digester = Digester::new();
            let mut writer = PartWriter {
                file,
                written: 0,
                limit: part.plaintext_len,
            };

            if range.is_some() {
                let mut stream = engine
                    .transport
                    .get_range(target.bucket, target.key, range)
                    .await?;
                let mut decryptor = content_key.map(PartDecryptor::new);
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    digester.update(&chunk);
                    match decryptor.as_mut() {
                        Some(decryptor) => writer.write(&decryptor.update(&chunk)?).await?,
                        None => writer.write(&chunk).await?,
                    }
                }
                if let Some(decryptor) = decryptor {
                    writer.write(&decryptor.finalize()?).await?;
                }
            }

            writer.finish().await?;
            Ok::<_, ClientError>(hex::encode(digester.finalize()))
        })
        .await
}

struct PartWriter {
    file: File,
    written: u64,
    limit: u64,
}

impl PartWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.written + data.len() as u64 > self.limit {
            return Err(ClientError::CorruptStream(format!(
                "part yielded more than {} bytes",
                self.limit
            )));
        }
        self.file.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self) -> Result<()> {
        self.file.flush().await?;
        if self.written != self.limit {
            return Err(ClientError::UnexpectedEof {
                expected: self.limit,
                actual: self.written,
            });
        }
        Ok(())
    }
}
