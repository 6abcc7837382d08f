//! In-process object store
//!
//! Implements [`Transport`] and [`Lister`] with S3 semantics close enough for
//! end-to-end tests: part etags are MD5 hex digests, completed objects get the
//! multipart etag, and ranged reads are streamed back in small chunks.

use crate::transport::{ByteRange, ByteStream, Lister, Transport};
use crate::types::{CompletedPart, MultipartHandle, ObjectSummary, RemoteObject};
use crate::{ClientError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use cloudstore_crypto::{digest_from_hex, md5_hex, multipart_etag};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default size of the chunks yielded by ranged reads
pub const DEFAULT_READ_CHUNK: usize = 64 * 1024;

#[derive(Clone, Debug)]
struct StoredObject {
    data: Bytes,
    metadata: HashMap<String, String>,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
struct PendingUpload {
    handle: MultipartHandle,
    metadata: HashMap<String, String>,
    parts: BTreeMap<u32, (Bytes, String)>,
}

/// Counters for calls that tests assert on
#[derive(Debug, Default)]
pub struct CallCounts {
    /// `get_range` calls
    pub get_range: AtomicUsize,
    /// `upload_part` calls
    pub upload_part: AtomicUsize,
    /// `copy_part_range` calls
    pub copy_part: AtomicUsize,
    /// `complete_multipart` calls
    pub complete: AtomicUsize,
}

/// Object store held in memory
#[derive(Clone)]
pub struct MemoryStore {
    objects: Arc<DashMap<(String, String), StoredObject>>,
    uploads: Arc<DashMap<String, PendingUpload>>,
    calls: Arc<CallCounts>,
    read_chunk: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            objects: Arc::new(DashMap::new()),
            uploads: Arc::new(DashMap::new()),
            calls: Arc::new(CallCounts::default()),
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }

    /// Yield ranged reads in chunks of this size
    pub fn with_read_chunk(mut self, read_chunk: usize) -> Self {
        self.read_chunk = read_chunk.max(1);
        self
    }

    /// Call counters
    pub fn calls(&self) -> &CallCounts {
        &self.calls
    }

    /// Number of `get_range` calls so far
    pub fn range_requests(&self) -> usize {
        self.calls.get_range.load(Ordering::SeqCst)
    }

    /// Store an object directly, as a single-part PUT would
    pub fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Bytes>,
        metadata: HashMap<String, String>,
    ) -> String {
        let data = data.into();
        let etag = md5_hex(&data);
        self.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                metadata,
                etag: etag.clone(),
                last_modified: Utc::now(),
            },
        );
        etag
    }

    /// Stored bytes of an object
    pub fn object_data(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    /// Raw metadata of an object
    pub fn object_metadata(&self, bucket: &str, key: &str) -> Option<HashMap<String, String>> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.metadata.clone())
    }

    /// Whether an object exists
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    /// All keys in a bucket, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|e| e.key().0 == bucket)
            .map(|e| e.key().1.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of multipart writes not yet completed or aborted
    pub fn pending_count(&self) -> usize {
        self.uploads.len()
    }

    /// Rewrite the initiation time of a pending upload
    pub fn backdate_upload(&self, upload_id: &str, initiated: DateTime<Utc>) -> bool {
        match self.uploads.get_mut(upload_id) {
            Some(mut pending) => {
                pending.handle.initiated = initiated;
                true
            }
            None => false,
        }
    }

    fn no_such_upload(handle: &MultipartHandle) -> ClientError {
        ClientError::service(
            404,
            "NoSuchUpload",
            format!("upload {} does not exist", handle.upload_id),
        )
    }

    fn no_such_key(bucket: &str, key: &str) -> ClientError {
        ClientError::service(404, "NoSuchKey", format!("{}/{} does not exist", bucket, key))
    }

    fn slice(data: &Bytes, range: Option<ByteRange>) -> Result<Bytes> {
        let len = data.len() as u64;
        match range {
            None => Ok(data.clone()),
            Some((start, end)) => {
                if start > end || start >= len {
                    return Err(ClientError::service(
                        416,
                        "InvalidRange",
                        format!("bytes={}-{} of {}", start, end, len),
                    ));
                }
                let end = end.min(len - 1);
                Ok(data.slice(start as usize..=end as usize))
            }
        }
    }

    fn add_part(&self, handle: &MultipartHandle, part_number: u32, data: Bytes) -> Result<String> {
        let mut pending = self
            .uploads
            .get_mut(&handle.upload_id)
            .ok_or_else(|| Self::no_such_upload(handle))?;
        let etag = md5_hex(&data);
        pending.parts.insert(part_number, (data, etag.clone()));
        Ok(etag)
    }
}

#[async_trait]
impl Transport for MemoryStore {
    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        metadata: &HashMap<String, String>,
        _acl: Option<&str>,
    ) -> Result<MultipartHandle> {
        let handle = MultipartHandle {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: uuid::Uuid::new_v4().simple().to_string(),
            initiated: Utc::now(),
        };
        self.uploads.insert(
            handle.upload_id.clone(),
            PendingUpload {
                handle: handle.clone(),
                metadata: metadata.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(handle)
    }

    async fn upload_part(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        mut body: ByteStream,
        length: u64,
    ) -> Result<String> {
        self.calls.upload_part.fetch_add(1, Ordering::SeqCst);
        let mut buf = BytesMut::with_capacity(length as usize);
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        if buf.len() as u64 != length {
            return Err(ClientError::service(
                400,
                "IncompleteBody",
                format!("expected {} bytes, received {}", length, buf.len()),
            ));
        }
        self.add_part(handle, part_number, buf.freeze())
    }

    async fn complete_multipart(
        &self,
        handle: &MultipartHandle,
        parts: &[CompletedPart],
    ) -> Result<String> {
        self.calls.complete.fetch_add(1, Ordering::SeqCst);
        let pending = {
            let current = self
                .uploads
                .get(&handle.upload_id)
                .ok_or_else(|| Self::no_such_upload(handle))?;
            let mut data = BytesMut::new();
            let mut digests = Vec::with_capacity(parts.len());
            for part in parts {
                let (bytes, etag) = current.parts.get(&part.part_number).ok_or_else(|| {
                    ClientError::service(
                        400,
                        "InvalidPart",
                        format!("part {} was not uploaded", part.part_number),
                    )
                })?;
                if etag != part.etag.trim_matches('"') {
                    return Err(ClientError::service(
                        400,
                        "InvalidPart",
                        format!("etag mismatch for part {}", part.part_number),
                    ));
                }
                data.extend_from_slice(bytes);
                digests.push(digest_from_hex(etag)?);
            }
            (data.freeze(), current.metadata.clone(), multipart_etag(&digests))
        };
        self.uploads.remove(&handle.upload_id);

        let (data, metadata, etag) = pending;
        self.objects.insert(
            (handle.bucket.clone(), handle.key.clone()),
            StoredObject {
                data,
                metadata,
                etag: etag.clone(),
                last_modified: Utc::now(),
            },
        );
        Ok(etag)
    }

    async fn abort_multipart(&self, handle: &MultipartHandle) -> Result<()> {
        self.uploads
            .remove(&handle.upload_id)
            .map(|_| ())
            .ok_or_else(|| Self::no_such_upload(handle))
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream> {
        self.calls.get_range.fetch_add(1, Ordering::SeqCst);
        let data = self
            .object_data(bucket, key)
            .ok_or_else(|| Self::no_such_key(bucket, key))?;
        let slice = Self::slice(&data, range)?;

        let step = self.read_chunk;
        let chunks: Vec<Result<Bytes>> = (0..slice.len())
            .step_by(step)
            .map(|start| Ok(slice.slice(start..(start + step).min(slice.len()))))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn get_metadata(&self, bucket: &str, key: &str) -> Result<RemoteObject> {
        let object = self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| Self::no_such_key(bucket, key))?;
        Ok(RemoteObject {
            metadata: object.metadata.clone(),
            content_length: object.data.len() as u64,
            etag: Some(object.etag.clone()),
            last_modified: Some(object.last_modified),
        })
    }

    async fn copy_part_range(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest: &MultipartHandle,
        part_number: u32,
        range: Option<ByteRange>,
    ) -> Result<String> {
        self.calls.copy_part.fetch_add(1, Ordering::SeqCst);
        let data = self
            .object_data(source_bucket, source_key)
            .ok_or_else(|| Self::no_such_key(source_bucket, source_key))?;
        let slice = Self::slice(&data, range)?;
        self.add_part(dest, part_number, slice)
    }

    async fn list_pending_multipart(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<MultipartHandle>> {
        let mut handles: Vec<MultipartHandle> = self
            .uploads
            .iter()
            .map(|e| e.handle.clone())
            .filter(|h| h.bucket == bucket && prefix.map_or(true, |p| h.key.starts_with(p)))
            .collect();
        handles.sort_by(|a, b| a.key.cmp(&b.key).then(a.initiated.cmp(&b.initiated)));
        Ok(handles)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

#[async_trait]
impl Lister for MemoryStore {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<ObjectSummary>> {
        let mut objects: Vec<ObjectSummary> = self
            .objects
            .iter()
            .filter(|e| e.key().0 == bucket && e.key().1.starts_with(prefix))
            .filter(|e| recursive || !e.key().1[prefix.len()..].contains('/'))
            .map(|e| ObjectSummary {
                key: e.key().1.clone(),
                size: e.value().data.len() as u64,
                etag: Some(e.value().etag.clone()),
                last_modified: Some(e.value().last_modified),
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}
