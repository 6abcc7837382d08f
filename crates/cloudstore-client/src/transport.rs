//! Boundary with the remote object store
//!
//! Sessions only talk to the store through these traits. Implementations
//! perform a single remote call per method and report failures as
//! [`ClientError`](crate::ClientError); retrying is the caller's job.

use crate::types::{CompletedPart, MultipartHandle, ObjectSummary, RemoteObject};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;

/// Stream of object bytes
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Inclusive byte range
pub type ByteRange = (u64, u64);

/// Multipart and ranged object operations
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a multipart write carrying `metadata` as user metadata
    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        metadata: &HashMap<String, String>,
        acl: Option<&str>,
    ) -> Result<MultipartHandle>;

    /// Upload part `part_number` (1-based), returning the store's etag
    async fn upload_part(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        body: ByteStream,
        length: u64,
    ) -> Result<String>;

    /// Commit the listed parts, returning the object's etag
    async fn complete_multipart(
        &self,
        handle: &MultipartHandle,
        parts: &[CompletedPart],
    ) -> Result<String>;

    /// Discard a multipart write and its parts
    async fn abort_multipart(&self, handle: &MultipartHandle) -> Result<()>;

    /// Read an inclusive byte range, or the whole object for `None`
    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream>;

    /// Fetch metadata and size without the body
    async fn get_metadata(&self, bucket: &str, key: &str) -> Result<RemoteObject>;

    /// Copy a byte range of an existing object into part `part_number` of `dest`
    async fn copy_part_range(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest: &MultipartHandle,
        part_number: u32,
        range: Option<ByteRange>,
    ) -> Result<String>;

    /// Multipart writes that were started but never completed or aborted
    async fn list_pending_multipart(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<MultipartHandle>>;

    /// Delete an object
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;
}

/// Object listing
#[async_trait]
pub trait Lister: Send + Sync {
    /// Objects under `prefix`; without `recursive` only direct children are returned
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<ObjectSummary>>;
}
