//! Common types for the client engine

use crate::{ClientError, Result};
use chrono::{DateTime, Utc};
use cloudstore_crypto::EncryptionEnvelope;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Metadata format written by this engine
pub const FORMAT_VERSION: &str = "0.2";

/// Version marker
pub const META_VERSION: &str = "s3tool-version";
/// Nominal part size in bytes
pub const META_CHUNK_SIZE: &str = "s3tool-chunk-size";
/// Total plaintext length in bytes
pub const META_FILE_LENGTH: &str = "s3tool-file-length";
/// Comma-joined recipient names
pub const META_KEY_NAME: &str = "s3tool-key-name";
/// Comma-joined base64 sealed content keys
pub const META_SYMMETRIC_KEY: &str = "s3tool-symmetric-key";
/// Comma-joined public-key hashes
pub const META_PUBKEY_HASH: &str = "s3tool-pubkey-hash";

const USER_META_PREFIXES: [&str; 2] = ["x-amz-meta-", "x-goog-meta-"];

/// Typed view of the metadata stored on an object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Version marker
    pub version: Option<String>,
    /// Nominal part size used at upload
    pub chunk_size: Option<u64>,
    /// Plaintext length
    pub file_length: Option<u64>,
    /// Recipients of the content key, when encrypted
    pub envelope: Option<EncryptionEnvelope>,
    /// Any other user metadata, keys lowercased
    pub user: BTreeMap<String, String>,
}

impl ObjectMetadata {
    /// Metadata for a new upload
    pub fn for_upload(
        chunk_size: u64,
        file_length: u64,
        envelope: Option<EncryptionEnvelope>,
    ) -> Self {
        Self {
            version: Some(FORMAT_VERSION.to_string()),
            chunk_size: Some(chunk_size),
            file_length: Some(file_length),
            envelope,
            user: BTreeMap::new(),
        }
    }

    /// Parse metadata as returned by a backend.
    ///
    /// Keys are matched case-insensitively and user-metadata header prefixes
    /// are stripped.
    pub fn from_remote(raw: &HashMap<String, String>) -> Result<Self> {
        let mut fields: BTreeMap<String, String> = raw
            .iter()
            .map(|(k, v)| (normalize_key(k), v.trim().to_string()))
            .collect();

        let version = fields.remove(META_VERSION);
        let chunk_size = take_number(&mut fields, META_CHUNK_SIZE)?;
        let file_length = take_number(&mut fields, META_FILE_LENGTH)?;

        let names = fields.remove(META_KEY_NAME);
        let sealed = fields.remove(META_SYMMETRIC_KEY);
        let hashes = fields.remove(META_PUBKEY_HASH);
        let envelope = match names {
            Some(names) => Some(EncryptionEnvelope::from_fields(
                &names,
                sealed.as_deref().unwrap_or_default(),
                hashes.as_deref().unwrap_or_default(),
            )?),
            None => None,
        };

        Ok(Self {
            version,
            chunk_size,
            file_length,
            envelope,
            user: fields,
        })
    }

    /// Flatten into the key/value pairs stored on the object
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = self
            .user
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(version) = &self.version {
            map.insert(META_VERSION.to_string(), version.clone());
        }
        if let Some(chunk_size) = self.chunk_size {
            map.insert(META_CHUNK_SIZE.to_string(), chunk_size.to_string());
        }
        if let Some(file_length) = self.file_length {
            map.insert(META_FILE_LENGTH.to_string(), file_length.to_string());
        }
        if let Some(envelope) = &self.envelope {
            map.insert(META_KEY_NAME.to_string(), envelope.names_field());
            map.insert(META_SYMMETRIC_KEY.to_string(), envelope.sealed_keys_field());
            map.insert(META_PUBKEY_HASH.to_string(), envelope.key_hashes_field());
        }
        map
    }

    /// Whether the object carries a content-key envelope
    pub fn is_encrypted(&self) -> bool {
        self.envelope.is_some()
    }

    /// Whether all fields needed to chunk-address the object are present
    pub fn is_self_describing(&self) -> bool {
        self.version.is_some() && self.chunk_size.is_some() && self.file_length.is_some()
    }

    /// Chunk size and plaintext length recorded at upload
    pub fn layout(&self, bucket: &str, key: &str) -> Result<(u64, u64)> {
        let (version, chunk_size, file_length) =
            match (&self.version, self.chunk_size, self.file_length) {
                (Some(v), Some(c), Some(l)) => (v, c, l),
                _ => {
                    return Err(ClientError::NotUploadedByThisTool {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    })
                }
            };
        if version != FORMAT_VERSION {
            return Err(ClientError::UnsupportedVersion(format!(
                "{} (expected {})",
                version, FORMAT_VERSION
            )));
        }
        if chunk_size == 0 {
            return Err(ClientError::InvalidResponse(format!(
                "{}/{} records a zero chunk size",
                bucket, key
            )));
        }
        Ok((chunk_size, file_length))
    }

    /// Add a user metadata entry
    pub fn with_user(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user.insert(normalize_key(&key.into()), value.into());
        self
    }
}

fn normalize_key(key: &str) -> String {
    let key = key.trim().to_ascii_lowercase();
    USER_META_PREFIXES
        .iter()
        .find_map(|prefix| key.strip_prefix(prefix).map(str::to_string))
        .unwrap_or(key)
}

fn take_number(fields: &mut BTreeMap<String, String>, name: &str) -> Result<Option<u64>> {
    fields
        .remove(name)
        .map(|v| {
            v.parse().map_err(|_| {
                ClientError::InvalidResponse(format!("metadata {} is not a number: '{}'", name, v))
            })
        })
        .transpose()
}

/// Object metadata and size as reported by the backend
#[derive(Clone, Debug, Default)]
pub struct RemoteObject {
    /// Raw metadata, key case as the backend returned it
    pub metadata: HashMap<String, String>,
    /// Stored size in bytes
    pub content_length: u64,
    /// Backend etag, unquoted
    pub etag: Option<String>,
    /// Last modification time
    pub last_modified: Option<DateTime<Utc>>,
}

/// An in-progress multipart write
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartHandle {
    /// Bucket name
    pub bucket: String,
    /// Object key
    pub key: String,
    /// Upload ID assigned by the backend
    pub upload_id: String,
    /// When the upload was initiated
    pub initiated: DateTime<Utc>,
}

/// A part accepted by the backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// Part number (1-indexed)
    pub part_number: u32,
    /// ETag of the part, unquoted
    pub etag: String,
}

/// An object in a bucket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    /// Object key
    pub key: String,
    /// Size in bytes
    pub size: u64,
    /// ETag
    pub etag: Option<String>,
    /// Last modified time
    pub last_modified: Option<DateTime<Utc>>,
}

/// A file uploaded to or downloaded from the store
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFile {
    /// Bucket name
    pub bucket: String,
    /// Object key
    pub key: String,
    /// ETag of the stored object
    pub etag: Option<String>,
    /// Plaintext size
    pub size: Option<u64>,
    /// Local file involved in the transfer
    pub local_file: Option<PathBuf>,
}

impl StoreFile {
    /// Create a store file reference
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            ..Default::default()
        }
    }

    /// URI form used in logs
    pub fn uri(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }
}

/// Options for uploading a file
#[derive(Clone, Debug, Default)]
pub struct UploadOptions {
    /// Encrypt for this recipient
    pub encryption_key: Option<String>,
    /// Part size override
    pub chunk_size: Option<u64>,
    /// Canned ACL passed to the backend
    pub acl: Option<String>,
    /// Extra user metadata
    pub metadata: HashMap<String, String>,
    /// Only log the intended action
    pub dry_run: bool,
}

impl UploadOptions {
    /// Encrypt for a recipient
    pub fn with_encryption_key(mut self, name: impl Into<String>) -> Self {
        self.encryption_key = Some(name.into());
        self
    }

    /// Set the part size
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Set a canned ACL
    pub fn with_acl(mut self, acl: impl Into<String>) -> Self {
        self.acl = Some(acl.into());
        self
    }

    /// Add user metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Enable dry-run
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Options for downloading an object
#[derive(Clone, Debug, Default)]
pub struct DownloadOptions {
    /// Replace an existing local file
    pub overwrite: bool,
    /// Only log the intended action
    pub dry_run: bool,
}

impl DownloadOptions {
    /// Allow replacing an existing local file
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Enable dry-run
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Options for a server-side copy
#[derive(Clone, Debug, Default)]
pub struct CopyOptions {
    /// Replace user metadata on the destination (engine fields are kept)
    pub user_metadata: Option<HashMap<String, String>>,
    /// Canned ACL for the destination
    pub acl: Option<String>,
    /// Only log the intended action
    pub dry_run: bool,
}

impl CopyOptions {
    /// Replace user metadata on the destination
    pub fn with_user_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.user_metadata = Some(metadata);
        self
    }

    /// Set a canned ACL
    pub fn with_acl(mut self, acl: impl Into<String>) -> Self {
        self.acl = Some(acl.into());
        self
    }

    /// Enable dry-run
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}
