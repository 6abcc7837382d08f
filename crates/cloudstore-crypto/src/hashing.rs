//! MD5 digests for part and whole-object integrity checks
//!
//! Object stores report a part's MD5 as its etag, and a completed multipart
//! object's etag as `hex(md5(part digests concatenated)) + "-" + part count`.

use crate::{CryptoError, Result};
use bytes::Bytes;
use futures::Stream;
use md5::{Digest, Md5};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

/// Size of an MD5 digest in bytes
pub const DIGEST_SIZE: usize = 16;

/// MD5 digest bytes
pub type Md5Digest = [u8; DIGEST_SIZE];

/// Compute the MD5 hex digest of a buffer
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Parse an etag (optionally quoted) back into digest bytes
pub fn digest_from_hex(etag: &str) -> Result<Md5Digest> {
    let bytes = hex::decode(etag.trim_matches('"'))
        .map_err(|e| CryptoError::InvalidDigest(format!("etag '{}': {}", etag, e)))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidDigest(format!("etag '{}' is not an md5 digest", etag)))
}

/// Expected etag of a completed multipart object
pub fn multipart_etag(part_digests: &[Md5Digest]) -> String {
    let mut hasher = Md5::new();
    for digest in part_digests {
        hasher.update(digest);
    }
    format!("{}-{}", hex::encode(hasher.finalize()), part_digests.len())
}

/// Incremental MD5 over bytes as they pass through
#[derive(Clone, Default)]
pub struct Digester {
    hasher: Md5,
    bytes_processed: u64,
}

impl Digester {
    /// Create a new digester
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more data
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    /// Total bytes fed so far
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    /// Finish and return the digest
    pub fn finalize(self) -> Md5Digest {
        self.hasher.finalize().into()
    }
}

/// Shared view of a `HashingStream`'s digester, read after the stream is drained
#[derive(Clone, Default)]
pub struct DigestHandle {
    inner: Arc<Mutex<Option<Digester>>>,
}

impl DigestHandle {
    /// Take the digest. Returns `None` if called twice.
    pub fn finalize(&self) -> Option<Md5Digest> {
        self.inner
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .map(Digester::finalize)
    }

    /// Bytes seen so far
    pub fn bytes_processed(&self) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(Digester::bytes_processed))
            .unwrap_or(0)
    }

    fn update(&self, data: &[u8]) {
        if let Ok(mut slot) = self.inner.lock() {
            if let Some(digester) = slot.as_mut() {
                digester.update(data);
            }
        }
    }
}

pin_project! {
    /// Byte stream tap that digests every chunk it yields
    pub struct HashingStream<S> {
        #[pin]
        inner: S,
        handle: DigestHandle,
    }
}

impl<S> HashingStream<S> {
    /// Wrap a stream; the returned handle yields the digest once drained
    pub fn new(inner: S) -> (Self, DigestHandle) {
        let handle = DigestHandle {
            inner: Arc::new(Mutex::new(Some(Digester::new()))),
        };
        (
            Self {
                inner,
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl<S, E> Stream for HashingStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
{
    type Item = std::result::Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.handle.update(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_md5_known_value() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"hello world"), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_digester_incremental() {
        let mut digester = Digester::new();
        digester.update(b"hello ");
        digester.update(b"world");
        assert_eq!(digester.bytes_processed(), 11);
        assert_eq!(hex::encode(digester.finalize()), md5_hex(b"hello world"));
    }

    #[test]
    fn test_multipart_etag() {
        let d0: Md5Digest = Md5::digest(b"part zero").into();
        let d1: Md5Digest = Md5::digest(b"part one").into();
        let d2: Md5Digest = Md5::digest(b"part two").into();

        let mut concat = Vec::new();
        for d in [&d0, &d1, &d2] {
            concat.extend_from_slice(d);
        }
        let expected = format!("{}-3", md5_hex(&concat));
        assert_eq!(multipart_etag(&[d0, d1, d2]), expected);

        let mut altered = d1;
        altered[0] ^= 1;
        assert_ne!(multipart_etag(&[d0, altered, d2]), expected);
    }

    #[test]
    fn test_digest_from_hex() {
        let expected = md5_hex(b"abc");
        let quoted = format!("\"{}\"", expected);
        assert_eq!(hex::encode(digest_from_hex(&quoted).unwrap()), expected);
        for bad in ["abc-2", "abcd"] {
            let err = digest_from_hex(bad).unwrap_err();
            assert!(matches!(err, CryptoError::InvalidDigest(_)));
            assert!(!err.is_key_error());
        }
    }

    #[tokio::test]
    async fn test_hashing_stream_taps_all_chunks() {
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let (stream, handle) = HashingStream::new(futures::stream::iter(chunks));
        let collected: Vec<_> = stream.collect().await;
        assert_eq!(collected.len(), 2);
        assert_eq!(handle.bytes_processed(), 11);
        assert_eq!(
            hex::encode(handle.finalize().unwrap()),
            md5_hex(b"hello world")
        );
        assert!(handle.finalize().is_none());
    }
}
