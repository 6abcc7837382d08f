//! Session state and the shared machinery behind every transfer
//!
//! A [`Session`] tracks one object transfer from the moment it has a remote
//! identity until it completes, fails or is aborted. Parts record their etag
//! exactly once, in any order, and completion waits for all of them.
//!
//! [`Engine`] bundles what sessions need to reach the store: the transport,
//! the retry executor, the transport pool and the fault injector.

use crate::fault::{FaultInjector, FaultPoint};
use crate::retry::RetryExecutor;
use crate::transport::{Lister, Transport};
use crate::types::{CompletedPart, MultipartHandle, ObjectMetadata, RemoteObject};
use crate::{ClientError, Config, Result};
use cloudstore_crypto::{digest_from_hex, multipart_etag, EnvelopeKeyManager};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

/// Lifecycle of a transfer session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Remote identity obtained, no parts started
    Initiated,
    /// Parts are being transferred
    PartsInFlight,
    /// All parts done, finishing the object
    Completing,
    /// Object committed and verified
    Complete,
    /// A step failed; any multipart handle is left pending
    Failed,
    /// Explicitly aborted by the caller
    Aborted,
}

impl SessionState {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Aborted)
    }

    fn can_become(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Initiated, PartsInFlight) | (PartsInFlight, Completing) | (Completing, Complete) => {
                true
            }
            (current, Failed | Aborted) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initiated => "initiated",
            Self::PartsInFlight => "parts-in-flight",
            Self::Completing => "completing",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Mutable aggregate of one object transfer
#[derive(Debug)]
pub struct Session {
    id: String,
    state: Mutex<SessionState>,
    parts: DashMap<usize, String>,
}

impl Session {
    /// Start a session in the `Initiated` state
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(SessionState::Initiated),
            parts: DashMap::new(),
        }
    }

    /// Session identifier (the upload ID for multipart writes)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Number of parts recorded so far
    pub fn parts_done(&self) -> usize {
        self.parts.len()
    }

    /// Etag or digest recorded for a part
    pub fn part_result(&self, index: usize) -> Option<String> {
        self.parts.get(&index).map(|e| e.value().clone())
    }

    pub(crate) fn transition(&self, next: SessionState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_become(next) {
            return Err(ClientError::Usage(format!(
                "session {} cannot move from {} to {}",
                self.id, *state, next
            )));
        }
        debug!(session = %self.id, from = %*state, to = %next, "session transition");
        *state = next;
        Ok(())
    }

    /// Mark the session failed unless it already finished
    pub(crate) fn fail(&self) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = SessionState::Failed;
        }
    }

    pub(crate) fn record_part(&self, index: usize, result: String) -> Result<()> {
        match self.parts.entry(index) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ClientError::Usage(format!(
                "part {} of session {} recorded twice",
                index + 1,
                self.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(result);
                Ok(())
            }
        }
    }

    /// Parts in index order, failing if any of `count` parts is missing
    pub(crate) fn completed_parts(&self, count: usize) -> Result<Vec<CompletedPart>> {
        (0..count)
            .map(|index| {
                let etag = self.part_result(index).ok_or_else(|| {
                    ClientError::Usage(format!(
                        "part {} of session {} has not completed",
                        index + 1,
                        self.id
                    ))
                })?;
                Ok(CompletedPart {
                    part_number: index as u32 + 1,
                    etag,
                })
            })
            .collect()
    }

    /// Multipart etag the store should report once all parts are committed
    pub(crate) fn expected_etag(&self, parts: &[CompletedPart]) -> Result<String> {
        let digests = parts
            .iter()
            .map(|p| digest_from_hex(&p.etag))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(multipart_etag(&digests))
    }
}

/// Everything a session needs to talk to the store
pub(crate) struct Engine {
    pub transport: Arc<dyn Transport>,
    pub lister: Option<Arc<dyn Lister>>,
    pub keys: Option<EnvelopeKeyManager>,
    pub executor: RetryExecutor,
    pub requests: Arc<Semaphore>,
    pub transfers: Arc<Semaphore>,
    pub faults: Arc<dyn FaultInjector>,
    pub config: Config,
}

impl Engine {
    /// Run one remote call under the transport pool and retry policy.
    ///
    /// The pool slot is held across retries, so a backing-off call keeps
    /// its worker busy.
    pub async fn remote<T, F, Fut>(&self, point: Option<FaultPoint>, id: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self
            .requests
            .acquire()
            .await
            .map_err(|e| ClientError::Join(e.to_string()))?;

        let label = match point {
            Some(point) => format!("{} {}", point, id),
            None => id.to_string(),
        };
        self.executor
            .retry(&label, || {
                let injected = match point {
                    Some(point) => self.faults.before(point, id),
                    None => Ok(()),
                };
                let attempt = op();
                async move {
                    injected?;
                    attempt.await
                }
            })
            .await
    }

    /// Fetch and parse an object's metadata
    pub async fn head(&self, bucket: &str, key: &str) -> Result<(RemoteObject, ObjectMetadata)> {
        let remote = self
            .remote(None, &format!("head {}/{}", bucket, key), || {
                let lookup = self.transport.get_metadata(bucket, key);
                async move {
                    lookup.await.map_err(|e| {
                        if e.is_not_found() {
                            ClientError::NotFound {
                                bucket: bucket.to_string(),
                                key: key.to_string(),
                            }
                        } else {
                            e
                        }
                    })
                }
            })
            .await?;
        let metadata = ObjectMetadata::from_remote(&remote.metadata)?;
        Ok((remote, metadata))
    }

    pub fn key_manager(&self) -> Result<&EnvelopeKeyManager> {
        self.keys
            .as_ref()
            .ok_or_else(|| ClientError::Config("no key provider configured".to_string()))
    }

    pub fn lister(&self) -> Result<&Arc<dyn Lister>> {
        self.lister
            .as_ref()
            .ok_or_else(|| ClientError::Config("no lister configured".to_string()))
    }

    /// Commit all parts of a multipart write and check the resulting etag
    pub async fn complete(
        &self,
        handle: &MultipartHandle,
        session: &Session,
        part_count: usize,
    ) -> Result<String> {
        session.transition(SessionState::Completing)?;
        let parts = session.completed_parts(part_count)?;
        let expected = session.expected_etag(&parts)?;

        let id = format!("{}/{}", handle.bucket, handle.key);
        let etag = self
            .remote(Some(FaultPoint::Complete), &id, || {
                self.transport.complete_multipart(handle, &parts)
            })
            .await?;
        let etag = etag.trim_matches('"').to_ascii_lowercase();
        if etag != expected {
            return Err(ClientError::BadHash {
                scope: format!("object {}", id),
                expected,
                actual: etag,
            });
        }

        session.transition(SessionState::Complete)?;
        Ok(etag)
    }

    /// Abort a multipart write and mark its session aborted
    pub async fn abort(&self, handle: &MultipartHandle, session: &Session) -> Result<()> {
        if session.state().is_terminal() && session.state() != SessionState::Failed {
            return Err(ClientError::Usage(format!(
                "session {} is already {}",
                session.id(),
                session.state()
            )));
        }
        self.remote(None, &format!("abort {}", handle.upload_id), || {
            self.transport.abort_multipart(handle)
        })
        .await?;
        *session.state.lock() = SessionState::Aborted;
        Ok(())
    }
}

/// Run part tasks concurrently and wait for all of them.
///
/// The first failure cancels the remaining tasks and is returned.
pub(crate) async fn join_parts<T, Fut>(tasks: Vec<Fut>) -> Result<Vec<T>>
where
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut set = JoinSet::new();
    for task in tasks {
        set.spawn(task);
    }

    let mut results = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(value)) => results.push(value),
            Ok(Err(e)) => {
                set.abort_all();
                return Err(e);
            }
            Err(e) => {
                set.abort_all();
                return Err(ClientError::Join(e.to_string()));
            }
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudstore_crypto::md5_hex;

    #[test]
    fn test_state_machine() {
        let session = Session::new("up-1");
        assert_eq!(session.state(), SessionState::Initiated);
        assert!(session.transition(SessionState::Completing).is_err());
        session.transition(SessionState::PartsInFlight).unwrap();
        session.transition(SessionState::Completing).unwrap();
        session.transition(SessionState::Complete).unwrap();
        assert!(session.transition(SessionState::Failed).is_err());
        session.fail();
        assert_eq!(session.state(), SessionState::Complete);
    }

    #[test]
    fn test_fail_from_any_open_state() {
        let session = Session::new("up-2");
        session.transition(SessionState::PartsInFlight).unwrap();
        session.fail();
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.transition(SessionState::Aborted).is_err());
    }

    #[test]
    fn test_parts_recorded_once() {
        let session = Session::new("up-3");
        session.record_part(1, md5_hex(b"b")).unwrap();
        session.record_part(0, md5_hex(b"a")).unwrap();
        assert!(session.record_part(1, md5_hex(b"b")).is_err());
        assert!(session.completed_parts(3).is_err());

        let parts = session.completed_parts(2).unwrap();
        assert_eq!(parts[0].part_number, 1);
        assert_eq!(parts[0].etag, md5_hex(b"a"));
        assert_eq!(parts[1].part_number, 2);
    }

    #[test]
    fn test_expected_etag_uses_part_order() {
        let session = Session::new("up-4");
        for (i, data) in [b"d0", b"d1", b"d2"].iter().enumerate() {
            session.record_part(i, md5_hex(*data)).unwrap();
        }
        let parts = session.completed_parts(3).unwrap();
        let expected = session.expected_etag(&parts).unwrap();
        assert!(expected.ends_with("-3"));

        let mut swapped = parts.clone();
        swapped.swap(0, 1);
        assert_ne!(session.expected_etag(&swapped).unwrap(), expected);
    }

    #[test]
    fn test_malformed_part_etag_is_invalid_response() {
        let session = Session::new("up-5");
        session.record_part(0, "not-a-digest".to_string()).unwrap();
        let parts = session.completed_parts(1).unwrap();
        let err = session.expected_etag(&parts).unwrap_err();
        assert!(matches!(err, ClientError::InvalidResponse(_)));
        assert!(!err.is_key_error());
    }

    #[tokio::test]
    async fn test_join_parts_returns_first_error() {
        let tasks: Vec<std::pin::Pin<Box<dyn Future<Output = Result<usize>> + Send>>> = vec![
            Box::pin(async { Ok(1) }),
            Box::pin(async { Err(ClientError::Usage("boom".into())) }),
            Box::pin(async { Ok(3) }),
        ];
        let err = join_parts(tasks).await.unwrap_err();
        assert!(matches!(err, ClientError::Usage(_)));
    }

    #[tokio::test]
    async fn test_join_parts_collects_all() {
        let tasks: Vec<_> = (0..5usize).map(|i| async move { Ok::<_, ClientError>(i * 2) }).collect();
        let mut values = join_parts(tasks).await.unwrap();
        values.sort();
        assert_eq!(values, vec![0, 2, 4, 6, 8]);
    }
}
