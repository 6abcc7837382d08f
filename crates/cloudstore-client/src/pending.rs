//! Cleanup of multipart writes that were never completed
//!
//! Failed sessions leave their multipart handle on the store. These helpers
//! list such handles and abort them, optionally only those initiated before
//! a cutoff.

use crate::session::Engine;
use crate::types::MultipartHandle;
use crate::Result;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

/// Multipart writes under `prefix` that are still pending
#[instrument(skip(engine))]
pub(crate) async fn list(
    engine: &Engine,
    bucket: &str,
    prefix: Option<&str>,
) -> Result<Vec<MultipartHandle>> {
    engine
        .remote(None, &format!("list-uploads {}", bucket), || {
            engine.transport.list_pending_multipart(bucket, prefix)
        })
        .await
}

/// Abort one pending multipart write
#[instrument(skip(engine, handle), fields(key = %handle.key, upload_id = %handle.upload_id))]
pub(crate) async fn abort(engine: &Engine, handle: &MultipartHandle, dry_run: bool) -> Result<()> {
    if dry_run || engine.config.dry_run {
        info!("dry run: would abort pending upload");
        return Ok(());
    }
    engine
        .remote(None, &format!("abort {}", handle.upload_id), || {
            engine.transport.abort_multipart(handle)
        })
        .await?;
    info!("aborted pending upload");
    Ok(())
}

/// Abort every pending write under `prefix` initiated before `before`.
///
/// Returns the handles that were aborted. Failures to abort individual
/// handles are logged and the first one is returned after the rest have
/// been tried.
#[instrument(skip(engine))]
pub(crate) async fn abort_older_than(
    engine: &Engine,
    bucket: &str,
    prefix: Option<&str>,
    before: DateTime<Utc>,
    dry_run: bool,
) -> Result<Vec<MultipartHandle>> {
    let stale: Vec<MultipartHandle> = list(engine, bucket, prefix)
        .await?
        .into_iter()
        .filter(|h| h.initiated < before)
        .collect();

    let mut aborted = Vec::with_capacity(stale.len());
    let mut first_error = None;
    for handle in stale {
        match abort(engine, &handle, dry_run).await {
            Ok(()) => aborted.push(handle),
            Err(e) => {
                warn!(key = %handle.key, upload_id = %handle.upload_id, error = %e, "abort failed");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(aborted),
    }
}
