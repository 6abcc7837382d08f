//! Adding and removing recipients of an encrypted object
//!
//! The content key never changes. The envelope is resealed locally and the
//! object is copied onto itself with the new envelope in its metadata.

use crate::copy::CopySession;
use crate::session::Engine;
use crate::types::{CopyOptions, StoreFile};
use crate::{ClientError, Result};
use std::sync::Arc;
use tracing::{info, instrument};

/// Change to an object's recipient list
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecipientChange {
    /// Seal the content key for another key name
    Add(String),
    /// Drop a key name
    Remove(String),
}

/// Apply a recipient change to an encrypted object
#[instrument(skip(engine))]
pub(crate) async fn rotate(
    engine: Arc<Engine>,
    bucket: &str,
    key: &str,
    change: RecipientChange,
    dry_run: bool,
) -> Result<StoreFile> {
    if dry_run || engine.config.dry_run {
        info!("dry run: would change recipients");
        return Ok(StoreFile::new(bucket, key));
    }

    let (_, metadata) = engine.head(bucket, key).await?;
    let envelope = metadata
        .envelope
        .ok_or_else(|| ClientError::Usage(format!("{}/{} is not encrypted", bucket, key)))?;

    let manager = engine.key_manager()?;
    let updated = match &change {
        RecipientChange::Add(name) => manager.add_recipient(&envelope, name)?,
        RecipientChange::Remove(name) => manager.remove_recipient(&envelope, name)?,
    };
    info!(recipients = %updated.names_field(), "rewriting envelope");

    CopySession::new(engine, (bucket, key), (bucket, key), CopyOptions::default())
        .with_envelope(updated)
        .run()
        .await
}
