//! Directory-level transfers
//!
//! Each operation expands into one single-object session per file or object
//! and runs them on the orchestration pool, at most
//! `max_concurrent_transfers` at a time. Failures of individual objects do
//! not stop the others; everything is collected into a [`BatchResult`].

use crate::copy::{rename, CopySession};
use crate::download::DownloadSession;
use crate::session::Engine;
use crate::types::{CopyOptions, DownloadOptions, ObjectSummary, StoreFile, UploadOptions};
use crate::upload::UploadSession;
use crate::{ClientError, Result};
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Outcome of a directory operation
#[derive(Debug, Default)]
pub struct BatchResult {
    /// Objects that were transferred, sorted by key
    pub completed: Vec<StoreFile>,
    /// Objects or files that failed, with their error
    pub failures: Vec<(String, ClientError)>,
}

impl BatchResult {
    /// Number of objects attempted
    pub fn total(&self) -> usize {
        self.completed.len() + self.failures.len()
    }

    /// Whether every object succeeded
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// The completed objects, or a [`ClientError::Batch`] if anything failed
    pub fn into_result(self) -> Result<Vec<StoreFile>> {
        let total = self.total();
        let failed = self.failures.len();
        match self.failures.into_iter().next() {
            None => Ok(self.completed),
            Some((_, first)) => Err(ClientError::Batch {
                failed,
                total,
                first: Box::new(first),
            }),
        }
    }
}

type Job = std::pin::Pin<Box<dyn Future<Output = Result<StoreFile>> + Send>>;

/// Run jobs on the orchestration pool and gather their outcomes
async fn fan_out(engine: &Engine, jobs: Vec<(String, Job)>) -> BatchResult {
    let mut set = JoinSet::new();
    for (name, job) in jobs {
        let transfers = Arc::clone(&engine.transfers);
        set.spawn(async move {
            let outcome = match transfers.acquire_owned().await {
                Ok(_permit) => job.await,
                Err(e) => Err(ClientError::Join(e.to_string())),
            };
            (name, outcome)
        });
    }

    let mut result = BatchResult::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(file))) => result.completed.push(file),
            Ok((name, Err(e))) => {
                warn!(object = %name, error = %e, "transfer failed");
                result.failures.push((name, e));
            }
            Err(e) => result
                .failures
                .push(("<task>".to_string(), ClientError::Join(e.to_string()))),
        }
    }
    result.completed.sort_by(|a, b| a.key.cmp(&b.key));
    result.failures.sort_by(|a, b| a.0.cmp(&b.0));
    result
}

/// Join a key prefix and a relative path with exactly one `/`
pub(crate) fn join_key(prefix: &str, relative: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", prefix, relative)
    }
}

/// Key relative to the directory part of `prefix`.
///
/// Only the prefix up to and including its last `/` is stripped, so a prefix
/// of `logs` keeps both `logs/a` and `logs-old/a` intact while `logs/` yields
/// `a`.
fn relative_key<'a>(key: &'a str, prefix: &str) -> &'a str {
    let base = match prefix.rfind('/') {
        Some(slash) => &prefix[..=slash],
        None => "",
    };
    key.strip_prefix(base).unwrap_or(key)
}

/// Local path for a relative key, refusing keys that escape the directory
fn local_path(root: &Path, relative: &str) -> Result<PathBuf> {
    let relative = Path::new(relative);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(ClientError::Usage(format!(
            "refusing to write {} outside the target directory",
            relative.display()
        )));
    }
    Ok(root.join(relative))
}

/// Upload every regular file under `root` to `bucket/prefix/<relative path>`
#[instrument(skip(engine, options), fields(root = %root.display()))]
pub(crate) async fn upload_dir(
    engine: Arc<Engine>,
    root: &Path,
    bucket: &str,
    prefix: &str,
    options: UploadOptions,
) -> Result<BatchResult> {
    if !root.is_dir() {
        return Err(ClientError::Usage(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let mut jobs: Vec<(String, Job)> = Vec::new();
    let mut walk_failures = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let name = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                walk_failures.push((name, ClientError::Io(e.into())));
                continue;
            }
        };
        if entry.path_is_symlink() {
            debug!(path = %entry.path().display(), "skipping symlink");
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| ClientError::Usage(e.to_string()))?;
        let relative: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let key = join_key(prefix, &relative.join("/"));

        let session = UploadSession::new(
            Arc::clone(&engine),
            entry.path(),
            bucket,
            key.clone(),
            options.clone(),
        );
        let job: Job = Box::pin(async move { session.run().await });
        jobs.push((key, job));
    }

    info!(files = jobs.len(), "uploading directory");
    let mut result = fan_out(&engine, jobs).await;
    result.failures.extend(walk_failures);
    Ok(result)
}

/// Download every object under `bucket/prefix` into `root`
#[instrument(skip(engine, options), fields(root = %root.display()))]
pub(crate) async fn download_dir(
    engine: Arc<Engine>,
    bucket: &str,
    prefix: &str,
    root: &Path,
    options: DownloadOptions,
) -> Result<BatchResult> {
    let objects = list(&engine, bucket, prefix).await?;

    let mut jobs: Vec<(String, Job)> = Vec::new();
    let mut rejected = Vec::new();
    for object in objects {
        let dest = match local_path(root, relative_key(&object.key, prefix)) {
            Ok(dest) => dest,
            Err(e) => {
                rejected.push((object.key, e));
                continue;
            }
        };
        let session = DownloadSession::new(
            Arc::clone(&engine),
            bucket,
            object.key.clone(),
            dest,
            options.clone(),
        );
        let job: Job = Box::pin(async move { session.run().await });
        jobs.push((object.key, job));
    }

    info!(objects = jobs.len(), "downloading prefix");
    let mut result = fan_out(&engine, jobs).await;
    result.failures.extend(rejected);
    Ok(result)
}

/// Copy every object under `source_bucket/source_prefix` to `dest_bucket/dest_prefix`
#[instrument(skip(engine, options))]
pub(crate) async fn copy_dir(
    engine: Arc<Engine>,
    source: (&str, &str),
    dest: (&str, &str),
    options: CopyOptions,
) -> Result<BatchResult> {
    let objects = list(&engine, source.0, source.1).await?;

    let jobs: Vec<(String, Job)> = objects
        .into_iter()
        .map(|object| {
            let dest_key = join_key(dest.1, relative_key(&object.key, source.1));
            let session = CopySession::new(
                Arc::clone(&engine),
                (source.0, object.key.as_str()),
                (dest.0, dest_key.as_str()),
                options.clone(),
            );
            let job: Job = Box::pin(async move { session.run().await });
            (object.key, job)
        })
        .collect();

    info!(objects = jobs.len(), "copying prefix");
    Ok(fan_out(&engine, jobs).await)
}

/// Move every object under a prefix to another prefix
#[instrument(skip(engine, options))]
pub(crate) async fn rename_dir(
    engine: Arc<Engine>,
    source: (&str, &str),
    dest: (&str, &str),
    options: CopyOptions,
) -> Result<BatchResult> {
    let objects = list(&engine, source.0, source.1).await?;

    let jobs: Vec<(String, Job)> = objects
        .into_iter()
        .map(|object| {
            let engine = Arc::clone(&engine);
            let source_bucket = source.0.to_string();
            let dest_bucket = dest.0.to_string();
            let dest_key = join_key(dest.1, relative_key(&object.key, source.1));
            let source_key = object.key.clone();
            let options = options.clone();
            let job: Job = Box::pin(async move {
                rename(
                    engine,
                    (source_bucket.as_str(), source_key.as_str()),
                    (dest_bucket.as_str(), dest_key.as_str()),
                    options,
                )
                .await
            });
            (object.key, job)
        })
        .collect();

    info!(objects = jobs.len(), "renaming prefix");
    Ok(fan_out(&engine, jobs).await)
}

/// Delete every object under a prefix.
///
/// Matching nothing is a usage error unless `force` is set.
#[instrument(skip(engine))]
pub(crate) async fn delete_dir(
    engine: Arc<Engine>,
    bucket: &str,
    prefix: &str,
    force: bool,
    dry_run: bool,
) -> Result<BatchResult> {
    let objects = list(&engine, bucket, prefix).await?;
    if objects.is_empty() && !force {
        return Err(ClientError::Usage(format!(
            "no objects match {}/{}",
            bucket, prefix
        )));
    }
    let dry_run = dry_run || engine.config.dry_run;

    let jobs: Vec<(String, Job)> = objects
        .into_iter()
        .map(|object| {
            let engine = Arc::clone(&engine);
            let mut file = StoreFile::new(bucket, object.key.clone());
            file.size = Some(object.size);
            file.etag = object.etag.clone();
            let job: Job = Box::pin(async move {
                if dry_run {
                    info!(key = %file.key, "dry run: would delete");
                    return Ok(file);
                }
                engine
                    .remote(None, &format!("delete {}", file.uri()), || {
                        engine.transport.delete_object(&file.bucket, &file.key)
                    })
                    .await?;
                Ok(file)
            });
            (object.key, job)
        })
        .collect();

    info!(objects = jobs.len(), "deleting prefix");
    Ok(fan_out(&engine, jobs).await)
}

/// Objects under a prefix, without `/`-terminated directory placeholders
async fn list(engine: &Engine, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>> {
    let lister = engine.lister()?;
    let objects = engine
        .remote(None, &format!("list {}/{}", bucket, prefix), || {
            lister.list_objects(bucket, prefix, true)
        })
        .await?;
    Ok(objects
        .into_iter()
        .filter(|object| !object.key.ends_with('/'))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("", "a/b.txt"), "a/b.txt");
        assert_eq!(join_key("backup/", "a.txt"), "backup/a.txt");
        assert_eq!(join_key("backup", "/a.txt"), "backup/a.txt");
    }

    #[test]
    fn test_relative_key() {
        assert_eq!(relative_key("logs/2024/a.log", "logs/"), "2024/a.log");
        assert_eq!(relative_key("logs/2024/a.log", "logs"), "logs/2024/a.log");
        assert_eq!(relative_key("logs-old/a.log", "logs"), "logs-old/a.log");
        assert_eq!(relative_key("var/logs-old/a.log", "var/logs"), "logs-old/a.log");
        assert_eq!(relative_key("a.log", ""), "a.log");
    }

    #[test]
    fn test_local_path_rejects_escape() {
        let root = Path::new("/tmp/out");
        assert_eq!(
            local_path(root, "a/b.txt").unwrap(),
            PathBuf::from("/tmp/out/a/b.txt")
        );
        assert!(local_path(root, "../etc/passwd").is_err());
        assert!(local_path(root, "/etc/passwd").is_err());
    }

    #[test]
    fn test_batch_into_result() {
        let ok = BatchResult {
            completed: vec![StoreFile::new("b", "k")],
            failures: vec![],
        };
        assert_eq!(ok.into_result().unwrap().len(), 1);

        let failed = BatchResult {
            completed: vec![StoreFile::new("b", "k")],
            failures: vec![("k2".into(), ClientError::Usage("x".into()))],
        };
        match failed.into_result() {
            Err(ClientError::Batch { failed, total, .. }) => {
                assert_eq!(failed, 1);
                assert_eq!(total, 2);
            }
            other => panic!("expected batch error, got {:?}", other),
        }
    }
}
