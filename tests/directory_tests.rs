//! Directory operations against the in-memory store

use cloudstore::client::{
    ClientError, CloudStoreClient, Config, CopyOptions, DownloadOptions, MemoryStore,
    UploadOptions,
};
use cloudstore::crypto::{KeyPair, MemoryKeyProvider};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const BUCKET: &str = "tree";

fn client(store: &Arc<MemoryStore>) -> CloudStoreClient {
    let config = Config::default()
        .with_chunk_size(700)
        .with_retries(2, Duration::from_millis(1), Duration::from_millis(2))
        .with_concurrency(4, 2);
    CloudStoreClient::builder(config)
        .store(Arc::clone(store))
        .build()
        .unwrap()
}

fn contents(name: &str) -> Vec<u8> {
    name.bytes().cycle().take(1500 + name.len() * 10).collect()
}

fn build_tree(root: &Path) {
    for name in ["a.txt", "sub/b.txt", "sub/deeper/c.txt"] {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents(name)).unwrap();
    }
}

fn keys(store: &MemoryStore, prefix: &str) -> Vec<String> {
    store
        .keys(BUCKET)
        .into_iter()
        .filter(|k| k.starts_with(prefix))
        .collect()
}

#[test_log::test(tokio::test)]
async fn test_directory_lifecycle() {
    let local = tempfile::tempdir().unwrap();
    build_tree(local.path());

    let store = Arc::new(MemoryStore::new());
    let client = client(&store);

    let uploaded = client
        .upload_directory(local.path(), BUCKET, "backup", UploadOptions::default())
        .await
        .unwrap();
    assert!(uploaded.is_success());
    assert_eq!(uploaded.total(), 3);
    assert_eq!(
        keys(&store, "backup/"),
        vec!["backup/a.txt", "backup/sub/b.txt", "backup/sub/deeper/c.txt"]
    );

    let restored = tempfile::tempdir().unwrap();
    let downloaded = client
        .download_directory(BUCKET, "backup/", restored.path(), DownloadOptions::default())
        .await
        .unwrap();
    assert!(downloaded.is_success());
    for name in ["a.txt", "sub/b.txt", "sub/deeper/c.txt"] {
        assert_eq!(std::fs::read(restored.path().join(name)).unwrap(), contents(name));
    }

    let copied = client
        .copy_directory((BUCKET, "backup/"), (BUCKET, "mirror/"), CopyOptions::default())
        .await
        .unwrap();
    assert_eq!(copied.completed.len(), 3);
    assert_eq!(
        keys(&store, "mirror/"),
        vec!["mirror/a.txt", "mirror/sub/b.txt", "mirror/sub/deeper/c.txt"]
    );

    let moved = client
        .rename_directory((BUCKET, "mirror/"), (BUCKET, "moved/"), CopyOptions::default())
        .await
        .unwrap();
    assert!(moved.is_success());
    assert!(keys(&store, "mirror/").is_empty());
    assert_eq!(keys(&store, "moved/").len(), 3);
    assert_eq!(
        store.object_data(BUCKET, "moved/sub/b.txt").unwrap().as_ref(),
        &contents("sub/b.txt")[..]
    );

    let planned = client
        .delete_directory(BUCKET, "moved/", false, true)
        .await
        .unwrap();
    assert_eq!(planned.total(), 3);
    assert_eq!(keys(&store, "moved/").len(), 3);

    let deleted = client
        .delete_directory(BUCKET, "moved/", false, false)
        .await
        .unwrap();
    assert_eq!(deleted.completed.len(), 3);
    assert!(keys(&store, "moved/").is_empty());

    let err = client
        .delete_directory(BUCKET, "moved/", false, false)
        .await
        .unwrap_err();
    assert!(err.is_usage_error());
    let forced = client
        .delete_directory(BUCKET, "moved/", true, false)
        .await
        .unwrap();
    assert_eq!(forced.total(), 0);
}

#[tokio::test]
async fn test_encrypted_directory_roundtrip() {
    let local = tempfile::tempdir().unwrap();
    build_tree(local.path());

    let alice = KeyPair::generate_with_bits(1024).unwrap();
    let provider = MemoryKeyProvider::new();
    provider.insert_pair("alice", &alice);

    let store = Arc::new(MemoryStore::new());
    let config = Config::default()
        .with_chunk_size(500)
        .with_retries(2, Duration::from_millis(1), Duration::from_millis(2));
    let client = CloudStoreClient::builder(config)
        .store(store.clone())
        .key_provider(Arc::new(provider))
        .build()
        .unwrap();

    client
        .upload_directory(
            local.path(),
            BUCKET,
            "enc",
            UploadOptions::default().with_encryption_key("alice"),
        )
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_ne!(
        store.object_data(BUCKET, "enc/a.txt").unwrap().as_ref(),
        &contents("a.txt")[..]
    );

    let restored = tempfile::tempdir().unwrap();
    client
        .download_directory(BUCKET, "enc/", restored.path(), DownloadOptions::default())
        .await
        .unwrap()
        .into_result()
        .unwrap();
    for name in ["a.txt", "sub/b.txt", "sub/deeper/c.txt"] {
        assert_eq!(std::fs::read(restored.path().join(name)).unwrap(), contents(name));
    }
}

#[tokio::test]
async fn test_directory_failures_are_collected() {
    let local = tempfile::tempdir().unwrap();
    build_tree(local.path());

    let store = Arc::new(MemoryStore::new());
    let client = client(&store);
    client
        .upload_directory(local.path(), BUCKET, "data", UploadOptions::default())
        .await
        .unwrap();

    // One destination file already exists and must not be overwritten
    let restored = tempfile::tempdir().unwrap();
    std::fs::write(restored.path().join("a.txt"), b"local edits").unwrap();

    let result = client
        .download_directory(BUCKET, "data/", restored.path(), DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(result.completed.len(), 2);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].0, "data/a.txt");
    assert_eq!(std::fs::read(restored.path().join("a.txt")).unwrap(), b"local edits");

    match result.into_result() {
        Err(ClientError::Batch { failed, total, .. }) => {
            assert_eq!(failed, 1);
            assert_eq!(total, 3);
        }
        other => panic!("expected a batch error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sibling_prefixes_keep_their_names() {
    let local = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let client = client(&store);
    for key in ["logs/a.txt", "logs-old/a.txt"] {
        let path = local.path().join(key.replace('/', "_"));
        std::fs::write(&path, contents(key)).unwrap();
        client
            .upload(&path, BUCKET, key, UploadOptions::default())
            .await
            .unwrap();
    }
    store.put_object(BUCKET, "logs/", Vec::new(), Default::default());

    let copied = client
        .copy_directory((BUCKET, "logs/"), (BUCKET, "dst/"), CopyOptions::default())
        .await
        .unwrap();
    assert!(copied.is_success());
    assert_eq!(keys(&store, "dst/"), vec!["dst/a.txt"]);

    let copied = client
        .copy_directory((BUCKET, "logs"), (BUCKET, "all"), CopyOptions::default())
        .await
        .unwrap();
    assert_eq!(copied.total(), 2);
    assert_eq!(
        keys(&store, "all/"),
        vec!["all/logs-old/a.txt", "all/logs/a.txt"]
    );

    let restored = tempfile::tempdir().unwrap();
    let downloaded = client
        .download_directory(BUCKET, "logs", restored.path(), DownloadOptions::default())
        .await
        .unwrap();
    assert!(downloaded.is_success());
    assert_eq!(
        std::fs::read(restored.path().join("logs/a.txt")).unwrap(),
        contents("logs/a.txt")
    );
    assert_eq!(
        std::fs::read(restored.path().join("logs-old/a.txt")).unwrap(),
        contents("logs-old/a.txt")
    );
    assert!(!restored.path().join("-old").exists());

    let moved = client
        .rename_directory((BUCKET, "logs/"), (BUCKET, "moved/"), CopyOptions::default())
        .await
        .unwrap();
    assert_eq!(moved.completed.len(), 1);
    assert_eq!(keys(&store, "moved/"), vec!["moved/a.txt"]);
    assert!(store.contains(BUCKET, "logs-old/a.txt"));

    // Directory placeholders are neither copied nor deleted
    let deleted = client
        .delete_directory(BUCKET, "logs", false, false)
        .await
        .unwrap();
    assert_eq!(deleted.completed.len(), 1);
    assert_eq!(deleted.completed[0].key, "logs-old/a.txt");
    assert!(store.contains(BUCKET, "logs/"));
    let err = client
        .delete_directory(BUCKET, "logs/", false, false)
        .await
        .unwrap_err();
    assert!(err.is_usage_error());
}

#[tokio::test]
async fn test_upload_directory_rejects_file_root() {
    let local = tempfile::tempdir().unwrap();
    let file = local.path().join("plain");
    std::fs::write(&file, b"x").unwrap();

    let store = Arc::new(MemoryStore::new());
    let err = client(&store)
        .upload_directory(&file, BUCKET, "p", UploadOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_usage_error());
}
