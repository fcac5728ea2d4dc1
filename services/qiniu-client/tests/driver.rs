//! Integration tests for the Qiniu driver, run against the in-memory mock.

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{Duration, Utc};
use futures::{StreamExt as _, TryStreamExt as _};
use qiniu_client::mock::{MockCall, MockQiniu, Operation};
use storage_driver::{ByteRange, Driver, Source, StorageErrorKind};

fn path(path: &str) -> &Utf8Path {
    Utf8Path::new(path)
}

async fn listing(client: &impl Driver, dir: &str) -> Vec<String> {
    let mut paths: Vec<String> = client
        .list_directory(path(dir))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    paths.sort();
    paths
}

async fn read_range(client: &impl Driver, key: &str, range: ByteRange) -> Bytes {
    let chunks: Vec<Bytes> = client
        .stream_read(path(key), Some(range))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    chunks.concat().into()
}

#[tokio::test]
async fn test_put_and_get_content() {
    let mock = MockQiniu::new();
    let client = mock.client();

    let link = path("docker/registry/v2/repositories/library/ubuntu/_layers/link");
    client.put_content(link, "sha256:abc".into()).await.unwrap();

    let data = client.get_content(link).await.unwrap();
    assert_eq!(data, "sha256:abc");
    assert_eq!(mock.count(Operation::Upload), 1);
    assert_eq!(mock.count(Operation::Download), 1);
}

#[tokio::test]
async fn test_empty_content() {
    let mock = MockQiniu::new();
    let client = mock.client();

    client.put_content(path("empty"), Bytes::new()).await.unwrap();
    assert_eq!(mock.object("empty").unwrap().len(), 0);

    let data = client.get_content(path("empty")).await.unwrap();
    assert!(data.is_empty());
    assert_eq!(client.get_size(path("empty")).await.unwrap(), 0);
}

#[tokio::test]
async fn test_overwrite() {
    let mock = MockQiniu::new();
    let client = mock.client();

    client.put_content(path("a"), "first".into()).await.unwrap();
    client.put_content(path("a"), "second".into()).await.unwrap();

    assert_eq!(client.get_content(path("a")).await.unwrap(), "second");
}

#[tokio::test]
async fn test_awkward_keys() {
    let mock = MockQiniu::new();
    let client = mock.client();

    let key = "repo/tag name+with%odd&chars?/data";
    client.put_content(path(key), "odd".into()).await.unwrap();

    assert_eq!(mock.keys(), vec![key.to_owned()]);
    assert_eq!(client.get_content(path(key)).await.unwrap(), "odd");
}

#[tokio::test]
async fn test_metadata() {
    let mock = MockQiniu::new();
    let client = mock.client();

    client.put_content(path("a/b"), "hello".into()).await.unwrap();

    let metadata = client.metadata(path("a/b")).await.unwrap();
    assert_eq!(metadata.size, 5);
    assert!(metadata.hash.is_some());
    assert_eq!(metadata.content_type.as_deref(), Some("application/octet-stream"));

    let now = Utc::now();
    assert!(metadata.created <= now + Duration::seconds(1));
    assert!(metadata.created > now - Duration::minutes(1));

    assert!(client.exists(path("a/b")).await);
}

#[tokio::test]
async fn test_missing_objects() {
    let mock = MockQiniu::new();
    let client = mock.client();

    let error = client.metadata(path("nope")).await.unwrap_err();
    assert_eq!(error.kind(), StorageErrorKind::NotFound);

    let error = client.get_content(path("nope")).await.unwrap_err();
    assert_eq!(error.kind(), StorageErrorKind::NotFound);

    let error = client.get_size(path("nope")).await.unwrap_err();
    assert!(error.is_not_found());

    assert!(!client.exists(path("nope")).await);
}

#[tokio::test]
async fn test_ranged_reads() {
    let mock = MockQiniu::new();
    mock.insert("blob", "hello world");
    let client = mock.client();

    assert_eq!(read_range(&client, "blob", ByteRange::inclusive(1, 3)).await, "ell");
    assert_eq!(read_range(&client, "blob", ByteRange::starting_at(6)).await, "world");
    assert_eq!(read_range(&client, "blob", ByteRange::inclusive(6, 100)).await, "world");
}

#[tokio::test]
async fn test_block_upload() {
    let mock = MockQiniu::new();
    let client = mock.client();

    let data: Bytes = (0..(5 * 1024 * 1024 + 17))
        .map(|i| (i % 251) as u8)
        .collect::<Vec<_>>()
        .into();
    client.put_content(path("big"), data.clone()).await.unwrap();

    assert_eq!(mock.count(Operation::Upload), 0);
    assert_eq!(mock.count(Operation::MakeBlock), 2);
    assert_eq!(mock.count(Operation::MakeFile), 1);
    assert_eq!(mock.object("big").unwrap(), data);

    assert_eq!(client.get_size(path("big")).await.unwrap(), data.len() as u64);
}

#[tokio::test]
async fn test_sized_source() {
    let mock = MockQiniu::new();
    let client = mock.client();

    let mut reader: &[u8] = b"sized content";
    client
        .stream_write(
            path("sized"),
            Source::Sized {
                reader: &mut reader,
                length: 13,
            },
        )
        .await
        .unwrap();

    assert_eq!(mock.object("sized").unwrap(), "sized content");
}

#[tokio::test]
async fn test_short_sized_source() {
    let mock = MockQiniu::new();
    let client = mock.client();

    let mut reader: &[u8] = b"short";
    let error = client
        .stream_write(
            path("short"),
            Source::Sized {
                reader: &mut reader,
                length: 10,
            },
        )
        .await
        .unwrap_err();

    assert_eq!(error.kind(), StorageErrorKind::Io);
    assert_eq!(mock.count(Operation::Upload), 0);
    assert!(mock.object("short").is_none());
}

fn spool_dir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, path)
}

fn spooled_files(dir: &Utf8Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[tokio::test]
async fn test_unsized_source_is_spooled() {
    let (_guard, dir) = spool_dir();
    let mock = MockQiniu::new();
    let mut config = mock.config();
    config.temp_dir = Some(dir.clone());
    let client = mock.client_with(config);

    let mut reader: &[u8] = b"streamed without a length";
    client
        .stream_write(path("unsized"), Source::Unsized(&mut reader))
        .await
        .unwrap();

    assert_eq!(mock.object("unsized").unwrap(), "streamed without a length");
    assert_eq!(spooled_files(&dir), 0);
}

#[tokio::test]
async fn test_failed_spooled_upload_cleans_up() {
    let (_guard, dir) = spool_dir();
    let mock = MockQiniu::new();
    let mut config = mock.config();
    config.temp_dir = Some(dir.clone());
    let client = mock.client_with(config);

    mock.fail(Operation::Upload);

    let mut reader: &[u8] = b"doomed";
    let error = client
        .stream_write(path("unsized"), Source::Unsized(&mut reader))
        .await
        .unwrap_err();

    assert_eq!(error.kind(), StorageErrorKind::Io);
    assert!(mock.object("unsized").is_none());
    assert_eq!(spooled_files(&dir), 0);
}

#[tokio::test]
async fn test_upload_files() {
    let (_guard, dir) = spool_dir();
    let mock = MockQiniu::new();
    let client = mock.client();

    let local = dir.join("local.txt");
    std::fs::write(&local, "from disk").unwrap();
    client.upload_file(path("remote"), &local).await.unwrap();
    assert_eq!(mock.object("remote").unwrap(), "from disk");

    let copy = dir.join("nested/copy.txt");
    client.download_file(path("remote"), &copy).await.unwrap();
    assert_eq!(std::fs::read_to_string(&copy).unwrap(), "from disk");
}

#[tokio::test]
async fn test_list_directory() {
    let mock = MockQiniu::new();
    for key in ["a/x", "a/y/z", "ab/y", "b"] {
        mock.insert(key, "data");
    }
    let client = mock.client();

    assert_eq!(listing(&client, "a").await, vec!["a/x", "a/y/z"]);
    assert_eq!(listing(&client, "").await, vec!["a/x", "a/y/z", "ab/y", "b"]);
}

#[tokio::test]
async fn test_list_pages() {
    let mock = MockQiniu::new().with_page_size(1);
    for key in ["dir/1", "dir/2", "dir/3"] {
        mock.insert(key, "data");
    }
    let client = mock.client();

    assert_eq!(listing(&client, "dir").await, vec!["dir/1", "dir/2", "dir/3"]);
    assert_eq!(mock.count(Operation::List), 3);
}

#[tokio::test]
async fn test_list_is_lazy() {
    let mock = MockQiniu::new().with_page_size(1);
    for key in ["dir/1", "dir/2", "dir/3"] {
        mock.insert(key, "data");
    }
    let client = mock.client();

    let mut stream = client.list_directory(path("dir")).await.unwrap();
    assert_eq!(mock.count(Operation::List), 1);

    assert_eq!(stream.next().await.unwrap().unwrap(), "dir/1");
    assert_eq!(mock.count(Operation::List), 1);

    assert_eq!(stream.next().await.unwrap().unwrap(), "dir/2");
    assert_eq!(mock.count(Operation::List), 2);
}

#[tokio::test]
async fn test_list_failure_mid_stream() {
    let mock = MockQiniu::new().with_page_size(1);
    for key in ["dir/1", "dir/2"] {
        mock.insert(key, "data");
    }
    let client = mock.client();
    mock.fail_after(Operation::List, 1);

    let mut stream = client.list_directory(path("dir")).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "dir/1");

    let error = stream.next().await.unwrap().unwrap_err();
    assert_eq!(error.kind(), StorageErrorKind::Io);
}

#[tokio::test]
async fn test_empty_listing_is_not_found() {
    let mock = MockQiniu::new();
    mock.insert("other/file", "data");
    let client = mock.client();

    let error = client.list_directory(path("missing")).await.err().unwrap();
    assert_eq!(error.kind(), StorageErrorKind::NotFound);
}

#[tokio::test]
async fn test_remove() {
    let mock = MockQiniu::new();
    mock.insert("a/b", "data");
    let client = mock.client();

    client.remove(path("a/b")).await.unwrap();
    assert!(mock.object("a/b").is_none());
    assert_eq!(mock.count(Operation::Delete), 1);

    assert!(!client.exists(path("a/b")).await);
}

#[tokio::test]
async fn test_remove_missing() {
    let mock = MockQiniu::new();
    let client = mock.client();

    let error = client.remove(path("a/b")).await.unwrap_err();
    assert_eq!(error.kind(), StorageErrorKind::NotFound);
    assert_eq!(mock.count(Operation::Delete), 0);
}

#[tokio::test]
async fn test_service_failures_are_io_errors() {
    let mock = MockQiniu::new();
    mock.insert("a", "data");
    let client = mock.client();

    mock.fail(Operation::Stat);
    let error = client.metadata(path("a")).await.unwrap_err();
    assert_eq!(error.kind(), StorageErrorKind::Io);
    assert!(!client.exists(path("a")).await);

    let error = client.remove(path("a")).await.unwrap_err();
    assert_eq!(error.kind(), StorageErrorKind::Io);
    assert_eq!(mock.count(Operation::Delete), 0);

    mock.heal(Operation::Stat);
    mock.fail(Operation::Download);
    let error = client.get_content(path("a")).await.unwrap_err();
    assert_eq!(error.kind(), StorageErrorKind::Io);

    mock.fail(Operation::List);
    let error = client.list_directory(path("")).await.err().unwrap();
    assert_eq!(error.kind(), StorageErrorKind::Io);
}

#[tokio::test]
async fn test_bad_credentials_are_rejected() {
    let mock = MockQiniu::new();
    mock.insert("a", "data");

    let mut config = mock.config();
    config.secret_key = "not-the-secret".into();
    let client = mock.client_with(config);

    let error = client.put_content(path("b"), "data".into()).await.unwrap_err();
    assert_eq!(error.kind(), StorageErrorKind::Io);
    assert!(mock.object("b").is_none());

    let error = client.metadata(path("a")).await.unwrap_err();
    assert_eq!(error.kind(), StorageErrorKind::Io);

    let error = client.get_content(path("a")).await.unwrap_err();
    assert_eq!(error.kind(), StorageErrorKind::Io);
}

#[tokio::test]
async fn test_virtual_root() {
    let mock = MockQiniu::new();
    mock.insert("elsewhere/file", "data");

    let mut config = mock.config();
    config.root = Some("/registry/".into());
    let client = mock.client_with(config);

    client.put_content(path("a/b"), "rooted".into()).await.unwrap();
    assert_eq!(mock.object("registry/a/b").unwrap(), "rooted");

    assert_eq!(client.get_content(path("a/b")).await.unwrap(), "rooted");
    assert_eq!(listing(&client, "").await, vec!["a/b"]);
    assert_eq!(listing(&client, "a").await, vec!["a/b"]);

    let url = client.content_redirect_url(path("a/b")).unwrap().unwrap();
    assert_eq!(url.path(), "/registry/a/b");

    client.remove(path("a/b")).await.unwrap();
    assert!(mock.object("registry/a/b").is_none());
    assert!(mock.object("elsewhere/file").is_some());
}

#[tokio::test]
async fn test_long_sized_source() {
    let mock = MockQiniu::new();
    let client = mock.client();

    let mut reader: &[u8] = b"hello world";
    let error = client
        .stream_write(
            path("long"),
            Source::Sized {
                reader: &mut reader,
                length: 5,
            },
        )
        .await
        .unwrap_err();

    assert_eq!(error.kind(), StorageErrorKind::Io);
    assert_eq!(mock.count(Operation::Upload), 0);
    assert!(mock.object("long").is_none());
}

#[tokio::test]
async fn test_long_sized_block_source() {
    let mock = MockQiniu::new();
    let client = mock.client();

    let data = vec![7u8; 4 * 1024 * 1024 + 10];
    let mut reader: &[u8] = &data;
    let error = client
        .stream_write(
            path("long"),
            Source::Sized {
                reader: &mut reader,
                length: 4 * 1024 * 1024 + 1,
            },
        )
        .await
        .unwrap_err();

    assert_eq!(error.kind(), StorageErrorKind::Io);
    assert_eq!(mock.count(Operation::MakeBlock), 2);
    assert_eq!(mock.count(Operation::MakeFile), 0);
    assert!(mock.object("long").is_none());
}

#[tokio::test]
async fn test_huge_declared_length() {
    let mock = MockQiniu::new();
    let client = mock.client();

    let mut reader: &[u8] = b"tiny";
    let error = client
        .stream_write(
            path("huge"),
            Source::Sized {
                reader: &mut reader,
                length: u64::MAX,
            },
        )
        .await
        .unwrap_err();

    assert_eq!(error.kind(), StorageErrorKind::Io);
    assert_eq!(mock.count(Operation::MakeBlock), 0);
    assert_eq!(mock.count(Operation::MakeFile), 0);
    assert!(mock.object("huge").is_none());
}

#[tokio::test]
async fn test_tokens_outlive_the_client() {
    let mock = MockQiniu::new();
    let mut config = mock.config();
    config.token_lifetime = 1;
    let client = mock.client_with(config);

    tokio::time::sleep(std::time::Duration::from_millis(2100)).await;

    client.put_content(path("late"), "still valid".into()).await.unwrap();
    assert_eq!(client.get_content(path("late")).await.unwrap(), "still valid");

    let url = client.content_redirect_url(path("late")).unwrap().unwrap();
    let deadline: i64 = url
        .query()
        .unwrap()
        .split('&')
        .find_map(|pair| pair.strip_prefix("e="))
        .unwrap()
        .parse()
        .unwrap();
    let now = Utc::now().timestamp();
    assert!(deadline >= now && deadline <= now + 1);
}

#[tokio::test]
async fn test_removal_calls() {
    let mock = MockQiniu::new();
    mock.insert("a/b", "data");
    let client = mock.client();

    client.remove(path("a/b")).await.unwrap();
    assert_eq!(
        mock.calls(),
        vec![
            MockCall {
                operation: Operation::Stat,
                key: Some("a/b".into()),
            },
            MockCall {
                operation: Operation::Delete,
                key: Some("a/b".into()),
            },
        ]
    );

    mock.clear_calls();
    assert!(mock.calls().is_empty());
    assert_eq!(mock.count(Operation::Stat), 0);
}
