use std::collections::BTreeMap;

use bytes::Bytes;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt as _};
use tokio::io::AsyncReadExt as _;
use tokio::sync::RwLock;

use storage_driver::{
    directory_prefix, ByteRange, ByteStream, Driver, Metadata, PathStream, Reader, Source,
    StorageError, StorageErrorKind,
};

const MEMORY_STORAGE_NAME: &str = "memory";

/// Helper to convert io::Error to StorageError with appropriate kind detection
fn io_error_to_storage(err: std::io::Error) -> StorageError {
    let kind = match err.kind() {
        std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
        _ => StorageErrorKind::Io,
    };
    StorageError::new(MEMORY_STORAGE_NAME, kind, err)
}

#[derive(Debug, Clone)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Bytes,
}

impl From<Bytes> for MemoryFileItem {
    fn from(data: Bytes) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
            hash: None,
            content_type: None,
        }
    }
}

async fn read_all(reader: &mut Reader<'_>, limit: Option<u64>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    match limit {
        Some(length) => (&mut *reader).take(length).read_to_end(&mut buf).await?,
        None => reader.read_to_end(&mut buf).await?,
    };
    Ok(buf)
}

fn size_mismatch(path: &Utf8Path, message: String) -> StorageError {
    StorageError::builder(MEMORY_STORAGE_NAME, StorageErrorKind::Io, message)
        .path(path.as_str())
        .build()
}

/// Storage driver that stores objects in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, MemoryFileItem>>,
}

impl MemoryStorage {
    /// Create a new, empty `MemoryStorage` instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of objects stored.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Whether no objects are stored.
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn not_found(&self, path: &Utf8Path) -> StorageError {
        StorageError::not_found(MEMORY_STORAGE_NAME, path.as_str())
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        MEMORY_STORAGE_NAME
    }

    fn scheme(&self) -> &str {
        "memory"
    }

    async fn metadata(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        let objects = self.objects.read().await;
        objects
            .get(path.as_str())
            .map(Metadata::from)
            .ok_or_else(|| self.not_found(path))
    }

    async fn stream_read(
        &self,
        path: &Utf8Path,
        range: Option<ByteRange>,
    ) -> Result<ByteStream, StorageError> {
        let objects = self.objects.read().await;
        let data = objects
            .get(path.as_str())
            .ok_or_else(|| self.not_found(path))?
            .data
            .clone();

        let data = match range {
            Some(range) => data.slice(range.clamp(data.len())),
            None => data,
        };
        Ok(stream::once(async move { Ok::<_, StorageError>(data) }).boxed())
    }

    async fn stream_write(
        &self,
        path: &Utf8Path,
        source: Source<'_>,
    ) -> Result<(), StorageError> {
        let data = match source {
            Source::Bytes(bytes) => bytes,
            Source::Sized { reader, length } => {
                let buf = read_all(reader, Some(length))
                    .await
                    .map_err(|err| io_error_to_storage(err).at(path.as_str()))?;
                if buf.len() as u64 != length {
                    return Err(size_mismatch(
                        path,
                        format!("expected {length} bytes, read {}", buf.len()),
                    ));
                }

                let mut extra = [0u8; 1];
                let overflow = reader
                    .read(&mut extra)
                    .await
                    .map_err(|err| io_error_to_storage(err).at(path.as_str()))?;
                if overflow > 0 {
                    return Err(size_mismatch(
                        path,
                        format!("source holds more than the expected {length} bytes"),
                    ));
                }
                buf.into()
            }
            Source::Unsized(reader) => read_all(reader, None)
                .await
                .map_err(|err| io_error_to_storage(err).at(path.as_str()))?
                .into(),
        };

        tracing::trace!(%path, size = data.len(), "store memory object");
        let mut objects = self.objects.write().await;
        objects.insert(path.to_string(), data.into());
        Ok(())
    }

    async fn list_directory(&self, path: &Utf8Path) -> Result<PathStream, StorageError> {
        let prefix = directory_prefix(path);
        tracing::trace!(%prefix, "list memory objects");

        let objects = self.objects.read().await;
        let paths: Vec<_> = objects
            .range(prefix.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(&prefix))
            .cloned()
            .map(Ok::<_, StorageError>)
            .collect();

        if paths.is_empty() {
            return Err(self.not_found(path));
        }
        Ok(stream::iter(paths).boxed())
    }

    async fn remove(&self, path: &Utf8Path) -> Result<(), StorageError> {
        let mut objects = self.objects.write().await;
        objects
            .remove(path.as_str())
            .map(|_| ())
            .ok_or_else(|| self.not_found(path))
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt as _;

    use super::*;

    fn path(path: &str) -> &Utf8Path {
        Utf8Path::new(path)
    }

    #[tokio::test]
    async fn content_roundtrip() {
        let storage = MemoryStorage::new();
        storage
            .put_content(path("a/b"), Bytes::from_static(b"hello"))
            .await
            .unwrap();

        assert_eq!(storage.get_content(path("a/b")).await.unwrap(), "hello");
        assert_eq!(storage.get_size(path("a/b")).await.unwrap(), 5);
        assert!(storage.exists(path("a/b")).await);
        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn ranges_are_sliced() {
        let storage = MemoryStorage::new();
        storage
            .put_content(path("blob"), Bytes::from_static(b"hello world"))
            .await
            .unwrap();

        let chunks: Vec<Bytes> = storage
            .stream_read(path("blob"), Some(ByteRange::inclusive(6, 8)))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), b"wor");
    }

    #[tokio::test]
    async fn readers_are_drained() {
        let storage = MemoryStorage::new();

        let mut reader: &[u8] = b"unsized";
        storage
            .stream_write(path("u"), Source::Unsized(&mut reader))
            .await
            .unwrap();
        assert_eq!(storage.get_content(path("u")).await.unwrap(), "unsized");

        let mut reader: &[u8] = b"short";
        let error = storage
            .stream_write(
                path("s"),
                Source::Sized {
                    reader: &mut reader,
                    length: 10,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(error.kind(), StorageErrorKind::Io);
        assert!(!storage.exists(path("s")).await);
    }

    #[tokio::test]
    async fn overlong_readers_are_rejected() {
        let storage = MemoryStorage::new();

        let mut reader: &[u8] = b"hello world";
        let error = storage
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
        assert_eq!(error.path(), Some("long"));
        assert!(!storage.exists(path("long")).await);

        let mut reader: &[u8] = b"hello";
        storage
            .stream_write(
                path("exact"),
                Source::Sized {
                    reader: &mut reader,
                    length: 5,
                },
            )
            .await
            .unwrap();
        assert_eq!(storage.get_content(path("exact")).await.unwrap(), "hello");
    }

    #[test]
    fn io_errors_carry_their_path() {
        let error = io_error_to_storage(std::io::ErrorKind::NotFound.into()).at("a/b");
        assert!(error.is_not_found());
        assert_eq!(error.path(), Some("a/b"));
    }

    #[tokio::test]
    async fn listing_uses_directories() {
        let storage = MemoryStorage::new();
        for key in ["a/1", "a/2", "ab/1", "b/1"] {
            storage
                .put_content(path(key), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        let paths: Vec<String> = storage
            .list_directory(path("a"))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(paths, vec!["a/1", "a/2"]);

        let error = storage.list_directory(path("c")).await.err().unwrap();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn remove_missing() {
        let storage = MemoryStorage::new();
        let error = storage.remove(path("nope")).await.unwrap_err();
        assert!(error.is_not_found());
        assert!(storage.is_empty().await);
    }
}
