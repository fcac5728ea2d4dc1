//! # Storage backends
//!
//! Configuration and unification for the storage backends used by the
//! registry: a [`StorageConfig`] selects a driver, and [`Storage`] wraps it
//! with path normalization and a content cache.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use camino::Utf8Path;
use echocache::ContentCache;
#[cfg(feature = "qiniu")]
use eyre::Context;
use futures::{StreamExt as _, TryStreamExt as _};
use http::Uri;
use serde::Deserialize;
use storage_driver::{normalize, ByteStream, PathStream, Source, StorageErrorKind};
use tokio::io;
use tokio_util::io::{ReaderStream, StreamReader};

pub(crate) mod memory;

#[doc(inline)]
pub use memory::MemoryStorage;

#[doc(inline)]
pub use storage_driver::{Driver, Metadata, StorageError};

/// Default chunk size for [`Storage::get_stream`].
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

const STORAGE_ENGINE: &str = "storage";

/// Which storage backend to use.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Objects held in memory, lost on exit.
    Memory,

    /// A Qiniu bucket.
    #[cfg(feature = "qiniu")]
    Qiniu(qiniu_client::QiniuConfig),

    /// A Qiniu bucket configured from `QINIU_*` environment variables.
    #[cfg(feature = "qiniu")]
    #[serde(alias = "qiniuenv")]
    QiniuEnv,
}

impl StorageConfig {
    /// Construct the configured driver.
    #[tracing::instrument]
    pub fn driver(self) -> Result<ArcDriver, StorageError> {
        let driver: ArcDriver = match self {
            StorageConfig::Memory => Arc::new(MemoryStorage::new()),
            #[cfg(feature = "qiniu")]
            StorageConfig::Qiniu(config) => Arc::new(
                config
                    .client()
                    .context("configuring qiniu client")
                    .map_err(StorageError::with("qiniu", StorageErrorKind::InvalidRequest))?,
            ),
            #[cfg(feature = "qiniu")]
            StorageConfig::QiniuEnv => Arc::new(
                qiniu_client::QiniuConfig::from_env()
                    .and_then(|config| config.client())
                    .context("configuring qiniu client from env")
                    .map_err(StorageError::with("qiniu", StorageErrorKind::InvalidRequest))?,
            ),
        };
        Ok(driver)
    }
}

/// Content cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Maximum number of cached objects. Zero disables the cache.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Seconds a cached object stays valid. Unset means until evicted.
    #[serde(default)]
    pub ttl: Option<u64>,
}

fn default_cache_capacity() -> usize {
    256
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl: None,
        }
    }
}

impl CacheConfig {
    /// A cache which stores nothing.
    pub fn disabled() -> Self {
        Self {
            capacity: 0,
            ttl: None,
        }
    }

    fn build(&self) -> ContentCache<String, Bytes> {
        ContentCache::new(self.capacity, self.ttl.map(Duration::from_secs))
    }
}

/// Full storage configuration: a backend and its content cache.
///
/// ```toml
/// [driver.qiniu]
/// access-key = "..."
/// secret-key = "..."
/// bucket = "registry"
/// domain = "cdn.example.com"
/// root = "docker"
///
/// [cache]
/// capacity = 1024
/// ttl = 300
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// The storage backend.
    pub driver: StorageConfig,

    /// Content cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Construct the storage facade.
    pub fn build(self) -> Result<Storage, StorageError> {
        Ok(Storage::with_cache(self.driver.driver()?, &self.cache))
    }
}

/// A shared, type-erased driver.
pub type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// The registry's view of storage.
///
/// Accepts registry paths with or without leading and trailing slashes,
/// normalizes them before handing them to the driver, and caches the results
/// of [`Storage::get_content`] until they are overwritten or removed.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
    cache: ContentCache<String, Bytes>,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver with the default cache settings.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self::with_cache(Arc::new(driver), &CacheConfig::default())
    }

    /// Wrap a shared driver with the given cache settings.
    pub fn with_cache(driver: ArcDriver, cache: &CacheConfig) -> Self {
        Self {
            driver,
            cache: cache.build(),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// The underlying driver.
    pub fn driver(&self) -> &ArcDriver {
        &self.driver
    }

    /// A time-limited URL from which the object can be fetched directly.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub fn content_redirect_url(&self, path: &str) -> Result<Option<Uri>, StorageError> {
        self.driver.content_redirect_url(normalize(path))
    }

    /// The full content of an object, served from the cache when possible.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn get_content(&self, path: &str) -> Result<Bytes, StorageError> {
        let path = normalize(path);
        self.cache
            .get_or_compute(path.to_string(), || self.driver.get_content(path))
            .await
    }

    /// Stream an object in chunks of at most `chunk_size` bytes
    /// ([`DEFAULT_CHUNK_SIZE`] when `None` or zero).
    ///
    /// Fails before the first chunk if the object is missing.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn get_stream(
        &self,
        path: &str,
        chunk_size: Option<usize>,
    ) -> Result<ByteStream, StorageError> {
        let chunk_size = chunk_size
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_CHUNK_SIZE);
        let stream = self.driver.stream_read(normalize(path), None).await?;

        let reader = StreamReader::new(stream.map_err(io::Error::other));
        Ok(ReaderStream::with_capacity(reader, chunk_size)
            .map_err(from_io)
            .boxed())
    }

    /// Store an object, returning its normalized path.
    #[tracing::instrument(skip(self, content), fields(driver=self.driver.name()))]
    pub async fn put_content(
        &self,
        path: &str,
        content: impl Into<Bytes>,
    ) -> Result<String, StorageError> {
        let path = normalize(path);
        let content = content.into();
        let result = self.driver.put_content(path, content.clone()).await;
        match result {
            Ok(()) => self.cache.set(path.to_string(), content),
            Err(_) => self.cache.invalidate(path.as_str()),
        }
        result.map(|()| path.to_string())
    }

    /// Store an object from a reader, returning its normalized path.
    #[tracing::instrument(skip(self, source), fields(driver=self.driver.name()))]
    pub async fn put_stream(&self, path: &str, source: Source<'_>) -> Result<String, StorageError> {
        let path = normalize(path);
        let result = self.driver.stream_write(path, source).await;
        self.cache.invalidate(path.as_str());
        result.map(|()| path.to_string())
    }

    /// Metadata for an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn metadata(&self, path: &str) -> Result<Metadata, StorageError> {
        self.driver.metadata(normalize(path)).await
    }

    /// Lazily list every object below a directory.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn list_directory(&self, path: &str) -> Result<PathStream, StorageError> {
        self.driver.list_directory(normalize(path)).await
    }

    /// Whether an object exists. Never fails.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn exists(&self, path: &str) -> bool {
        self.driver.exists(normalize(path)).await
    }

    /// Delete an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn remove(&self, path: &str) -> Result<(), StorageError> {
        let path = normalize(path);
        let result = self.driver.remove(path).await;
        self.cache.invalidate(path.as_str());
        result
    }

    /// The size of an object in bytes.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn get_size(&self, path: &str) -> Result<u64, StorageError> {
        self.driver.get_size(normalize(path)).await
    }

    /// Download an object into a local file.
    pub async fn download_file(&self, path: &str, local: &Utf8Path) -> Result<(), StorageError> {
        self.driver.download_file(normalize(path), local).await
    }

    /// Upload an object from a local file, returning its normalized path.
    pub async fn upload_file(&self, path: &str, local: &Utf8Path) -> Result<String, StorageError> {
        let path = normalize(path);
        let result = self.driver.upload_file(path, local).await;
        self.cache.invalidate(path.as_str());
        result.map(|()| path.to_string())
    }
}

/// Recover the driver error from a chunked stream's `io::Error`.
fn from_io(error: io::Error) -> StorageError {
    let kind = error.kind();
    match error.into_inner() {
        Some(inner) => match inner.downcast::<StorageError>() {
            Ok(error) => *error,
            Err(inner) => {
                StorageError::new(STORAGE_ENGINE, StorageErrorKind::Io, io::Error::new(kind, inner))
            }
        },
        None => StorageError::new(STORAGE_ENGINE, StorageErrorKind::Io, io::Error::from(kind)),
    }
}
