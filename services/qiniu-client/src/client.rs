//! Core client for accessing objects on Qiniu using the storage driver API.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use eyre::Context;
use futures::{StreamExt as _, TryStreamExt as _};
use http::Uri;

use storage_driver::{
    rooted, ByteRange, ByteStream, Driver, Metadata, PathStream, Source, StorageError,
    StorageErrorKind,
};

use crate::config::Settings;
use crate::transport::Transport;

use super::QINIU_STORAGE_NAME;
use super::QINIU_STORAGE_SCHEME;

/// API client for a single Qiniu bucket.
///
/// Create one from a [`crate::QiniuConfig`]. Clones share the transport and
/// the credentials.
#[derive(Debug, Clone)]
pub struct QiniuClient {
    pub(crate) transport: Transport,
    pub(crate) settings: Arc<Settings>,
}

impl QiniuClient {
    pub(crate) fn from_parts(transport: Transport, settings: Settings) -> Self {
        QiniuClient {
            transport,
            settings: Arc::new(settings),
        }
    }

    /// The bucket this client stores objects in.
    pub fn bucket(&self) -> &str {
        &self.settings.bucket
    }

    /// The virtual root prepended to every key, empty when unset.
    pub fn root(&self) -> &Utf8Path {
        &self.settings.root
    }

    /// The object key for a normalized registry path.
    pub fn key(&self, path: &Utf8Path) -> Utf8PathBuf {
        rooted(&self.settings.root, path)
    }

    fn error(
        &self,
        kind: StorageErrorKind,
        path: &Utf8Path,
    ) -> impl FnOnce(eyre::Report) -> StorageError + '_ {
        let path = path.to_string();
        move |report| {
            StorageError::builder(QINIU_STORAGE_NAME, kind, report)
                .bucket(self.bucket())
                .path(path)
                .build()
        }
    }

    fn not_found(&self, path: &Utf8Path) -> StorageError {
        StorageError::builder(
            QINIU_STORAGE_NAME,
            StorageErrorKind::NotFound,
            format!("{path} is not there"),
        )
        .bucket(self.bucket())
        .path(path.as_str())
        .build()
    }
}

#[async_trait::async_trait]
impl Driver for QiniuClient {
    fn name(&self) -> &'static str {
        QINIU_STORAGE_NAME
    }

    fn scheme(&self) -> &str {
        QINIU_STORAGE_SCHEME
    }

    fn content_redirect_url(&self, path: &Utf8Path) -> Result<Option<Uri>, StorageError> {
        let key = self.key(path);
        let url = self
            .private_url(&key)
            .with_context(|| format!("sign download url for {key}"))
            .map_err(self.error(StorageErrorKind::Io, path))?;
        Ok(Some(url))
    }

    async fn metadata(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        let key = self.key(path);
        match self.qiniu_stat(&key).await {
            Ok(info) => Ok(info.into()),
            Err(error) if error.is_not_found() => Err(self.not_found(path)),
            Err(error) => Err(error)
                .with_context(|| format!("stat qiniu://{}/{key}", self.bucket()))
                .map_err(self.error(StorageErrorKind::Io, path)),
        }
    }

    async fn stream_read(
        &self,
        path: &Utf8Path,
        range: Option<ByteRange>,
    ) -> Result<ByteStream, StorageError> {
        let key = self.key(path);
        let stream = match self.qiniu_download(&key, range).await {
            Ok(stream) => stream,
            Err(error) if error.is_not_found() => return Err(self.not_found(path)),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("open download stream for {key}"))
                    .map_err(self.error(StorageErrorKind::Io, path))
            }
        };

        let path = path.to_string();
        let bucket = self.bucket().to_owned();
        Ok(stream
            .map_err(move |error| {
                StorageError::builder(QINIU_STORAGE_NAME, StorageErrorKind::Io, error)
                    .bucket(bucket.clone())
                    .path(path.clone())
                    .context("read download stream")
                    .build()
            })
            .boxed())
    }

    async fn stream_write(
        &self,
        path: &Utf8Path,
        source: Source<'_>,
    ) -> Result<(), StorageError> {
        let key = self.key(path);
        self.upload_source(&key, source)
            .await
            .with_context(|| format!("upload to qiniu://{}/{key}", self.bucket()))
            .map_err(self.error(StorageErrorKind::Io, path))
    }

    async fn list_directory(&self, path: &Utf8Path) -> Result<PathStream, StorageError> {
        match self.list_paths(path).await {
            Ok(Some(stream)) => Ok(stream),
            Ok(None) => Err(self.not_found(path)),
            Err(error) => Err(error)
                .with_context(|| format!("list qiniu://{}/{path}", self.bucket()))
                .map_err(self.error(StorageErrorKind::Io, path)),
        }
    }

    async fn remove(&self, path: &Utf8Path) -> Result<(), StorageError> {
        // Confirm presence first, so a missing key is reported as such
        // without issuing a delete.
        self.metadata(path).await?;

        let key = self.key(path);
        self.qiniu_delete(&key)
            .await
            .with_context(|| format!("delete qiniu://{}/{key}", self.bucket()))
            .map_err(self.error(StorageErrorKind::Io, path))
    }
}
