use std::{fmt, ops::Deref, sync::Arc};

use bytes::{Bytes, BytesMut};
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use eyre::WrapErr;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use http::Uri;
use tokio::io::{self, AsyncWriteExt};

use crate::error::{StorageError, StorageErrorKind};

/// A reader stream for file contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// A lazily produced, finite, non-restartable sequence of object bytes.
pub type ByteStream = BoxStream<'static, Result<Bytes, StorageError>>;

/// A lazily produced sequence of object paths, as returned by a listing.
pub type PathStream = BoxStream<'static, Result<String, StorageError>>;

/// Object metadata, as reported by the storage backend at call time.
///
/// Only `size` and `created` are guaranteed; backends fill in the rest
/// when the service reports them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the object in bytes.
    pub size: u64,

    /// When the object was written.
    pub created: DateTime<Utc>,

    /// Content hash reported by the backend (an etag, not necessarily a digest).
    pub hash: Option<String>,

    /// MIME type recorded by the backend.
    pub content_type: Option<String>,
}

/// An inclusive byte range within an object, as in an HTTP `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    /// First byte to return.
    pub start: u64,

    /// Last byte to return, or `None` to read to the end of the object.
    pub end: Option<u64>,
}

impl ByteRange {
    /// A range from `start` to the end of the object.
    pub fn starting_at(start: u64) -> Self {
        ByteRange { start, end: None }
    }

    /// A range covering `start..=end`.
    pub fn inclusive(start: u64, end: u64) -> Self {
        ByteRange {
            start,
            end: Some(end),
        }
    }

    /// The value of an HTTP `Range` header selecting this range.
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }

    /// The slice of a buffer of `len` bytes selected by this range,
    /// clamped to the buffer.
    pub fn clamp(&self, len: usize) -> std::ops::Range<usize> {
        let start = usize::try_from(self.start).unwrap_or(usize::MAX).min(len);
        let end = match self.end {
            Some(end) => usize::try_from(end)
                .unwrap_or(usize::MAX)
                .saturating_add(1)
                .min(len),
            None => len,
        };
        start..end.max(start)
    }
}

/// The content to store with [`Driver::stream_write`].
pub enum Source<'s> {
    /// Fully materialized content.
    Bytes(Bytes),

    /// A reader which will produce exactly `length` bytes.
    Sized {
        /// The content.
        reader: &'s mut Reader<'s>,

        /// The number of bytes `reader` will produce.
        length: u64,
    },

    /// A reader of unknown length, read until EOF.
    Unsized(&'s mut Reader<'s>),
}

impl Source<'_> {
    /// The length of the content, when known up front.
    pub fn length(&self) -> Option<u64> {
        match self {
            Source::Bytes(bytes) => Some(bytes.len() as u64),
            Source::Sized { length, .. } => Some(*length),
            Source::Unsized(_) => None,
        }
    }
}

impl fmt::Debug for Source<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Source::Sized { length, .. } => {
                f.debug_struct("Sized").field("length", length).finish()
            }
            Source::Unsized(_) => f.debug_tuple("Unsized").finish(),
        }
    }
}

impl From<Bytes> for Source<'_> {
    fn from(value: Bytes) -> Self {
        Source::Bytes(value)
    }
}

/// A storage driver, which provides the registry's view of a storage backend.
///
/// Paths handed to a driver are already normalized (see [`crate::normalize`]);
/// the driver maps them onto its own key space.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// The Uri scheme of the driver.
    fn scheme(&self) -> &str;

    /// A time-scoped URL from which a client can download the object directly,
    /// bypassing the driver. `None` when the backend cannot serve one.
    fn content_redirect_url(&self, path: &Utf8Path) -> Result<Option<Uri>, StorageError> {
        let _ = path;
        Ok(None)
    }

    /// Get the metadata for an object.
    async fn metadata(&self, path: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Open a download stream over an object, optionally limited to a byte range.
    ///
    /// Fails with [`StorageErrorKind::NotFound`] before producing any bytes
    /// if the object is missing.
    async fn stream_read(
        &self,
        path: &Utf8Path,
        range: Option<ByteRange>,
    ) -> Result<ByteStream, StorageError>;

    /// Store an object, replacing any previous content.
    async fn stream_write(&self, path: &Utf8Path, source: Source<'_>)
        -> Result<(), StorageError>;

    /// Lazily list the paths of all objects below a directory path.
    ///
    /// A listing which matches nothing fails with [`StorageErrorKind::NotFound`].
    async fn list_directory(&self, path: &Utf8Path) -> Result<PathStream, StorageError>;

    /// Delete an object, failing with [`StorageErrorKind::NotFound`] if it is
    /// not there.
    async fn remove(&self, path: &Utf8Path) -> Result<(), StorageError>;

    /// Read the full content of an object.
    async fn get_content(&self, path: &Utf8Path) -> Result<Bytes, StorageError> {
        let mut stream = self.stream_read(path, None).await?;
        let mut buffer = BytesMut::new();
        while let Some(chunk) = stream.try_next().await? {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }

    /// Store the full content of an object.
    async fn put_content(&self, path: &Utf8Path, content: Bytes) -> Result<(), StorageError> {
        self.stream_write(path, Source::Bytes(content)).await
    }

    /// Whether the object exists. Every failure reads as `false`.
    async fn exists(&self, path: &Utf8Path) -> bool {
        match self.metadata(path).await {
            Ok(_) => true,
            Err(error) => {
                tracing::trace!(%path, "treating as missing: {error}");
                false
            }
        }
    }

    /// The size of the object in bytes.
    async fn get_size(&self, path: &Utf8Path) -> Result<u64, StorageError> {
        Ok(self.metadata(path).await?.size)
    }

    /// Download an object into a local file.
    async fn download_file(&self, path: &Utf8Path, local: &Utf8Path) -> Result<(), StorageError> {
        tracing::trace!(%path, %local, "Downloading to file: {local}");

        if let Some(parent) = local.parent().filter(|p| !p.as_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .wrap_err("create parents of local destination file")
                .map_err(StorageError::with("tokio::fs", StorageErrorKind::Io))?;
        }

        let mut stream = self.stream_read(path, None).await?;
        let mut file = tokio::io::BufWriter::new(
            tokio::fs::File::create(local)
                .await
                .wrap_err("create local file for writing")
                .map_err(StorageError::with("tokio::fs", StorageErrorKind::Io))?,
        );

        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?)
                .await
                .wrap_err("write local file")
                .map_err(StorageError::with("tokio::fs", StorageErrorKind::Io))?;
        }

        file.shutdown()
            .await
            .wrap_err("shutdown file buffer")
            .map_err(StorageError::with("tokio::fs", StorageErrorKind::Io))?;
        Ok(())
    }

    /// Upload an object from a local file.
    async fn upload_file(&self, path: &Utf8Path, local: &Utf8Path) -> Result<(), StorageError> {
        tracing::trace!(%path, %local, "Uploading from file: {local}");
        let file = tokio::fs::File::open(local)
            .await
            .wrap_err("open local file for reading")
            .map_err(StorageError::with("tokio::fs", StorageErrorKind::Io))?;
        let length = file
            .metadata()
            .await
            .wrap_err("local file metadata")
            .map_err(StorageError::with("tokio::fs", StorageErrorKind::Io))?
            .len();

        let mut reader = tokio::io::BufReader::new(file);
        self.stream_write(
            path,
            Source::Sized {
                reader: &mut reader,
                length,
            },
        )
        .await
    }
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    fn scheme(&self) -> &str {
        self.deref().scheme()
    }

    fn content_redirect_url(&self, path: &Utf8Path) -> Result<Option<Uri>, StorageError> {
        self.deref().content_redirect_url(path)
    }

    async fn metadata(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(path).await
    }

    async fn stream_read(
        &self,
        path: &Utf8Path,
        range: Option<ByteRange>,
    ) -> Result<ByteStream, StorageError> {
        self.deref().stream_read(path, range).await
    }

    async fn stream_write(
        &self,
        path: &Utf8Path,
        source: Source<'_>,
    ) -> Result<(), StorageError> {
        self.deref().stream_write(path, source).await
    }

    async fn list_directory(&self, path: &Utf8Path) -> Result<PathStream, StorageError> {
        self.deref().list_directory(path).await
    }

    async fn remove(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.deref().remove(path).await
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Bytes, StorageError> {
        self.deref().get_content(path).await
    }

    async fn put_content(&self, path: &Utf8Path, content: Bytes) -> Result<(), StorageError> {
        self.deref().put_content(path, content).await
    }

    async fn exists(&self, path: &Utf8Path) -> bool {
        self.deref().exists(path).await
    }

    async fn get_size(&self, path: &Utf8Path) -> Result<u64, StorageError> {
        self.deref().get_size(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);

    #[test]
    fn range_headers() {
        assert_eq!(ByteRange::starting_at(10).header_value(), "bytes=10-");
        assert_eq!(ByteRange::inclusive(0, 99).header_value(), "bytes=0-99");
    }

    #[test]
    fn range_clamps() {
        assert_eq!(ByteRange::inclusive(1, 3).clamp(10), 1..4);
        assert_eq!(ByteRange::inclusive(8, 30).clamp(10), 8..10);
        assert_eq!(ByteRange::starting_at(4).clamp(10), 4..10);
        assert_eq!(ByteRange::starting_at(40).clamp(10), 10..10);
        assert_eq!(ByteRange::inclusive(5, 2).clamp(10), 5..5);
    }

    #[test]
    fn source_lengths() {
        assert_eq!(Source::from(Bytes::from_static(b"hello")).length(), Some(5));

        let mut reader: &[u8] = b"abc";
        let source = Source::Unsized(&mut reader);
        assert_eq!(source.length(), None);
        assert_eq!(format!("{source:?}"), "Unsized");
    }
}
