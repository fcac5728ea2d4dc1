use bytes::{Bytes, BytesMut};
use camino::Utf8Path;
use common_multipart_rfc7578::client::multipart::{self, Form};
use futures::TryStreamExt as _;
use hyperdriver::Body;
use serde::Deserialize;
use storage_driver::{Reader, Source};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use crate::credentials::upload_header;
use crate::errors::QiniuResponseExt as _;
use crate::policy::PutPolicy;
use crate::{QiniuClient, QiniuRequestError, QINIU_BLOCK_SIZE};

use base64::prelude::{Engine as _, BASE64_URL_SAFE};

#[derive(Debug, Clone, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct BlockResponse {
    ctx: String,
}

/// A multipart form body for a single-request upload, with its content type.
async fn multipart_form(
    token: &str,
    key: &str,
    data: Bytes,
) -> Result<(String, Bytes), QiniuRequestError> {
    let filename: String = key
        .rsplit('/')
        .next()
        .unwrap_or(key)
        .chars()
        .map(|c| if matches!(c, '"' | '\r' | '\n') { '_' } else { c })
        .collect();

    let mut form = Form::default();
    form.add_text("token", token);
    form.add_text("key", key);
    form.add_reader_file_with_mime(
        "file",
        std::io::Cursor::new(data),
        filename,
        mime::APPLICATION_OCTET_STREAM,
    );
    let content_type = form.content_type();

    let body = multipart::Body::from(form)
        .try_fold(BytesMut::new(), |mut body, chunk| async move {
            body.extend_from_slice(&chunk);
            Ok(body)
        })
        .await
        .map_err(std::io::Error::other)?;
    Ok((content_type, body.freeze()))
}

/// Read up to `size` bytes, stopping early only at EOF.
async fn read_block(reader: &mut Reader<'_>, size: usize) -> std::io::Result<Bytes> {
    let mut buffer = Vec::with_capacity(size);
    (&mut *reader)
        .take(size as u64)
        .read_to_end(&mut buffer)
        .await?;
    Ok(buffer.into())
}

/// Fail if `reader` still has bytes after the `expected` promised ones.
async fn ensure_drained(reader: &mut Reader<'_>, expected: u64) -> Result<(), QiniuRequestError> {
    let mut extra = [0u8; 1];
    if reader.read(&mut extra).await? > 0 {
        return Err(QiniuRequestError::LongUpload { expected });
    }
    Ok(())
}

impl QiniuClient {
    /// A fresh upload token scoped to `key`.
    fn upload_token(&self, key: &Utf8Path) -> Result<String, QiniuRequestError> {
        PutPolicy::for_key(self.bucket(), key.as_str(), self.settings.token_lifetime)
            .token(&self.settings.credentials)
            .map_err(QiniuRequestError::Encode)
    }

    pub(crate) async fn upload_source(
        &self,
        key: &Utf8Path,
        source: Source<'_>,
    ) -> Result<(), QiniuRequestError> {
        match source {
            Source::Bytes(bytes) if bytes.len() <= QINIU_BLOCK_SIZE => {
                self.qiniu_form_upload(key, bytes).await
            }
            Source::Bytes(bytes) => {
                let length = bytes.len() as u64;
                let mut reader: &[u8] = &bytes;
                self.qiniu_block_upload(key, &mut reader, length).await
            }
            Source::Sized { reader, length } => self.upload_sized(key, reader, length).await,
            Source::Unsized(reader) => self.upload_spooled(key, reader).await,
        }
    }

    async fn upload_sized(
        &self,
        key: &Utf8Path,
        reader: &mut Reader<'_>,
        length: u64,
    ) -> Result<(), QiniuRequestError> {
        if length > QINIU_BLOCK_SIZE as u64 {
            return self.qiniu_block_upload(key, reader, length).await;
        }

        let body = read_block(reader, length as usize).await?;
        if body.len() as u64 != length {
            return Err(QiniuRequestError::ShortUpload {
                expected: length,
                actual: body.len() as u64,
            });
        }
        ensure_drained(reader, length).await?;
        self.qiniu_form_upload(key, body).await
    }

    /// Drain a source of unknown length into a temporary file, then upload
    /// that file. The file is removed when this returns, whatever the outcome.
    #[tracing::instrument(level = "debug", skip_all, fields(bucket = %self.bucket(), %key))]
    async fn upload_spooled(
        &self,
        key: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), QiniuRequestError> {
        let spool = match &self.settings.temp_dir {
            Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
            None => tempfile::NamedTempFile::new()?,
        };
        tracing::trace!(spool = %spool.path().display(), "Spooling upload of unknown length");

        let length = {
            let mut file = tokio::fs::File::from_std(spool.reopen()?);
            let length = tokio::io::copy_buf(reader, &mut file).await?;
            file.flush().await?;
            length
        };

        let mut file = tokio::io::BufReader::new(tokio::fs::File::from_std(spool.reopen()?));
        self.upload_sized(key, &mut file, length).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(bucket = %self.bucket(), %key, size = body.len()))]
    async fn qiniu_form_upload(&self, key: &Utf8Path, body: Bytes) -> Result<(), QiniuRequestError> {
        let token = self.upload_token(key)?;
        let (content_type, form) = multipart_form(&token, key.as_str(), body).await?;

        let request = http::Request::builder()
            .method(http::Method::POST)
            .version(http::Version::HTTP_11)
            .uri(format!("{}/", self.settings.up))
            .header(http::header::CONTENT_TYPE, content_type)
            .header(http::header::CONTENT_LENGTH, form.len())
            .body(Body::from(form))?;

        let info: UploadResponse = self.transport.execute(request).await?.deserialize().await?;
        tracing::debug!(hash = ?info.hash, "Uploaded {key}");
        Ok(())
    }

    /// Upload `length` bytes from `reader` one block at a time, then stitch
    /// the blocks together under `key`.
    #[tracing::instrument(level = "debug", skip_all, fields(bucket = %self.bucket(), %key, %length))]
    async fn qiniu_block_upload(
        &self,
        key: &Utf8Path,
        reader: &mut Reader<'_>,
        length: u64,
    ) -> Result<(), QiniuRequestError> {
        let token = self.upload_token(key)?;
        let mut contexts = Vec::new();

        let mut uploaded = 0;
        while uploaded < length {
            let size = (length - uploaded).min(QINIU_BLOCK_SIZE as u64) as usize;
            let block = read_block(reader, size).await?;
            if block.len() != size {
                return Err(QiniuRequestError::ShortUpload {
                    expected: length,
                    actual: uploaded + block.len() as u64,
                });
            }

            tracing::trace!(block = contexts.len(), %size, "Uploading block");
            contexts.push(self.qiniu_make_block(&token, block).await?);
            uploaded += size as u64;
        }
        ensure_drained(reader, length).await?;

        self.qiniu_make_file(&token, key, length, &contexts).await?;
        tracing::debug!("Uploaded {key} in {} blocks", contexts.len());
        Ok(())
    }

    async fn qiniu_make_block(&self, token: &str, block: Bytes) -> Result<String, QiniuRequestError> {
        let request = http::Request::builder()
            .method(http::Method::POST)
            .version(http::Version::HTTP_11)
            .uri(format!("{}/mkblk/{}", self.settings.up, block.len()))
            .header(http::header::AUTHORIZATION, upload_header(token)?)
            .header(http::header::CONTENT_TYPE, mime::APPLICATION_OCTET_STREAM.as_ref())
            .header(http::header::CONTENT_LENGTH, block.len())
            .body(Body::from(block))?;

        let info: BlockResponse = self.transport.execute(request).await?.deserialize().await?;
        Ok(info.ctx)
    }

    async fn qiniu_make_file(
        &self,
        token: &str,
        key: &Utf8Path,
        length: u64,
        contexts: &[String],
    ) -> Result<(), QiniuRequestError> {
        let body = contexts.join(",");
        let request = http::Request::builder()
            .method(http::Method::POST)
            .version(http::Version::HTTP_11)
            .uri(format!(
                "{}/mkfile/{length}/key/{}",
                self.settings.up,
                BASE64_URL_SAFE.encode(key.as_str())
            ))
            .header(http::header::AUTHORIZATION, upload_header(token)?)
            .header(http::header::CONTENT_TYPE, mime::TEXT_PLAIN.as_ref())
            .header(http::header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))?;

        let info: UploadResponse = self.transport.execute(request).await?.deserialize().await?;
        tracing::trace!(hash = ?info.hash, "Assembled blocks");
        Ok(())
    }
}
