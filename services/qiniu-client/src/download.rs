use bytes::Bytes;
use camino::Utf8Path;
use chrono::Utc;
use futures::{Stream, TryStreamExt as _};
use http::Uri;
use http_body_util::BodyExt as _;
use hyperdriver::Body;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use storage_driver::ByteRange;

use crate::{QiniuClient, QiniuRequestError};

/// Characters escaped in the path of a download URL. Key separators stay intact.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

impl QiniuClient {
    /// The unsigned download URL for a key on the bucket's domain.
    pub(crate) fn public_url(&self, key: &Utf8Path) -> String {
        format!(
            "{}/{}",
            self.settings.download_base,
            utf8_percent_encode(key.as_str(), KEY_ENCODE_SET)
        )
    }

    /// A download URL for a key, valid for the configured token lifetime.
    ///
    /// The URL is signed with a deadline (`e`), and the signature over the
    /// URL including that deadline is appended as `token`.
    pub(crate) fn private_url(&self, key: &Utf8Path) -> Result<Uri, QiniuRequestError> {
        let lifetime = i64::try_from(self.settings.token_lifetime.as_secs()).unwrap_or(i64::MAX);
        let deadline = Utc::now().timestamp().saturating_add(lifetime);

        let url = format!("{}?e={deadline}", self.public_url(key));
        let token = self.settings.credentials.token(url.as_bytes());
        Ok(format!("{url}&token={token}").parse()?)
    }

    #[tracing::instrument(level = "trace", skip(self), fields(bucket = %self.bucket()))]
    pub(crate) async fn qiniu_download(
        &self,
        key: &Utf8Path,
        range: Option<ByteRange>,
    ) -> Result<impl Stream<Item = Result<Bytes, QiniuRequestError>> + Send + 'static, QiniuRequestError>
    {
        let url = self.private_url(key)?;

        let mut request = http::Request::builder()
            .method(http::Method::GET)
            .version(http::Version::HTTP_11)
            .uri(url);
        if let Some(range) = range {
            tracing::trace!(range = %range.header_value(), "Ranged download");
            request = request.header(http::header::RANGE, range.header_value());
        }
        let request = request.body(Body::empty())?;

        let response = self.transport.execute(request).await?;
        Ok(response
            .into_body()
            .into_data_stream()
            .map_err(|error| QiniuRequestError::Body(error.into())))
    }
}
