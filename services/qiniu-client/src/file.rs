use camino::Utf8Path;
use chrono::{TimeZone, Utc};
use http::Method;
use hyperdriver::Body;
use serde::{Deserialize, Serialize};
use storage_driver::Metadata;

use crate::credentials::encoded_entry;
use crate::errors::QiniuResponseExt as _;
use crate::{QiniuClient, QiniuRequestError};

/// Object metadata as reported by `stat` and `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileInfo {
    /// Only present in listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) key: Option<String>,
    pub(crate) fsize: u64,
    pub(crate) hash: String,
    #[serde(default)]
    pub(crate) mime_type: Option<String>,
    /// Upload time, in units of 100ns since the Unix epoch.
    pub(crate) put_time: i64,
}

impl From<FileInfo> for Metadata {
    fn from(value: FileInfo) -> Self {
        Metadata {
            size: value.fsize,
            created: Utc.timestamp_nanos(value.put_time.saturating_mul(100)),
            hash: Some(value.hash),
            content_type: value.mime_type,
        }
    }
}

impl QiniuClient {
    /// `rs` request for a single entry, e.g. `stat` or `delete`.
    fn entry_request(
        &self,
        method: Method,
        operation: &str,
        key: &Utf8Path,
    ) -> Result<http::Request<hyperdriver::Body>, QiniuRequestError> {
        let entry = encoded_entry(self.bucket(), key.as_str());
        let uri: http::Uri = format!("{}/{operation}/{entry}", self.settings.rs).parse()?;
        let authorization = self.settings.credentials.management_header(&uri)?;

        let request = http::Request::builder()
            .method(method)
            .version(http::Version::HTTP_11)
            .uri(uri)
            .header(http::header::AUTHORIZATION, authorization)
            .header(
                http::header::CONTENT_TYPE,
                mime::APPLICATION_WWW_FORM_URLENCODED.as_ref(),
            )
            .body(Body::empty())?;
        Ok(request)
    }

    #[tracing::instrument(level = "trace", skip(self), fields(bucket = %self.bucket()))]
    pub(crate) async fn qiniu_stat(&self, key: &Utf8Path) -> Result<FileInfo, QiniuRequestError> {
        let request = self.entry_request(Method::GET, "stat", key)?;
        let response = self.transport.execute(request).await?;
        response.deserialize().await
    }

    #[tracing::instrument(level = "trace", skip(self), fields(bucket = %self.bucket()))]
    pub(crate) async fn qiniu_delete(&self, key: &Utf8Path) -> Result<(), QiniuRequestError> {
        let request = self.entry_request(Method::POST, "delete", key)?;
        self.transport.execute(request).await?;
        tracing::debug!("Deleted {key}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_response_to_metadata() {
        let info: FileInfo = serde_json::from_str(
            r#"{"fsize":5,"hash":"FjJt","mimeType":"text/plain","putTime":17000000000000000}"#,
        )
        .unwrap();
        assert_eq!(info.key, None);

        let metadata = Metadata::from(info);
        assert_eq!(metadata.size, 5);
        assert_eq!(metadata.created.timestamp(), 1_700_000_000);
        assert_eq!(metadata.hash.as_deref(), Some("FjJt"));
        assert_eq!(metadata.content_type.as_deref(), Some("text/plain"));
    }
}
