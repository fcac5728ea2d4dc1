use std::fmt;

use http::{StatusCode, Uri};
use http_body_util::BodyExt as _;
type Response = http::Response<hyperdriver::Body>;
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;

/// An error returned by the Qiniu API.
#[derive(Debug, Clone, Error)]
#[error("{status}: {message} ({code})")]
pub struct QiniuError {
    status: StatusCode,
    code: QiniuErrorCode,
    message: String,
}

impl QiniuError {
    pub(crate) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        QiniuError {
            status,
            code: status.into(),
            message: message.into(),
        }
    }

    /// The HTTP status code of the response.
    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// The error category derived from the status code.
    pub fn kind(&self) -> &QiniuErrorCode {
        &self.code
    }

    /// The error message returned by Qiniu.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the error means the requested key (or its bucket) does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.code,
            QiniuErrorCode::NoSuchEntry | QiniuErrorCode::NoSuchBucket | QiniuErrorCode::NotFound
        )
    }
}

/// Qiniu reports error categories as (sometimes non-standard) HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QiniuErrorCode {
    /// 612: the key does not exist.
    NoSuchEntry,

    /// 631: the bucket does not exist.
    NoSuchBucket,

    /// 404: the download domain has no such document.
    NotFound,

    /// 401: the request signature or token was rejected.
    Unauthorized,

    /// Any other failure.
    Other(u16),
}

impl From<StatusCode> for QiniuErrorCode {
    fn from(value: StatusCode) -> Self {
        match value.as_u16() {
            612 => QiniuErrorCode::NoSuchEntry,
            631 => QiniuErrorCode::NoSuchBucket,
            404 => QiniuErrorCode::NotFound,
            401 => QiniuErrorCode::Unauthorized,
            code => QiniuErrorCode::Other(code),
        }
    }
}

impl fmt::Display for QiniuErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QiniuErrorCode::NoSuchEntry => f.write_str("no_such_entry"),
            QiniuErrorCode::NoSuchBucket => f.write_str("no_such_bucket"),
            QiniuErrorCode::NotFound => f.write_str("not_found"),
            QiniuErrorCode::Unauthorized => f.write_str("unauthorized"),
            QiniuErrorCode::Other(code) => write!(f, "status_{code}"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawErrorInfo {
    error: String,
}

/// An error that occurred while making a request to the Qiniu API.
///
/// This can include errors from Qiniu itself, as well as errors from the
/// client or the network.
#[derive(Debug, Error)]
pub enum QiniuRequestError {
    /// An error returned by the Qiniu API.
    #[error(transparent)]
    Qiniu(#[from] QiniuError),

    /// An error deserializing a response from the Qiniu API.
    #[error("deserializing: {0} {1}")]
    Serde(#[source] serde_json::Error, String),

    /// An error encoding a request for the Qiniu API.
    #[error("encoding: {0}")]
    Encode(#[source] serde_json::Error),

    /// An io error occurred, probably while reading an upload source.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// An error occurred while reading the response body.
    #[error("body: {0}")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// An error occurred while making a request to the Qiniu API.
    #[error("client: {0}")]
    Client(#[from] hyperdriver::client::Error),

    /// A request could not be assembled.
    #[error("request: {0}")]
    Request(#[from] http::Error),

    /// An upload source produced a different number of bytes than promised.
    #[error("upload source produced {actual} bytes, expected {expected}")]
    ShortUpload {
        /// Bytes promised by the caller.
        expected: u64,
        /// Bytes actually read.
        actual: u64,
    },

    /// An upload source produced more bytes than promised.
    #[error("upload source produced more than the expected {expected} bytes")]
    LongUpload {
        /// Bytes promised by the caller.
        expected: u64,
    },
}

impl QiniuRequestError {
    /// Get a reference to the Qiniu error, if there is one.
    pub fn qiniu(&self) -> Option<&QiniuError> {
        match self {
            QiniuRequestError::Qiniu(err) => Some(err),
            _ => None,
        }
    }

    /// Whether the error means the requested key does not exist.
    pub fn is_not_found(&self) -> bool {
        self.qiniu().is_some_and(QiniuError::is_not_found)
    }
}

impl From<http::header::InvalidHeaderValue> for QiniuRequestError {
    fn from(value: http::header::InvalidHeaderValue) -> Self {
        QiniuRequestError::Request(value.into())
    }
}

impl From<http::uri::InvalidUri> for QiniuRequestError {
    fn from(value: http::uri::InvalidUri) -> Self {
        QiniuRequestError::Request(value.into())
    }
}

#[async_trait::async_trait]
pub(crate) trait QiniuResponseExt {
    async fn bytes(self) -> Result<bytes::Bytes, QiniuRequestError>;
    async fn deserialize<D: DeserializeOwned>(self) -> Result<D, QiniuRequestError>;
    async fn handle_errors(self, uri: &Uri) -> Result<Self, QiniuRequestError>
    where
        Self: Sized;
}

#[async_trait::async_trait]
impl QiniuResponseExt for Response {
    async fn bytes(self) -> Result<bytes::Bytes, QiniuRequestError> {
        let collected = self
            .into_body()
            .collect()
            .await
            .map_err(|err| QiniuRequestError::Body(err.into()))?;
        Ok(collected.to_bytes())
    }

    async fn handle_errors(self, uri: &Uri) -> Result<Self, QiniuRequestError> {
        if self.status().is_success() {
            return Ok(self);
        }

        let status = self.status();
        let body = self.bytes().await?;
        let text = String::from_utf8_lossy(&body);

        let message = match serde_json::from_slice::<RawErrorInfo>(&body) {
            Ok(info) => info.error,
            Err(_) if text.trim().is_empty() => status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_owned(),
            Err(_) => text.trim().to_owned(),
        };

        let err = QiniuError::new(status, message);
        qiniu_response_breadcrumb(&err, uri);
        Err(err.into())
    }

    async fn deserialize<D: DeserializeOwned>(self) -> Result<D, QiniuRequestError> {
        let body = self.bytes().await?;
        serde_json::from_slice(&body).map_err(|err| {
            QiniuRequestError::Serde(err, String::from_utf8_lossy(&body).into_owned())
        })
    }
}

fn qiniu_response_breadcrumb(error: &QiniuError, uri: &Uri) {
    use sentry::protocol::{Breadcrumb, Map};

    let breadcrumb = Breadcrumb {
        ty: "http".into(),
        category: Some("request".into()),
        data: {
            let mut map = Map::new();

            // Download URLs carry a token in the query, so only the path is recorded.
            map.insert(
                "url".into(),
                format!("{}{}", uri.authority().map(|a| a.as_str()).unwrap_or(""), uri.path())
                    .into(),
            );
            map.insert("status_code".into(), error.status_code().as_u16().into());
            map.insert("code".into(), error.kind().to_string().into());
            map.insert("message".into(), error.message().to_string().into());
            map.insert("service".into(), "qiniu".into());
            map
        },
        ..Default::default()
    };

    sentry::add_breadcrumb(breadcrumb);
}

#[cfg(test)]
mod tests {
    use hyperdriver::Body;

    use super::*;

    fn response(status: u16, body: &'static str) -> Response {
        http::Response::builder()
            .status(status)
            .body(Body::from(bytes::Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    #[test]
    fn not_found_codes() {
        for code in [612, 631, 404] {
            let err = QiniuError::new(StatusCode::from_u16(code).unwrap(), "missing");
            assert!(err.is_not_found(), "{code}");
        }

        let err = QiniuError::new(StatusCode::UNAUTHORIZED, "bad token");
        assert!(!err.is_not_found());
        assert_eq!(err.kind(), &QiniuErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn decodes_error_body() {
        let uri: Uri = "https://rs.qbox.me/stat/abc".parse().unwrap();
        let err = response(612, r#"{"error":"no such file or directory"}"#)
            .handle_errors(&uri)
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        let qiniu = err.qiniu().unwrap();
        assert_eq!(qiniu.status_code().as_u16(), 612);
        assert_eq!(qiniu.message(), "no such file or directory");
    }

    #[tokio::test]
    async fn tolerates_plain_error_body() {
        let uri: Uri = "https://up.qiniup.com/".parse().unwrap();
        let err = response(502, "bad gateway\n")
            .handle_errors(&uri)
            .await
            .unwrap_err();
        assert!(!err.is_not_found());
        assert_eq!(err.qiniu().unwrap().message(), "bad gateway");

        let err = response(503, "").handle_errors(&uri).await.unwrap_err();
        assert_eq!(err.qiniu().unwrap().message(), "Service Unavailable");
    }

    #[tokio::test]
    async fn passes_success_through() {
        let uri: Uri = "https://rs.qbox.me/stat/abc".parse().unwrap();
        let value: serde_json::Value = response(200, r#"{"fsize":5}"#)
            .handle_errors(&uri)
            .await
            .unwrap()
            .deserialize()
            .await
            .unwrap();
        assert_eq!(value["fsize"], 5);
    }
}
