//! HTTP transport shared by all requests a client makes.

use http::Uri;
type Request = http::Request<hyperdriver::Body>;
type Response = http::Response<hyperdriver::Body>;
use hyperdriver::client::SharedClientService;
use hyperdriver::Body;
use tower::ServiceExt as _;

use crate::errors::{QiniuRequestError, QiniuResponseExt as _};

/// A cloneable handle to the underlying HTTP client service.
#[derive(Debug, Clone)]
pub(crate) struct Transport {
    inner: SharedClientService<Body, Body>,
}

impl Transport {
    /// A TCP + TLS client with the default connect and request timeouts.
    pub(crate) fn new() -> Self {
        let mut builder = hyperdriver::Client::build_tcp_http().with_default_tls();
        let tcp = builder.transport();

        tcp.config_mut().connect_timeout = Some(crate::QINIU_DEFAULT_CONNECT_TIMEOUT);

        let inner = builder
            .with_timeout(crate::QINIU_DEFAULT_TIMEOUT)
            .build_service();

        Transport { inner }
    }

    pub(crate) fn from_service(inner: SharedClientService<Body, Body>) -> Self {
        Transport { inner }
    }

    /// Send a request, turning non-success responses into [`QiniuRequestError::Qiniu`].
    pub(crate) async fn execute(&self, request: Request) -> Result<Response, QiniuRequestError> {
        let uri: Uri = request.uri().clone();
        tracing::trace!(
            "{} {}{}",
            request.method(),
            uri.authority().map(|a| a.as_str()).unwrap_or_default(),
            uri.path()
        );

        let response = self.inner.clone().oneshot(request).await?;
        tracing::trace!(status = %response.status(), "response");
        response.handle_errors(&uri).await
    }
}
