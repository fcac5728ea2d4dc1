//! An in-memory stand-in for the Qiniu HTTP API.
//!
//! [`MockQiniu`] is a tower service which answers the requests a
//! [`QiniuClient`] makes (`stat`, `delete`, `list`, form uploads, block
//! uploads and signed downloads) from an in-memory bucket. It checks every
//! signature and token the way the real service would, records the calls it
//! receives, and can be told to fail specific operations.
//!
//! ```rust
//! use camino::Utf8Path;
//! use qiniu_client::mock::{MockQiniu, Operation};
//! use storage_driver::Driver;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mock = MockQiniu::new();
//! let client = mock.client();
//!
//! client
//!     .put_content(Utf8Path::new("a/b"), "hello".into())
//!     .await
//!     .unwrap();
//! assert_eq!(mock.object("a/b").unwrap(), "hello");
//! assert_eq!(mock.count(Operation::Upload), 1);
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use base64::prelude::{Engine as _, BASE64_URL_SAFE};
use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::BodyExt as _;
type Request = http::Request<hyperdriver::Body>;
type Response = http::Response<hyperdriver::Body>;
use hyperdriver::client::SharedClientService;
use hyperdriver::service::SharedService;
use hyperdriver::Body;
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use serde_json::json;
use sha1::{Digest as _, Sha1};
use storage_driver::ByteRange;

use crate::credentials::{signing_data, Credentials};
use crate::policy::PutPolicy;
use crate::{QiniuClient, QiniuConfig};

const MOCK_ACCESS_KEY: &str = "mock-access-key";
const MOCK_SECRET_KEY: &str = "mock-secret-key";
const MOCK_BUCKET: &str = "mock-bucket";
const MOCK_DOMAIN: &str = "cdn.mock.test";
const MOCK_UP_HOST: &str = "http://up.mock.test";
const MOCK_RS_HOST: &str = "http://rs.mock.test";
const MOCK_RSF_HOST: &str = "http://rsf.mock.test";

/// A Qiniu API operation, as seen by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `GET /stat/<entry>`
    Stat,
    /// `POST /delete/<entry>`
    Delete,
    /// `POST /list?...`
    List,
    /// Multipart form upload to `POST /`.
    Upload,
    /// `POST /mkblk/<size>`
    MakeBlock,
    /// `POST /mkfile/<size>/key/<key>`
    MakeFile,
    /// `GET` of a signed URL on the download domain.
    Download,
}

/// A request received by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// The operation requested.
    pub operation: Operation,
    /// The key addressed, when the request names one.
    pub key: Option<String>,
}

#[derive(Debug, Clone)]
struct MockObject {
    data: Bytes,
    hash: String,
    mime_type: String,
    put_time: i64,
}

impl MockObject {
    fn new(data: Bytes) -> Self {
        let put_time = Utc::now().timestamp_nanos_opt().unwrap_or_default() / 100;
        MockObject {
            hash: etag(&data),
            data,
            mime_type: mime::APPLICATION_OCTET_STREAM.to_string(),
            put_time,
        }
    }

    fn info(&self, key: Option<&str>) -> serde_json::Value {
        let mut info = json!({
            "fsize": self.data.len(),
            "hash": self.hash,
            "mimeType": self.mime_type,
            "putTime": self.put_time,
        });
        if let Some(key) = key {
            info["key"] = key.into();
        }
        info
    }
}

/// Qiniu's etag for content which fits in one block.
fn etag(data: &[u8]) -> String {
    let mut tagged = vec![0x16];
    tagged.extend_from_slice(&Sha1::digest(data));
    BASE64_URL_SAFE.encode(tagged)
}

#[derive(Debug)]
struct MockState {
    credentials: Credentials,
    bucket: String,
    objects: BTreeMap<String, MockObject>,
    blocks: HashMap<String, Bytes>,
    calls: Vec<MockCall>,
    page_size: usize,
    /// Operations set to fail, mapped to the number of calls still allowed
    /// to succeed first.
    failures: HashMap<Operation, usize>,
}

/// In-memory Qiniu service. Clones share the same bucket.
#[derive(Debug, Clone)]
pub struct MockQiniu {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockQiniu {
    fn default() -> Self {
        Self::new()
    }
}

impl MockQiniu {
    /// An empty bucket.
    pub fn new() -> Self {
        MockQiniu {
            state: Arc::new(Mutex::new(MockState {
                credentials: Credentials::new(MOCK_ACCESS_KEY, MOCK_SECRET_KEY),
                bucket: MOCK_BUCKET.to_owned(),
                objects: BTreeMap::new(),
                blocks: HashMap::new(),
                calls: Vec::new(),
                page_size: crate::QINIU_LIST_LIMIT,
                failures: HashMap::new(),
            })),
        }
    }

    /// Limit the number of keys returned per listing page.
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.state.lock().page_size = page_size.max(1);
        self
    }

    /// A client configuration addressing this mock.
    pub fn config(&self) -> QiniuConfig {
        let mut config = QiniuConfig::new(MOCK_ACCESS_KEY, MOCK_SECRET_KEY, MOCK_BUCKET, MOCK_DOMAIN);
        config.up_host = Some(MOCK_UP_HOST.to_owned());
        config.rs_host = Some(MOCK_RS_HOST.to_owned());
        config.rsf_host = Some(MOCK_RSF_HOST.to_owned());
        config
    }

    /// The mock as a client transport.
    pub fn service(&self) -> SharedClientService<Body, Body> {
        SharedService::new(self.clone())
    }

    /// A client which sends its requests to this mock.
    pub fn client(&self) -> QiniuClient {
        self.client_with(self.config())
    }

    /// A client built from `config` (usually a modified [`MockQiniu::config`])
    /// which sends its requests to this mock.
    pub fn client_with(&self, config: QiniuConfig) -> QiniuClient {
        config
            .client_with_service(self.service())
            .expect("mock configuration is valid")
    }

    /// Store an object directly, without going through the API.
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.state
            .lock()
            .objects
            .insert(key.into(), MockObject::new(data.into()));
    }

    /// The content stored under `key`.
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().objects.get(key).map(|o| o.data.clone())
    }

    /// Every stored key, in order.
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// The number of calls received for `operation`.
    pub fn count(&self, operation: Operation) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Fail every following call of `operation` with a server error.
    pub fn fail(&self, operation: Operation) {
        self.fail_after(operation, 0);
    }

    /// Let `successes` calls of `operation` through, then fail the rest.
    pub fn fail_after(&self, operation: Operation, successes: usize) {
        self.state.lock().failures.insert(operation, successes);
    }

    /// Stop failing `operation`.
    pub fn heal(&self, operation: Operation) {
        self.state.lock().failures.remove(&operation);
    }
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response {
    http::Response::builder()
        .status(status)
        .version(http::Version::HTTP_11)
        .header(http::header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
        .body(Body::from(body.into()))
        .expect("mock response is valid")
}

fn ok(value: serde_json::Value) -> Response {
    respond(StatusCode::OK, value.to_string())
}

fn error(status: u16, message: &str) -> Response {
    let status = StatusCode::from_u16(status).expect("mock status is valid");
    respond(status, json!({ "error": message }).to_string())
}

fn header<'h>(headers: &'h HeaderMap, name: http::header::HeaderName) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[derive(Debug, Deserialize)]
struct ListParams {
    bucket: String,
    #[serde(default)]
    prefix: String,
    #[serde(default)]
    marker: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

/// Split a multipart form into its named fields.
pub(crate) async fn parse_form(content_type: &str, body: Bytes) -> Option<HashMap<String, Bytes>> {
    let boundary = multer::parse_boundary(content_type).ok()?;
    let body = futures::stream::once(async move { Ok::<_, std::convert::Infallible>(body) });
    let mut multipart = multer::Multipart::new(body, boundary);

    let mut fields = HashMap::new();
    while let Some(field) = multipart.next_field().await.ok()? {
        let name = field.name()?.to_owned();
        fields.insert(name, field.bytes().await.ok()?);
    }
    Some(fields)
}

impl MockState {
    fn record(&mut self, operation: Operation, key: Option<&str>) -> Option<Response> {
        self.calls.push(MockCall {
            operation,
            key: key.map(str::to_owned),
        });

        match self.failures.get_mut(&operation) {
            Some(0) => Some(error(599, "injected failure")),
            Some(remaining) => {
                *remaining -= 1;
                None
            }
            None => None,
        }
    }

    fn check_management(&self, uri: &Uri, headers: &HeaderMap) -> Option<Response> {
        let token = header(headers, http::header::AUTHORIZATION)
            .and_then(|value| value.strip_prefix("QBox "));
        match token {
            Some(token) if self.credentials.verify(signing_data(uri).as_bytes(), token) => None,
            _ => Some(error(401, "bad token")),
        }
    }

    /// Validate an upload token, returning the policy it carries.
    fn check_upload_token(&self, token: &str) -> Result<PutPolicy, Response> {
        let (signed, encoded) = token
            .rsplit_once(':')
            .ok_or_else(|| error(401, "bad token"))?;
        if !self.credentials.verify(encoded.as_bytes(), signed) {
            return Err(error(401, "bad token"));
        }

        let policy: PutPolicy = BASE64_URL_SAFE
            .decode(encoded)
            .ok()
            .and_then(|policy| serde_json::from_slice(&policy).ok())
            .ok_or_else(|| error(401, "bad token"))?;

        if policy.is_expired() {
            return Err(error(401, "token out of date"));
        }
        if policy.bucket() != self.bucket {
            return Err(error(631, "no such bucket"));
        }
        Ok(policy)
    }

    fn check_scope(policy: &PutPolicy, key: &str) -> Result<(), Response> {
        match policy.key() {
            Some(scope) if scope != key => Err(error(403, "key doesn't match with scope")),
            _ => Ok(()),
        }
    }

    fn entry(&self, encoded: Option<&str>) -> Result<String, Response> {
        let entry = encoded
            .and_then(|encoded| BASE64_URL_SAFE.decode(encoded).ok())
            .and_then(|entry| String::from_utf8(entry).ok())
            .ok_or_else(|| error(400, "invalid entry"))?;
        let (bucket, key) = entry
            .split_once(':')
            .ok_or_else(|| error(400, "invalid entry"))?;
        if bucket != self.bucket {
            return Err(error(631, "no such bucket"));
        }
        Ok(key.to_owned())
    }

    fn handle(
        &mut self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
        form: Option<HashMap<String, Bytes>>,
    ) -> Response {
        if uri.host() == Some(MOCK_DOMAIN) {
            return self.download(uri, headers);
        }

        let mut segments = uri.path().trim_start_matches('/').split('/');
        let result = match (method, segments.next()) {
            (&Method::GET, Some("stat")) => self.stat(uri, headers, segments.next()),
            (&Method::POST, Some("delete")) => self.delete(uri, headers, segments.next()),
            (&Method::POST, Some("list")) => self.list(uri, headers),
            (&Method::POST, Some("mkblk")) => self.make_block(headers, segments.next(), body),
            (&Method::POST, Some("mkfile")) => {
                let size = segments.next();
                let key = match (segments.next(), segments.next()) {
                    (Some("key"), key) => key,
                    _ => None,
                };
                self.make_file(headers, size, key, body)
            }
            (&Method::POST, Some("")) => self.form_upload(form),
            _ => Err(error(400, "unknown endpoint")),
        };

        result.unwrap_or_else(|response| response)
    }

    fn stat(
        &mut self,
        uri: &Uri,
        headers: &HeaderMap,
        entry: Option<&str>,
    ) -> Result<Response, Response> {
        let key = self.entry(entry);
        if let Some(response) = self.record(Operation::Stat, key.as_deref().ok()) {
            return Err(response);
        }
        if let Some(response) = self.check_management(uri, headers) {
            return Err(response);
        }

        let key = key?;
        let object = self
            .objects
            .get(&key)
            .ok_or_else(|| error(612, "no such file or directory"))?;
        Ok(ok(object.info(None)))
    }

    fn delete(
        &mut self,
        uri: &Uri,
        headers: &HeaderMap,
        entry: Option<&str>,
    ) -> Result<Response, Response> {
        let key = self.entry(entry);
        if let Some(response) = self.record(Operation::Delete, key.as_deref().ok()) {
            return Err(response);
        }
        if let Some(response) = self.check_management(uri, headers) {
            return Err(response);
        }

        let key = key?;
        self.objects
            .remove(&key)
            .ok_or_else(|| error(612, "no such file or directory"))?;
        Ok(respond(StatusCode::OK, Bytes::new()))
    }

    fn list(&mut self, uri: &Uri, headers: &HeaderMap) -> Result<Response, Response> {
        if let Some(response) = self.record(Operation::List, None) {
            return Err(response);
        }
        if let Some(response) = self.check_management(uri, headers) {
            return Err(response);
        }

        let params: ListParams = serde_urlencoded::from_str(uri.query().unwrap_or_default())
            .map_err(|_| error(400, "invalid list query"))?;
        if params.bucket != self.bucket {
            return Err(error(631, "no such bucket"));
        }

        let after = match params.marker.filter(|m| !m.is_empty()) {
            Some(marker) => Some(
                BASE64_URL_SAFE
                    .decode(&marker)
                    .ok()
                    .and_then(|key| String::from_utf8(key).ok())
                    .ok_or_else(|| error(400, "invalid marker"))?,
            ),
            None => None,
        };

        let limit = params.limit.unwrap_or(self.page_size).min(self.page_size);
        let mut matching = self
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(&params.prefix))
            .filter(|(key, _)| after.as_ref().map_or(true, |after| *key > after));

        let items: Vec<_> = matching.by_ref().take(limit).collect();
        let marker = match (items.last(), matching.next()) {
            (Some((last, _)), Some(_)) => BASE64_URL_SAFE.encode(last.as_bytes()),
            _ => String::new(),
        };

        let items: Vec<_> = items
            .into_iter()
            .map(|(key, object)| object.info(Some(key)))
            .collect();
        Ok(ok(json!({ "marker": marker, "items": items })))
    }

    fn store(&mut self, key: String, data: Bytes) -> Response {
        let object = MockObject::new(data);
        let response = ok(json!({ "hash": object.hash, "key": key }));
        self.objects.insert(key, object);
        response
    }

    fn form_upload(&mut self, form: Option<HashMap<String, Bytes>>) -> Result<Response, Response> {
        let mut fields = form.ok_or_else(|| error(400, "invalid multipart form"))?;

        let key = fields
            .remove("key")
            .and_then(|key| String::from_utf8(key.to_vec()).ok());
        if let Some(response) = self.record(Operation::Upload, key.as_deref()) {
            return Err(response);
        }

        let token = fields
            .remove("token")
            .and_then(|token| String::from_utf8(token.to_vec()).ok())
            .ok_or_else(|| error(401, "token not specified"))?;
        let policy = self.check_upload_token(&token)?;

        let key = key.ok_or_else(|| error(400, "key not specified"))?;
        Self::check_scope(&policy, &key)?;

        let data = fields
            .remove("file")
            .ok_or_else(|| error(400, "file not specified"))?;
        Ok(self.store(key, data))
    }

    fn upload_token<'h>(&self, headers: &'h HeaderMap) -> Result<&'h str, Response> {
        header(headers, http::header::AUTHORIZATION)
            .and_then(|value| value.strip_prefix("UpToken "))
            .ok_or_else(|| error(401, "token not specified"))
    }

    fn make_block(
        &mut self,
        headers: &HeaderMap,
        size: Option<&str>,
        body: Bytes,
    ) -> Result<Response, Response> {
        if let Some(response) = self.record(Operation::MakeBlock, None) {
            return Err(response);
        }
        self.check_upload_token(self.upload_token(headers)?)?;

        let size: usize = size
            .and_then(|size| size.parse().ok())
            .ok_or_else(|| error(400, "invalid block size"))?;
        if size != body.len() || size > crate::QINIU_BLOCK_SIZE {
            return Err(error(400, "block size mismatch"));
        }

        let ctx = uuid::Uuid::new_v4().simple().to_string();
        self.blocks.insert(ctx.clone(), body);
        Ok(ok(json!({
            "ctx": ctx,
            "checksum": etag(&[]),
            "crc32": 0,
            "offset": size,
            "host": MOCK_UP_HOST,
        })))
    }

    fn make_file(
        &mut self,
        headers: &HeaderMap,
        size: Option<&str>,
        encoded_key: Option<&str>,
        body: Bytes,
    ) -> Result<Response, Response> {
        let key = encoded_key
            .and_then(|key| BASE64_URL_SAFE.decode(key).ok())
            .and_then(|key| String::from_utf8(key).ok());
        if let Some(response) = self.record(Operation::MakeFile, key.as_deref()) {
            return Err(response);
        }

        let policy = self.check_upload_token(self.upload_token(headers)?)?;
        let key = key.ok_or_else(|| error(400, "key not specified"))?;
        Self::check_scope(&policy, &key)?;

        let size: usize = size
            .and_then(|size| size.parse().ok())
            .ok_or_else(|| error(400, "invalid file size"))?;

        let contexts = std::str::from_utf8(&body).map_err(|_| error(400, "invalid ctx"))?;
        let mut data = Vec::with_capacity(size);
        for ctx in contexts.split(',') {
            let block = self
                .blocks
                .remove(ctx)
                .ok_or_else(|| error(701, "invalid ctx"))?;
            data.extend_from_slice(&block);
        }
        if data.len() != size {
            return Err(error(400, "file size mismatch"));
        }

        Ok(self.store(key, data.into()))
    }

    fn download(&mut self, uri: &Uri, headers: &HeaderMap) -> Response {
        let key = percent_decode_str(uri.path().trim_start_matches('/'))
            .decode_utf8()
            .map(|key| key.into_owned())
            .ok();
        if let Some(response) = self.record(Operation::Download, key.as_deref()) {
            return response;
        }

        let url = uri.to_string();
        let Some((signed, token)) = url.rsplit_once("&token=") else {
            return error(401, "download token not specified");
        };
        if !self.credentials.verify(signed.as_bytes(), token) {
            return error(401, "bad token");
        }

        let deadline = uri
            .query()
            .and_then(|query| query.split('&').find_map(|pair| pair.strip_prefix("e=")))
            .and_then(|deadline| deadline.parse::<i64>().ok());
        match deadline {
            Some(deadline) if deadline >= Utc::now().timestamp() => {}
            _ => return error(401, "token out of date"),
        }

        let Some(object) = key.and_then(|key| self.objects.get(&key)) else {
            return error(404, "Document not found");
        };

        let range = header(headers, http::header::RANGE).and_then(parse_range);
        let Some(range) = range else {
            return http::Response::builder()
                .status(StatusCode::OK)
                .header(http::header::CONTENT_LENGTH, object.data.len())
                .body(Body::from(object.data.clone()))
                .expect("mock response is valid");
        };

        let slice = range.clamp(object.data.len());
        if slice.is_empty() {
            return error(416, "requested range not satisfiable");
        }

        http::Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                http::header::CONTENT_RANGE,
                format!(
                    "bytes {}-{}/{}",
                    slice.start,
                    slice.end - 1,
                    object.data.len()
                ),
            )
            .header(http::header::CONTENT_LENGTH, slice.len())
            .body(Body::from(object.data.slice(slice)))
            .expect("mock response is valid")
    }
}

fn parse_range(value: &str) -> Option<ByteRange> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start = start.parse().ok()?;
    if end.is_empty() {
        Some(ByteRange::starting_at(start))
    } else {
        Some(ByteRange::inclusive(start, end.parse().ok()?))
    }
}

impl tower::Service<Request> for MockQiniu {
    type Response = Response;
    type Error = hyperdriver::client::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let state = self.state.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => return Ok(error(400, "unreadable request body")),
            };

            let form = match header(&parts.headers, http::header::CONTENT_TYPE) {
                Some(content_type) if content_type.starts_with("multipart/form-data") => {
                    parse_form(content_type, body.clone()).await
                }
                _ => None,
            };

            tracing::trace!("mock {} {}", parts.method, parts.uri.path());
            let response = state
                .lock()
                .handle(&parts.method, &parts.uri, &parts.headers, body, form);
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forms_parse() {
        let body = "--B\r\nContent-Disposition: form-data; name=\"key\"\r\n\r\na/b\r\n\
--B\r\nContent-Disposition: form-data; name=\"file\"; filename=\"b\"\r\nContent-Type: application/octet-stream\r\n\r\nhello\r\n--B--\r\n";
        let fields = parse_form("multipart/form-data; boundary=B", Bytes::from(body))
            .await
            .unwrap();

        assert_eq!(fields["key"], "a/b");
        assert_eq!(fields["file"], "hello");
        assert_eq!(fields.len(), 2);
    }

    #[tokio::test]
    async fn malformed_forms_are_rejected() {
        assert!(parse_form("text/plain", Bytes::from_static(b"hello")).await.is_none());
    }

    #[test]
    fn ranges_parse() {
        assert_eq!(parse_range("bytes=2-"), Some(ByteRange::starting_at(2)));
        assert_eq!(parse_range("bytes=0-9"), Some(ByteRange::inclusive(0, 9)));
        assert_eq!(parse_range("items=0-9"), None);
    }

    #[test]
    fn etag_format() {
        // One tag byte plus 20 bytes of SHA1, base64 encoded.
        assert_eq!(etag(b"hello").len(), 28);
    }
}
