use camino::Utf8Path;
use futures::stream::{self, StreamExt as _, TryStreamExt as _};
use http::Method;
use hyperdriver::Body;
use serde::{Deserialize, Serialize};
use storage_driver::{
    directory_prefix, rooted, unrooted, PathStream, StorageError, StorageErrorKind,
};

use crate::errors::QiniuResponseExt as _;
use crate::file::FileInfo;
use crate::{QiniuClient, QiniuRequestError, QINIU_LIST_LIMIT, QINIU_STORAGE_NAME};

#[derive(Debug, Clone, Serialize)]
struct ListQuery<'q> {
    bucket: &'q str,
    prefix: &'q str,
    #[serde(skip_serializing_if = "Option::is_none")]
    marker: Option<&'q str>,
    limit: usize,
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ListPage {
    /// Opaque continuation marker. Absent or empty on the last page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) marker: Option<String>,
    #[serde(default)]
    pub(crate) items: Vec<FileInfo>,
}

impl ListPage {
    fn next_marker(&self) -> Option<String> {
        self.marker.clone().filter(|m| !m.is_empty())
    }
}

impl QiniuClient {
    #[tracing::instrument(level = "trace", skip(self), fields(bucket = %self.bucket()))]
    pub(crate) async fn qiniu_list(
        &self,
        prefix: &str,
        marker: Option<&str>,
    ) -> Result<ListPage, QiniuRequestError> {
        let query = serde_urlencoded::to_string(ListQuery {
            bucket: self.bucket(),
            prefix,
            marker,
            limit: QINIU_LIST_LIMIT,
        })
        .map_err(|error| {
            QiniuRequestError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, error))
        })?;

        let uri: http::Uri = format!("{}/list?{query}", self.settings.rsf).parse()?;
        let authorization = self.settings.credentials.management_header(&uri)?;

        let request = http::Request::builder()
            .method(Method::POST)
            .version(http::Version::HTTP_11)
            .uri(uri)
            .header(http::header::AUTHORIZATION, authorization)
            .header(
                http::header::CONTENT_TYPE,
                mime::APPLICATION_WWW_FORM_URLENCODED.as_ref(),
            )
            .body(Body::empty())?;

        let page: ListPage = self.transport.execute(request).await?.deserialize().await?;
        tracing::trace!(items = page.items.len(), more = page.next_marker().is_some(), "page");
        Ok(page)
    }

    /// Page through every key below `path`.
    ///
    /// Pages are fetched until the first one with any keys, so that an empty
    /// listing can be reported as `None` up front. The remaining pages are
    /// fetched as the stream is polled.
    pub(crate) async fn list_paths(
        &self,
        path: &Utf8Path,
    ) -> Result<Option<PathStream>, QiniuRequestError> {
        let prefix = directory_prefix(&rooted(self.root(), path));
        tracing::debug!(%prefix, "Listing");

        let mut marker: Option<String> = None;
        let first = loop {
            let page = self.qiniu_list(&prefix, marker.as_deref()).await?;
            marker = page.next_marker();
            if !page.items.is_empty() {
                break page;
            }
            if marker.is_none() {
                return Ok(None);
            }
        };

        let client = self.clone();
        let first_paths = self.paths(first);

        let rest = stream::try_unfold(
            (client, prefix, marker),
            |(client, prefix, marker)| async move {
                let Some(current) = marker else {
                    return Ok(None);
                };
                let page = client.qiniu_list(&prefix, Some(&current)).await?;
                let next = page.next_marker();
                let paths = client.paths(page);
                Ok::<_, QiniuRequestError>(Some((paths, (client, prefix, next))))
            },
        );

        let bucket = self.bucket().to_owned();
        let stream = stream::once(futures::future::ready(Ok::<_, QiniuRequestError>(first_paths)))
            .chain(rest)
            .map_ok(|paths| stream::iter(paths.into_iter().map(Ok::<_, QiniuRequestError>)))
            .try_flatten()
            .map_err(move |error| {
                StorageError::builder(QINIU_STORAGE_NAME, StorageErrorKind::Io, error)
                    .bucket(bucket.clone())
                    .context("list next page")
                    .build()
            });

        Ok(Some(stream.boxed()))
    }

    /// Registry paths for the keys on a page, with the virtual root removed.
    fn paths(&self, page: ListPage) -> Vec<String> {
        page.items
            .into_iter()
            .filter_map(|item| item.key)
            .filter_map(|key| unrooted(self.root(), &key).map(str::to_owned))
            .collect()
    }
}
