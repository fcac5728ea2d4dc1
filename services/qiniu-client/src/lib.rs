//! # Qiniu storage driver
//!
//! Stores registry objects in a Qiniu bucket, using the v1 HTTP API:
//! uploads go to the `up` host, stat and delete to `rs`, listings to `rsf`,
//! and downloads are served from the bucket's bound domain through
//! time-limited signed URLs.
//!
//! ```rust,no_run
//! use camino::Utf8Path;
//! use qiniu_client::QiniuConfig;
//! use storage_driver::Driver;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let client = QiniuConfig::from_env()?.client()?;
//! let data = client.get_content(Utf8Path::new("docker/registry/v2/blobs/layer")).await?;
//! # let _ = data;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

mod client;
mod config;
mod credentials;
mod download;
mod errors;
mod file;
mod list;
pub mod mock;
mod policy;
mod transport;
mod upload;

/// The name of the storage driver.
const QINIU_STORAGE_NAME: &str = "qiniu";

/// URL Scheme which should be registered for this storage driver.
const QINIU_STORAGE_SCHEME: &str = "qiniu";

/// Size of a Qiniu upload block.
///
/// Objects no larger than one block are sent in a single form upload,
/// larger objects are sent block by block and then stitched together.
const QINIU_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Number of keys requested per listing page.
const QINIU_LIST_LIMIT: usize = 1000;

/// Default lifetime of upload tokens and signed download URLs.
const QINIU_DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Default timeout for regular requests
const QINIU_DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default connect timeout
const QINIU_DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const QINIU_DEFAULT_UP_HOST: &str = "https://up.qiniup.com";
const QINIU_DEFAULT_RS_HOST: &str = "https://rs.qbox.me";
const QINIU_DEFAULT_RSF_HOST: &str = "https://rsf.qbox.me";

pub use crate::client::QiniuClient;
pub use crate::config::{ConfigError, QiniuConfig};
pub use crate::credentials::{Credentials, Secret};
pub use crate::errors::{QiniuError, QiniuErrorCode, QiniuRequestError};
pub use crate::policy::PutPolicy;
