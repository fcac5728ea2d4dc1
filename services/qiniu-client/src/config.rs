//! Configuration for a [`QiniuClient`].

use std::env::VarError;
use std::time::Duration;

use camino::Utf8PathBuf;
use http::Uri;
use serde::Deserialize;
use thiserror::Error;

use crate::credentials::{Credentials, Secret};
use crate::QiniuClient;

const QINIU_ACCESS_KEY_ENV: &str = "QINIU_ACCESS_KEY";
const QINIU_SECRET_KEY_ENV: &str = "QINIU_SECRET_KEY";
const QINIU_BUCKET_ENV: &str = "QINIU_BUCKET";
const QINIU_DOMAIN_ENV: &str = "QINIU_DOMAIN";
const QINIU_ROOT_ENV: &str = "QINIU_ROOT";

/// An error in the configuration of a Qiniu client.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is unset or not unicode.
    #[error("environment variable {name}: {source}")]
    Env {
        /// The variable name.
        name: &'static str,
        /// Why it could not be read.
        #[source]
        source: VarError,
    },

    /// A host or domain does not form a valid URL.
    #[error("{field} {value:?} is not a valid URL: {source}")]
    InvalidUrl {
        /// The configuration field.
        field: &'static str,
        /// The configured value.
        value: String,
        /// The parse failure.
        #[source]
        source: http::uri::InvalidUri,
    },

    /// A required field was empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

fn env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|source| ConfigError::Env { name, source })
}

/// Settings for a [`QiniuClient`], deserialized from the registry configuration.
///
/// The legacy `qiniu_accesskey`, `qiniu_secretkey`, `qiniu_bucket` and
/// `qiniu_domain` keys are accepted as aliases.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QiniuConfig {
    /// Qiniu access key.
    #[serde(alias = "qiniu_accesskey")]
    pub access_key: String,

    /// Qiniu secret key.
    #[serde(alias = "qiniu_secretkey")]
    pub secret_key: Secret,

    /// Bucket objects are stored in.
    #[serde(alias = "qiniu_bucket")]
    pub bucket: String,

    /// Public domain bound to the bucket, used for downloads.
    #[serde(alias = "qiniu_domain")]
    pub domain: String,

    /// Virtual root prepended to every key.
    #[serde(default)]
    pub root: Option<Utf8PathBuf>,

    /// Download over `https` instead of `http`.
    #[serde(default)]
    pub https: bool,

    /// Lifetime of upload tokens and signed download URLs, in seconds.
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime: u64,

    /// Upload host override.
    #[serde(default)]
    pub up_host: Option<String>,

    /// Resource management (`stat`, `delete`) host override.
    #[serde(default)]
    pub rs_host: Option<String>,

    /// Listing host override.
    #[serde(default)]
    pub rsf_host: Option<String>,

    /// Directory for spooling uploads of unknown length.
    #[serde(default)]
    pub temp_dir: Option<Utf8PathBuf>,
}

fn default_token_lifetime() -> u64 {
    crate::QINIU_DEFAULT_TOKEN_LIFETIME.as_secs()
}

impl QiniuConfig {
    /// Minimal configuration with default hosts.
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<Secret>,
        bucket: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        QiniuConfig {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            bucket: bucket.into(),
            domain: domain.into(),
            root: None,
            https: false,
            token_lifetime: default_token_lifetime(),
            up_host: None,
            rs_host: None,
            rsf_host: None,
            temp_dir: None,
        }
    }

    /// Read the configuration from `QINIU_ACCESS_KEY`, `QINIU_SECRET_KEY`,
    /// `QINIU_BUCKET`, `QINIU_DOMAIN` and the optional `QINIU_ROOT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = QiniuConfig::new(
            env(QINIU_ACCESS_KEY_ENV)?,
            Secret::from_env(QINIU_SECRET_KEY_ENV).map_err(|source| ConfigError::Env {
                name: QINIU_SECRET_KEY_ENV,
                source,
            })?,
            env(QINIU_BUCKET_ENV)?,
            env(QINIU_DOMAIN_ENV)?,
        );

        config.root = match std::env::var(QINIU_ROOT_ENV) {
            Ok(root) => Some(root.into()),
            Err(VarError::NotPresent) => None,
            Err(source) => {
                return Err(ConfigError::Env {
                    name: QINIU_ROOT_ENV,
                    source,
                })
            }
        };

        Ok(config)
    }

    /// Build a client with the default HTTP transport.
    pub fn client(self) -> Result<QiniuClient, ConfigError> {
        let settings = self.settings()?;
        Ok(QiniuClient::from_parts(
            crate::transport::Transport::new(),
            settings,
        ))
    }

    /// Build a client which sends its requests through `service`.
    pub fn client_with_service(
        self,
        service: hyperdriver::client::SharedClientService<hyperdriver::Body, hyperdriver::Body>,
    ) -> Result<QiniuClient, ConfigError> {
        let settings = self.settings()?;
        Ok(QiniuClient::from_parts(
            crate::transport::Transport::from_service(service),
            settings,
        ))
    }

    pub(crate) fn settings(self) -> Result<Settings, ConfigError> {
        for (field, value) in [
            ("access-key", &self.access_key),
            ("bucket", &self.bucket),
            ("domain", &self.domain),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty(field));
            }
        }

        if self.secret_key.revealed().is_empty() {
            return Err(ConfigError::Empty("secret-key"));
        }

        let scheme = if self.https { "https" } else { "http" };
        let domain = self.domain.trim_end_matches('/').to_owned();
        let download = format!("{scheme}://{domain}/");
        validate("domain", &download)?;

        let up = host("up-host", self.up_host, crate::QINIU_DEFAULT_UP_HOST)?;
        let rs = host("rs-host", self.rs_host, crate::QINIU_DEFAULT_RS_HOST)?;
        let rsf = host("rsf-host", self.rsf_host, crate::QINIU_DEFAULT_RSF_HOST)?;

        let root = self
            .root
            .map(|root| Utf8PathBuf::from(storage_driver::normalize(root.as_str())))
            .unwrap_or_default();

        if self.token_lifetime == 0 {
            tracing::warn!("Qiniu token lifetime is zero, every upload will be rejected");
        }

        Ok(Settings {
            credentials: Credentials::new(self.access_key, self.secret_key),
            bucket: self.bucket,
            download_base: format!("{scheme}://{domain}"),
            root,
            token_lifetime: Duration::from_secs(self.token_lifetime),
            up,
            rs,
            rsf,
            temp_dir: self.temp_dir,
        })
    }
}

fn validate(field: &'static str, value: &str) -> Result<(), ConfigError> {
    value
        .parse::<Uri>()
        .map_err(|source| ConfigError::InvalidUrl {
            field,
            value: value.to_owned(),
            source,
        })?;
    Ok(())
}

fn host(
    field: &'static str,
    value: Option<String>,
    default: &'static str,
) -> Result<String, ConfigError> {
    let value = value.unwrap_or_else(|| default.to_owned());
    let value = value.trim_end_matches('/').to_owned();
    validate(field, &format!("{value}/"))?;
    Ok(value)
}

/// Validated client settings, immutable for the lifetime of a client.
#[derive(Debug)]
pub(crate) struct Settings {
    pub(crate) credentials: Credentials,
    pub(crate) bucket: String,
    /// `scheme://domain`, without a trailing slash.
    pub(crate) download_base: String,
    pub(crate) root: Utf8PathBuf,
    pub(crate) token_lifetime: Duration,
    /// Hosts, without trailing slashes.
    pub(crate) up: String,
    pub(crate) rs: String,
    pub(crate) rsf: String,
    pub(crate) temp_dir: Option<Utf8PathBuf>,
}
