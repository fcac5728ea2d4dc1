//! Qiniu access keys and request signing.

use std::{env::VarError, fmt};

use base64::prelude::{Engine as _, BASE64_URL_SAFE};
use hmac::{Hmac, Mac};
use http::{header::InvalidHeaderValue, HeaderValue, Uri};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use zeroize::Zeroize;

type HmacSha1 = Hmac<Sha1>;

/// A semi-secret string, such as a Qiniu secret key.
///
/// The value never appears in `Debug` output and is zeroed on drop.
/// Use [`Secret::revealed`] to get the underlying value.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub struct Secret(String);

impl Secret {
    /// Read a secret from an environment variable.
    pub fn from_env(var: &str) -> Result<Self, VarError> {
        std::env::var(var).map(Secret)
    }

    /// Expose the underlying value.
    pub fn revealed(&self) -> &str {
        &self.0
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Secret(value.to_owned())
    }
}

impl From<Secret> for String {
    fn from(value: Secret) -> Self {
        value.0.clone()
    }
}

/// A Qiniu access key / secret key pair.
///
/// All Qiniu tokens are `access_key:signature` pairs, where the signature is
/// the URL-safe base64 HMAC-SHA1 of some request data under the secret key.
#[derive(Debug, Clone)]
pub struct Credentials {
    access_key: String,
    secret_key: Secret,
}

impl Credentials {
    /// Create a new credential pair.
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<Secret>) -> Self {
        Credentials {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    /// The public half of the pair.
    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    fn mac(&self) -> HmacSha1 {
        HmacSha1::new_from_slice(self.secret_key.revealed().as_bytes())
            .expect("HMAC accepts keys of any length")
    }

    /// URL-safe base64 HMAC-SHA1 of `data`.
    pub fn sign(&self, data: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(data);
        BASE64_URL_SAFE.encode(mac.finalize().into_bytes())
    }

    /// An `access_key:signature` token over `data`.
    pub fn token(&self, data: &[u8]) -> String {
        format!("{}:{}", self.access_key, self.sign(data))
    }

    /// An `access_key:signature:encoded` token, where `encoded` is the
    /// base64 form of `data` and is itself what gets signed.
    ///
    /// Used for upload tokens, which carry their put policy.
    pub fn token_with_data(&self, data: &[u8]) -> String {
        let encoded = BASE64_URL_SAFE.encode(data);
        format!("{}:{}", self.token(encoded.as_bytes()), encoded)
    }

    /// The token authorizing a management (`rs` / `rsf`) request for `uri`.
    ///
    /// Management requests sign the path and query followed by a newline.
    /// None of the requests made here carry a form body, so the body is
    /// never part of the signature.
    pub fn management_token(&self, uri: &Uri) -> String {
        self.token(signing_data(uri).as_bytes())
    }

    /// The `Authorization` header value for a management request.
    pub fn management_header(&self, uri: &Uri) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut value = HeaderValue::try_from(format!("QBox {}", self.management_token(uri)))?;
        value.set_sensitive(true);
        Ok(value)
    }

    /// Check a token produced by [`Credentials::token`] over `data`.
    pub fn verify(&self, data: &[u8], token: &str) -> bool {
        let Some((access_key, signature)) = token.split_once(':') else {
            return false;
        };
        if access_key != self.access_key {
            return false;
        }
        let Ok(signature) = BASE64_URL_SAFE.decode(signature) else {
            return false;
        };

        let mut mac = self.mac();
        mac.update(data);
        mac.verify_slice(&signature).is_ok()
    }
}

/// The `Authorization` header value for an upload request.
pub(crate) fn upload_header(token: &str) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut value = HeaderValue::try_from(format!("UpToken {token}"))?;
    value.set_sensitive(true);
    Ok(value)
}

pub(crate) fn signing_data(uri: &Uri) -> String {
    match uri.query() {
        Some(query) => format!("{}?{}\n", uri.path(), query),
        None => format!("{}\n", uri.path()),
    }
}

/// Qiniu's `EncodedEntryURI`: URL-safe base64 of `bucket:key`.
pub(crate) fn encoded_entry(bucket: &str, key: &str) -> String {
    BASE64_URL_SAFE.encode(format!("{bucket}:{key}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials::new("test-access", "test-secret")
    }

    #[test]
    fn secret_hidden_debug() {
        let secret = Secret::from("secret garden");
        assert_eq!(format!("{secret:?}"), "Secret(****)");
        assert_eq!(secret.revealed(), "secret garden");

        let creds = credentials();
        assert!(!format!("{creds:?}").contains("test-secret"));
    }

    #[test]
    fn signatures_verify() {
        let creds = credentials();
        let token = creds.token(b"hello");
        assert!(token.starts_with("test-access:"));
        assert!(creds.verify(b"hello", &token));
        assert!(!creds.verify(b"goodbye", &token));

        let other = Credentials::new("test-access", "other-secret");
        assert!(!other.verify(b"hello", &token));
    }

    #[test]
    fn signature_is_url_safe_base64_of_sha1() {
        let signature = credentials().sign(b"data");
        // 20 bytes of SHA1 output encode to 28 padded characters.
        assert_eq!(signature.len(), 28);
        assert!(signature.ends_with('='));
        assert!(!signature.contains('+') && !signature.contains('/'));
    }

    #[test]
    fn token_with_data_embeds_payload() {
        let creds = credentials();
        let token = creds.token_with_data(br#"{"scope":"bucket"}"#);
        let mut parts = token.splitn(3, ':');
        assert_eq!(parts.next(), Some("test-access"));
        let signature = parts.next().unwrap();
        let encoded = parts.next().unwrap();

        assert_eq!(
            BASE64_URL_SAFE.decode(encoded).unwrap(),
            br#"{"scope":"bucket"}"#
        );
        assert!(creds.verify(
            encoded.as_bytes(),
            &format!("test-access:{signature}")
        ));
    }

    #[test]
    fn management_signature_covers_query() {
        let uri: Uri = "https://rsf.qbox.me/list?bucket=b&prefix=a%2F".parse().unwrap();
        assert_eq!(signing_data(&uri), "/list?bucket=b&prefix=a%2F\n");

        let uri: Uri = "https://rs.qbox.me/stat/YjprZXk=".parse().unwrap();
        assert_eq!(signing_data(&uri), "/stat/YjprZXk=\n");

        let header = credentials().management_header(&uri).unwrap();
        assert!(header.is_sensitive());
        assert!(header.to_str().unwrap().starts_with("QBox test-access:"));
    }

    #[test]
    fn entry_encoding() {
        assert_eq!(encoded_entry("b", "key"), "YjprZXk=");
    }
}
