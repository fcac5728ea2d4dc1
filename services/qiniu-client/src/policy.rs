//! Upload put policies.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::credentials::Credentials;

/// A Qiniu put policy, which scopes an upload token to one key and expires
/// at a fixed deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutPolicy {
    /// `bucket:key` the token may write.
    pub scope: String,

    /// Unix timestamp (seconds) after which the token is rejected.
    pub deadline: i64,
}

impl PutPolicy {
    /// A policy allowing `key` in `bucket` to be written (or overwritten)
    /// for `lifetime` from now.
    pub fn for_key(bucket: &str, key: &str, lifetime: Duration) -> Self {
        let lifetime = i64::try_from(lifetime.as_secs()).unwrap_or(i64::MAX);
        PutPolicy {
            scope: format!("{bucket}:{key}"),
            deadline: Utc::now().timestamp().saturating_add(lifetime),
        }
    }

    /// The bucket this policy is scoped to.
    pub fn bucket(&self) -> &str {
        self.scope
            .split_once(':')
            .map(|(bucket, _)| bucket)
            .unwrap_or(&self.scope)
    }

    /// The key this policy is scoped to, if it names one.
    pub fn key(&self) -> Option<&str> {
        self.scope.split_once(':').map(|(_, key)| key)
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline < Utc::now().timestamp()
    }

    /// Sign the policy into an upload token.
    pub fn token(&self, credentials: &Credentials) -> Result<String, serde_json::Error> {
        let policy = serde_json::to_vec(self)?;
        Ok(credentials.token_with_data(&policy))
    }
}
