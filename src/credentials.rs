//! Bearer token source for stream requests
//!
//! Token acquisition and refresh belong to the dashboard's auth layer. The
//! stream client only asks for a currently valid token, at most twice per
//! connection attempt.

use async_trait::async_trait;

/// Supplies bearer tokens for authenticated stream requests.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Return a token believed to be valid right now, or `None` when the user
    /// cannot be authenticated. Implementations may refresh internally.
    async fn get_valid_token(&self) -> Option<String>;
}

/// Fixed token, e.g. from `CAMSTREAM_TOKEN`
#[derive(Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    /// Wrap a token. An empty string behaves as "no credential".
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticToken")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn get_valid_token(&self) -> Option<String> {
        if self.token.is_empty() {
            None
        } else {
            Some(self.token.clone())
        }
    }
}
