//! Credential providers for the connection handshake.
//!
//! Two policies:
//!
//! | Provider | `fetch` | `fetch_on_expiry` |
//! |----------|---------|-------------------|
//! | `SubscriptionKeyAuth` | fixed key, no I/O | same fixed key |
//! | `TokenAuth` | first-connect callback | renewal callback |
//!
//! `fetch_on_expiry` is only called after the service rejected the previous
//! credential, so token callers can force a refresh there and serve a cached
//! token from `fetch`.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

use crate::error::{Result, VoxlinkError};

pub const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
pub const AUTHORIZATION_HEADER: &str = "Authorization";
const BEARER_PREFIX: &str = "Bearer ";

/// One header to attach to the handshake. Fetched fresh per connection attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthInfo {
    header_name: String,
    token: String,
}

impl AuthInfo {
    pub fn new(header_name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            header_name: header_name.into(),
            token: token.into(),
        }
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthInfo")
            .field("header_name", &self.header_name)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Supplies handshake credentials.
#[async_trait]
pub trait AuthenticationProvider: Send + Sync {
    /// Credential for a first connection attempt.
    async fn fetch(&self, auth_fetch_event_id: &str) -> Result<AuthInfo>;

    /// Credential after the service reported the previous one expired.
    async fn fetch_on_expiry(&self, auth_fetch_event_id: &str) -> Result<AuthInfo>;
}

/// Static subscription key.
#[derive(Debug, Clone)]
pub struct SubscriptionKeyAuth {
    info: AuthInfo,
}

impl SubscriptionKeyAuth {
    /// # Errors
    /// `VoxlinkError::ArgumentNull` for an empty key.
    pub fn new(subscription_key: &str) -> Result<Self> {
        let key = subscription_key.trim();
        if key.is_empty() {
            return Err(VoxlinkError::ArgumentNull("subscription_key"));
        }
        Ok(Self {
            info: AuthInfo::new(SUBSCRIPTION_KEY_HEADER, key),
        })
    }
}

#[async_trait]
impl AuthenticationProvider for SubscriptionKeyAuth {
    async fn fetch(&self, _auth_fetch_event_id: &str) -> Result<AuthInfo> {
        Ok(self.info.clone())
    }

    async fn fetch_on_expiry(&self, _auth_fetch_event_id: &str) -> Result<AuthInfo> {
        Ok(self.info.clone())
    }
}

/// Async callback returning a raw (unprefixed) bearer token.
pub type TokenCallback = Arc<dyn Fn(String) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Wrap an async closure as a `TokenCallback`.
pub fn token_callback<F, Fut>(f: F) -> TokenCallback
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    Arc::new(move |auth_fetch_event_id| Box::pin(f(auth_fetch_event_id)))
}

/// Bearer token supplied by caller-owned callbacks.
pub struct TokenAuth {
    fetch: TokenCallback,
    fetch_on_expiry: TokenCallback,
}

impl TokenAuth {
    /// # Errors
    /// `VoxlinkError::ArgumentNull` when either callback is missing.
    pub fn new(fetch: Option<TokenCallback>, fetch_on_expiry: Option<TokenCallback>) -> Result<Self> {
        Ok(Self {
            fetch: fetch.ok_or(VoxlinkError::ArgumentNull("fetch"))?,
            fetch_on_expiry: fetch_on_expiry.ok_or(VoxlinkError::ArgumentNull("fetch_on_expiry"))?,
        })
    }

    async fn run(callback: &TokenCallback, auth_fetch_event_id: &str) -> Result<AuthInfo> {
        let token = callback(auth_fetch_event_id.to_string())
            .await
            .map_err(|e| match e {
                VoxlinkError::AuthenticationFailure(_) => e,
                other => VoxlinkError::AuthenticationFailure(other.to_string()),
            })?;
        if token.is_empty() {
            return Err(VoxlinkError::AuthenticationFailure(
                "token callback returned an empty token".into(),
            ));
        }
        Ok(AuthInfo::new(
            AUTHORIZATION_HEADER,
            format!("{BEARER_PREFIX}{token}"),
        ))
    }
}

impl std::fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuth").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthenticationProvider for TokenAuth {
    async fn fetch(&self, auth_fetch_event_id: &str) -> Result<AuthInfo> {
        debug!(auth_fetch_event_id, "fetching token");
        Self::run(&self.fetch, auth_fetch_event_id).await
    }

    async fn fetch_on_expiry(&self, auth_fetch_event_id: &str) -> Result<AuthInfo> {
        debug!(auth_fetch_event_id, "refreshing expired token");
        Self::run(&self.fetch_on_expiry, auth_fetch_event_id).await
    }
}
