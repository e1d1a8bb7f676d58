//! Service-to-service identity tokens.
//!
//! The proxy replaces the caller's bearer token with a token that asserts the
//! gateway's own identity, scoped to the upstream's origin as audience. One
//! source is built per upstream at startup and shared by every request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::Result;
use crate::config::{ServiceIdentityConfig, ServiceIdentityProvider};

/// Lifetime assumed for a token whose `exp` cannot be read
const ASSUMED_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Why an identity token could not be produced
#[derive(Debug, Error)]
pub enum TokenSourceError {
    /// The metadata server could not be reached
    #[error("identity token request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The metadata server answered with a non-success status
    #[error("identity token request returned {0}")]
    Status(StatusCode),

    /// The metadata server answered with an empty body
    #[error("identity token response was empty")]
    Empty,
}

/// Produces the current identity token for one audience.
///
/// Implementations own their caching; callers ask on every request.
#[async_trait]
pub trait IdentityTokenSource: Send + Sync {
    /// Return a token that is valid for at least the configured skew
    async fn token(&self) -> std::result::Result<String, TokenSourceError>;
}

struct CachedToken {
    value: String,
    /// Unix seconds after which the token must be re-minted
    refresh_at: i64,
}

/// Identity tokens minted by the compute metadata server.
pub struct MetadataTokenSource {
    http: reqwest::Client,
    metadata_url: String,
    audience: String,
    refresh_skew: Duration,
    cached: RwLock<Option<CachedToken>>,
    refresh_lock: Mutex<()>,
}

impl MetadataTokenSource {
    /// Create a source for one audience.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        metadata_url: impl Into<String>,
        audience: impl Into<String>,
        refresh_skew: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            metadata_url: metadata_url.into(),
            audience: audience.into(),
            refresh_skew,
            cached: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        })
    }

    /// The audience tokens are minted for
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    fn cached_token(&self, now: i64) -> Option<String> {
        self.cached
            .read()
            .as_ref()
            .filter(|cached| now < cached.refresh_at)
            .map(|cached| cached.value.clone())
    }

    async fn mint(&self) -> std::result::Result<String, TokenSourceError> {
        let response = self
            .http
            .get(&self.metadata_url)
            .query(&[("audience", self.audience.as_str()), ("format", "full")])
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TokenSourceError::Status(status));
        }

        let token = response.text().await?.trim().to_string();
        if token.is_empty() {
            return Err(TokenSourceError::Empty);
        }
        Ok(token)
    }
}

#[async_trait]
impl IdentityTokenSource for MetadataTokenSource {
    async fn token(&self) -> std::result::Result<String, TokenSourceError> {
        if let Some(token) = self.cached_token(now_unix()) {
            return Ok(token);
        }

        // One mint at a time; waiters pick up the fresh token
        let _guard = self.refresh_lock.lock().await;
        if let Some(token) = self.cached_token(now_unix()) {
            return Ok(token);
        }

        let token = self.mint().await?;
        let now = now_unix();
        let expires_at =
            token_expiry(&token).unwrap_or(now + ASSUMED_TOKEN_LIFETIME_SECS);
        let skew = i64::try_from(self.refresh_skew.as_secs()).unwrap_or(i64::MAX);
        let refresh_at = expires_at.saturating_sub(skew);

        debug!(audience = %self.audience, expires_at, "Minted identity token");
        *self.cached.write() = Some(CachedToken {
            value: token.clone(),
            refresh_at,
        });
        Ok(token)
    }
}

/// Build the token source for an upstream, if service identity is enabled.
///
/// # Errors
///
/// Returns an error if the source's HTTP client cannot be built.
pub fn build_token_source(
    config: &ServiceIdentityConfig,
    audience: &str,
) -> Result<Option<Arc<dyn IdentityTokenSource>>> {
    match config.provider {
        ServiceIdentityProvider::None => Ok(None),
        ServiceIdentityProvider::Metadata => {
            info!(audience = %audience, "Identity token source ready");
            let source = MetadataTokenSource::new(
                config.metadata_url.clone(),
                audience,
                config.refresh_skew,
                config.timeout,
            )?;
            Ok(Some(Arc::new(source)))
        }
    }
}

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: Option<i64>,
}

/// Read `exp` from a JWT payload without verifying it.
fn token_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice::<ExpiryClaim>(&bytes).ok()?.exp
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
