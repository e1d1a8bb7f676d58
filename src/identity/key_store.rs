//! JWKS-backed signing key store.
//!
//! # Refresh policy
//!
//! - A fetched key set is fresh for `ttl` (default 10 minutes). Lookups on a
//!   fresh set take only the read lock.
//! - Refreshes happen under the write lock and re-check the freshness
//!   condition after acquiring it, so callers that queued behind an in-flight
//!   fetch reuse its result instead of issuing their own.
//! - An unknown `kid` on a fresh set triggers a refresh at most once per
//!   `refresh_interval`; this picks up a publisher's key rotation without
//!   letting forged `kid`s drive fetch traffic.
//! - A refresh replaces the whole map or nothing. Any key that fails to decode
//!   fails the refresh, and a failed refresh keeps the last good set.
//! - With no set ever loaded, a failed fetch is a [`VerifyError::JwksFetchFailed`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::VerifyError;
use crate::config::AuthConfig;
use crate::Result;

/// A published public key, as resolved by `kid`.
#[derive(Clone)]
pub struct SigningKey {
    /// Key identifier from the JWKS entry
    pub key_id: String,
    /// RSA public key material
    pub public_key: DecodingKey,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey").field("key_id", &self.key_id).finish_non_exhaustive()
    }
}

/// JWKS document as published by the identity provider.
#[derive(Debug, Deserialize)]
pub(crate) struct JwksDocument {
    #[serde(default)]
    keys: Vec<Jwk>,
}

/// One JWKS entry. Only the fields we act on.
#[derive(Debug, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    kty: String,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Default)]
struct KeyStoreState {
    keys: HashMap<String, Arc<SigningKey>>,
    last_refreshed_at: Option<Instant>,
    last_attempt_at: Option<Instant>,
    last_error: Option<String>,
}

impl KeyStoreState {
    fn is_fresh(&self, ttl: Duration) -> bool {
        !self.keys.is_empty() && self.last_refreshed_at.is_some_and(|at| at.elapsed() < ttl)
    }

    fn attempted_within(&self, interval: Duration) -> bool {
        self.last_attempt_at.is_some_and(|at| at.elapsed() < interval)
    }

    /// Decide, under the write lock, whether this caller has to fetch.
    fn needs_refresh(
        &self,
        kid: &str,
        requested_at: Instant,
        ttl: Duration,
        refresh_interval: Duration,
    ) -> bool {
        // Someone fetched while we waited for the lock
        if self.last_attempt_at.is_some_and(|at| at >= requested_at) {
            return false;
        }
        if self.keys.is_empty() {
            return true;
        }
        if !self.is_fresh(ttl) {
            // Stale but usable: back off after a failed attempt
            let last_failed = self.last_attempt_at > self.last_refreshed_at;
            return !(last_failed && self.attempted_within(refresh_interval));
        }
        !self.keys.contains_key(kid) && !self.attempted_within(refresh_interval)
    }
}

/// Signing keys for one JWKS URL, shared by all in-flight verifications.
pub struct KeyStore {
    jwks_url: String,
    http: reqwest::Client,
    ttl: Duration,
    refresh_interval: Duration,
    state: RwLock<KeyStoreState>,
}

impl KeyStore {
    /// Create an empty store. Nothing is fetched until the first lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        jwks_url: impl Into<String>,
        ttl: Duration,
        fetch_timeout: Duration,
        refresh_interval: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(fetch_timeout).build()?;
        Ok(Self {
            jwks_url: jwks_url.into(),
            http,
            ttl,
            refresh_interval,
            state: RwLock::new(KeyStoreState::default()),
        })
    }

    /// Create from the `auth` config section.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        Self::new(
            config.jwks_url.clone(),
            config.cache_ttl,
            config.fetch_timeout,
            config.unknown_kid_refresh_interval,
        )
    }

    /// Resolve a signing key by `kid`, refreshing the set when needed.
    pub async fn get_key(&self, kid: &str) -> std::result::Result<Arc<SigningKey>, VerifyError> {
        {
            let state = self.state.read().await;
            if state.is_fresh(self.ttl) {
                if let Some(key) = state.keys.get(kid) {
                    return Ok(Arc::clone(key));
                }
            }
        }

        let requested_at = Instant::now();
        let mut state = self.state.write().await;

        if state.needs_refresh(kid, requested_at, self.ttl, self.refresh_interval) {
            state.last_attempt_at = Some(Instant::now());
            match self.fetch().await {
                Ok(keys) => {
                    info!(url = %self.jwks_url, keys = keys.len(), "Refreshed JWKS key set");
                    state.keys = keys;
                    state.last_refreshed_at = state.last_attempt_at;
                    state.last_error = None;
                }
                Err(e) if state.keys.is_empty() => {
                    error!(url = %self.jwks_url, error = %e, "JWKS fetch failed and no key set is loaded");
                    state.last_error = Some(e.to_string());
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        url = %self.jwks_url,
                        error = %e,
                        keys = state.keys.len(),
                        "JWKS refresh failed, keeping previous key set"
                    );
                    state.last_error = Some(e.to_string());
                }
            }
        }

        if state.keys.is_empty() {
            let reason = state
                .last_error
                .clone()
                .unwrap_or_else(|| "no key set loaded".to_string());
            return Err(VerifyError::JwksFetchFailed(reason));
        }

        state.keys.get(kid).cloned().ok_or_else(|| {
            debug!(kid = %kid, "Key ID not present in JWKS");
            VerifyError::KeyNotFound(kid.to_string())
        })
    }

    /// Number of keys currently loaded
    pub async fn len(&self) -> usize {
        self.state.read().await.keys.len()
    }

    /// Whether no key set has been loaded yet
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.keys.is_empty()
    }

    async fn fetch(&self) -> std::result::Result<HashMap<String, Arc<SigningKey>>, VerifyError> {
        debug!(url = %self.jwks_url, "Fetching JWKS");
        let response = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| VerifyError::JwksFetchFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VerifyError::JwksFetchFailed(format!(
                "unexpected status {status}"
            )));
        }

        let document: JwksDocument = response
            .json()
            .await
            .map_err(|e| VerifyError::JwksFetchFailed(format!("decode jwks: {e}")))?;

        parse_key_set(document)
    }
}

/// Decode every supported key in the document, or fail the whole set.
pub(crate) fn parse_key_set(
    document: JwksDocument,
) -> std::result::Result<HashMap<String, Arc<SigningKey>>, VerifyError> {
    let mut keys = HashMap::with_capacity(document.keys.len());

    for jwk in document.keys {
        if jwk.kty != "RSA" {
            debug!(kty = %jwk.kty, kid = ?jwk.kid, "Skipping unsupported JWKS key type");
            continue;
        }
        let Some(kid) = jwk.kid.filter(|k| !k.is_empty()) else {
            debug!("Skipping JWKS key without kid");
            continue;
        };

        let (Some(n), Some(e)) = (
            jwk.n.filter(|v| !v.is_empty()),
            jwk.e.filter(|v| !v.is_empty()),
        ) else {
            return Err(VerifyError::JwksFetchFailed(format!(
                "parse jwks key {kid}: missing modulus or exponent"
            )));
        };

        let public_key = DecodingKey::from_rsa_components(&n, &e).map_err(|err| {
            VerifyError::JwksFetchFailed(format!("parse jwks key {kid}: {err}"))
        })?;

        keys.insert(
            kid.clone(),
            Arc::new(SigningKey {
                key_id: kid,
                public_key,
            }),
        );
    }

    if keys.is_empty() {
        return Err(VerifyError::JwksFetchFailed(
            "jwks contained no supported keys".to_string(),
        ));
    }

    Ok(keys)
}
