//! Subscription entitlement lookups.
//!
//! One `GET {base_url}/subscribers/{subject}` per premium-gated request. Results
//! are never cached; the proxy decides what an error means.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::{EntitlementConfig, parse_absolute_url};
use crate::{Error, Result};

/// Why an entitlement lookup did not produce an answer
#[derive(Debug, Error)]
pub enum EntitlementError {
    /// Network failure or timeout
    #[error("entitlement request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Any status other than 200 or 404
    #[error("entitlement provider returned {0}")]
    Status(StatusCode),

    /// The subscriber document could not be decoded
    #[error("entitlement response could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Deserialize)]
struct SubscriberResponse {
    subscriber: Subscriber,
}

#[derive(Debug, Default, Deserialize)]
struct Subscriber {
    #[serde(default)]
    entitlements: HashMap<String, EntitlementRecord>,
}

/// One entitlement as reported by the provider
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntitlementRecord {
    /// RFC 3339 expiry; absent or null means a lifetime grant
    #[serde(default)]
    pub expires_date: Option<String>,
}

impl EntitlementRecord {
    /// Whether the grant is active at `now`. Unparsable dates are not active.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.expires_date.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|expires| now < expires.with_timezone(&Utc))
                .unwrap_or(false),
        }
    }
}

/// HTTP client for the subscription provider.
pub struct EntitlementClient {
    http: reqwest::Client,
    base_url: Url,
    secret_key: String,
    entitlement_id: String,
}

impl EntitlementClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not an absolute URL or the HTTP client
    /// cannot be built.
    pub fn new(
        base_url: &str,
        secret_key: &str,
        entitlement_id: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = parse_absolute_url(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!("entitlement base_url '{base_url}' cannot be a base")));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            secret_key: secret_key.trim().to_string(),
            entitlement_id: entitlement_id.trim().to_string(),
        })
    }

    /// Build from config; `None` when lookups are not configured.
    ///
    /// # Errors
    ///
    /// See [`EntitlementClient::new`].
    pub fn from_config(config: &EntitlementConfig) -> Result<Option<Self>> {
        if !config.is_enabled() {
            return Ok(None);
        }
        Self::new(
            &config.base_url,
            &config.secret_key,
            &config.entitlement_id,
            config.timeout,
        )
        .map(Some)
    }

    /// Whether `subject` currently holds the configured entitlement.
    ///
    /// An unknown subscriber is `Ok(false)`.
    pub async fn has_active_entitlement(
        &self,
        subject: &str,
    ) -> std::result::Result<bool, EntitlementError> {
        let subject = subject.trim();
        if self.secret_key.is_empty() || self.entitlement_id.is_empty() || subject.is_empty() {
            return Ok(false);
        }

        let response = self
            .http
            .get(self.subscriber_url(subject))
            .bearer_auth(&self.secret_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                debug!(subject = %subject, "Subscriber not found");
                return Ok(false);
            }
            status => return Err(EntitlementError::Status(status)),
        }

        let bytes = response.bytes().await?;
        let body: SubscriberResponse = serde_json::from_slice(&bytes)
            .map_err(|e| EntitlementError::Decode(e.to_string()))?;

        Ok(body
            .subscriber
            .entitlements
            .get(&self.entitlement_id)
            .is_some_and(|record| record.is_active(Utc::now())))
    }

    fn subscriber_url(&self, subject: &str) -> Url {
        let mut url = self.base_url.clone();
        // Infallible: cannot_be_a_base was rejected in new()
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("subscribers").push(subject);
        }
        url
    }
}
