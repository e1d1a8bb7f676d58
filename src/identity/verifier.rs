//! JWKS signature verification for bearer JWTs.

use std::collections::HashSet;

use jsonwebtoken::{
    Algorithm, Validation,
    errors::{Error as JwtError, ErrorKind},
};
use serde::Deserialize;
use tracing::debug;

use super::{AuthenticatedIdentity, KeyStore, VerifyError};
use crate::Result;
use crate::config::AuthConfig;

/// Claims we read from a verified token.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    exp: Option<serde_json::Number>,
}

/// Verifies RS256/RS384/RS512 tokens against a [`KeyStore`].
pub struct JwksVerifier {
    key_store: KeyStore,
    issuer: Option<String>,
    audience: Option<String>,
    leeway_secs: u64,
}

impl JwksVerifier {
    /// Create a verifier around an explicit key store.
    #[must_use]
    pub fn new(key_store: KeyStore) -> Self {
        Self {
            key_store,
            issuer: None,
            audience: None,
            leeway_secs: 5,
        }
    }

    /// Require an exact `iss` match
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Require `aud` to contain this value
    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Clock skew tolerated on `exp` and `nbf`
    #[must_use]
    pub fn with_leeway_secs(mut self, leeway_secs: u64) -> Self {
        self.leeway_secs = leeway_secs;
        self
    }

    /// Build from the `auth` config section.
    ///
    /// # Errors
    ///
    /// Returns an error if the key store's HTTP client cannot be built.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let mut verifier =
            Self::new(KeyStore::from_config(config)?).with_leeway_secs(config.leeway.as_secs());
        if let Some(issuer) = &config.issuer {
            verifier = verifier.with_issuer(issuer.clone());
        }
        if let Some(audience) = &config.audience {
            verifier = verifier.with_audience(audience.clone());
        }
        Ok(verifier)
    }

    /// The key store backing this verifier
    #[must_use]
    pub fn key_store(&self) -> &KeyStore {
        &self.key_store
    }

    /// Verify a token and extract the caller's identity.
    pub async fn verify(&self, token: &str) -> std::result::Result<AuthenticatedIdentity, VerifyError> {
        let header = jsonwebtoken::decode_header(token)?;
        let kid = header
            .kid
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(VerifyError::MissingKeyId)?;
        let algorithm = accepted_algorithm(header.alg)?;

        let key = self.key_store.get_key(kid).await?;

        let data = jsonwebtoken::decode::<TokenClaims>(
            token,
            &key.public_key,
            &self.validation(algorithm),
        )?;
        let claims = data.claims;

        let subject = claims
            .sub
            .filter(|s| !s.is_empty())
            .ok_or(VerifyError::MissingSubject)?;

        debug!(kid = %kid, subject = %subject, "Token verified");

        Ok(AuthenticatedIdentity {
            subject,
            session_id: claims.sid.filter(|s| !s.is_empty()),
            expires_at: claims.exp.as_ref().and_then(numeric_date).unwrap_or(0),
            raw_credential: token.to_string(),
        })
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.leeway = self.leeway_secs;
        validation.validate_nbf = true;
        // `exp` is checked when present; absence is reported as expires_at = 0
        let mut required = HashSet::new();

        match &self.audience {
            Some(audience) => {
                validation.set_audience(&[audience]);
                required.insert("aud".to_string());
            }
            None => validation.validate_aud = false,
        }
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
            required.insert("iss".to_string());
        }
        validation.required_spec_claims = required;
        validation
    }
}

/// Only RSA signatures are published in the key set.
fn accepted_algorithm(alg: Algorithm) -> std::result::Result<Algorithm, VerifyError> {
    match alg {
        Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => Ok(alg),
        _ => Err(VerifyError::TokenInvalid(JwtError::from(
            ErrorKind::InvalidAlgorithm,
        ))),
    }
}

fn numeric_date(value: &serde_json::Number) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite())
            .map(|f| f.trunc() as i64)
    })
}
