//! Bearer credential verification.
//!
//! # Verification flow
//!
//! 1. The auth middleware extracts the raw bearer credential.
//! 2. [`TokenVerifier::verify`] hands it to the strategy selected at startup:
//!    - [`JwksVerifier`]: decode the header, resolve `kid` through the
//!      [`KeyStore`], check signature, `exp`/`nbf` (with leeway), `aud`, `iss`.
//!    - `TrustAll`: the credential string *is* the subject. Development only.
//! 3. The result is an [`AuthenticatedIdentity`] that lives in the request's
//!    extensions until the response is produced.
//!
//! Every identity has a non-empty subject; anything else is a [`VerifyError`].

pub mod key_store;
pub mod verifier;

use std::fmt;

use tracing::warn;

use crate::config::{AuthMode, Config, Environment};
use crate::{Error, Result};

pub use key_store::{KeyStore, SigningKey};
pub use verifier::JwksVerifier;

/// Verified caller identity, scoped to a single request.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity {
    /// `sub` claim (never empty)
    pub subject: String,
    /// `sid` claim, when the issuer provides one
    pub session_id: Option<String>,
    /// `exp` as unix seconds, 0 if unknown
    pub expires_at: i64,
    /// The credential the identity was derived from
    pub raw_credential: String,
}

impl AuthenticatedIdentity {
    /// Identity asserted by a trusted caller without a credential
    #[must_use]
    pub fn from_trusted_subject(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            session_id: None,
            expires_at: 0,
            raw_credential: String::new(),
        }
    }
}

impl fmt::Debug for AuthenticatedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedIdentity")
            .field("subject", &self.subject)
            .field("session_id", &self.session_id)
            .field("expires_at", &self.expires_at)
            .field("raw_credential", &"<redacted>")
            .finish()
    }
}

/// Why a credential was not accepted.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// The JWT header has no `kid`.
    #[error("token missing kid header")]
    MissingKeyId,

    /// No published key matches the token's `kid`, even after a refresh.
    #[error("signing key not found: {0}")]
    KeyNotFound(String),

    /// The key set could not be fetched and no previous set is available.
    #[error("JWKS fetch failed: {0}")]
    JwksFetchFailed(String),

    /// Malformed token, bad signature, expired, or wrong audience/issuer.
    #[error("token verification failed: {0}")]
    TokenInvalid(#[from] jsonwebtoken::errors::Error),

    /// The token verified but carries no subject.
    #[error("token missing subject claim")]
    MissingSubject,
}

impl VerifyError {
    /// Short message safe to return to the client
    #[must_use]
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::MissingKeyId => "token missing kid header",
            Self::KeyNotFound(_) => "token signing key not recognized",
            Self::JwksFetchFailed(_) => "unable to verify token",
            Self::TokenInvalid(_) => "invalid token",
            Self::MissingSubject => "token missing subject claim",
        }
    }
}

/// The verification strategy, chosen once at startup.
pub enum TokenVerifier {
    /// Signature verification against a published key set
    Jwks(JwksVerifier),
    /// Treats the credential itself as the subject.
    ///
    /// This is a trust-boundary switch for local development, not a security
    /// feature. [`TokenVerifier::from_config`] refuses it in production.
    TrustAll,
}

impl TokenVerifier {
    /// Build the verifier selected by `auth.mode`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for `trust_all` in production, or if the
    /// JWKS HTTP client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.auth.mode {
            AuthMode::Jwks => Ok(Self::Jwks(JwksVerifier::from_config(&config.auth)?)),
            AuthMode::TrustAll if config.environment == Environment::Production => Err(
                Error::Config("trust_all verifier cannot be used in production".to_string()),
            ),
            AuthMode::TrustAll => {
                warn!("TRUST-ALL verifier active - bearer credentials are accepted as subjects without verification");
                Ok(Self::TrustAll)
            }
        }
    }

    /// Verify a raw bearer credential.
    pub async fn verify(&self, raw_token: &str) -> std::result::Result<AuthenticatedIdentity, VerifyError> {
        match self {
            Self::Jwks(verifier) => verifier.verify(raw_token).await,
            Self::TrustAll => {
                let subject = raw_token.trim();
                if subject.is_empty() {
                    return Err(VerifyError::MissingSubject);
                }
                Ok(AuthenticatedIdentity {
                    subject: subject.to_string(),
                    session_id: None,
                    expires_at: 0,
                    raw_credential: raw_token.to_string(),
                })
            }
        }
    }

    /// Name used in startup logs
    #[must_use]
    pub fn mode_name(&self) -> &'static str {
        match self {
            Self::Jwks(_) => "jwks",
            Self::TrustAll => "trust_all",
        }
    }
}
