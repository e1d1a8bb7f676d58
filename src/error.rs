//! Error types for the gateway process

use std::io;

use thiserror::Error;

/// Result type alias for gateway startup and configuration
pub type Result<T> = std::result::Result<T, Error>;

/// Process-level gateway errors.
///
/// Per-request failures have their own enums ([`crate::identity::VerifyError`],
/// [`crate::gateway::auth::AuthError`], [`crate::gateway::proxy::ProxyError`],
/// [`crate::entitlement::EntitlementError`]); this type covers what can stop the
/// process from starting or serving.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP client construction error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
