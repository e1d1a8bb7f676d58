//! Focus Gateway Library
//!
//! Authenticating edge gateway for the Focus backend services.
//!
//! # Features
//!
//! - **JWKS verification**: RS256/384/512 bearer tokens checked against a
//!   cached, rotation-aware key set with single-flight refresh
//! - **Identity propagation**: the verified subject is written to `X-User-ID`,
//!   overwriting anything the client sent
//! - **Service identity**: per-upstream identity tokens replace the caller's
//!   credential on the way out
//! - **Entitlements**: premium-gated routes are annotated with `X-Premium`
//!   after a subscription lookup
//! - **Production Ready**: request ids, tracing, deadlines, graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod service_token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
