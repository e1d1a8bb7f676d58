//! Authentication middleware
//!
//! Every proxied request passes through [`auth_middleware`] before it reaches
//! the proxy. On success the verified [`AuthenticatedIdentity`] is inserted
//! into the request extensions; on failure the request ends here with a 401.
//!
//! The `X-User-ID` short-circuit is honored only by state built with
//! [`AuthState::internal`], which the server attaches to the internal listener.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::identity::{AuthenticatedIdentity, TokenVerifier, VerifyError};

/// Trusted subject header, also written by the proxy
pub const USER_ID_HEADER: &str = "x-user-id";

/// Authentication failure, always answered with 401
#[derive(Debug, Error)]
pub enum AuthError {
    /// No `Authorization` header
    #[error("missing bearer token")]
    Missing,

    /// Not `Bearer <token>`, or an empty token
    #[error("malformed authorization header")]
    Malformed,

    /// The verifier rejected the credential
    #[error(transparent)]
    Verification(#[from] VerifyError),
}

impl AuthError {
    fn client_message(&self) -> &'static str {
        match self {
            Self::Missing => "missing bearer token",
            Self::Malformed => "malformed authorization header",
            Self::Verification(e) => e.client_message(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer")],
            Json(json!({ "error": self.client_message() })),
        )
            .into_response()
    }
}

/// Per-listener authentication state
#[derive(Clone)]
pub struct AuthState {
    verifier: Arc<TokenVerifier>,
    trust_forwarded_subject: bool,
}

impl AuthState {
    /// State for the public edge: bearer tokens only
    #[must_use]
    pub fn public(verifier: Arc<TokenVerifier>) -> Self {
        Self {
            verifier,
            trust_forwarded_subject: false,
        }
    }

    /// State for the internal listener: `X-User-ID` is accepted as the subject
    #[must_use]
    pub fn internal(verifier: Arc<TokenVerifier>) -> Self {
        Self {
            verifier,
            trust_forwarded_subject: true,
        }
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthenticatedIdentity, AuthError> {
        if self.trust_forwarded_subject {
            if let Some(subject) = forwarded_subject(headers) {
                return Ok(AuthenticatedIdentity::from_trusted_subject(subject));
            }
        }

        let token = extract_credential(headers)?;
        Ok(self.verifier.verify(token).await?)
    }
}

/// Pull the bearer token out of the `Authorization` header.
///
/// # Errors
///
/// [`AuthError::Missing`] without a header, [`AuthError::Malformed`] for any
/// other scheme or an empty token.
pub fn extract_credential(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers.get(header::AUTHORIZATION).ok_or(AuthError::Missing)?;
    let value = value.to_str().map_err(|_| AuthError::Malformed)?;

    let (scheme, token) = value.trim().split_once(' ').ok_or(AuthError::Malformed)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::Malformed);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::Malformed);
    }
    Ok(token)
}

fn forwarded_subject(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Authentication middleware
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    match auth.authenticate(request.headers()).await {
        Ok(identity) => {
            debug!(subject = %identity.subject, path = %request.uri().path(), "Authenticated request");
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %request.uri().path(), error = %e, "Authentication failed");
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Extension, Router, middleware, routing::get};
    use tower::ServiceExt;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn test_extract_credential() {
        let h = headers(&[("authorization", "Bearer abc.def.ghi")]);
        assert_eq!(extract_credential(&h).unwrap(), "abc.def.ghi");

        let h = headers(&[("authorization", "bearer   tok ")]);
        assert_eq!(extract_credential(&h).unwrap(), "tok");
    }

    #[test]
    fn test_extract_credential_failures() {
        assert!(matches!(extract_credential(&HeaderMap::new()), Err(AuthError::Missing)));

        for bad in ["Basic dXNlcjpwYXNz", "Bearer", "Bearer    ", "tokenonly"] {
            let h = headers(&[("authorization", bad)]);
            assert!(
                matches!(extract_credential(&h), Err(AuthError::Malformed)),
                "{bad:?} should be malformed"
            );
        }
    }

    async fn whoami(Extension(identity): Extension<AuthenticatedIdentity>) -> String {
        identity.subject
    }

    fn app(state: AuthState) -> Router {
        Router::new()
            .route("/whoami", get(whoami))
            .layer(middleware::from_fn_with_state(state, auth_middleware))
    }

    async fn call(app: Router, pairs: &[(&'static str, &str)]) -> (StatusCode, HeaderMap, String) {
        let mut builder = Request::builder().uri("/whoami");
        for (name, value) in pairs {
            builder = builder.header(*name, *value);
        }
        let response = app.oneshot(builder.body(Body::empty()).unwrap()).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_identity_reaches_handler() {
        let state = AuthState::public(Arc::new(TokenVerifier::TrustAll));
        let (status, _, body) = call(app(state), &[("authorization", "Bearer alice")]).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "alice");
    }

    #[tokio::test]
    async fn test_missing_header_is_401_with_challenge() {
        let state = AuthState::public(Arc::new(TokenVerifier::TrustAll));
        let (status, headers, body) = call(app(state), &[]).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(headers[header::WWW_AUTHENTICATE], "Bearer");
        assert_eq!(body, r#"{"error":"missing bearer token"}"#);
    }

    #[tokio::test]
    async fn test_public_listener_ignores_forwarded_subject() {
        // GIVEN: the public edge
        let state = AuthState::public(Arc::new(TokenVerifier::TrustAll));

        // WHEN: a client sends only X-User-ID
        let (status, _, _) = call(app(state), &[("x-user-id", "victim")]).await;

        // THEN: still unauthenticated
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_internal_listener_accepts_forwarded_subject() {
        let state = AuthState::internal(Arc::new(TokenVerifier::TrustAll));
        let (status, _, body) = call(app(state), &[("x-user-id", "svc-user-7")]).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "svc-user-7");
    }

    #[tokio::test]
    async fn test_internal_listener_falls_back_to_bearer() {
        let state = AuthState::internal(Arc::new(TokenVerifier::TrustAll));
        let (status, _, body) =
            call(app(state), &[("x-user-id", " "), ("authorization", "Bearer bob")]).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "bob");
    }
}
