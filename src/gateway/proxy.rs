//! Identity-propagating reverse proxy.
//!
//! For each authenticated request the proxy:
//!
//! 1. resolves the route by longest segment-aligned path prefix,
//! 2. rewrites the trust headers (`X-User-ID`, `X-User-Session-ID`, `X-Premium`,
//!    `Authorization`) so nothing the client sent for them survives,
//! 3. forwards method, path, query and body to the upstream and streams the
//!    response back.
//!
//! Service identity tokens fail open (the request goes out without one). The
//! premium flag fails closed (no answer means no flag).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    body::{Body, HttpBody},
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use super::auth::{AuthError, USER_ID_HEADER};
use crate::config::{Config, parse_absolute_url};
use crate::entitlement::EntitlementClient;
use crate::identity::AuthenticatedIdentity;
use crate::service_token::{IdentityTokenSource, build_token_source};
use crate::{Error, Result};

/// Verified session id, set alongside `X-User-ID`
pub const SESSION_ID_HEADER: &str = "x-user-session-id";
/// Entitlement flag; only the gateway may set it
pub const PREMIUM_HEADER: &str = "x-premium";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Headers that describe one connection and never cross the proxy
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Per-request proxy failure
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No route prefix matches the path
    #[error("no route for path")]
    NoRoute,

    /// The path contains `.` or `..` segments (plain or percent-encoded)
    #[error("path contains dot segments")]
    DotSegments,

    /// The verified subject cannot be written to `X-User-ID`
    #[error("subject is not a valid header value")]
    UnrepresentableSubject,

    /// The route exists but its upstream has no URL
    #[error("upstream '{0}' not configured")]
    UpstreamNotConfigured(String),

    /// The upstream did not answer within the request deadline
    #[error("upstream timed out: {0}")]
    Timeout(reqwest::Error),

    /// Connecting to or reading from the upstream failed
    #[error("upstream transport error: {0}")]
    Transport(reqwest::Error),
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e)
        } else {
            Self::Transport(e)
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NoRoute => (StatusCode::NOT_FOUND, "not found"),
            Self::DotSegments => (StatusCode::BAD_REQUEST, "invalid path"),
            Self::UnrepresentableSubject => (StatusCode::BAD_GATEWAY, "bad gateway"),
            Self::UpstreamNotConfigured(_) => (StatusCode::BAD_GATEWAY, "upstream not configured"),
            Self::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "request timed out"),
            Self::Transport(_) => (StatusCode::BAD_GATEWAY, "bad gateway"),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// A backend service requests are forwarded to.
pub struct Upstream {
    name: String,
    base_url: Url,
    token_source: Option<Arc<dyn IdentityTokenSource>>,
}

impl Upstream {
    /// Create an upstream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `base_url` is not absolute.
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        token_source: Option<Arc<dyn IdentityTokenSource>>,
    ) -> Result<Self> {
        let name = name.into();
        let base_url = parse_absolute_url(base_url)
            .map_err(|e| Error::Config(format!("upstream '{name}': {e}")))?;
        Ok(Self {
            name,
            base_url,
            token_source,
        })
    }

    /// Upstream name from config
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base URL requests are rewritten onto
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Origin (`scheme://host[:port]`) used as identity token audience
    #[must_use]
    pub fn audience(&self) -> String {
        audience_for(&self.base_url)
    }

    fn target_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        let joined = format!("{}{}", self.base_url.path().trim_end_matches('/'), path);
        url.set_path(&joined);
        url.set_query(query);
        url
    }
}

/// Method + path fragment that triggers an entitlement lookup
#[derive(Debug, Clone)]
pub struct PremiumRule {
    method: Method,
    path_contains: String,
}

impl PremiumRule {
    /// Create a rule
    #[must_use]
    pub fn new(method: Method, path_contains: impl Into<String>) -> Self {
        Self {
            method,
            path_contains: path_contains.into(),
        }
    }

    fn matches(&self, method: &Method, path: &str) -> bool {
        self.method == method && path.contains(&self.path_contains)
    }
}

/// One routing table entry.
pub struct RouteTarget {
    path_prefix: String,
    upstream_name: String,
    upstream: Option<Arc<Upstream>>,
    premium: Vec<PremiumRule>,
}

impl RouteTarget {
    /// Route `path_prefix` to an upstream; `None` means not configured.
    #[must_use]
    pub fn new(
        path_prefix: impl Into<String>,
        upstream_name: impl Into<String>,
        upstream: Option<Arc<Upstream>>,
    ) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            upstream_name: upstream_name.into(),
            upstream,
            premium: Vec::new(),
        }
    }

    /// Add a premium-gated method/path combination
    #[must_use]
    pub fn with_premium_rule(mut self, rule: PremiumRule) -> Self {
        self.premium.push(rule);
        self
    }

    /// Public path prefix
    #[must_use]
    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    /// Name of the upstream this route points at
    #[must_use]
    pub fn upstream_name(&self) -> &str {
        &self.upstream_name
    }

    /// The upstream, if it has a URL
    #[must_use]
    pub fn upstream(&self) -> Option<&Arc<Upstream>> {
        self.upstream.as_ref()
    }

    fn matches_path(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix(&self.path_prefix) else {
            return false;
        };
        rest.is_empty() || rest.starts_with('/') || self.path_prefix.ends_with('/')
    }

    fn is_premium(&self, method: &Method, path: &str) -> bool {
        self.premium.iter().any(|rule| rule.matches(method, path))
    }
}

/// Static routing table, longest prefix first.
pub struct RouteTable {
    routes: Vec<RouteTarget>,
}

impl RouteTable {
    /// Build a table; order of `routes` does not matter.
    #[must_use]
    pub fn new(mut routes: Vec<RouteTarget>) -> Self {
        routes.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        Self { routes }
    }

    /// Longest segment-aligned prefix match
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<&RouteTarget> {
        self.routes.iter().find(|route| route.matches_path(path))
    }

    /// All routes, longest prefix first
    pub fn iter(&self) -> impl Iterator<Item = &RouteTarget> {
        self.routes.iter()
    }
}

/// The forwarding half of the gateway.
pub struct ReverseProxy {
    routes: RouteTable,
    client: reqwest::Client,
    entitlement: Option<EntitlementClient>,
}

impl ReverseProxy {
    /// Create a proxy over an explicit routing table.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        routes: RouteTable,
        entitlement: Option<EntitlementClient>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            routes,
            client,
            entitlement,
        })
    }

    /// Build upstreams, token sources, routes and the entitlement client.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid upstream URLs or if an HTTP client cannot
    /// be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut upstreams = std::collections::BTreeMap::new();
        for (name, upstream_config) in &config.upstreams {
            let Some(raw_url) = upstream_config.configured_url() else {
                warn!(upstream = %name, "Upstream has no URL; its routes will answer 502");
                continue;
            };

            let base_url = parse_absolute_url(raw_url)
                .map_err(|e| Error::Config(format!("upstream '{name}': {e}")))?;
            let token_source = if upstream_config.service_auth {
                build_token_source(&config.service_identity, &audience_for(&base_url))?
            } else {
                None
            };

            upstreams.insert(
                name.clone(),
                Arc::new(Upstream::new(name.clone(), raw_url, token_source)?),
            );
        }

        let routes = config
            .routes
            .iter()
            .map(|route| {
                route.premium.iter().try_fold(
                    RouteTarget::new(
                        route.prefix.clone(),
                        route.upstream.clone(),
                        upstreams.get(&route.upstream).cloned(),
                    ),
                    |target, rule| {
                        let method = Method::from_bytes(rule.method.trim().to_ascii_uppercase().as_bytes())
                            .map_err(|e| Error::Config(format!("premium rule method '{}': {e}", rule.method)))?;
                        Ok::<_, Error>(target.with_premium_rule(PremiumRule::new(method, rule.path_contains.clone())))
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let entitlement = EntitlementClient::from_config(&config.entitlement)?;
        if entitlement.is_none() {
            debug!("Entitlement lookups disabled");
        }

        Self::new(RouteTable::new(routes), entitlement, config.server.request_timeout)
    }

    /// The routing table
    #[must_use]
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Forward one authenticated request.
    ///
    /// # Errors
    ///
    /// [`ProxyError::NoRoute`] when nothing matches,
    /// [`ProxyError::UpstreamNotConfigured`] when the route has no URL,
    /// [`ProxyError::Timeout`] or [`ProxyError::Transport`] when the upstream
    /// cannot be reached in time.
    pub async fn forward(
        &self,
        request: Request,
        identity: &AuthenticatedIdentity,
        peer: Option<SocketAddr>,
    ) -> std::result::Result<Response, ProxyError> {
        let (parts, body) = request.into_parts();
        let path = parts.uri.path();

        // The outbound URL is normalized, so the routed path must already be
        if has_dot_segments(path) {
            return Err(ProxyError::DotSegments);
        }
        let route = self.routes.resolve(path).ok_or(ProxyError::NoRoute)?;
        let upstream = route
            .upstream()
            .ok_or_else(|| ProxyError::UpstreamNotConfigured(route.upstream_name.clone()))?;

        let mut headers = forwardable_headers(&parts.headers);
        set_forwarded_headers(&mut headers, &parts.headers, peer);
        set_identity_headers(&mut headers, identity)?;

        if let Some(source) = &upstream.token_source {
            match source.token().await {
                Ok(token) => match HeaderValue::from_str(&format!("Bearer {token}")) {
                    Ok(value) => {
                        headers.insert(header::AUTHORIZATION, value);
                    }
                    Err(e) => {
                        error!(upstream = %upstream.name, error = %e, "Identity token is not a valid header value");
                    }
                },
                Err(e) => {
                    error!(upstream = %upstream.name, error = %e, "Failed to get identity token, forwarding without one");
                }
            }
        }

        if route.is_premium(&parts.method, path) && self.is_entitled(&identity.subject).await {
            headers.insert(PREMIUM_HEADER, HeaderValue::from_static("true"));
        }

        let url = upstream.target_url(path, parts.uri.query());
        debug!(upstream = %upstream.name, method = %parts.method, path = %path, "Forwarding request");

        let mut outbound = self
            .client
            .request(parts.method.clone(), url)
            .headers(headers);
        if body.size_hint().exact() != Some(0) {
            outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream_response = outbound.send().await?;
        Ok(into_streamed_response(upstream_response))
    }

    async fn is_entitled(&self, subject: &str) -> bool {
        let Some(client) = &self.entitlement else {
            return false;
        };
        match client.has_active_entitlement(subject).await {
            Ok(entitled) => entitled,
            Err(e) => {
                warn!(subject = %subject, error = %e, "Entitlement check failed, treating as not entitled");
                false
            }
        }
    }
}

/// Catch-all handler behind the auth middleware
pub async fn proxy_handler(State(proxy): State<Arc<ReverseProxy>>, request: Request) -> Response {
    let Some(identity) = request.extensions().get::<AuthenticatedIdentity>().cloned() else {
        return AuthError::Missing.into_response();
    };
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let path = request.uri().path().to_string();

    match proxy.forward(request, &identity, peer).await {
        Ok(response) => response,
        Err(e) => {
            match &e {
                ProxyError::NoRoute => debug!(path = %path, "No route"),
                ProxyError::DotSegments => warn!(path = %path, "Rejected path with dot segments"),
                ProxyError::UnrepresentableSubject => {
                    error!(path = %path, "Verified subject is not a valid header value");
                }
                ProxyError::UpstreamNotConfigured(upstream) => {
                    error!(path = %path, upstream = %upstream, "Upstream not configured");
                }
                ProxyError::Timeout(err) | ProxyError::Transport(err) => {
                    error!(path = %path, error = %err, "Proxy error");
                }
            }
            e.into_response()
        }
    }
}

fn audience_for(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Drop hop-by-hop headers, headers named in `Connection`, and every header
/// the gateway owns.
fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let connection_listed = connection_tokens(inbound);
    let mut headers = HeaderMap::with_capacity(inbound.len());

    for (name, value) in inbound {
        let owned_by_gateway = name == header::HOST
            || name == header::AUTHORIZATION
            || name == USER_ID_HEADER
            || name == SESSION_ID_HEADER
            || name == PREMIUM_HEADER
            || name == X_FORWARDED_FOR
            || name == X_FORWARDED_HOST;
        if owned_by_gateway
            || HOP_BY_HOP.contains(name)
            || connection_listed.iter().any(|listed| listed == name)
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn connection_tokens(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect()
}

fn set_forwarded_headers(headers: &mut HeaderMap, inbound: &HeaderMap, peer: Option<SocketAddr>) {
    let prior = inbound
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ");
    let chain = match (prior.is_empty(), peer) {
        (_, None) => prior,
        (true, Some(addr)) => addr.ip().to_string(),
        (false, Some(addr)) => format!("{prior}, {}", addr.ip()),
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        if !chain.is_empty() {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if let Some(host) = inbound.get(header::HOST) {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }
}

/// Overwrite (never merge) the identity headers with verified values.
///
/// An upstream never sees an authenticated request without `X-User-ID`.
fn set_identity_headers(
    headers: &mut HeaderMap,
    identity: &AuthenticatedIdentity,
) -> std::result::Result<(), ProxyError> {
    let value = HeaderValue::from_str(&identity.subject)
        .map_err(|_| ProxyError::UnrepresentableSubject)?;
    headers.insert(USER_ID_HEADER, value);

    if let Some(value) = identity
        .session_id
        .as_deref()
        .and_then(|sid| HeaderValue::from_str(sid).ok())
    {
        headers.insert(SESSION_ID_HEADER, value);
    }
    Ok(())
}

/// Whether any segment is `.` or `..`, including `%2e` spellings.
fn has_dot_segments(path: &str) -> bool {
    path.split('/').any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

fn into_streamed_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let connection_listed = connection_tokens(upstream.headers());

    let mut response_headers = HeaderMap::with_capacity(upstream.headers().len());
    for (name, value) in upstream.headers() {
        if HOP_BY_HOP.contains(name) || connection_listed.iter().any(|listed| listed == name) {
            continue;
        }
        response_headers.append(name.clone(), value.clone());
    }

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}
