//! Configuration management

use std::{collections::BTreeMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    pub env_files: Vec<String>,
    /// Deployment environment; gates development-only switches
    pub environment: Environment,
    /// Public listener
    pub server: ServerConfig,
    /// Trusted internal listener (service-to-service traffic)
    pub internal: InternalListenerConfig,
    /// Bearer token verification
    pub auth: AuthConfig,
    /// Upstream services by name
    pub upstreams: BTreeMap<String, UpstreamConfig>,
    /// Routing table, matched by longest path prefix
    pub routes: Vec<RouteConfig>,
    /// Service-to-service identity tokens
    pub service_identity: ServiceIdentityConfig,
    /// Subscription entitlement lookups
    pub entitlement: EntitlementConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            environment: Environment::default(),
            server: ServerConfig::default(),
            internal: InternalListenerConfig::default(),
            auth: AuthConfig::default(),
            upstreams: default_upstreams(),
            routes: default_routes(),
            service_identity: ServiceIdentityConfig::default(),
            entitlement: EntitlementConfig::default(),
        }
    }
}

/// Deployment environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Local development and tests
    Development,
    /// Anything reachable by real clients
    #[default]
    Production,
}

/// Public listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Overall per-request deadline, including the upstream round trip
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Internal listener configuration.
///
/// Requests arriving here may identify their subject with a bare `X-User-ID`
/// header instead of a bearer token. Bind it to a private interface only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalListenerConfig {
    /// Enable the internal listener
    pub enabled: bool,
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for InternalListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 8081,
        }
    }
}

/// Token verification strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Verify RS256/384/512 signatures against a published JWKS
    #[default]
    Jwks,
    /// Accept the raw bearer credential as the subject. Development only.
    TrustAll,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Verification strategy
    pub mode: AuthMode,
    /// JWKS document URL (required for `jwks` mode)
    pub jwks_url: String,
    /// Expected `iss` claim (exact match) when set
    pub issuer: Option<String>,
    /// Expected member of the `aud` claim when set
    pub audience: Option<String>,
    /// How long a fetched key set is considered fresh
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Timeout for a single JWKS fetch
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Clock skew tolerated on `exp`/`nbf`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
    /// Minimum spacing between out-of-band refreshes (unknown `kid`, failed fetch)
    #[serde(with = "humantime_serde")]
    pub unknown_kid_refresh_interval: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Jwks,
            jwks_url: String::new(),
            issuer: None,
            audience: None,
            cache_ttl: Duration::from_secs(600),
            fetch_timeout: Duration::from_secs(5),
            leeway: Duration::from_secs(5),
            unknown_kid_refresh_interval: Duration::from_secs(60),
        }
    }
}

/// A proxied backend service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL (scheme + host [+ port]); empty or absent = not configured
    pub url: Option<String>,
    /// Attach a service identity token scoped to this upstream
    pub service_auth: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            service_auth: true,
        }
    }
}

impl UpstreamConfig {
    fn with_url(url: &str) -> Self {
        Self {
            url: Some(url.to_string()),
            ..Self::default()
        }
    }

    /// The configured URL, if any
    #[must_use]
    pub fn configured_url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }
}

/// One entry of the routing table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Public path prefix (segment-aligned match)
    pub prefix: String,
    /// Name of the upstream in [`Config::upstreams`]
    pub upstream: String,
    /// Requests on this route that get an entitlement lookup
    #[serde(default)]
    pub premium: Vec<PremiumRuleConfig>,
}

impl RouteConfig {
    fn new(prefix: &str, upstream: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            upstream: upstream.to_string(),
            premium: Vec::new(),
        }
    }
}

/// Method + path fragment that marks a premium-gated request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PremiumRuleConfig {
    /// HTTP method, case-insensitive
    pub method: String,
    /// Substring the request path must contain
    pub path_contains: String,
}

/// Which identity token provider to use for upstream calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceIdentityProvider {
    /// Forward without a service credential
    #[default]
    None,
    /// Mint tokens from the compute metadata server
    Metadata,
}

/// Service-to-service identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceIdentityConfig {
    /// Token provider
    pub provider: ServiceIdentityProvider,
    /// Metadata server identity endpoint
    pub metadata_url: String,
    /// Refresh a cached token this long before it expires
    #[serde(with = "humantime_serde")]
    pub refresh_skew: Duration,
    /// Timeout for a single metadata request
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ServiceIdentityConfig {
    fn default() -> Self {
        Self {
            provider: ServiceIdentityProvider::None,
            metadata_url:
                "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/identity"
                    .to_string(),
            refresh_skew: Duration::from_secs(300),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Subscription provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitlementConfig {
    /// Provider API root; subscribers live at `{base_url}/subscribers/{subject}`
    pub base_url: String,
    /// Secret API key (supports `${VAR}`)
    pub secret_key: String,
    /// Entitlement identifier that grants premium access
    pub entitlement_id: String,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.revenuecat.com/v1".to_string(),
            secret_key: String::new(),
            entitlement_id: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl EntitlementConfig {
    /// Lookups only happen with both a secret key and an entitlement id
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.secret_key.trim().is_empty() && !self.entitlement_id.trim().is_empty()
    }
}

fn default_upstreams() -> BTreeMap<String, UpstreamConfig> {
    [
        ("activity", "http://focus-service:8080"),
        ("analytics", "http://progress-service:8080"),
        ("chatbot", "http://chatbot-service:8080"),
        ("user", "http://user-service:8080"),
    ]
    .into_iter()
    .map(|(name, url)| (name.to_string(), UpstreamConfig::with_url(url)))
    .collect()
}

fn default_routes() -> Vec<RouteConfig> {
    let mut progress = RouteConfig::new("/v1/progress", "analytics");
    progress.premium.push(PremiumRuleConfig {
        method: "POST".to_string(),
        path_contains: "/streak/recover".to_string(),
    });

    vec![
        RouteConfig::new("/v1/productivities", "activity"),
        progress,
        RouteConfig::new("/v1/chatbot", "chatbot"),
        RouteConfig::new("/v1/users", "user"),
        RouteConfig::new("/v1/challenges", "user"),
        RouteConfig::new("/v1/shares", "user"),
        RouteConfig::new("/v1/mindfulness", "user"),
    ]
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // Defaults first, so a partial override (one upstream URL) keeps the rest
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (FOCUS_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("FOCUS_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in endpoint and secret values
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        self.auth.jwks_url = Self::expand_string(&re, &self.auth.jwks_url);
        self.auth.issuer = expand_optional(&re, self.auth.issuer.as_deref());
        self.auth.audience = expand_optional(&re, self.auth.audience.as_deref());

        for upstream in self.upstreams.values_mut() {
            upstream.url = expand_optional(&re, upstream.url.as_deref());
        }

        self.service_identity.metadata_url =
            Self::expand_string(&re, &self.service_identity.metadata_url);

        self.entitlement.base_url = Self::expand_string(&re, &self.entitlement.base_url);
        self.entitlement.secret_key = Self::expand_string(&re, &self.entitlement.secret_key);
        self.entitlement.entitlement_id =
            Self::expand_string(&re, &self.entitlement.entitlement_id);

        Ok(())
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Check cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        match self.auth.mode {
            AuthMode::TrustAll if self.environment == Environment::Production => {
                return Err(Error::Config(
                    "auth.mode 'trust_all' is not allowed when environment is 'production'"
                        .to_string(),
                ));
            }
            AuthMode::Jwks if self.auth.jwks_url.trim().is_empty() => {
                return Err(Error::Config(
                    "auth.jwks_url is required when auth.mode is 'jwks'".to_string(),
                ));
            }
            AuthMode::Jwks => {
                parse_absolute_url(&self.auth.jwks_url)?;
            }
            AuthMode::TrustAll => {}
        }

        for (name, upstream) in &self.upstreams {
            if let Some(raw) = upstream.configured_url() {
                parse_absolute_url(raw)
                    .map_err(|e| Error::Config(format!("upstream '{name}': {e}")))?;
            }
        }

        for route in &self.routes {
            if !route.prefix.starts_with('/') {
                return Err(Error::Config(format!(
                    "route prefix '{}' must start with '/'",
                    route.prefix
                )));
            }
            if !self.upstreams.contains_key(&route.upstream) {
                return Err(Error::Config(format!(
                    "route '{}' references unknown upstream '{}'",
                    route.prefix, route.upstream
                )));
            }
        }

        if self.internal.enabled
            && self.internal.host == self.server.host
            && self.internal.port == self.server.port
        {
            return Err(Error::Config(
                "internal listener must not share the public listener address".to_string(),
            ));
        }

        Ok(())
    }

    /// Copy of this config with secrets masked, for printing
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.entitlement.secret_key.is_empty() {
            copy.entitlement.secret_key = "***".to_string();
        }
        copy
    }
}

fn expand_optional(re: &Regex, value: Option<&str>) -> Option<String> {
    value
        .map(|v| Config::expand_string(re, v))
        .filter(|v| !v.trim().is_empty())
}

/// Parse a required absolute URL (scheme and host both present).
///
/// # Errors
///
/// Returns [`Error::Config`] for empty, unparsable or relative input.
pub fn parse_absolute_url(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::Config("missing url".to_string()));
    }
    let url = Url::parse(raw).map_err(|e| Error::Config(format!("invalid url '{raw}': {e}")))?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::Config(format!("invalid url '{raw}': no host")));
    }
    Ok(url)
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "1h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "100ms", "30s", "5m", "1h" or a bare number of seconds
    pub(crate) fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" must be checked before the bare "s"/"m" suffixes
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim().parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.trim().parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn dev_config() -> Config {
        Config {
            environment: Environment::Development,
            auth: AuthConfig {
                jwks_url: "https://issuer.example.com/.well-known/jwks.json".to_string(),
                ..AuthConfig::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_default_routing_table() {
        let config = Config::default();

        let prefixes: Vec<&str> = config.routes.iter().map(|r| r.prefix.as_str()).collect();
        assert_eq!(
            prefixes,
            vec![
                "/v1/productivities",
                "/v1/progress",
                "/v1/chatbot",
                "/v1/users",
                "/v1/challenges",
                "/v1/shares",
                "/v1/mindfulness",
            ]
        );

        let progress = &config.routes[1];
        assert_eq!(progress.upstream, "analytics");
        assert_eq!(progress.premium.len(), 1);
        assert_eq!(progress.premium[0].path_contains, "/streak/recover");

        // Every default route points at a declared upstream
        for route in &config.routes {
            assert!(config.upstreams.contains_key(&route.upstream));
        }
    }

    #[test]
    fn test_default_timeouts() {
        let config = Config::default();
        assert_eq!(config.server.request_timeout, Duration::from_secs(15));
        assert_eq!(config.auth.cache_ttl, Duration::from_secs(600));
        assert_eq!(config.auth.fetch_timeout, Duration::from_secs(5));
        assert_eq!(config.auth.leeway, Duration::from_secs(5));
        assert_eq!(config.environment, Environment::Production);
        assert!(!config.internal.enabled);
    }

    #[test]
    fn test_trust_all_rejected_in_production() {
        let config = Config {
            auth: AuthConfig {
                mode: AuthMode::TrustAll,
                ..AuthConfig::default()
            },
            ..Config::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("trust_all"));
    }

    #[test]
    fn test_trust_all_allowed_in_development() {
        let config = Config {
            environment: Environment::Development,
            auth: AuthConfig {
                mode: AuthMode::TrustAll,
                ..AuthConfig::default()
            },
            ..Config::default()
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_jwks_mode_requires_url() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("jwks_url"));
    }

    #[test]
    fn test_route_to_unknown_upstream_rejected() {
        let mut config = dev_config();
        config.routes.push(RouteConfig::new("/v1/media", "media"));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown upstream 'media'"));
    }

    #[test]
    fn test_relative_upstream_url_rejected() {
        let mut config = dev_config();
        config
            .upstreams
            .insert("user".to_string(), UpstreamConfig::with_url("user-service:8080/api"));

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_upstream_without_url_is_valid_but_unconfigured() {
        let mut config = dev_config();
        config
            .upstreams
            .insert("chatbot".to_string(), UpstreamConfig::default());

        assert!(config.validate().is_ok());
        assert!(config.upstreams["chatbot"].configured_url().is_none());
    }

    #[test]
    fn test_internal_listener_cannot_share_public_address() {
        let mut config = dev_config();
        config.internal = InternalListenerConfig {
            enabled: true,
            host: config.server.host.clone(),
            port: config.server.port,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_absolute_url() {
        assert!(parse_absolute_url("http://user-service:8080").is_ok());
        assert!(parse_absolute_url("  https://api.example.com/v1 ").is_ok());
        assert!(parse_absolute_url("").is_err());
        assert!(parse_absolute_url("not a url").is_err());
        assert!(parse_absolute_url("mailto:someone@example.com").is_err());
    }

    #[test]
    fn test_humantime_parse() {
        assert_eq!(humantime_serde::parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(humantime_serde::parse("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(humantime_serde::parse("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(humantime_serde::parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(humantime_serde::parse("42").unwrap(), Duration::from_secs(42));
        assert!(humantime_serde::parse("soon").is_err());
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        let mut config = dev_config();
        config.entitlement.secret_key = "${FOCUS_GW_TEST_UNSET_SECRET:-fallback}".to_string();
        config.auth.issuer = Some("${FOCUS_GW_TEST_UNSET_ISSUER:-}".to_string());

        config.expand_env_vars().unwrap();

        assert_eq!(config.entitlement.secret_key, "fallback");
        // Expands to empty, which means "not configured"
        assert!(config.auth.issuer.is_none());
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
environment: development
server:
  port: 9090
  request_timeout: 20s
auth:
  jwks_url: https://clerk.example.com/.well-known/jwks.json
  issuer: https://clerk.example.com
  cache_ttl: 5m
upstreams:
  analytics:
    url: http://127.0.0.1:7001
    service_auth: false
routes:
  - prefix: /v1/progress
    upstream: analytics
    premium:
      - method: POST
        path_contains: /streak/recover
"#
        )
        .unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.request_timeout, Duration::from_secs(20));
        assert_eq!(config.auth.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.auth.issuer.as_deref(), Some("https://clerk.example.com"));
        // Maps merge over the defaults, lists replace them
        assert_eq!(config.upstreams.len(), 4);
        assert_eq!(
            config.upstreams["analytics"].configured_url(),
            Some("http://127.0.0.1:7001")
        );
        assert!(!config.upstreams["analytics"].service_auth);
        assert_eq!(
            config.upstreams["user"].configured_url(),
            Some("http://user-service:8080")
        );
        assert_eq!(config.routes.len(), 1);
    }

    #[test]
    fn test_env_overrides_single_upstream() {
        figment::Jail::expect_with(|jail| {
            // GIVEN: only one upstream URL and the JWKS URL in the environment
            jail.set_env("FOCUS_GATEWAY_UPSTREAMS__CHATBOT__URL", "http://10.1.2.3:8080");
            jail.set_env(
                "FOCUS_GATEWAY_AUTH__JWKS_URL",
                "https://issuer.example.com/.well-known/jwks.json",
            );

            // WHEN: loading without a file
            let config = Config::load(None).map_err(|e| e.to_string())?;

            // THEN: the other default upstreams and routes are still there
            assert_eq!(
                config.upstreams["chatbot"].configured_url(),
                Some("http://10.1.2.3:8080")
            );
            assert_eq!(
                config.upstreams["activity"].configured_url(),
                Some("http://focus-service:8080")
            );
            assert_eq!(config.upstreams.len(), 4);
            assert_eq!(config.routes.len(), Config::default().routes.len());
            assert_eq!(config.server.request_timeout, Duration::from_secs(15));
            Ok(())
        });
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let err = Config::load(Some(Path::new("/nonexistent/gateway.yaml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "FOCUS_GW_TEST_ENTITLEMENT_KEY=sk_from_env_file").unwrap();
        drop(f);

        let mut config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..dev_config()
        };
        config.entitlement.secret_key = "${FOCUS_GW_TEST_ENTITLEMENT_KEY}".to_string();
        config.load_env_files();
        config.expand_env_vars().unwrap();

        assert_eq!(config.entitlement.secret_key, "sk_from_env_file");
        // Note: env::remove_var is unsafe in edition 2024 and the crate denies unsafe.
        // Test keys use a unique FOCUS_GW_TEST_ prefix so they won't conflict.
    }

    #[test]
    fn test_load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Config::default()
        };
        config.load_env_files();
    }

    #[test]
    fn test_entitlement_enabled_requires_key_and_id() {
        let mut cfg = EntitlementConfig::default();
        assert!(!cfg.is_enabled());
        cfg.secret_key = "sk_live".to_string();
        assert!(!cfg.is_enabled());
        cfg.entitlement_id = "premium".to_string();
        assert!(cfg.is_enabled());
    }

    #[test]
    fn test_redacted_masks_secret() {
        let mut config = dev_config();
        config.entitlement.secret_key = "sk_live_123".to_string();

        let yaml = serde_yaml::to_string(&config.redacted()).unwrap();
        assert!(!yaml.contains("sk_live_123"));
        assert!(yaml.contains("***"));
    }
}
