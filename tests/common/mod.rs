//! Shared helpers: RSA test keys, token signing, mock JWKS endpoints.

#![allow(dead_code)]

use std::time::Duration;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use focus_gateway::identity::{JwksVerifier, KeyStore};

pub const JWKS_PATH: &str = "/.well-known/jwks.json";

/// One of the checked-in RSA key pairs
#[derive(Debug, Clone, Copy)]
pub enum TestKey {
    Primary,
    Rotated,
}

impl TestKey {
    fn private_pem(self) -> &'static str {
        match self {
            Self::Primary => include_str!("../fixtures/primary.pem"),
            Self::Rotated => include_str!("../fixtures/rotated.pem"),
        }
    }

    fn public_jwk(self) -> &'static str {
        match self {
            Self::Primary => include_str!("../fixtures/primary.jwk.json"),
            Self::Rotated => include_str!("../fixtures/rotated.jwk.json"),
        }
    }

    /// Public JWK published under `kid`
    pub fn jwk(self, kid: &str) -> Value {
        let mut jwk: Value = serde_json::from_str(self.public_jwk()).unwrap();
        jwk["kid"] = json!(kid);
        jwk
    }

    /// Sign `claims` as RS256 with `kid` in the header
    pub fn sign(self, kid: Option<&str>, claims: &Value) -> String {
        self.sign_with(Algorithm::RS256, kid, claims)
    }

    pub fn sign_with(self, alg: Algorithm, kid: Option<&str>, claims: &Value) -> String {
        let mut header = Header::new(alg);
        header.kid = kid.map(String::from);
        let key = EncodingKey::from_rsa_pem(self.private_pem().as_bytes()).unwrap();
        jsonwebtoken::encode(&header, claims, &key).unwrap()
    }
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Claims for `sub`, valid for an hour
pub fn claims(sub: &str) -> Value {
    json!({ "sub": sub, "iat": now(), "exp": now() + 3600 })
}

pub fn jwks(keys: &[(TestKey, &str)]) -> Value {
    json!({ "keys": keys.iter().map(|(key, kid)| key.jwk(kid)).collect::<Vec<_>>() })
}

/// Start a server publishing `keys` at [`JWKS_PATH`]
pub async fn jwks_server(keys: &[(TestKey, &str)]) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(JWKS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks(keys)))
        .mount(&server)
        .await;
    server
}

pub fn jwks_url(server: &MockServer) -> String {
    format!("{}{JWKS_PATH}", server.uri())
}

/// Key store with a 10 minute TTL and the given unknown-kid interval
pub fn key_store(server: &MockServer, refresh_interval: Duration) -> KeyStore {
    KeyStore::new(
        jwks_url(server),
        Duration::from_secs(600),
        Duration::from_secs(2),
        refresh_interval,
    )
    .unwrap()
}

pub fn verifier(server: &MockServer) -> JwksVerifier {
    JwksVerifier::new(key_store(server, Duration::from_secs(60)))
}
