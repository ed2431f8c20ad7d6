//! Fakes shared by orchestrator and cleanup tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use oauth_client::{ExchangeRequest, TokenEndpoint, TokenSet};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde_json::{Value, json};
use token_validator::{JwksCache, JwksCacheConfig, StaticJwksSource, TokenValidator, ValidatorConfig};

use crate::model::{ClientConfig, ServerConfig};

pub const ISSUER: &str = "https://idp.example/realms/demo";
pub const AUDIENCE: &str = "resource-server";
pub const CLIENT_ID: &str = "demo-client";

pub struct SigningKey {
    kid: String,
    pkcs8: Vec<u8>,
    public: Vec<u8>,
}

impl SigningKey {
    pub fn generate(kid: &str) -> Self {
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        Self {
            kid: kid.to_string(),
            pkcs8: pkcs8.as_ref().to_vec(),
            public: pair.public_key().as_ref().to_vec(),
        }
    }

    pub fn key_set(&self) -> JwkSet {
        serde_json::from_value(json!({
            "keys": [{
                "kty": "OKP",
                "crv": "Ed25519",
                "x": URL_SAFE_NO_PAD.encode(&self.public),
                "kid": self.kid,
                "alg": "EdDSA",
                "use": "sig"
            }]
        }))
        .unwrap()
    }

    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &EncodingKey::from_ed_der(&self.pkcs8)).unwrap()
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// Token endpoint that mints tokens with `signer` and counts exchanges.
pub struct FakeTokenEndpoint {
    signer: SigningKey,
    delay: Duration,
    calls: AtomicUsize,
    /// `Some` makes the endpoint return an ID token carrying this nonce.
    pub id_token_nonce: Mutex<Option<String>>,
    /// Whether the last exchange carried a `code_verifier`.
    pub saw_verifier: Mutex<Option<bool>>,
}

impl FakeTokenEndpoint {
    pub fn new(signer: SigningKey) -> Self {
        Self::with_delay(signer, Duration::ZERO)
    }

    pub fn with_delay(signer: SigningKey, delay: Duration) -> Self {
        Self {
            signer,
            delay,
            calls: AtomicUsize::new(0),
            id_token_nonce: Mutex::new(None),
            saw_verifier: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TokenEndpoint for FakeTokenEndpoint {
    fn exchange<'a>(
        &'a self,
        request: &'a ExchangeRequest,
    ) -> Pin<Box<dyn Future<Output = oauth_client::Result<TokenSet>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.saw_verifier.lock().unwrap() = Some(request.code_verifier.is_some());
        let nonce = self.id_token_nonce.lock().unwrap().clone();

        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if request.code.expose() == "bad-code" {
                return Err(oauth_client::Error::TokenEndpoint {
                    status: 400,
                    error: "invalid_grant".into(),
                    description: None,
                });
            }
            let now = now_secs();
            let access = self.signer.sign(&json!({
                "iss": ISSUER,
                "aud": [AUDIENCE],
                "sub": "user-1",
                "scope": "openid profile email",
                "exp": now + 3600,
            }));
            let id_token = nonce.map(|nonce| {
                self.signer.sign(&json!({
                    "iss": ISSUER,
                    "aud": CLIENT_ID,
                    "sub": "user-1",
                    "exp": now + 3600,
                    "nonce": nonce,
                }))
            });
            Ok(TokenSet {
                access_token: Secret::new(access),
                token_type: "Bearer".into(),
                expires_in: Some(3600),
                refresh_token: None,
                id_token: id_token.map(Secret::new),
                scope: Some("openid profile email".into()),
            })
        })
    }
}

/// Validator trusting `keys` for `ISSUER`.
pub fn validator(keys: JwkSet) -> Arc<TokenValidator> {
    let source = Arc::new(StaticJwksSource::with_key_set(ISSUER, keys));
    Arc::new(TokenValidator::new(
        Arc::new(JwksCache::new(source, JwksCacheConfig::default())),
        ValidatorConfig::default(),
    ))
}

pub fn client(scopes: &[&str]) -> ClientConfig {
    ClientConfig {
        client_id: CLIENT_ID.into(),
        redirect_uri: "http://localhost:8080/callback".into(),
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn server() -> ServerConfig {
    ServerConfig {
        issuer: ISSUER.into(),
        authorization_endpoint: format!("{ISSUER}/protocol/openid-connect/auth"),
        token_endpoint: format!("{ISSUER}/protocol/openid-connect/token"),
        audience: AUDIENCE.into(),
    }
}

/// Query parameter `name` of `url`.
pub fn query_param(url: &str, name: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}
