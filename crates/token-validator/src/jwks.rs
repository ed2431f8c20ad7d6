//! Per-issuer JWKS cache with single-flight refresh
//!
//! Each issuer owns a slot holding the last decoded key set and an async
//! refresh mutex. Lookups that hit a fresh entry never touch the mutex. A miss
//! (cold, expired or unknown `kid`) takes the mutex, and waiters that queued
//! behind an in-flight fetch reuse its outcome instead of fetching again.
//! An unknown `kid` against a set younger than `min_refresh_interval` is
//! answered from the cache, so random key ids cannot drive fetches.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk, JwkSet, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};

const DEFAULT_TTL_SECS: u64 = 300;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MIN_REFRESH_INTERVAL_SECS: u64 = 10;

/// Why a key set could not be fetched.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("no JWKS location configured for issuer {0}")]
    UnknownIssuer(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("JWKS endpoint returned {0}")]
    Status(u16),

    #[error("malformed key set: {0}")]
    Malformed(String),
}

/// Where key sets come from.
pub trait JwksSource: Send + Sync {
    fn fetch_key_set<'a>(
        &'a self,
        issuer: &'a str,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<JwkSet, SourceError>> + Send + 'a>>;
}

/// Fetches `jwks_uri` documents over HTTPS.
#[derive(Clone)]
pub struct HttpJwksSource {
    client: reqwest::Client,
    uris: HashMap<String, String>,
}

impl HttpJwksSource {
    /// `uris` maps issuer identifiers to their JWKS document URL.
    pub fn new(client: reqwest::Client, uris: HashMap<String, String>) -> Self {
        Self { client, uris }
    }

    async fn fetch(&self, issuer: &str) -> std::result::Result<JwkSet, SourceError> {
        let uri = self
            .uris
            .get(issuer)
            .ok_or_else(|| SourceError::UnknownIssuer(issuer.to_string()))?;

        let response = self
            .client
            .get(uri)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        serde_json::from_slice::<JwkSet>(&body).map_err(|e| SourceError::Malformed(e.to_string()))
    }
}

impl JwksSource for HttpJwksSource {
    fn fetch_key_set<'a>(
        &'a self,
        issuer: &'a str,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<JwkSet, SourceError>> + Send + 'a>> {
        Box::pin(self.fetch(issuer))
    }
}

/// Pinned in-memory key set, swappable at runtime. Counts fetches.
#[derive(Default)]
pub struct StaticJwksSource {
    sets: StdMutex<HashMap<String, JwkSet>>,
    fetches: AtomicUsize,
}

impl StaticJwksSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_set(issuer: &str, set: JwkSet) -> Self {
        let source = Self::new();
        source.set_key_set(issuer, set);
        source
    }

    /// Replace the set served for `issuer`.
    pub fn set_key_set(&self, issuer: &str, set: JwkSet) {
        if let Ok(mut sets) = self.sets.lock() {
            sets.insert(issuer.to_string(), set);
        }
    }

    pub fn remove_key_set(&self, issuer: &str) {
        if let Ok(mut sets) = self.sets.lock() {
            sets.remove(issuer);
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl JwksSource for StaticJwksSource {
    fn fetch_key_set<'a>(
        &'a self,
        issuer: &'a str,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<JwkSet, SourceError>> + Send + 'a>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let result = match self.sets.lock() {
            Ok(sets) => sets
                .get(issuer)
                .cloned()
                .ok_or_else(|| SourceError::UnknownIssuer(issuer.to_string())),
            Err(_) => Err(SourceError::Transport("key set store poisoned".into())),
        };
        Box::pin(async move { result })
    }
}

/// What to do when the cached set is past its TTL and refreshing fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
    #[default]
    FailClosed,
    ServeStale,
}

#[derive(Debug, Clone)]
pub struct JwksCacheConfig {
    pub ttl: Duration,
    pub fetch_timeout: Duration,
    pub stale_policy: StalePolicy,
    /// An unknown `kid` refetches only when the cached set is at least this old.
    pub min_refresh_interval: Duration,
}

impl Default for JwksCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            stale_policy: StalePolicy::default(),
            min_refresh_interval: Duration::from_secs(DEFAULT_MIN_REFRESH_INTERVAL_SECS),
        }
    }
}

/// Asymmetric key families a signature algorithm can be checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Rsa,
    EcP256,
    EcP384,
    Ed25519,
}

impl KeyFamily {
    pub fn supports(&self, alg: Algorithm) -> bool {
        use Algorithm::*;
        matches!(
            (self, alg),
            (KeyFamily::Rsa, RS256 | RS384 | RS512 | PS256 | PS384 | PS512)
                | (KeyFamily::EcP256, ES256)
                | (KeyFamily::EcP384, ES384)
                | (KeyFamily::Ed25519, EdDSA)
        )
    }
}

#[derive(Clone)]
struct CachedKey {
    kid: Option<String>,
    key: DecodingKey,
    family: KeyFamily,
    algorithm: Option<Algorithm>,
}

struct CacheEntry {
    keys: Vec<CachedKey>,
    fetched_at: Instant,
}

impl CacheEntry {
    fn from_set(issuer: &str, set: &JwkSet) -> Self {
        let keys = set
            .keys
            .iter()
            .filter_map(|jwk| decode_jwk(issuer, jwk))
            .collect();
        Self {
            keys,
            fetched_at: Instant::now(),
        }
    }

    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.fetched_at) < ttl
    }

    /// `kid`-less tokens resolve only against a single-key set.
    fn lookup(&self, kid: Option<&str>) -> Option<&CachedKey> {
        match kid {
            Some(kid) => self.keys.iter().find(|k| k.kid.as_deref() == Some(kid)),
            None if self.keys.len() == 1 => self.keys.first(),
            None => None,
        }
    }
}

fn decode_jwk(issuer: &str, jwk: &Jwk) -> Option<CachedKey> {
    let kid = jwk.common.key_id.clone();
    if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
        debug!(issuer, kid = ?kid, "skipping encryption key");
        return None;
    }

    let family = match &jwk.algorithm {
        AlgorithmParameters::RSA(_) => KeyFamily::Rsa,
        AlgorithmParameters::EllipticCurve(p) => match p.curve {
            EllipticCurve::P256 => KeyFamily::EcP256,
            EllipticCurve::P384 => KeyFamily::EcP384,
            _ => {
                debug!(issuer, kid = ?kid, "skipping unsupported curve");
                return None;
            }
        },
        AlgorithmParameters::OctetKeyPair(p) if p.curve == EllipticCurve::Ed25519 => {
            KeyFamily::Ed25519
        }
        AlgorithmParameters::OctetKeyPair(_) | AlgorithmParameters::OctetKey(_) => {
            debug!(issuer, kid = ?kid, "skipping symmetric or unsupported key");
            return None;
        }
    };

    // A JWK may pin its algorithm; encryption algorithms mean the key is not
    // for signatures at all.
    let algorithm = match &jwk.common.key_algorithm {
        Some(pinned) => match Algorithm::from_str(&format!("{pinned:?}")) {
            Ok(alg) => Some(alg),
            Err(_) => {
                debug!(issuer, kid = ?kid, alg = ?pinned, "skipping non-signing key");
                return None;
            }
        },
        None => None,
    };

    match DecodingKey::from_jwk(jwk) {
        Ok(key) => Some(CachedKey {
            kid,
            key,
            family,
            algorithm,
        }),
        Err(e) => {
            warn!(issuer, kid = ?kid, error = %e, "unusable key in key set");
            None
        }
    }
}

/// A key ready for signature verification.
#[derive(Clone)]
pub struct ResolvedKey {
    pub kid: Option<String>,
    pub key: DecodingKey,
    pub family: KeyFamily,
    /// Algorithm pinned by the JWK `alg` member, if any.
    pub algorithm: Option<Algorithm>,
    /// Served from an expired entry under `StalePolicy::ServeStale`.
    pub stale: bool,
}

impl std::fmt::Debug for ResolvedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedKey")
            .field("kid", &self.kid)
            .field("family", &self.family)
            .field("algorithm", &self.algorithm)
            .field("stale", &self.stale)
            .finish_non_exhaustive()
    }
}

impl From<(&CachedKey, bool)> for ResolvedKey {
    fn from((key, stale): (&CachedKey, bool)) -> Self {
        Self {
            kid: key.kid.clone(),
            key: key.key.clone(),
            family: key.family,
            algorithm: key.algorithm,
            stale,
        }
    }
}

#[derive(Default)]
struct IssuerSlot {
    entry: RwLock<Option<Arc<CacheEntry>>>,
    refresh: Mutex<()>,
    /// Bumped after every completed fetch attempt, success or not.
    attempts: AtomicU64,
    last_error: StdMutex<Option<Error>>,
}

/// Key cache shared by every validator in the process.
pub struct JwksCache {
    source: Arc<dyn JwksSource>,
    slots: DashMap<String, Arc<IssuerSlot>>,
    config: JwksCacheConfig,
}

impl JwksCache {
    pub fn new(source: Arc<dyn JwksSource>, config: JwksCacheConfig) -> Self {
        Self {
            source,
            slots: DashMap::new(),
            config,
        }
    }

    fn slot(&self, issuer: &str) -> Arc<IssuerSlot> {
        self.slots
            .entry(issuer.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Resolve the verification key for `kid` published by `issuer`.
    #[instrument(skip(self))]
    pub async fn get_key(&self, issuer: &str, kid: Option<&str>) -> Result<ResolvedKey> {
        let slot = self.slot(issuer);
        let seen_attempts = slot.attempts.load(Ordering::SeqCst);

        if let Some(entry) = slot.entry.read().await.clone() {
            let now = Instant::now();
            if entry.is_fresh(now, self.config.ttl) {
                if let Some(key) = entry.lookup(kid) {
                    debug!(kid = ?kid, "jwks cache hit");
                    return Ok((key, false).into());
                }
                if now.duration_since(entry.fetched_at) < self.config.min_refresh_interval {
                    debug!(kid = ?kid, "unknown kid, key set refreshed too recently");
                    metrics::counter!("jwks_refresh_throttled_total").increment(1);
                    return Err(key_not_found(issuer, kid));
                }
            }
        }

        let _refresh = slot.refresh.lock().await;

        // Someone else finished a fetch while we queued: reuse its outcome.
        if slot.attempts.load(Ordering::SeqCst) != seen_attempts {
            let entry = slot.entry.read().await.clone();
            if let Some(entry) = &entry
                && entry.is_fresh(Instant::now(), self.config.ttl)
            {
                return entry
                    .lookup(kid)
                    .map(|k| (k, false).into())
                    .ok_or_else(|| key_not_found(issuer, kid));
            }
            let failure = slot
                .last_error
                .lock()
                .ok()
                .and_then(|e| e.clone())
                .unwrap_or_else(|| key_not_found(issuer, kid));
            return self.fallback(issuer, kid, entry, failure);
        }

        let outcome = self.fetch(issuer).await;
        slot.attempts.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok(set) => {
                let entry = Arc::new(CacheEntry::from_set(issuer, &set));
                info!(keys = entry.keys.len(), "jwks refreshed");
                *slot.entry.write().await = Some(entry.clone());
                if let Ok(mut last) = slot.last_error.lock() {
                    *last = None;
                }
                entry
                    .lookup(kid)
                    .map(|k| (k, false).into())
                    .ok_or_else(|| key_not_found(issuer, kid))
            }
            Err(failure) => {
                if let Ok(mut last) = slot.last_error.lock() {
                    *last = Some(failure.clone());
                }
                let entry = slot.entry.read().await.clone();
                self.fallback(issuer, kid, entry, failure)
            }
        }
    }

    async fn fetch(&self, issuer: &str) -> Result<JwkSet> {
        let started = std::time::Instant::now();
        let outcome =
            tokio::time::timeout(self.config.fetch_timeout, self.source.fetch_key_set(issuer))
                .await;
        metrics::histogram!("jwks_fetch_duration_seconds").record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(Ok(set)) => {
                metrics::counter!("jwks_fetches_total", "outcome" => "ok").increment(1);
                Ok(set)
            }
            Ok(Err(e)) => {
                metrics::counter!("jwks_fetches_total", "outcome" => "error").increment(1);
                warn!(issuer, error = %e, "jwks fetch failed");
                Err(Error::KeySetUnavailable {
                    issuer: issuer.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                metrics::counter!("jwks_fetches_total", "outcome" => "timeout").increment(1);
                warn!(issuer, timeout = ?self.config.fetch_timeout, "jwks fetch timed out");
                Err(Error::Timeout(format!("jwks fetch for {issuer}")))
            }
        }
    }

    /// Refresh failed. A stale entry may still answer under `ServeStale`.
    fn fallback(
        &self,
        issuer: &str,
        kid: Option<&str>,
        entry: Option<Arc<CacheEntry>>,
        failure: Error,
    ) -> Result<ResolvedKey> {
        if self.config.stale_policy == StalePolicy::ServeStale
            && let Some(key) = entry.as_ref().and_then(|e| e.lookup(kid))
        {
            warn!(issuer, kid = ?kid, "serving key from stale key set");
            return Ok((key, true).into());
        }
        Err(failure)
    }

    /// Drop the cached set for `issuer`. The next lookup refetches.
    pub async fn invalidate(&self, issuer: &str) {
        if let Some(slot) = self.slots.get(issuer).map(|s| s.value().clone()) {
            *slot.entry.write().await = None;
            info!(issuer, "jwks entry invalidated");
        }
    }
}

fn key_not_found(issuer: &str, kid: Option<&str>) -> Error {
    Error::KeyNotFound {
        issuer: issuer.to_string(),
        kid: kid.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ISSUER, TestKey, key_set};
    use common::FailureKind;

    fn cache(source: Arc<dyn JwksSource>, config: JwksCacheConfig) -> JwksCache {
        JwksCache::new(source, config)
    }

    /// Source that sleeps before answering and counts calls.
    struct SlowSource {
        set: JwkSet,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl JwksSource for SlowSource {
        fn fetch_key_set<'a>(
            &'a self,
            _issuer: &'a str,
        ) -> Pin<Box<dyn Future<Output = std::result::Result<JwkSet, SourceError>> + Send + 'a>>
        {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                Ok(self.set.clone())
            })
        }
    }

    #[tokio::test]
    async fn cold_lookup_fetches_then_serves_from_cache() {
        let key = TestKey::generate("k1");
        let source = Arc::new(StaticJwksSource::with_key_set(ISSUER, key_set(&[&key])));
        let cache = cache(source.clone(), JwksCacheConfig::default());

        let resolved = cache.get_key(ISSUER, Some("k1")).await.unwrap();
        assert_eq!(resolved.kid.as_deref(), Some("k1"));
        assert_eq!(resolved.family, KeyFamily::Ed25519);
        assert_eq!(resolved.algorithm, Some(Algorithm::EdDSA));
        assert!(!resolved.stale);

        cache.get_key(ISSUER, Some("k1")).await.unwrap();
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_fetch() {
        let key = TestKey::generate("k1");
        let source = Arc::new(SlowSource {
            set: key_set(&[&key]),
            delay: Duration::from_millis(100),
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(cache(source.clone(), JwksCacheConfig::default()));

        let barrier = Arc::new(tokio::sync::Barrier::new(16));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                cache.get_key(ISSUER, Some("k1")).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_kid_refetches_once_then_key_not_found() {
        let key = TestKey::generate("k1");
        let source = Arc::new(StaticJwksSource::with_key_set(ISSUER, key_set(&[&key])));
        let cache = cache(source.clone(), JwksCacheConfig::default());
        cache.get_key(ISSUER, Some("k1")).await.unwrap();
        tokio::time::advance(Duration::from_secs(DEFAULT_MIN_REFRESH_INTERVAL_SECS)).await;

        let err = cache.get_key(ISSUER, Some("rotated")).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::KeyNotFound);
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rotated_key_is_picked_up_on_miss() {
        let old = TestKey::generate("old");
        let new = TestKey::generate("new");
        let source = Arc::new(StaticJwksSource::with_key_set(ISSUER, key_set(&[&old])));
        let cache = cache(source.clone(), JwksCacheConfig::default());
        cache.get_key(ISSUER, Some("old")).await.unwrap();

        source.set_key_set(ISSUER, key_set(&[&old, &new]));
        tokio::time::advance(Duration::from_secs(DEFAULT_MIN_REFRESH_INTERVAL_SECS)).await;
        let resolved = cache.get_key(ISSUER, Some("new")).await.unwrap();
        assert_eq!(resolved.kid.as_deref(), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn random_kids_do_not_refetch_within_min_interval() {
        let key = TestKey::generate("k1");
        let source = Arc::new(StaticJwksSource::with_key_set(ISSUER, key_set(&[&key])));
        let cache = cache(source.clone(), JwksCacheConfig::default());
        cache.get_key(ISSUER, Some("k1")).await.unwrap();

        for n in 0..50 {
            let err = cache.get_key(ISSUER, Some(&format!("random-{n}"))).await.unwrap_err();
            assert_eq!(err.kind(), FailureKind::KeyNotFound);
        }
        assert_eq!(source.fetch_count(), 1);
        assert!(cache.get_key(ISSUER, Some("k1")).await.is_ok());

        tokio::time::advance(Duration::from_secs(DEFAULT_MIN_REFRESH_INTERVAL_SECS)).await;
        cache.get_key(ISSUER, Some("random-x")).await.unwrap_err();
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn unreachable_source_is_key_set_unavailable() {
        let source = Arc::new(StaticJwksSource::new());
        let cache = cache(source, JwksCacheConfig::default());
        let err = cache.get_key(ISSUER, Some("k1")).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::KeySetUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_times_out() {
        let key = TestKey::generate("k1");
        let source = Arc::new(SlowSource {
            set: key_set(&[&key]),
            delay: Duration::from_secs(60),
            calls: AtomicUsize::new(0),
        });
        let cache = cache(
            source,
            JwksCacheConfig {
                fetch_timeout: Duration::from_secs(2),
                ..Default::default()
            },
        );
        let err = cache.get_key(ISSUER, Some("k1")).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_fails_closed_by_default() {
        let key = TestKey::generate("k1");
        let source = Arc::new(StaticJwksSource::with_key_set(ISSUER, key_set(&[&key])));
        let cache = cache(source.clone(), JwksCacheConfig::default());
        cache.get_key(ISSUER, Some("k1")).await.unwrap();

        source.remove_key_set(ISSUER);
        tokio::time::advance(Duration::from_secs(DEFAULT_TTL_SECS + 1)).await;
        let err = cache.get_key(ISSUER, Some("k1")).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::KeySetUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_served_when_configured() {
        let key = TestKey::generate("k1");
        let source = Arc::new(StaticJwksSource::with_key_set(ISSUER, key_set(&[&key])));
        let cache = cache(
            source.clone(),
            JwksCacheConfig {
                stale_policy: StalePolicy::ServeStale,
                ..Default::default()
            },
        );
        cache.get_key(ISSUER, Some("k1")).await.unwrap();

        source.remove_key_set(ISSUER);
        tokio::time::advance(Duration::from_secs(DEFAULT_TTL_SECS + 1)).await;
        let resolved = cache.get_key(ISSUER, Some("k1")).await.unwrap();
        assert!(resolved.stale);
    }

    #[tokio::test]
    async fn kidless_lookup_needs_single_key_set() {
        let a = TestKey::generate("a");
        let b = TestKey::generate("b");
        let source = Arc::new(StaticJwksSource::with_key_set(ISSUER, key_set(&[&a])));
        let cache = cache(source.clone(), JwksCacheConfig::default());
        assert!(cache.get_key(ISSUER, None).await.is_ok());

        source.set_key_set(ISSUER, key_set(&[&a, &b]));
        cache.invalidate(ISSUER).await;
        let err = cache.get_key(ISSUER, None).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::KeyNotFound);
    }

    #[tokio::test]
    async fn encryption_and_symmetric_keys_are_never_loaded() {
        let sig = TestKey::generate("sig");
        let mut enc = sig.jwk();
        enc["kid"] = "enc".into();
        enc["use"] = "enc".into();
        let set: JwkSet = serde_json::from_value(serde_json::json!({
            "keys": [
                sig.jwk(),
                enc,
                { "kty": "oct", "k": "c2VjcmV0", "kid": "hmac", "alg": "HS256" }
            ]
        }))
        .unwrap();
        let source = Arc::new(StaticJwksSource::with_key_set(ISSUER, set));
        let cache = cache(source, JwksCacheConfig::default());

        assert!(cache.get_key(ISSUER, Some("sig")).await.is_ok());
        for kid in ["enc", "hmac"] {
            let err = cache.get_key(ISSUER, Some(kid)).await.unwrap_err();
            assert_eq!(err.kind(), FailureKind::KeyNotFound, "{kid} must not load");
        }
    }

    #[tokio::test]
    async fn http_source_fetches_document() {
        let key = TestKey::generate("k1");
        let body = serde_json::to_value(key_set(&[&key])).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/certs",
                axum::routing::get(move || {
                    let body = body.clone();
                    async move { axum::Json(body) }
                }),
            );
            axum::serve(listener, app).await.unwrap();
        });

        let source = HttpJwksSource::new(
            reqwest::Client::new(),
            HashMap::from([(ISSUER.to_string(), format!("http://{addr}/certs"))]),
        );
        let set = source.fetch_key_set(ISSUER).await.unwrap();
        assert_eq!(set.keys.len(), 1);

        let err = source
            .fetch_key_set("https://other.example")
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::UnknownIssuer(_)));
    }

    #[test]
    fn key_families_gate_algorithms() {
        assert!(KeyFamily::Rsa.supports(Algorithm::PS256));
        assert!(KeyFamily::EcP256.supports(Algorithm::ES256));
        assert!(!KeyFamily::EcP256.supports(Algorithm::ES384));
        assert!(KeyFamily::Ed25519.supports(Algorithm::EdDSA));
        assert!(!KeyFamily::Ed25519.supports(Algorithm::RS256));
        assert!(!KeyFamily::Rsa.supports(Algorithm::HS256));
    }
}
