//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The client secret is loaded from OAUTH_CLIENT_SECRET or
//! client_secret_file, never stored in the TOML directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use flow::{ClientConfig, OrchestratorConfig, OverflowPolicy, ServerConfig};
use oauth_client::constants::{MAX_VERIFIER_LENGTH, MIN_VERIFIER_LENGTH};
use serde::Deserialize;
use token_validator::{JwksCacheConfig, ScopeMode, ScopePolicy, StalePolicy};

const DEFAULT_CONFIG_PATH: &str = "oauth-flow-server.toml";
const CLIENT_SECRET_ENV: &str = "OAUTH_CLIENT_SECRET";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerSection,
    pub client: ClientSection,
    pub authorization_server: AuthorizationServerSection,
    #[serde(default)]
    pub resource: ResourceSection,
    #[serde(default)]
    pub jwks: JwksSection,
    #[serde(default)]
    pub flows: FlowsSection,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// The OAuth client this server drives flows for
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Alternative to the OAUTH_CLIENT_SECRET env var
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct AuthorizationServerSection {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    /// Audience access tokens must carry.
    pub audience: String,
    #[serde(default = "default_token_timeout")]
    pub token_timeout_secs: u64,
}

/// The bearer-protected demo resource
#[derive(Debug, Deserialize)]
pub struct ResourceSection {
    #[serde(default = "default_realm")]
    pub realm: String,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    #[serde(default)]
    pub scope_mode: ScopeMode,
}

impl Default for ResourceSection {
    fn default() -> Self {
        Self {
            realm: default_realm(),
            required_scopes: Vec::new(),
            scope_mode: ScopeMode::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JwksSection {
    #[serde(default = "default_jwks_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_jwks_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default)]
    pub stale_policy: StalePolicy,
    /// Minimum age of the cached set before an unknown `kid` refetches.
    #[serde(default = "default_jwks_min_refresh_interval")]
    pub min_refresh_interval_secs: u64,
    /// Clock skew tolerated on exp/nbf.
    #[serde(default)]
    pub leeway_secs: u64,
}

impl Default for JwksSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_jwks_ttl(),
            fetch_timeout_secs: default_jwks_fetch_timeout(),
            stale_policy: StalePolicy::default(),
            min_refresh_interval_secs: default_jwks_min_refresh_interval(),
            leeway_secs: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FlowsSection {
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,
    #[serde(default = "default_max_flow_age")]
    pub max_flow_age_secs: u64,
    #[serde(default = "default_terminal_retention")]
    pub terminal_retention_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_state_ttl")]
    pub state_ttl_secs: u64,
    #[serde(default = "default_verifier_length")]
    pub verifier_length: usize,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
}

impl Default for FlowsSection {
    fn default() -> Self {
        Self {
            callback_timeout_secs: default_callback_timeout(),
            max_flow_age_secs: default_max_flow_age(),
            terminal_retention_secs: default_terminal_retention(),
            cleanup_interval_secs: default_cleanup_interval(),
            state_ttl_secs: default_state_ttl(),
            verifier_length: default_verifier_length(),
            event_buffer: default_event_buffer(),
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_scopes() -> Vec<String> {
    vec!["openid".into(), "profile".into()]
}

fn default_token_timeout() -> u64 {
    10
}

fn default_realm() -> String {
    "oauth-flow-server".into()
}

fn default_jwks_ttl() -> u64 {
    300
}

fn default_jwks_fetch_timeout() -> u64 {
    5
}

fn default_jwks_min_refresh_interval() -> u64 {
    10
}

fn default_callback_timeout() -> u64 {
    30
}

fn default_max_flow_age() -> u64 {
    24 * 60 * 60
}

fn default_terminal_retention() -> u64 {
    60 * 60
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_state_ttl() -> u64 {
    oauth_client::constants::DEFAULT_STATE_TTL_SECS
}

fn default_verifier_length() -> usize {
    oauth_client::constants::DEFAULT_VERIFIER_LENGTH
}

fn default_event_buffer() -> usize {
    64
}

impl Config {
    /// Parse and validate a TOML config file, then resolve the client secret.
    ///
    /// Client secret resolution order:
    /// 1. OAUTH_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(secret) = std::env::var(CLIENT_SECRET_ENV) {
            config.client.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.client.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                config.client.client_secret = Some(Secret::new(secret));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let urls = [
            ("client.redirect_uri", &self.client.redirect_uri),
            ("authorization_server.issuer", &self.authorization_server.issuer),
            (
                "authorization_server.authorization_endpoint",
                &self.authorization_server.authorization_endpoint,
            ),
            ("authorization_server.token_endpoint", &self.authorization_server.token_endpoint),
            ("authorization_server.jwks_uri", &self.authorization_server.jwks_uri),
        ];
        for (name, value) in urls {
            require_http_url(name, value)?;
        }

        if self.client.client_id.trim().is_empty() {
            return Err(common::Error::Config("client.client_id must not be empty".into()));
        }

        let durations = [
            ("authorization_server.token_timeout_secs", self.authorization_server.token_timeout_secs),
            ("jwks.ttl_secs", self.jwks.ttl_secs),
            ("jwks.fetch_timeout_secs", self.jwks.fetch_timeout_secs),
            ("flows.callback_timeout_secs", self.flows.callback_timeout_secs),
            ("flows.max_flow_age_secs", self.flows.max_flow_age_secs),
            ("flows.cleanup_interval_secs", self.flows.cleanup_interval_secs),
            ("flows.state_ttl_secs", self.flows.state_ttl_secs),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(common::Error::Config(format!("{name} must be greater than 0")));
            }
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "server.max_connections must be greater than 0".into(),
            ));
        }

        if !(MIN_VERIFIER_LENGTH..=MAX_VERIFIER_LENGTH).contains(&self.flows.verifier_length) {
            return Err(common::Error::Config(format!(
                "flows.verifier_length must be within {MIN_VERIFIER_LENGTH}..={MAX_VERIFIER_LENGTH}, got {}",
                self.flows.verifier_length
            )));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            client_id: self.client.client_id.clone(),
            redirect_uri: self.client.redirect_uri.clone(),
            scopes: self.client.scopes.clone(),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            issuer: self.authorization_server.issuer.clone(),
            authorization_endpoint: self.authorization_server.authorization_endpoint.clone(),
            token_endpoint: self.authorization_server.token_endpoint.clone(),
            audience: self.authorization_server.audience.clone(),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            callback_timeout: Duration::from_secs(self.flows.callback_timeout_secs),
            max_flow_age: Duration::from_secs(self.flows.max_flow_age_secs),
            terminal_retention: Duration::from_secs(self.flows.terminal_retention_secs),
            verifier_length: self.flows.verifier_length,
        }
    }

    pub fn jwks_cache_config(&self) -> JwksCacheConfig {
        JwksCacheConfig {
            ttl: Duration::from_secs(self.jwks.ttl_secs),
            fetch_timeout: Duration::from_secs(self.jwks.fetch_timeout_secs),
            stale_policy: self.jwks.stale_policy,
            min_refresh_interval: Duration::from_secs(self.jwks.min_refresh_interval_secs),
        }
    }

    /// Issuer -> JWKS URI map for `HttpJwksSource`.
    pub fn jwks_uris(&self) -> HashMap<String, String> {
        HashMap::from([(
            self.authorization_server.issuer.clone(),
            self.authorization_server.jwks_uri.clone(),
        )])
    }

    pub fn scope_policy(&self) -> ScopePolicy {
        ScopePolicy {
            required: self.resource.required_scopes.clone(),
            mode: self.resource.scope_mode,
        }
    }
}

fn require_http_url(name: &str, value: &str) -> common::Result<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| common::Error::Config(format!("{name} is not a valid URL ({e}): {value}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(common::Error::Config(format!(
            "{name} must start with http:// or https://, got: {value}"
        )));
    }
    Ok(())
}
