//! Configuration for the token service.
//!
//! Tunables (endpoints, intervals, paths) come from a TOML file; secrets
//! (client credentials, token encryption secret) come from environment
//! variables. Everything is validated once at startup and injected into
//! constructors; a missing required value aborts startup rather than
//! surfacing at first use.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Complete service configuration (TOML file)
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            provider: ProviderConfig::default(),
            state: StateConfig::default(),
            refresh: RefreshConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Public base URL of this service (used to build the OAuth redirect URI)
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    /// Where the browser is sent after the callback completes (success or
    /// failure; the outcome is appended as query parameters)
    #[serde(default = "default_post_auth_redirect")]
    pub post_auth_redirect: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8095".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:8095".to_string()
}

fn default_post_auth_redirect() -> String {
    "http://localhost:8095/settings".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            public_base_url: default_public_base_url(),
            post_auth_redirect: default_post_auth_redirect(),
        }
    }
}

/// OAuth provider endpoints and scopes
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Provider name as it appears in URL paths (/auth/{name}/...)
    #[serde(default = "default_provider_name")]
    pub name: String,
    /// Authorization endpoint (user-facing redirect target)
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    /// Token endpoint (code exchange and refresh)
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Revocation endpoint
    #[serde(default = "default_revoke_url")]
    pub revoke_url: String,
    /// Scopes requested during authorization
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

fn default_provider_name() -> String {
    "smartthings".to_string()
}

fn default_auth_url() -> String {
    "https://api.smartthings.com/oauth/authorize".to_string()
}

fn default_token_url() -> String {
    "https://auth-global.api.smartthings.com/oauth/token".to_string()
}

fn default_revoke_url() -> String {
    "https://auth-global.api.smartthings.com/oauth/revoke".to_string()
}

fn default_scopes() -> Vec<String> {
    vec![
        "r:devices:*".to_string(),
        "x:devices:*".to_string(),
        "r:locations:*".to_string(),
    ]
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            revoke_url: default_revoke_url(),
            scopes: default_scopes(),
        }
    }
}

/// CSRF state cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    /// How long issued state tokens remain valid (seconds)
    #[serde(default = "default_state_ttl")]
    pub ttl_seconds: i64,
    /// How often expired states are swept (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_state_ttl() -> i64 {
    600
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_state_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

/// Proactive refresh configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// How often the refresh loop scans stored credentials (seconds)
    #[serde(default = "default_refresh_interval")]
    pub interval_seconds: u64,
    /// Renew tokens expiring within this window (seconds)
    #[serde(default = "default_refresh_buffer")]
    pub buffer_seconds: i64,
    /// Upstream refresh attempts per pass before deferring
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Delays between attempts; the last entry repeats if attempts exceed it
    #[serde(default = "default_backoff")]
    pub backoff_seconds: Vec<u64>,
}

fn default_max_attempts() -> usize {
    3
}

fn default_refresh_interval() -> u64 {
    3600
}

fn default_refresh_buffer() -> i64 {
    3600
}

fn default_backoff() -> Vec<u64> {
    vec![30, 60, 120]
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_refresh_interval(),
            buffer_seconds: default_refresh_buffer(),
            max_attempts: default_max_attempts(),
            backoff_seconds: default_backoff(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite credential database
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "hearth-credentials.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &str) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path))?;
    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
    Ok(config)
}

/// Secrets supplied via environment variables.
///
/// All three are required; startup fails immediately when any is absent so
/// the authorization endpoints never discover a missing credential at
/// request time.
#[derive(Clone)]
pub struct Secrets {
    /// OAuth client identifier
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Operator secret the token encryption key is derived from
    pub token_secret: String,
}

impl Secrets {
    /// Read secrets from the environment, failing fast on any missing value.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            client_id: require_env("HEARTH_OAUTH_CLIENT_ID")?,
            client_secret: require_env("HEARTH_OAUTH_CLIENT_SECRET")?,
            token_secret: require_env("HEARTH_TOKEN_SECRET")?,
        })
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("token_secret", &"[REDACTED]")
            .finish()
    }
}

fn require_env(name: &str) -> Result<String> {
    let value = std::env::var(name)
        .map_err(|_| anyhow!("Required environment variable {} is not set", name))?;
    if value.is_empty() {
        return Err(anyhow!("Required environment variable {} is empty", name));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.state.ttl_seconds, 600);
        assert_eq!(config.refresh.interval_seconds, 3600);
        assert_eq!(config.refresh.buffer_seconds, 3600);
        assert_eq!(config.refresh.max_attempts, 3);
        assert_eq!(config.refresh.backoff_seconds, vec![30, 60, 120]);
        assert_eq!(config.provider.name, "smartthings");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml = r#"
            [refresh]
            interval_seconds = 120
            buffer_seconds = 300
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.refresh.interval_seconds, 120);
        assert_eq!(config.refresh.buffer_seconds, 300);
        assert_eq!(config.state.ttl_seconds, 600); // Default
        assert_eq!(config.database.path, "hearth-credentials.db"); // Default
    }

    #[test]
    fn test_provider_config_deserialization() {
        let toml = r#"
            [provider]
            name = "hue"
            auth_url = "https://api.example.com/v2/oauth2/authorize"
            token_url = "https://api.example.com/v2/oauth2/token"
            revoke_url = "https://api.example.com/v2/oauth2/revoke"
            scopes = ["read", "write"]
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.provider.name, "hue");
        assert_eq!(config.provider.scopes, vec!["read", "write"]);
    }

    #[test]
    fn test_secrets_debug_redacts() {
        let secrets = Secrets {
            client_id: "id".to_string(),
            client_secret: "very-secret".to_string(),
            token_secret: "also-secret".to_string(),
        };

        let debug = format!("{:?}", secrets);
        assert!(!debug.contains("very-secret"));
        assert!(!debug.contains("also-secret"));
    }
}
