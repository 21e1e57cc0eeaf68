//! Token endpoint client: code exchange, refresh, revocation.
//!
//! All calls authenticate with client-credential basic auth. Failures are
//! classified for the caller: retryable (network, 5xx, 429) versus terminal
//! (any other 4xx, including invalid_grant, which means the refresh token
//! itself is dead and the user must re-authorize). Retry policy belongs to
//! the caller, not here.

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// HTTP timeout for provider calls
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// How much of a provider error body is kept for messages
const BODY_SNIPPET_LEN: usize = 200;

/// A successful grant from the token endpoint.
///
/// The provider may rotate the refresh token on refresh, or omit it to keep
/// the old one; callers persist exactly what came back.
#[derive(Clone, Debug)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub scope: Option<String>,
}

/// Token endpoint failure, classified for retry decisions.
#[derive(Debug)]
pub enum ExchangeError {
    /// Network error, 5xx, or rate limit; worth retrying with backoff
    Retryable(String),
    /// Provider definitively rejected the request; retrying cannot help
    Terminal(String),
}

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Retryable(_))
    }
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::Retryable(msg) => write!(f, "retryable exchange failure: {}", msg),
            ExchangeError::Terminal(msg) => write!(f, "terminal exchange failure: {}", msg),
        }
    }
}

impl std::error::Error for ExchangeError {}

/// Standard OAuth 2.0 token response
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Client for the provider's token and revocation endpoints.
pub struct TokenExchanger {
    http: reqwest::Client,
    token_url: String,
    revoke_url: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl TokenExchanger {
    pub fn new(
        token_url: String,
        revoke_url: String,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            token_url,
            revoke_url,
            client_id,
            client_secret,
            redirect_uri,
        })
    }

    /// Exchange an authorization code for a token grant.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, ExchangeError> {
        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("code", code);
        form.insert("redirect_uri", &self.redirect_uri);

        debug!(token_url = %self.token_url, "Exchanging authorization code");
        self.token_request(form).await
    }

    /// Exchange a refresh token for a new grant.
    ///
    /// The provider may invalidate the presented refresh token as soon as
    /// this succeeds, so the caller must persist the returned grant.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ExchangeError> {
        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token);

        debug!(token_url = %self.token_url, "Refreshing access token");
        self.token_request(form).await
    }

    /// Revoke a token upstream.
    ///
    /// A "not found" / "invalid token" response means the token is already
    /// invalid, which is the desired end state, so it is logged and treated as
    /// success.
    pub async fn revoke(&self, token: &str, token_type_hint: &str) -> Result<(), ExchangeError> {
        let mut form = HashMap::new();
        form.insert("token", token);
        form.insert("token_type_hint", token_type_hint);

        let response = self
            .http
            .post(&self.revoke_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&form)
            .send()
            .await
            .map_err(|e| ExchangeError::Retryable(format!("revocation request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        // Already-invalid token: the provider has nothing to revoke
        if status == StatusCode::NOT_FOUND || status == StatusCode::BAD_REQUEST {
            debug!(hint = %token_type_hint, status = %status, "Token already invalid upstream");
            return Ok(());
        }

        let body = body_snippet(response).await;
        Err(classify(status, body))
    }

    async fn token_request(
        &self,
        form: HashMap<&str, &str>,
    ) -> Result<TokenGrant, ExchangeError> {
        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| ExchangeError::Retryable(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = body_snippet(response).await;
            return Err(classify(status, body));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::Retryable(format!("malformed token response: {}", e)))?;

        debug!(
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token grant received"
        );

        Ok(TokenGrant {
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
            expires_in: token_response.expires_in.unwrap_or(3600),
            scope: token_response.scope,
        })
    }
}

/// 5xx and 429 are worth retrying; any other failure status is terminal.
fn classify(status: StatusCode, body: String) -> ExchangeError {
    let msg = format!("provider returned {}: {}", status, body);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ExchangeError::Retryable(msg)
    } else {
        ExchangeError::Terminal(msg)
    }
}

async fn body_snippet(response: reqwest::Response) -> String {
    let body = response.text().await.unwrap_or_default();
    let mut snippet: String = body.chars().take(BODY_SNIPPET_LEN).collect();
    if snippet.len() < body.len() {
        snippet.push_str("...");
    }
    snippet
}
