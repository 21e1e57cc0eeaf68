//! OAuth 2.0 authorization flow for the smart-home cloud connection.
//!
//! Authorization code flow:
//! 1. Browser hits GET /auth/{provider} → redirect to provider
//! 2. User authorizes on the provider's site
//! 3. Provider redirects to /auth/{provider}/callback
//! 4. Callback is validated, state consumed, code exchanged, tokens
//!    encrypted and persisted
//! 5. Browser is redirected to the configured post-auth page with the
//!    outcome as query parameters
//!
//! The callback runs as a small state machine (received, validated, state
//! consumed, code exchanged, persisted) with one terminal redirect per
//! outcome. Every path either persists valid credentials or performs zero
//! durable writes.

mod exchange;
mod revoke;
mod state_cache;
pub mod validate;

pub use exchange::{ExchangeError, TokenExchanger, TokenGrant};
pub use revoke::disconnect;
pub use state_cache::{run_state_sweeper, StateCache, STATE_LEN};

use crate::tokens::{TokenSet, TokenStore};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use validate::{redact_state, truncate_for_log, CallbackParams, ValidCallback};

/// Shared state for the auth endpoints
#[derive(Clone)]
pub struct AuthAppState {
    pub store: Arc<TokenStore>,
    pub exchanger: Arc<TokenExchanger>,
    pub states: StateCache,
    /// Provider name accepted in URL paths
    pub provider_name: String,
    /// Provider authorization endpoint with client/scope parameters baked
    /// in at startup; only the state token varies per request
    pub auth_url_base: AuthUrlBuilder,
    /// Where the browser lands after the callback, outcome appended
    pub post_auth_redirect: String,
    /// Refresh buffer, for the status endpoint's needs_refresh field
    pub refresh_buffer_seconds: i64,
}

/// Builds provider authorization URLs. Static configuration is validated at
/// startup, so URL construction cannot fail per-request.
#[derive(Clone)]
pub struct AuthUrlBuilder {
    auth_url: String,
    client_id: String,
    redirect_uri: String,
    scopes: String,
}

impl AuthUrlBuilder {
    pub fn new(auth_url: String, client_id: String, redirect_uri: String, scopes: &[String]) -> Self {
        Self {
            auth_url,
            client_id,
            redirect_uri,
            scopes: scopes.join(" "),
        }
    }

    fn build(&self, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&self.scopes),
            urlencoding::encode(state)
        )
    }
}

/// Terminal outcomes of the callback state machine.
///
/// Each maps to exactly one redirect; raw error detail never reaches the
/// client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallbackOutcome {
    Success,
    Denied,
    InvalidParams,
    InvalidState,
    Failed,
}

impl CallbackOutcome {
    fn redirect_suffix(self) -> &'static str {
        match self {
            CallbackOutcome::Success => "",
            CallbackOutcome::Denied => "?oauth=denied",
            CallbackOutcome::InvalidParams => "?oauth=error&reason=invalid_params",
            CallbackOutcome::InvalidState => "?oauth=error&reason=invalid_state",
            CallbackOutcome::Failed => "?oauth=error&reason=callback_failed",
        }
    }
}

#[derive(Serialize)]
struct DisconnectResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    needs_refresh: Option<bool>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Create the auth endpoint router
pub fn create_auth_router(state: AuthAppState) -> Router {
    Router::new()
        .route("/auth/:provider", get(auth_start))
        .route("/auth/:provider/callback", get(auth_callback))
        .route("/auth/:provider/disconnect", post(auth_disconnect))
        .route("/auth/:provider/status", get(auth_status))
        .with_state(Arc::new(state))
}

/// GET /auth/{provider}
///
/// Issues a fresh CSRF state and redirects to the provider authorization
/// page.
async fn auth_start(
    State(state): State<Arc<AuthAppState>>,
    Path(provider): Path<String>,
) -> Response {
    if provider != state.provider_name {
        warn!(provider = %truncate_for_log(&provider, 32), "Unknown provider");
        return provider_not_found();
    }

    let csrf_state = state.states.issue();
    let auth_url = state.auth_url_base.build(&csrf_state);

    info!(
        provider = %provider,
        state_prefix = %redact_state(&csrf_state),
        "Redirecting to provider authorization page"
    );

    Redirect::temporary(&auth_url).into_response()
}

/// GET /auth/{provider}/callback
///
/// Runs the callback state machine and redirects to the post-auth page with
/// the outcome.
async fn auth_callback(
    State(state): State<Arc<AuthAppState>>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Redirect {
    let outcome = if provider == state.provider_name {
        handle_callback(&state, params).await
    } else {
        warn!(provider = %truncate_for_log(&provider, 32), "Callback for unknown provider");
        CallbackOutcome::InvalidParams
    };

    let target = format!("{}{}", state.post_auth_redirect, outcome.redirect_suffix());
    Redirect::temporary(&target)
}

/// The callback state machine: validate → consume state → exchange code →
/// persist. Exposed for integration tests.
pub async fn handle_callback(state: &AuthAppState, params: CallbackParams) -> CallbackOutcome {
    // RECEIVED → VALIDATED
    let valid = match validate::validate_callback(&params) {
        Ok(valid) => valid,
        Err(e) => {
            // Log truncated, never echoed
            warn!(
                error = %e,
                code = %truncate_for_log(params.code.as_deref().unwrap_or(""), 32),
                "Callback rejected by parameter validation"
            );
            return CallbackOutcome::InvalidParams;
        }
    };

    let (code, csrf_state) = match valid {
        ValidCallback::Denied { error } => {
            info!(error = %error, "User denied authorization");
            return CallbackOutcome::Denied;
        }
        ValidCallback::Grant { code, state } => (code, state),
    };

    // VALIDATED → STATE_CONSUMED. Absent, consumed, and expired are one
    // outcome by design.
    if !state.states.consume(&csrf_state) {
        warn!(
            state_prefix = %redact_state(&csrf_state),
            "State not recognized (never issued, already consumed, or expired)"
        );
        return CallbackOutcome::InvalidState;
    }

    // STATE_CONSUMED → CODE_EXCHANGED
    let grant = match state.exchanger.exchange_code(&code).await {
        Ok(grant) => grant,
        Err(e) => {
            error!(error = %e, "Authorization code exchange failed");
            return CallbackOutcome::Failed;
        }
    };

    // The initial grant must carry a refresh token, or the connection would
    // die at first expiry
    let Some(refresh_token) = grant.refresh_token else {
        error!("Provider grant missing refresh token");
        return CallbackOutcome::Failed;
    };

    // CODE_EXCHANGED → PERSISTED
    let tokens = TokenSet {
        access_token: grant.access_token,
        refresh_token,
        expires_at: Utc::now().timestamp() + grant.expires_in,
        scope: grant.scope.unwrap_or_default(),
    };

    let user_id = default_user_id();
    if let Err(e) = state.store.upsert(&user_id, &tokens) {
        error!(user_id = %user_id, error = %e, "Failed to persist credentials");
        return CallbackOutcome::Failed;
    }

    info!(user_id = %user_id, expires_at = tokens.expires_at, "Authorization complete");
    CallbackOutcome::Success
}

/// POST /auth/{provider}/disconnect
///
/// Best-effort upstream revocation, guaranteed local deletion. Fails only
/// on a local storage error.
async fn auth_disconnect(
    State(state): State<Arc<AuthAppState>>,
    Path(provider): Path<String>,
) -> Response {
    if provider != state.provider_name {
        return provider_not_found();
    }

    let user_id = default_user_id();
    match revoke::disconnect(&state.store, &state.exchanger, &user_id).await {
        Ok(_) => Json(DisconnectResponse {
            success: true,
            error: None,
        })
        .into_response(),
        Err(e) => {
            error!(user_id = %user_id, error = %e, "Local credential deletion failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(DisconnectResponse {
                    success: false,
                    error: Some("failed to remove stored credentials".to_string()),
                }),
            )
                .into_response()
        }
    }
}

/// GET /auth/{provider}/status
async fn auth_status(
    State(state): State<Arc<AuthAppState>>,
    Path(provider): Path<String>,
) -> Response {
    if provider != state.provider_name {
        return provider_not_found();
    }

    let user_id = default_user_id();
    match state.store.summary(&user_id) {
        Ok(Some(summary)) => {
            let needs_refresh =
                summary.expires_at - Utc::now().timestamp() < state.refresh_buffer_seconds;
            Json(StatusResponse {
                connected: summary.expires_at > Utc::now().timestamp(),
                expires_at: Some(summary.expires_at),
                scope: Some(summary.scope),
                needs_refresh: Some(needs_refresh),
            })
            .into_response()
        }
        Ok(None) => Json(StatusResponse {
            connected: false,
            expires_at: None,
            scope: None,
            needs_refresh: None,
        })
        .into_response(),
        Err(e) => {
            error!(user_id = %user_id, error = %e, "Failed to read credential summary");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "credential storage unavailable".to_string(),
                }),
            )
                .into_response()
        }
    }
}

fn provider_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "unknown provider".to_string(),
        }),
    )
        .into_response()
}

/// Keyed storage supports many users; the bridge itself runs single-user,
/// so HTTP handlers operate on this identity.
fn default_user_id() -> String {
    "default".to_string()
}
