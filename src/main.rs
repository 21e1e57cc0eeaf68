use anyhow::{Context, Result};
use hearth::config::{self, Config, Secrets};
use hearth::oauth::{self, AuthAppState, AuthUrlBuilder, StateCache, TokenExchanger};
use hearth::refresh::RefreshCoordinator;
use hearth::tokens::{TokenCodec, TokenStore};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hearth=info".into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => config::load_config(&path)?,
        None => Config::default(),
    };

    // All required secrets are read and validated here; a missing one
    // aborts startup rather than failing at first use
    let secrets = Secrets::from_env()?;

    info!("Hearth starting...");

    let codec = TokenCodec::derive(&secrets.token_secret)?;
    let store = Arc::new(TokenStore::open(&config.database.path, codec)?);

    let redirect_uri = format!(
        "{}/auth/{}/callback",
        config.server.public_base_url, config.provider.name
    );
    let exchanger = Arc::new(TokenExchanger::new(
        config.provider.token_url.clone(),
        config.provider.revoke_url.clone(),
        secrets.client_id.clone(),
        secrets.client_secret.clone(),
        redirect_uri.clone(),
    )?);

    let states = StateCache::new(config.state.ttl_seconds);
    tokio::spawn(oauth::run_state_sweeper(
        states.clone(),
        config.state.sweep_interval_seconds,
    ));

    let coordinator = Arc::new(RefreshCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&exchanger),
        config.refresh.clone(),
    ));
    tokio::spawn(coordinator.run_refresh_loop());

    let app = oauth::create_auth_router(AuthAppState {
        store,
        exchanger,
        states,
        provider_name: config.provider.name.clone(),
        auth_url_base: AuthUrlBuilder::new(
            config.provider.auth_url.clone(),
            secrets.client_id.clone(),
            redirect_uri,
            &config.provider.scopes,
        ),
        post_auth_redirect: config.server.post_auth_redirect.clone(),
        refresh_buffer_seconds: config.refresh.buffer_seconds,
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, provider = %config.provider.name, "Listening");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
