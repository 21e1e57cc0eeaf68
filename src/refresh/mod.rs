//! Proactive token refresh.
//!
//! A background loop scans stored credentials on a fixed interval (and once
//! immediately at startup), renews any access token expiring within the
//! buffer window, and persists whatever the provider returns, including a
//! rotated refresh token. Renewal is serialized per user via [`RefreshLocks`];
//! after acquiring the lock a caller re-checks staleness, so waiters behind
//! a successful renewal skip their own upstream call.
//!
//! Retryable failures (network, 5xx, rate limit) get bounded retries with
//! backoff, then defer to the next scheduled pass. Terminal failures
//! (invalid_grant: the refresh token itself is dead) are not retried; the
//! user must re-run the authorization flow. None of this noise ever reaches
//! request-handling code.

mod lock;

pub use lock::RefreshLocks;

use crate::config::RefreshConfig;
use crate::oauth::TokenExchanger;
use crate::tokens::{TokenSet, TokenStore};
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// What a renewal attempt concluded. Mostly for tests and logs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefreshOutcome {
    /// New grant persisted
    Refreshed,
    /// Token was no longer stale by the time the lock was held (another
    /// renewal finished first), or the record disappeared
    Skipped,
    /// Retryable failures exhausted the attempt budget; next pass retries
    Deferred,
    /// Refresh token rejected; only a full re-authorization can recover
    ReauthRequired,
}

/// Background renewal of stored credentials.
pub struct RefreshCoordinator {
    store: Arc<TokenStore>,
    exchanger: Arc<TokenExchanger>,
    locks: RefreshLocks,
    config: RefreshConfig,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<TokenStore>, exchanger: Arc<TokenExchanger>, config: RefreshConfig) -> Self {
        Self {
            store,
            exchanger,
            locks: RefreshLocks::new(),
            config,
        }
    }

    /// Run the refresh loop indefinitely.
    ///
    /// The first tick fires immediately, giving the startup pass; later
    /// ticks follow the configured interval.
    pub async fn run_refresh_loop(self: Arc<Self>) {
        info!(
            interval_seconds = self.config.interval_seconds,
            buffer_seconds = self.config.buffer_seconds,
            "Starting refresh coordinator"
        );

        let mut timer = interval(Duration::from_secs(self.config.interval_seconds));

        loop {
            timer.tick().await;

            if let Err(e) = self.run_pass().await {
                error!(error = %e, "Refresh pass failed");
            }
        }
    }

    /// One scan over all stored credentials.
    pub async fn run_pass(&self) -> Result<()> {
        let users = self.store.list_users().context("Failed to scan credentials")?;
        let now = Utc::now().timestamp();

        for user in users {
            if !needs_refresh(user.expires_at, now, self.config.buffer_seconds) {
                continue;
            }

            match self.refresh_user(&user.user_id).await {
                Ok(outcome) => {
                    debug!(user_id = %user.user_id, outcome = ?outcome, "Renewal finished")
                }
                Err(e) => error!(user_id = %user.user_id, error = %e, "Renewal failed"),
            }
        }

        Ok(())
    }

    /// Renew one user's tokens under the per-user lock.
    ///
    /// Safe to call concurrently: exactly one caller reaches the provider,
    /// the rest wait and then observe the refreshed record.
    pub async fn refresh_user(&self, user_id: &str) -> Result<RefreshOutcome> {
        let guard = self.locks.acquire(user_id).await;
        let outcome = self.refresh_locked(user_id).await;
        // Guard drop releases on every path; then shed the map entry
        drop(guard);
        self.locks.reap(user_id);
        outcome
    }

    async fn refresh_locked(&self, user_id: &str) -> Result<RefreshOutcome> {
        // Re-check staleness: a renewal that finished while this caller
        // waited makes the upstream call unnecessary
        let tokens = match self.store.get(user_id) {
            Ok(Some(tokens)) => tokens,
            Ok(None) => return Ok(RefreshOutcome::Skipped),
            Err(e) => return Err(e.context("Credential record unreadable")),
        };

        let now = Utc::now().timestamp();
        if !needs_refresh(tokens.expires_at, now, self.config.buffer_seconds) {
            debug!(user_id = %user_id, "Token already fresh, skipping renewal");
            return Ok(RefreshOutcome::Skipped);
        }

        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.exchanger.refresh(&tokens.refresh_token).await {
                Ok(grant) => {
                    let renewed = TokenSet {
                        access_token: grant.access_token,
                        // Persist the rotated refresh token when the
                        // provider sends one; keep the old otherwise
                        refresh_token: grant
                            .refresh_token
                            .unwrap_or_else(|| tokens.refresh_token.clone()),
                        expires_at: Utc::now().timestamp() + grant.expires_in,
                        scope: grant.scope.unwrap_or_else(|| tokens.scope.clone()),
                    };
                    self.store
                        .upsert(user_id, &renewed)
                        .context("Failed to persist renewed tokens")?;

                    info!(
                        user_id = %user_id,
                        expires_at = renewed.expires_at,
                        "Access token renewed"
                    );
                    return Ok(RefreshOutcome::Refreshed);
                }
                Err(e) if e.is_retryable() => {
                    if attempt == attempts {
                        warn!(
                            user_id = %user_id,
                            attempts,
                            error = %e,
                            "Renewal attempts exhausted, deferring to next pass"
                        );
                        return Ok(RefreshOutcome::Deferred);
                    }
                    let delay = backoff_delay(&self.config.backoff_seconds, attempt);
                    warn!(
                        user_id = %user_id,
                        attempt,
                        retry_in_seconds = delay,
                        error = %e,
                        "Renewal attempt failed, backing off"
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
                Err(e) => {
                    warn!(
                        user_id = %user_id,
                        error = %e,
                        "Refresh token rejected; user must re-authorize"
                    );
                    return Ok(RefreshOutcome::ReauthRequired);
                }
            }
        }

        unreachable!("attempt loop always returns")
    }
}

fn needs_refresh(expires_at: i64, now: i64, buffer_seconds: i64) -> bool {
    expires_at - now < buffer_seconds
}

/// Delay after the i-th failed attempt; the schedule's last entry repeats
/// when attempts outnumber it, and an empty schedule means no delay.
fn backoff_delay(schedule: &[u64], attempt: usize) -> u64 {
    match schedule {
        [] => 0,
        _ => schedule[(attempt - 1).min(schedule.len() - 1)],
    }
}
