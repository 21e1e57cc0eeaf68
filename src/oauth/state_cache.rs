//! CSRF state cache for the authorization handshake.
//!
//! State tokens are 32 random bytes rendered as 64 lowercase hex characters.
//! Each is single-use: `consume` removes the entry atomically, so a replayed
//! callback URL fails on the second attempt. Absent, already-consumed, and
//! expired states are indistinguishable to the caller.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Bytes of entropy per state token (256 bits)
const STATE_BYTES: usize = 32;

/// Hex length of a rendered state token
pub const STATE_LEN: usize = STATE_BYTES * 2;

/// Short-lived, single-use CSRF correlation tokens.
#[derive(Clone)]
pub struct StateCache {
    states: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    ttl: Duration,
}

impl StateCache {
    /// Create a cache whose entries expire after `ttl_seconds`.
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Generate, register, and return a fresh state token.
    pub fn issue(&self) -> String {
        let mut bytes = [0u8; STATE_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let state = hex::encode(bytes);

        let mut states = self.states.lock().unwrap();
        states.insert(state.clone(), Utc::now());

        state
    }

    /// Atomically check-and-delete a state token.
    ///
    /// Returns false when the state is absent, already consumed, or
    /// expired; the caller cannot tell which.
    pub fn consume(&self, state: &str) -> bool {
        let mut states = self.states.lock().unwrap();

        let Some(created_at) = states.remove(state) else {
            return false;
        };

        Utc::now() - created_at <= self.ttl
    }

    /// Drop entries older than the TTL.
    pub fn sweep(&self) {
        let now = Utc::now();
        let mut states = self.states.lock().unwrap();
        states.retain(|_, created_at| now - *created_at <= self.ttl);
    }

    /// Number of live entries (monitoring).
    pub fn len(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    /// True when no states are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background task that periodically sweeps expired states.
pub async fn run_state_sweeper(cache: StateCache, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        cache.sweep();
        tracing::debug!(remaining = cache.len(), "State sweep complete");
    }
}
