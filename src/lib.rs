// Configuration (TOML tunables + environment secrets)
pub mod config;

// OAuth 2.0 authorization flow: initiation, callback, disconnect, status
pub mod oauth;

// Proactive token refresh (background loop, per-user renewal locks)
pub mod refresh;

// Encrypted token storage (Argon2-derived key, AES-256-GCM over SQLite)
pub mod tokens;
