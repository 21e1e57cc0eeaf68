//! Encrypted storage for delegated-access credentials.
//!
//! One credential record per user, encrypted at rest with AES-256-GCM under
//! a key derived once at startup (Argon2id over the operator secret).
//! Access and refresh tokens are encrypted independently (they never share
//! an IV) and each carries its own authentication tag, verified on read.
//!
//! # Security
//! - Tokens exist in plaintext only in memory, decrypted on demand
//! - Tag mismatch on decrypt means the record is unusable (corruption or
//!   tampering) and is surfaced as an error, never partially trusted
//! - The derived key lives in memory only; the operator secret is read from
//!   the environment at startup

mod crypto;
mod store;

pub use crypto::{Sealed, TokenCodec};
pub use store::{StoredTokens, TokenStore, TokenSummary, UserExpiry};

/// A freshly obtained token pair, ready to persist.
///
/// Built from a provider grant (code exchange or refresh); `expires_at` is
/// absolute unix seconds, computed from the grant's `expires_in` at receipt.
#[derive(Clone, Debug)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds at which the access token expires
    pub expires_at: i64,
    /// Space-separated scopes granted by the provider
    pub scope: String,
}
