//! Best-effort disconnect: revoke upstream, always delete locally.
//!
//! A user-initiated disconnect must succeed locally even when the provider
//! is unreachable. Both tokens are revoked independently (one failing
//! never blocks the other) and the local record is deleted regardless of
//! either outcome, accepting that a token may stay valid upstream until its
//! natural expiry.

use crate::oauth::TokenExchanger;
use crate::tokens::TokenStore;
use anyhow::Result;
use tracing::{info, warn};

/// Disconnect a user: best-effort upstream revocation, guaranteed local
/// deletion.
///
/// Returns whether a local record existed. The only error path is a local
/// storage failure on the delete itself.
pub async fn disconnect(
    store: &TokenStore,
    exchanger: &TokenExchanger,
    user_id: &str,
) -> Result<bool> {
    match store.get(user_id) {
        Ok(Some(tokens)) => {
            // Access token first, then refresh token; failures are logged
            // and do not stop the flow
            if let Err(e) = exchanger.revoke(&tokens.access_token, "access_token").await {
                warn!(user_id = %user_id, error = %e, "Access token revocation failed");
            }
            if let Err(e) = exchanger.revoke(&tokens.refresh_token, "refresh_token").await {
                warn!(user_id = %user_id, error = %e, "Refresh token revocation failed");
            }
        }
        Ok(None) => {}
        Err(e) => {
            // Unreadable record: nothing to revoke upstream, but the local
            // delete still happens
            warn!(user_id = %user_id, error = %e, "Credential record unreadable, skipping upstream revocation");
        }
    }

    let deleted = store.delete(user_id)?;
    info!(user_id = %user_id, had_record = deleted, "User disconnected");
    Ok(deleted)
}
