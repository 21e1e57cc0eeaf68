//! Durable credential storage backed by SQLite.
//!
//! One row per user, upsert semantics on every successful exchange or
//! refresh. Tokens are encrypted on write and decrypted on read; plaintext
//! never touches the database.
//!
//! # Schema
//! ```sql
//! CREATE TABLE credentials (
//!     user_id TEXT NOT NULL UNIQUE,
//!     access_token_ciphertext TEXT NOT NULL,
//!     access_token_iv TEXT NOT NULL,
//!     access_token_auth_tag TEXT NOT NULL,
//!     refresh_token_ciphertext TEXT NOT NULL,
//!     refresh_token_iv TEXT NOT NULL,
//!     refresh_token_auth_tag TEXT NOT NULL,
//!     expires_at INTEGER NOT NULL,   -- unix seconds
//!     scope TEXT NOT NULL,
//!     updated_at INTEGER NOT NULL    -- unix seconds
//! );
//! ```
//!
//! # Thread safety
//! Connection is wrapped in a Mutex; rows are independent per user, so no
//! cross-row transactions are needed.

use super::{Sealed, TokenCodec, TokenSet};
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// A decrypted credential record plus metadata.
#[derive(Clone, Debug)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub scope: String,
    pub updated_at: i64,
}

/// Record metadata without any decryption (status endpoint).
#[derive(Clone, Debug)]
pub struct TokenSummary {
    pub expires_at: i64,
    pub scope: String,
}

/// One row of the refresh scan: who, and when their access token expires.
#[derive(Clone, Debug)]
pub struct UserExpiry {
    pub user_id: String,
    pub expires_at: i64,
}

/// Encrypted credential storage keyed by user id.
pub struct TokenStore {
    conn: Mutex<Connection>,
    codec: TokenCodec,
}

impl TokenStore {
    /// Open (or create) the credential database.
    ///
    /// WAL journaling gives write-ahead durability for single-row upserts.
    pub fn open<P: AsRef<Path>>(db_path: P, codec: TokenCodec) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open credential database")?;
        Self::init(conn, codec)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(codec: TokenCodec) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, codec)
    }

    fn init(conn: Connection, codec: TokenCodec) -> Result<Self> {
        // WAL fails on in-memory databases; ignore the pragma result there
        let _ = conn.pragma_update(None, "journal_mode", "WAL");

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                user_id TEXT NOT NULL UNIQUE,
                access_token_ciphertext TEXT NOT NULL,
                access_token_iv TEXT NOT NULL,
                access_token_auth_tag TEXT NOT NULL,
                refresh_token_ciphertext TEXT NOT NULL,
                refresh_token_iv TEXT NOT NULL,
                refresh_token_auth_tag TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                scope TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create credentials table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            codec,
        })
    }

    /// Insert or replace the credential record for a user.
    ///
    /// Both tokens are encrypted independently (fresh IV each).
    pub fn upsert(&self, user_id: &str, tokens: &TokenSet) -> Result<()> {
        let access = self
            .codec
            .encrypt(&tokens.access_token)
            .context("Failed to encrypt access token")?;
        let refresh = self
            .codec
            .encrypt(&tokens.refresh_token)
            .context("Failed to encrypt refresh token")?;

        let now = Utc::now().timestamp();

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO credentials (
                    user_id,
                    access_token_ciphertext, access_token_iv, access_token_auth_tag,
                    refresh_token_ciphertext, refresh_token_iv, refresh_token_auth_tag,
                    expires_at, scope, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(user_id) DO UPDATE SET
                    access_token_ciphertext = excluded.access_token_ciphertext,
                    access_token_iv = excluded.access_token_iv,
                    access_token_auth_tag = excluded.access_token_auth_tag,
                    refresh_token_ciphertext = excluded.refresh_token_ciphertext,
                    refresh_token_iv = excluded.refresh_token_iv,
                    refresh_token_auth_tag = excluded.refresh_token_auth_tag,
                    expires_at = excluded.expires_at,
                    scope = excluded.scope,
                    updated_at = excluded.updated_at
                "#,
                params![
                    user_id,
                    access.ciphertext,
                    access.iv,
                    access.auth_tag,
                    refresh.ciphertext,
                    refresh.iv,
                    refresh.auth_tag,
                    tokens.expires_at,
                    tokens.scope,
                    now,
                ],
            )
            .context("Failed to store credentials")?;

        Ok(())
    }

    /// Retrieve and decrypt the credential record for a user.
    ///
    /// A decryption failure (tag mismatch) is an error: the record is
    /// unusable and must not be partially trusted.
    pub fn get(&self, user_id: &str) -> Result<Option<StoredTokens>> {
        let row = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT access_token_ciphertext, access_token_iv, access_token_auth_tag,
                           refresh_token_ciphertext, refresh_token_iv, refresh_token_auth_tag,
                           expires_at, scope, updated_at
                    FROM credentials
                    WHERE user_id = ?1
                    "#,
                )
                .context("Failed to prepare query")?;

            stmt.query_row(params![user_id], |row| {
                Ok((
                    Sealed {
                        ciphertext: row.get(0)?,
                        iv: row.get(1)?,
                        auth_tag: row.get(2)?,
                    },
                    Sealed {
                        ciphertext: row.get(3)?,
                        iv: row.get(4)?,
                        auth_tag: row.get(5)?,
                    },
                    row.get::<_, i64>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            })
            .optional()
            .context("Failed to read credentials")?
        };

        let Some((access_sealed, refresh_sealed, expires_at, scope, updated_at)) = row else {
            return Ok(None);
        };

        let access_token = self
            .codec
            .decrypt(&access_sealed)
            .context("Failed to decrypt access token")?;
        let refresh_token = self
            .codec
            .decrypt(&refresh_sealed)
            .context("Failed to decrypt refresh token")?;

        Ok(Some(StoredTokens {
            access_token,
            refresh_token,
            expires_at,
            scope,
            updated_at,
        }))
    }

    /// Cheap check: does a record exist whose access token has not expired?
    ///
    /// No decryption; used by other subsystems to decide whether to attempt
    /// an upstream call at all.
    pub fn has_valid(&self, user_id: &str) -> Result<bool> {
        let now = Utc::now().timestamp();
        let found: Option<i64> = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT 1 FROM credentials WHERE user_id = ?1 AND expires_at > ?2",
                params![user_id, now],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check credential validity")?;

        Ok(found.is_some())
    }

    /// The consumer-facing accessor: a currently valid access token, or None.
    ///
    /// Read-only. Never triggers a refresh; proactive renewal is the
    /// refresh loop's job. Cryptographic failure surfaces as "not
    /// connected" (None), logged server-side.
    pub fn valid_access_token(&self, user_id: &str) -> Result<Option<String>> {
        match self.get(user_id) {
            Ok(Some(tokens)) if tokens.expires_at > Utc::now().timestamp() => {
                Ok(Some(tokens.access_token))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Credential record unusable");
                Ok(None)
            }
        }
    }

    /// Delete the credential record for a user.
    ///
    /// Returns whether a record existed.
    pub fn delete(&self, user_id: &str) -> Result<bool> {
        let rows = self
            .conn
            .lock()
            .unwrap()
            .execute("DELETE FROM credentials WHERE user_id = ?1", params![user_id])
            .context("Failed to delete credentials")?;

        Ok(rows > 0)
    }

    /// Metadata only (no decryption) for the status endpoint.
    pub fn summary(&self, user_id: &str) -> Result<Option<TokenSummary>> {
        let summary = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT expires_at, scope FROM credentials WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(TokenSummary {
                        expires_at: row.get(0)?,
                        scope: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("Failed to read credential summary")?;

        Ok(summary)
    }

    /// All users with stored credentials and their expiry, for the refresh
    /// scan. No decryption.
    pub fn list_users(&self) -> Result<Vec<UserExpiry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT user_id, expires_at FROM credentials ORDER BY user_id")
            .context("Failed to prepare query")?;

        let users = stmt
            .query_map([], |row| {
                Ok(UserExpiry {
                    user_id: row.get(0)?,
                    expires_at: row.get(1)?,
                })
            })
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_store() -> TokenStore {
        let codec = TokenCodec::from_key([3u8; 32]).unwrap();
        TokenStore::open_in_memory(codec).expect("Failed to create test store")
    }

    fn test_tokens() -> TokenSet {
        TokenSet {
            access_token: "access-token-12345".to_string(),
            refresh_token: "refresh-token-67890".to_string(),
            expires_at: (Utc::now() + Duration::hours(1)).timestamp(),
            scope: "r:devices:* x:devices:*".to_string(),
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let store = test_store();
        let tokens = test_tokens();

        store.upsert("user1", &tokens).unwrap();

        let stored = store.get("user1").unwrap().unwrap();
        assert_eq!(stored.access_token, tokens.access_token);
        assert_eq!(stored.refresh_token, tokens.refresh_token);
        assert_eq!(stored.expires_at, tokens.expires_at);
        assert_eq!(stored.scope, tokens.scope);
        assert!(stored.updated_at > 0);
    }

    #[test]
    fn test_get_nonexistent() {
        let store = test_store();
        assert!(store.get("nobody").unwrap().is_none());
    }

    #[test]
    fn test_upsert_replaces() {
        let store = test_store();
        store.upsert("user1", &test_tokens()).unwrap();

        let rotated = TokenSet {
            access_token: "new-access".to_string(),
            refresh_token: "new-refresh".to_string(),
            expires_at: (Utc::now() + Duration::hours(2)).timestamp(),
            scope: "r:devices:*".to_string(),
        };
        store.upsert("user1", &rotated).unwrap();

        let stored = store.get("user1").unwrap().unwrap();
        assert_eq!(stored.access_token, "new-access");
        assert_eq!(stored.refresh_token, "new-refresh");
        assert_eq!(stored.scope, "r:devices:*");
    }

    #[test]
    fn test_has_valid() {
        let store = test_store();

        assert!(!store.has_valid("user1").unwrap());

        store.upsert("user1", &test_tokens()).unwrap();
        assert!(store.has_valid("user1").unwrap());

        // Expired record is not valid
        let expired = TokenSet {
            expires_at: (Utc::now() - Duration::hours(1)).timestamp(),
            ..test_tokens()
        };
        store.upsert("user1", &expired).unwrap();
        assert!(!store.has_valid("user1").unwrap());
    }

    #[test]
    fn test_valid_access_token() {
        let store = test_store();

        assert!(store.valid_access_token("user1").unwrap().is_none());

        let tokens = test_tokens();
        store.upsert("user1", &tokens).unwrap();
        assert_eq!(
            store.valid_access_token("user1").unwrap().as_deref(),
            Some(tokens.access_token.as_str())
        );

        let expired = TokenSet {
            expires_at: (Utc::now() - Duration::minutes(5)).timestamp(),
            ..test_tokens()
        };
        store.upsert("user1", &expired).unwrap();
        assert!(store.valid_access_token("user1").unwrap().is_none());
    }

    #[test]
    fn test_delete() {
        let store = test_store();
        store.upsert("user1", &test_tokens()).unwrap();

        assert!(store.delete("user1").unwrap());
        assert!(store.get("user1").unwrap().is_none());
        assert!(!store.delete("user1").unwrap());
    }

    #[test]
    fn test_list_users() {
        let store = test_store();
        store.upsert("alice", &test_tokens()).unwrap();
        store.upsert("bob", &test_tokens()).unwrap();

        let users = store.list_users().unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].user_id, "alice");
        assert_eq!(users[1].user_id, "bob");
    }

    #[test]
    fn test_summary_no_decryption_of_tampered_record() {
        // Summary must work even when token columns are garbage, since it
        // never decrypts
        let store = test_store();
        let tokens = test_tokens();
        store.upsert("user1", &tokens).unwrap();

        store
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE credentials SET access_token_auth_tag = 'AAAA' WHERE user_id = 'user1'",
                [],
            )
            .unwrap();

        let summary = store.summary("user1").unwrap().unwrap();
        assert_eq!(summary.expires_at, tokens.expires_at);

        // But get() fails closed
        assert!(store.get("user1").is_err());

        // And the accessor maps the failure to "not connected"
        assert!(store.valid_access_token("user1").unwrap().is_none());
    }

    #[test]
    fn test_tokens_encrypted_at_rest() {
        let store = test_store();
        let tokens = test_tokens();
        store.upsert("user1", &tokens).unwrap();

        let raw: String = store
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT access_token_ciphertext FROM credentials WHERE user_id = 'user1'",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert_ne!(raw, tokens.access_token);
    }

    #[test]
    fn test_on_disk_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.db");

        let codec = TokenCodec::from_key([3u8; 32]).unwrap();
        let store = TokenStore::open(&path, codec.clone()).unwrap();
        let tokens = test_tokens();
        store.upsert("user1", &tokens).unwrap();
        drop(store);

        // Reopen and read back
        let store = TokenStore::open(&path, codec).unwrap();
        let stored = store.get("user1").unwrap().unwrap();
        assert_eq!(stored.access_token, tokens.access_token);
    }
}
