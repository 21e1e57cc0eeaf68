//! AES-256-GCM encryption for token material at rest.
//!
//! The key is derived once at startup from the operator-supplied secret via
//! Argon2id with a fixed application salt. The salt's only job is to
//! separate this application's key space; the secret itself is expected to
//! be high-entropy, so a per-record salt would buy nothing.
//!
//! Ciphertext, IV, and authentication tag are stored as separate columns,
//! so the AEAD output is split: the trailing 16 bytes are the tag.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Size of the derived encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the IV in bytes (96 bits, standard for GCM)
const IV_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes (128 bits)
const TAG_SIZE: usize = 16;

/// Fixed application salt for key derivation. Separates this application's
/// key space; never user-supplied, never per-record.
const KDF_SALT: &[u8] = b"hearth-token-encryption-v1";

/// One encrypted token: ciphertext, IV, and authentication tag,
/// base64-encoded for storage.
#[derive(Clone, Debug, PartialEq)]
pub struct Sealed {
    pub ciphertext: String,
    pub iv: String,
    pub auth_tag: String,
}

/// Authenticated encryption of token plaintext.
///
/// Cheap to clone; holds only the cipher instance.
#[derive(Clone)]
pub struct TokenCodec {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec").field("key", &"[REDACTED]").finish()
    }
}

impl TokenCodec {
    /// Derive the encryption key from the operator secret.
    ///
    /// Argon2id with default cost parameters: deliberately slow and
    /// memory-hard, run exactly once at startup.
    pub fn derive(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(anyhow!("Token encryption secret must not be empty"));
        }

        let mut key = [0u8; KEY_SIZE];
        Argon2::default()
            .hash_password_into(secret.as_bytes(), KDF_SALT, &mut key)
            .map_err(|e| anyhow!("Key derivation failed: {}", e))?;

        Self::from_key(key)
    }

    /// Build a codec from a raw 32-byte key (tests, key import).
    pub fn from_key(key: [u8; KEY_SIZE]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
        Ok(Self { cipher })
    }

    /// Encrypt a token, drawing a fresh random IV.
    ///
    /// Two calls never share an IV, so the access and refresh token of one
    /// record are always encrypted independently.
    pub fn encrypt(&self, plaintext: &str) -> Result<Sealed> {
        let iv = Aes256Gcm::generate_nonce(&mut OsRng);

        let sealed = self
            .cipher
            .encrypt(&iv, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        // AEAD output is ciphertext || tag; store them separately
        let tag_start = sealed.len() - TAG_SIZE;
        Ok(Sealed {
            ciphertext: BASE64.encode(&sealed[..tag_start]),
            iv: BASE64.encode(iv),
            auth_tag: BASE64.encode(&sealed[tag_start..]),
        })
    }

    /// Decrypt a token, verifying the authentication tag.
    ///
    /// Any failure (bad encoding, wrong IV/tag size, tag mismatch) means
    /// the record is unusable (corruption or tampering) and is an error.
    pub fn decrypt(&self, sealed: &Sealed) -> Result<String> {
        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .context("Failed to decode ciphertext")?;
        let iv = BASE64.decode(&sealed.iv).context("Failed to decode IV")?;
        let tag = BASE64
            .decode(&sealed.auth_tag)
            .context("Failed to decode auth tag")?;

        if iv.len() != IV_SIZE {
            return Err(anyhow!("Invalid IV size: expected {}, got {}", IV_SIZE, iv.len()));
        }
        if tag.len() != TAG_SIZE {
            return Err(anyhow!("Invalid auth tag size: expected {}, got {}", TAG_SIZE, tag.len()));
        }

        let mut combined = ciphertext;
        combined.extend_from_slice(&tag);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&iv), combined.as_ref())
            .map_err(|_| anyhow!("Token decryption failed: authentication tag mismatch"))?;

        String::from_utf8(plaintext).context("Decrypted token is not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_codec() -> TokenCodec {
        TokenCodec::from_key([7u8; 32]).unwrap()
    }

    /// Flip one bit inside a base64-encoded value.
    fn corrupt_one_bit(encoded: &str) -> String {
        let mut bytes = BASE64.decode(encoded).unwrap();
        bytes[0] ^= 0x01;
        BASE64.encode(&bytes)
    }

    #[test]
    fn test_roundtrip() {
        let codec = test_codec();
        let plaintext = "smartthings-access-token-12345";

        let sealed = codec.encrypt(plaintext).unwrap();
        assert_ne!(sealed.ciphertext, plaintext);

        let decrypted = codec.decrypt(&sealed).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let codec = test_codec();

        let a = codec.encrypt("same-token").unwrap();
        let b = codec.encrypt("same-token").unwrap();

        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_single_bit_corruption_fails_closed() {
        let codec = test_codec();
        let sealed = codec.encrypt("secret-token").unwrap();

        let bad_ct = Sealed {
            ciphertext: corrupt_one_bit(&sealed.ciphertext),
            ..sealed.clone()
        };
        assert!(codec.decrypt(&bad_ct).is_err());

        let bad_iv = Sealed {
            iv: corrupt_one_bit(&sealed.iv),
            ..sealed.clone()
        };
        assert!(codec.decrypt(&bad_iv).is_err());

        let bad_tag = Sealed {
            auth_tag: corrupt_one_bit(&sealed.auth_tag),
            ..sealed.clone()
        };
        assert!(codec.decrypt(&bad_tag).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = test_codec().encrypt("secret").unwrap();
        let other = TokenCodec::from_key([8u8; 32]).unwrap();
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_derive_is_deterministic() {
        let a = TokenCodec::derive("operator-secret").unwrap();
        let b = TokenCodec::derive("operator-secret").unwrap();

        // Same secret derives the same key: b can decrypt what a encrypted
        let sealed = a.encrypt("token").unwrap();
        assert_eq!(b.decrypt(&sealed).unwrap(), "token");
    }

    #[test]
    fn test_derive_different_secrets_differ() {
        let a = TokenCodec::derive("secret-one").unwrap();
        let b = TokenCodec::derive("secret-two").unwrap();

        let sealed = a.encrypt("token").unwrap();
        assert!(b.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_derive_rejects_empty_secret() {
        assert!(TokenCodec::derive("").is_err());
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let codec = test_codec();
        let sealed = codec.encrypt("").unwrap();
        assert_eq!(codec.decrypt(&sealed).unwrap(), "");
    }
}
