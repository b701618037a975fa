//! Server-side crypto helpers
//!
//! At-rest wrapping uses AES-256-GCM keyed by `ENCRYPTION_KEY`. This is a
//! second layer over the client-side E2E encryption: the server never sees
//! message plaintext either way, it only wraps the opaque blobs it stores.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;

/// Prefix marking a column value as at-rest wrapped. Values without it are
/// passed through unchanged, so the key can be introduced on a live database.
const WRAP_PREFIX: &str = "enc1:";

const NONCE_LEN: usize = 12;

/// AES-256-GCM wrapper for column values stored at rest.
#[derive(Clone)]
pub struct AtRestCipher {
    cipher: Aes256Gcm,
}

impl AtRestCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(key).expect("key length is fixed at 32 bytes");
        Self { cipher }
    }

    /// Wrap a value as `enc1:<base64(nonce || ciphertext)>`.
    pub fn wrap(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("at-rest encryption failed: {e}"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        Ok(format!("{WRAP_PREFIX}{}", BASE64.encode(blob)))
    }

    /// Unwrap a stored value; unwrapped values pass through untouched.
    pub fn unwrap(&self, stored: &str) -> Result<String> {
        let Some(encoded) = stored.strip_prefix(WRAP_PREFIX) else {
            return Ok(stored.to_string());
        };

        let blob = BASE64
            .decode(encoded)
            .map_err(|e| anyhow!("invalid at-rest blob encoding: {e}"))?;
        if blob.len() < NONCE_LEN {
            return Err(anyhow!("at-rest blob too short"));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| anyhow!("at-rest decryption failed: {e}"))?;

        String::from_utf8(plaintext).map_err(|e| anyhow!("at-rest blob is not UTF-8: {e}"))
    }
}

impl std::fmt::Debug for AtRestCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtRestCipher").finish_non_exhaustive()
    }
}

/// Generate a random 8-character alphanumeric invite code.
pub fn generate_invite_code() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; 8];
    rng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| CHARSET[(*b as usize) % CHARSET.len()] as char)
        .collect()
}
