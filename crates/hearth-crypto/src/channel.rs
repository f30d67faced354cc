//! Per-client AEAD session channels.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde_json::Value;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};

/// Length of the XChaCha20 nonce prepended to each ciphertext.
const NONCE_LEN: usize = 24;

/// Live cryptographic state for one client session.
///
/// Holds the AEAD key derived during the handshake plus lifetime
/// bookkeeping. A channel is immutable once established except for the
/// `last_used_at` timestamp; replacing a client's channel is done by
/// swapping the whole value in the session map.
#[derive(ZeroizeOnDrop)]
pub struct SessionChannel {
    /// Stable identifier of the owning client.
    #[zeroize(skip)]
    client_id: String,

    /// Derived XChaCha20-Poly1305 key.
    key: [u8; 32],

    #[zeroize(skip)]
    established_at: DateTime<Utc>,

    #[zeroize(skip)]
    last_used_at: DateTime<Utc>,

    #[zeroize(skip)]
    expires_at: DateTime<Utc>,
}

impl SessionChannel {
    /// Create a channel from a derived key with the given lifetime.
    #[must_use]
    pub fn new(client_id: impl Into<String>, key: [u8; 32], ttl_secs: u64) -> Self {
        let now = Utc::now();
        let ttl = i64::try_from(ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or_else(|| Duration::days(36500));
        Self {
            client_id: client_id.into(),
            key,
            established_at: now,
            last_used_at: now,
            expires_at: now + ttl,
        }
    }

    /// The owning client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// When the channel was established.
    #[must_use]
    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    /// When the channel was last used for encryption or decryption.
    #[must_use]
    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }

    /// When the channel expires.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the channel can still encrypt and decrypt.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        Utc::now() < self.expires_at
    }

    /// Record activity on the channel.
    pub fn touch(&mut self) {
        self.last_used_at = Utc::now();
    }

    /// Encrypt a JSON value into a base64 `nonce || ciphertext` blob.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SessionExpired`] on an expired channel
    /// and [`CryptoError::Encryption`] if the AEAD rejects the input.
    pub fn encrypt_json(&self, payload: &Value) -> CryptoResult<String> {
        if !self.is_valid() {
            return Err(CryptoError::SessionExpired);
        }

        let plaintext = serde_json::to_vec(payload)?;

        let cipher =
            XChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| CryptoError::Encryption)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| CryptoError::Encryption)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(blob))
    }

    /// Decrypt a base64 `nonce || ciphertext` blob into a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SessionExpired`] on an expired channel,
    /// [`CryptoError::InvalidBase64`] on a malformed blob, and
    /// [`CryptoError::Decryption`] when authentication fails.
    pub fn decrypt_json(&self, encoded: &str) -> CryptoResult<Value> {
        if !self.is_valid() {
            return Err(CryptoError::SessionExpired);
        }

        let blob = BASE64
            .decode(encoded)
            .map_err(|_| CryptoError::InvalidBase64("payload"))?;

        if blob.len() <= NONCE_LEN {
            return Err(CryptoError::Decryption);
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);

        let cipher =
            XChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| CryptoError::Decryption)?;

        let mut plaintext = cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decryption)?;

        let value = serde_json::from_slice(&plaintext)?;
        plaintext.zeroize();
        Ok(value)
    }
}

impl std::fmt::Debug for SessionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannel")
            .field("client_id", &self.client_id)
            .field("established_at", &self.established_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}
