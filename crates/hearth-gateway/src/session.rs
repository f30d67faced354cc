//! Session channel map and session token issuing.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use hearth_core::{ApiError, ErrorKind, Principal};
use hearth_crypto::{
    CryptoError, CryptoResult, HandshakeRequest, HandshakeResponse, SessionChannel,
    TransportIdentity,
};
use rand::RngCore;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Owner of the per-client channel map.
///
/// The manager is the single writer: channels enter through
/// [`SessionManager::handshake`] (which atomically replaces any
/// previous channel for the client) and leave through the sweeper or
/// explicit eviction. Request handling only reads.
pub struct SessionManager {
    channels: DashMap<String, SessionChannel>,
    identity: TransportIdentity,
    session_ttl_secs: u64,
}

impl SessionManager {
    /// Create a manager answering handshakes as `component`.
    #[must_use]
    pub fn new(identity: TransportIdentity, session_ttl_secs: u64) -> Self {
        Self {
            channels: DashMap::new(),
            identity,
            session_ttl_secs,
        }
    }

    /// Process a handshake and store the resulting channel.
    ///
    /// A second handshake from the same client identity supersedes the
    /// first: the old channel is replaced atomically and is no longer
    /// valid for incoming requests.
    ///
    /// # Errors
    ///
    /// Propagates handshake verification failures.
    pub fn handshake(
        &self,
        request: &mut HandshakeRequest,
    ) -> CryptoResult<(String, HandshakeResponse)> {
        let (client_id, response, channel) = self
            .identity
            .process_handshake(request, self.session_ttl_secs)?;

        self.channels.insert(client_id.clone(), channel);
        info!(client_id = %client_id, "Session channel established");
        Ok((client_id, response))
    }

    /// Whether a valid channel exists for the client.
    #[must_use]
    pub fn has_valid_channel(&self, client_id: &str) -> bool {
        self.channels
            .get(client_id)
            .is_some_and(|channel| channel.is_valid())
    }

    /// Decrypt a payload with the client's channel, updating its
    /// last-used time.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SessionExpired`] when no valid channel
    /// exists and decryption errors from the channel itself.
    pub fn decrypt(&self, client_id: &str, payload: &str) -> CryptoResult<Value> {
        let mut channel = self
            .channels
            .get_mut(client_id)
            .ok_or(CryptoError::SessionExpired)?;
        let value = channel.decrypt_json(payload)?;
        channel.touch();
        Ok(value)
    }

    /// Encrypt a payload with the client's channel.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SessionExpired`] when no valid channel
    /// exists and encryption errors from the channel itself.
    pub fn encrypt(&self, client_id: &str, payload: &Value) -> CryptoResult<String> {
        let mut channel = self
            .channels
            .get_mut(client_id)
            .ok_or(CryptoError::SessionExpired)?;
        let encrypted = channel.encrypt_json(payload)?;
        channel.touch();
        Ok(encrypted)
    }

    /// Remove a client's channel.
    pub fn evict(&self, client_id: &str) {
        if self.channels.remove(client_id).is_some() {
            debug!(client_id, "Session channel evicted");
        }
    }

    /// Remove every invalid channel. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, channel| channel.is_valid());
        let removed = before.saturating_sub(self.channels.len());
        if removed > 0 {
            debug!(removed, "Expired session channels swept");
        }
        removed
    }

    /// Number of live channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the channel map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Drop every channel (gateway shutdown).
    pub fn clear(&self) {
        self.channels.clear();
    }

    /// Spawn the periodic expiry sweeper.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(interval) => {
                        manager.sweep();
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

/// Issues and validates opaque session tokens.
///
/// Tokens are minted when a connection authenticates (WebSocket `auth`
/// frames, handshake-bound logins) and checked by the security plugin
/// on every protected request. The MAC is a keyed blake3 hash, so
/// validation needs no database roundtrip.
pub struct AuthTokens {
    key: [u8; 32],
    ttl_secs: u64,
}

impl AuthTokens {
    /// Create an issuer with a random process-lifetime key.
    #[must_use]
    pub fn new(ttl_secs: u64) -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self { key, ttl_secs }
    }

    /// Issue a token for a user.
    #[must_use]
    pub fn issue(&self, user_id: Uuid, roles: &[String]) -> String {
        let expires = chrono::Utc::now().timestamp() + i64::try_from(self.ttl_secs).unwrap_or(0);
        let payload = format!("{user_id}.{}.{expires}", roles.join(","));
        let mac = blake3::keyed_hash(&self.key, payload.as_bytes());
        format!("{payload}.{}", mac.to_hex())
    }

    /// Validate a token and recover its principal.
    ///
    /// # Errors
    ///
    /// Returns 401 [`ApiError`]s: `invalid_credential` for malformed
    /// or forged tokens, `expired_token` past expiry.
    pub fn validate(&self, token: &str) -> Result<Principal, ApiError> {
        let invalid = || ApiError::unauthorized(ErrorKind::InvalidCredential, "invalid token");

        let (payload, mac_hex) = token.rsplit_once('.').ok_or_else(invalid)?;
        let expected = blake3::keyed_hash(&self.key, payload.as_bytes());
        let presented = blake3::Hash::from_hex(mac_hex).map_err(|_| invalid())?;
        // blake3::Hash equality is constant-time.
        if presented != expected {
            return Err(invalid());
        }

        let mut parts = payload.splitn(3, '.');
        let user_id = parts
            .next()
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(invalid)?;
        let roles: Vec<String> = parts
            .next()
            .map(|raw| {
                raw.split(',')
                    .filter(|role| !role.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let expires: i64 = parts
            .next()
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(invalid)?;

        if chrono::Utc::now().timestamp() >= expires {
            return Err(ApiError::unauthorized(
                ErrorKind::ExpiredToken,
                "token expired",
            ));
        }

        Ok(Principal {
            user_id,
            roles,
            auth_method: "session_token".into(),
        })
    }
}

impl std::fmt::Debug for AuthTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthTokens")
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_crypto::{ClientHandshake, IdentityKeyPair};
    use serde_json::json;

    fn manager(ttl_secs: u64) -> SessionManager {
        SessionManager::new(
            TransportIdentity::new(IdentityKeyPair::generate(), "gateway"),
            ttl_secs,
        )
    }

    #[test]
    fn test_handshake_establishes_channel() {
        let manager = manager(60);
        let (client, mut request) = ClientHandshake::initiate("test");

        let (client_id, response) = manager.handshake(&mut request).unwrap();
        assert!(manager.has_valid_channel(&client_id));

        let channel = client.complete(&response, 60).unwrap();
        let encrypted = channel.encrypt_json(&json!({"n": 7})).unwrap();
        assert_eq!(manager.decrypt(&client_id, &encrypted).unwrap()["n"], 7);
    }

    #[test]
    fn test_replay_supersedes_previous_channel() {
        let manager = manager(60);
        let identity = IdentityKeyPair::generate();
        let secret = identity.secret_key_bytes();

        let (first_client, mut first) =
            ClientHandshake::initiate_with_identity(identity, "test");
        let (client_id, first_response) = manager.handshake(&mut first).unwrap();
        let first_channel = first_client.complete(&first_response, 60).unwrap();

        let identity = IdentityKeyPair::from_secret_key(secret.as_slice()).unwrap();
        let (_, mut second) = ClientHandshake::initiate_with_identity(identity, "test");
        let (second_id, _) = manager.handshake(&mut second).unwrap();
        assert_eq!(client_id, second_id);

        // Traffic encrypted under the first channel no longer decrypts.
        let stale = first_channel.encrypt_json(&json!({"x": 1})).unwrap();
        assert!(manager.decrypt(&client_id, &stale).is_err());
    }

    #[test]
    fn test_sweep_removes_expired() {
        let manager = manager(0);
        let (_, mut request) = ClientHandshake::initiate("test");
        let (client_id, _) = manager.handshake(&mut request).unwrap();

        assert_eq!(manager.len(), 1);
        assert!(!manager.has_valid_channel(&client_id));
        assert_eq!(manager.sweep(), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_token_roundtrip() {
        let tokens = AuthTokens::new(3600);
        let user_id = Uuid::new_v4();
        let token = tokens.issue(user_id, &["user".into(), "admin".into()]);

        let principal = tokens.validate(&token).unwrap();
        assert_eq!(principal.user_id, user_id);
        assert!(principal.has_role("admin"));
    }

    #[test]
    fn test_forged_token_rejected() {
        let tokens = AuthTokens::new(3600);
        let token = tokens.issue(Uuid::new_v4(), &["user".into()]);

        let mut forged = token.clone();
        forged.replace_range(..1, "z");
        // Either the payload or the MAC no longer line up.
        assert!(tokens.validate(&forged).is_err());

        let other_issuer = AuthTokens::new(3600);
        assert!(other_issuer.validate(&token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let tokens = AuthTokens::new(0);
        let token = tokens.issue(Uuid::new_v4(), &[]);
        let err = tokens.validate(&token).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExpiredToken);
    }
}
