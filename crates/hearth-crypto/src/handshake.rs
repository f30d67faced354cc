//! Handshake protocol establishing session channels.
//!
//! The transcript signed by each side binds the long-term identity key
//! to the ephemeral exchange key, so a middleperson cannot splice its
//! own ephemeral key into an observed handshake.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::channel::SessionChannel;
use crate::error::{CryptoError, CryptoResult};
use crate::identity::IdentityKeyPair;

/// Wire name of the AEAD scheme used by session channels.
pub const ENCRYPTION_SCHEME: &str = "xchacha20poly1305";

/// Domain separation prefix for the client's handshake signature.
const CLIENT_TRANSCRIPT: &[u8] = b"hearth-handshake-v1";

/// Domain separation prefix for the server's confirmation signature.
const SERVER_TRANSCRIPT: &[u8] = b"hearth-handshake-ack-v1";

/// HKDF info prefix for session key derivation.
const KDF_INFO_PREFIX: &[u8] = b"hearth-transport-v1:";

/// Handshake request sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Name of the connecting component.
    pub component: String,

    /// Client clock at request time (seconds). Filled by the server
    /// when absent.
    #[serde(default)]
    pub timestamp: Option<f64>,

    /// Base64 Ed25519 identity public key.
    pub identity_key: String,

    /// Base64 ephemeral X25519 public key.
    pub public_key: String,

    /// Base64 random nonce, included in the signed transcript.
    pub nonce: String,

    /// Base64 Ed25519 signature over the client transcript.
    pub signature: String,
}

/// Handshake response returned by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Base64 Ed25519 identity public key of the server.
    pub identity_key: String,

    /// Base64 ephemeral X25519 public key of the server.
    pub public_key: String,

    /// Base64 Ed25519 signature over the server transcript.
    pub confirmation: String,
}

/// Stable client id derived from an identity public key.
///
/// The id is the truncated blake3 hex of the raw key bytes, so two
/// handshakes from the same identity land on the same session slot.
#[must_use]
pub fn client_id_for_identity(identity_key: &[u8]) -> String {
    blake3::hash(identity_key).to_hex()[..16].to_string()
}

fn decode_field(field: &'static str, value: &str, expected: usize) -> CryptoResult<Vec<u8>> {
    let bytes = BASE64
        .decode(value)
        .map_err(|_| CryptoError::InvalidBase64(field))?;
    if bytes.len() != expected {
        return Err(CryptoError::InvalidLength {
            field,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

fn client_transcript(identity_key: &[u8], exchange_key: &[u8], nonce: &[u8]) -> Vec<u8> {
    let mut transcript =
        Vec::with_capacity(CLIENT_TRANSCRIPT.len() + identity_key.len() + exchange_key.len() + nonce.len());
    transcript.extend_from_slice(CLIENT_TRANSCRIPT);
    transcript.extend_from_slice(identity_key);
    transcript.extend_from_slice(exchange_key);
    transcript.extend_from_slice(nonce);
    transcript
}

fn server_transcript(
    server_identity: &[u8],
    server_exchange: &[u8],
    client_exchange: &[u8],
) -> Vec<u8> {
    let mut transcript = Vec::with_capacity(
        SERVER_TRANSCRIPT.len() + server_identity.len() + server_exchange.len() + client_exchange.len(),
    );
    transcript.extend_from_slice(SERVER_TRANSCRIPT);
    transcript.extend_from_slice(server_identity);
    transcript.extend_from_slice(server_exchange);
    transcript.extend_from_slice(client_exchange);
    transcript
}

fn derive_session_key(shared_secret: &[u8; 32], client_id: &str) -> CryptoResult<[u8; 32]> {
    let mut info = Vec::with_capacity(KDF_INFO_PREFIX.len() + client_id.len());
    info.extend_from_slice(KDF_INFO_PREFIX);
    info.extend_from_slice(client_id.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(&info, &mut key)
        .map_err(|_| CryptoError::Encryption)?;
    Ok(key)
}

/// Server-side identity answering handshake requests.
pub struct TransportIdentity {
    keypair: IdentityKeyPair,
    component: String,
}

impl TransportIdentity {
    /// Create a transport identity from the server's key pair.
    #[must_use]
    pub fn new(keypair: IdentityKeyPair, component: impl Into<String>) -> Self {
        Self {
            keypair,
            component: component.into(),
        }
    }

    /// The component name this identity answers for.
    #[must_use]
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Process a handshake request and derive a fresh session channel.
    ///
    /// A missing `timestamp` is filled with server time. On success,
    /// returns the derived `client_id`, the response to send back, and
    /// the established channel. The caller stores the channel; any
    /// previous channel for the same client id is superseded.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidBase64`] /
    /// [`CryptoError::InvalidLength`] on malformed fields and
    /// [`CryptoError::SignatureVerification`] when the transcript
    /// signature does not verify.
    pub fn process_handshake(
        &self,
        request: &mut HandshakeRequest,
        ttl_secs: u64,
    ) -> CryptoResult<(String, HandshakeResponse, SessionChannel)> {
        if request.timestamp.is_none() {
            request.timestamp = Some(Utc::now().timestamp() as f64);
        }

        let client_identity = decode_field("identity_key", &request.identity_key, 32)?;
        let client_exchange = decode_field("public_key", &request.public_key, 32)?;
        let nonce = BASE64
            .decode(&request.nonce)
            .map_err(|_| CryptoError::InvalidBase64("nonce"))?;
        let signature = decode_field("signature", &request.signature, 64)?;

        let transcript = client_transcript(&client_identity, &client_exchange, &nonce);
        IdentityKeyPair::verify_peer(&client_identity, &transcript, &signature)?;

        let client_id = client_id_for_identity(&client_identity);

        let server_secret = StaticSecret::random_from_rng(OsRng);
        let server_public = PublicKey::from(&server_secret);

        let mut client_exchange_bytes = [0u8; 32];
        client_exchange_bytes.copy_from_slice(&client_exchange);
        let client_public = PublicKey::from(client_exchange_bytes);

        let shared = server_secret.diffie_hellman(&client_public);
        let key = derive_session_key(shared.as_bytes(), &client_id)?;

        let transcript = server_transcript(
            self.keypair.public_key_bytes(),
            server_public.as_bytes(),
            client_public.as_bytes(),
        );
        let confirmation = self.keypair.sign(&transcript);

        let response = HandshakeResponse {
            identity_key: self.keypair.public_key_b64(),
            public_key: BASE64.encode(server_public.as_bytes()),
            confirmation: BASE64.encode(confirmation.to_bytes()),
        };

        let channel = SessionChannel::new(client_id.clone(), key, ttl_secs);
        Ok((client_id, response, channel))
    }
}

impl std::fmt::Debug for TransportIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportIdentity")
            .field("component", &self.component)
            .finish_non_exhaustive()
    }
}

/// Client side of the handshake, used by local clients and tests.
pub struct ClientHandshake {
    identity: IdentityKeyPair,
    secret: StaticSecret,
    public: PublicKey,
}

impl ClientHandshake {
    /// Begin a handshake, producing the request to send.
    #[must_use]
    pub fn initiate(component: impl Into<String>) -> (Self, HandshakeRequest) {
        Self::initiate_with_identity(IdentityKeyPair::generate(), component)
    }

    /// Begin a handshake with a fixed identity key pair.
    ///
    /// Reusing the identity across handshakes keeps the derived
    /// client id stable, which is how a client supersedes its own
    /// session.
    #[must_use]
    pub fn initiate_with_identity(
        identity: IdentityKeyPair,
        component: impl Into<String>,
    ) -> (Self, HandshakeRequest) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);

        let transcript = client_transcript(identity.public_key_bytes(), public.as_bytes(), &nonce);
        let signature = identity.sign(&transcript);

        let request = HandshakeRequest {
            component: component.into(),
            timestamp: Some(Utc::now().timestamp() as f64),
            identity_key: identity.public_key_b64(),
            public_key: BASE64.encode(public.as_bytes()),
            nonce: BASE64.encode(nonce),
            signature: BASE64.encode(signature.to_bytes()),
        };

        (
            Self {
                identity,
                secret,
                public,
            },
            request,
        )
    }

    /// The client id the server will derive for this handshake.
    #[must_use]
    pub fn client_id(&self) -> String {
        client_id_for_identity(self.identity.public_key_bytes())
    }

    /// Complete the handshake from the server's response.
    ///
    /// Verifies the server's confirmation signature and derives the
    /// same session key as the server.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SignatureVerification`] when the
    /// confirmation does not verify and decoding errors on malformed
    /// fields.
    pub fn complete(self, response: &HandshakeResponse, ttl_secs: u64) -> CryptoResult<SessionChannel> {
        let server_identity = decode_field("identity_key", &response.identity_key, 32)?;
        let server_exchange = decode_field("public_key", &response.public_key, 32)?;
        let confirmation = decode_field("confirmation", &response.confirmation, 64)?;

        let transcript =
            server_transcript(&server_identity, &server_exchange, self.public.as_bytes());
        IdentityKeyPair::verify_peer(&server_identity, &transcript, &confirmation)?;

        let mut server_exchange_bytes = [0u8; 32];
        server_exchange_bytes.copy_from_slice(&server_exchange);
        let server_public = PublicKey::from(server_exchange_bytes);

        let client_id = self.client_id();
        let shared = self.secret.diffie_hellman(&server_public);
        let key = derive_session_key(shared.as_bytes(), &client_id)?;

        Ok(SessionChannel::new(client_id, key, ttl_secs))
    }
}

impl std::fmt::Debug for ClientHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandshake")
            .field("client_id", &self.client_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn server() -> TransportIdentity {
        TransportIdentity::new(IdentityKeyPair::generate(), "gateway")
    }

    #[test]
    fn test_full_handshake_derives_matching_keys() {
        let server = server();
        let (client, mut request) = ClientHandshake::initiate("test-client");

        let (client_id, response, server_channel) =
            server.process_handshake(&mut request, 60).unwrap();
        let client_channel = client.complete(&response, 60).unwrap();

        assert_eq!(client_id, client_channel.client_id());

        // Traffic encrypted by one side decrypts on the other.
        let payload = json!({"hello": "hearth"});
        let encrypted = client_channel.encrypt_json(&payload).unwrap();
        assert_eq!(server_channel.decrypt_json(&encrypted).unwrap(), payload);

        let encrypted = server_channel.encrypt_json(&payload).unwrap();
        assert_eq!(client_channel.decrypt_json(&encrypted).unwrap(), payload);
    }

    #[test]
    fn test_missing_timestamp_is_filled() {
        let server = server();
        let (_, mut request) = ClientHandshake::initiate("test-client");
        request.timestamp = None;

        server.process_handshake(&mut request, 60).unwrap();
        assert!(request.timestamp.is_some());
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let server = server();
        let (_, mut request) = ClientHandshake::initiate("test-client");
        // Swap the exchange key after signing.
        let other = StaticSecret::random_from_rng(OsRng);
        request.public_key = BASE64.encode(PublicKey::from(&other).as_bytes());

        let result = server.process_handshake(&mut request, 60);
        assert!(matches!(result, Err(CryptoError::SignatureVerification)));
    }

    #[test]
    fn test_same_identity_same_client_id() {
        let server = server();
        let identity_a = IdentityKeyPair::generate();
        let secret = *identity_a.public_key_bytes();

        let (_, mut first) = ClientHandshake::initiate_with_identity(identity_a, "c");
        let (first_id, _, _) = server.process_handshake(&mut first, 60).unwrap();

        assert_eq!(first_id, client_id_for_identity(&secret));
    }

    #[test]
    fn test_distinct_handshakes_distinct_channels() {
        let server = server();
        let identity = IdentityKeyPair::generate();
        let identity_bytes = identity.secret_key_bytes();

        let (client_one, mut first) =
            ClientHandshake::initiate_with_identity(identity, "c");
        let (id_one, response_one, server_one) = server.process_handshake(&mut first, 60).unwrap();
        let channel_one = client_one.complete(&response_one, 60).unwrap();

        let identity = IdentityKeyPair::from_secret_key(identity_bytes.as_slice()).unwrap();
        let (client_two, mut second) = ClientHandshake::initiate_with_identity(identity, "c");
        let (id_two, response_two, server_two) =
            server.process_handshake(&mut second, 60).unwrap();
        let channel_two = client_two.complete(&response_two, 60).unwrap();

        // Same client id, different session keys.
        assert_eq!(id_one, id_two);
        let payload = json!({"n": 1});
        let from_two = channel_two.encrypt_json(&payload).unwrap();
        assert!(server_one.decrypt_json(&from_two).is_err());
        assert_eq!(server_two.decrypt_json(&from_two).unwrap(), payload);
        assert!(channel_one.client_id() == channel_two.client_id());
    }
}
