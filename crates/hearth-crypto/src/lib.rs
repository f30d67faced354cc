//! Session transport cryptography for the Hearth gateway runtime.
//!
//! Implements the out-of-band session negotiation used by every client
//! transport:
//!
//! 1. The client sends a handshake carrying its long-term Ed25519
//!    identity key, an ephemeral X25519 public key, and a signature
//!    binding the two together.
//! 2. The server verifies the signature, performs the X25519 exchange
//!    with its own ephemeral key, and derives a per-session
//!    XChaCha20-Poly1305 key via HKDF-SHA256.
//! 3. Both sides wrap JSON payloads in the resulting
//!    [`SessionChannel`] until the session expires.
//!
//! The handshake is one round trip; replaying it simply supersedes the
//! previous channel for that client identity.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod channel;
mod error;
mod handshake;
mod identity;

pub use channel::SessionChannel;
pub use error::{CryptoError, CryptoResult};
pub use handshake::{
    client_id_for_identity, ClientHandshake, HandshakeRequest, HandshakeResponse,
    TransportIdentity, ENCRYPTION_SCHEME,
};
pub use identity::IdentityKeyPair;
