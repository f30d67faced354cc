//! Ed25519 identity key pairs with secure memory handling.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};

/// An Ed25519 key pair identifying one endpoint of the transport.
///
/// The secret key is zeroized on drop to prevent leaking sensitive
/// material.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)] // VerifyingKey doesn't implement Zeroize
    verifying_key: VerifyingKey,
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a new random key pair.
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            verifying_key,
            signing_key,
        }
    }

    /// Create from a secret key (32 bytes).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidLength`] if the slice is not
    /// exactly 32 bytes.
    pub fn from_secret_key(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidLength {
                field: "secret key",
                expected: 32,
                actual: bytes.len(),
            });
        }

        let mut secret = [0u8; 32];
        secret.copy_from_slice(bytes);

        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();

        secret.zeroize();

        Ok(Self {
            verifying_key,
            signing_key,
        })
    }

    /// The public key bytes (32 bytes).
    #[must_use]
    pub fn public_key_bytes(&self) -> &[u8; 32] {
        self.verifying_key.as_bytes()
    }

    /// Export the secret key bytes, e.g. for key-file persistence.
    ///
    /// The returned buffer zeroizes itself on drop.
    #[must_use]
    pub fn secret_key_bytes(&self) -> zeroize::Zeroizing<[u8; 32]> {
        zeroize::Zeroizing::new(self.signing_key.to_bytes())
    }

    /// The public key, base64-encoded for wire transport.
    #[must_use]
    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.public_key_bytes())
    }

    /// Sign a message.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Verify a signature made by a peer's identity key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SignatureVerification`] if the signature
    /// does not verify, and [`CryptoError::InvalidLength`] on malformed
    /// inputs.
    pub fn verify_peer(
        peer_public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> CryptoResult<()> {
        if peer_public_key.len() != 32 {
            return Err(CryptoError::InvalidLength {
                field: "public key",
                expected: 32,
                actual: peer_public_key.len(),
            });
        }
        if signature.len() != 64 {
            return Err(CryptoError::InvalidLength {
                field: "signature",
                expected: 64,
                actual: signature.len(),
            });
        }

        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(peer_public_key);
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| CryptoError::SignatureVerification)?;

        let mut sig_bytes = [0u8; 64];
        sig_bytes.copy_from_slice(signature);
        let signature = Signature::from_bytes(&sig_bytes);

        verifying_key
            .verify(message, &signature)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &self.public_key_b64())
            .finish_non_exhaustive()
    }
}
