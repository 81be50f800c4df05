//! Key material for the encryption engine
//!
//! Identity key pairs, signed pre-keys, one-time pre-keys, and the
//! public pre-key bundle published to the directory service.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Long-term identity: Ed25519 for signing, X25519 for key agreement.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    x25519_private: StaticSecret,
    x25519_public: X25519PublicKey,
}

impl IdentityKeyPair {
    /// Generate a new identity key pair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);

        // The X25519 agreement key is derived from the Ed25519 seed so a
        // single 64-byte record restores the whole identity.
        let private_bytes = signing_key.to_bytes();
        let x25519_private = StaticSecret::from(private_bytes);
        let x25519_public = X25519PublicKey::from(&x25519_private);

        Self {
            signing_key,
            x25519_private,
            x25519_public,
        }
    }

    /// Ed25519 public key used to verify pre-key signatures.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// X25519 public key used in key agreement.
    pub fn public_key(&self) -> X25519PublicKey {
        self.x25519_public
    }

    pub(crate) fn private_key(&self) -> &StaticSecret {
        &self.x25519_private
    }

    /// Sign data with the identity signing key.
    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.x25519_public.to_bytes()
    }

    /// Serialize for storage (signing seed + agreement secret).
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.signing_key.to_bytes());
        bytes[32..].copy_from_slice(&self.x25519_private.to_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Result<Self, KeyError> {
        let signing_bytes: [u8; 32] =
            bytes[..32].try_into().map_err(|_| KeyError::InvalidFormat)?;
        let signing_key = SigningKey::from_bytes(&signing_bytes);

        let private_bytes: [u8; 32] =
            bytes[32..].try_into().map_err(|_| KeyError::InvalidFormat)?;
        let x25519_private = StaticSecret::from(private_bytes);
        let x25519_public = X25519PublicKey::from(&x25519_private);

        Ok(Self {
            signing_key,
            x25519_private,
            x25519_public,
        })
    }
}

/// Medium-term pre-key, signed by the identity key and rotated periodically.
#[derive(Clone)]
pub struct SignedPreKey {
    pub id: u32,
    private_key: StaticSecret,
    public_key: X25519PublicKey,
    signature: Signature,
}

impl SignedPreKey {
    pub fn generate(id: u32, identity: &IdentityKeyPair) -> Self {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = X25519PublicKey::from(&private_key);
        let signature = identity.sign(public_key.as_bytes());

        Self {
            id,
            private_key,
            public_key,
            signature,
        }
    }

    pub fn public_key(&self) -> X25519PublicKey {
        self.public_key
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub(crate) fn private_key(&self) -> &StaticSecret {
        &self.private_key
    }

    /// Verify the signature against the owning identity's verifying key.
    pub fn verify(&self, identity_public: &VerifyingKey) -> bool {
        identity_public
            .verify(self.public_key.as_bytes(), &self.signature)
            .is_ok()
    }
}

/// Single-use pre-key, removed from the local pool once consumed.
#[derive(Clone)]
pub struct OneTimePreKey {
    pub id: u32,
    private_key: StaticSecret,
    public_key: X25519PublicKey,
}

impl OneTimePreKey {
    pub fn generate(id: u32) -> Self {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = X25519PublicKey::from(&private_key);

        Self {
            id,
            private_key,
            public_key,
        }
    }

    pub fn public_key(&self) -> X25519PublicKey {
        self.public_key
    }

    pub(crate) fn private_key(&self) -> &StaticSecret {
        &self.private_key
    }
}

/// Public pre-key bundle published to the directory service.
#[derive(Clone, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Identity agreement key (X25519).
    pub identity_key: X25519PublicKey,
    /// Identity verifying key (Ed25519).
    pub signing_key: VerifyingKey,
    pub signed_prekey: X25519PublicKey,
    pub signed_prekey_id: u32,
    pub signed_prekey_signature: Signature,
    /// Optional single-use pre-key, `(id, public)`.
    pub one_time_prekey: Option<(u32, X25519PublicKey)>,
}

impl PreKeyBundle {
    pub fn new(
        identity: &IdentityKeyPair,
        signed_prekey: &SignedPreKey,
        one_time_prekey: Option<&OneTimePreKey>,
    ) -> Self {
        Self {
            identity_key: identity.public_key(),
            signing_key: identity.verifying_key(),
            signed_prekey: signed_prekey.public_key(),
            signed_prekey_id: signed_prekey.id,
            signed_prekey_signature: signed_prekey.signature(),
            one_time_prekey: one_time_prekey.map(|k| (k.id, k.public_key())),
        }
    }

    /// Verify the signed pre-key signature.
    pub fn verify(&self) -> bool {
        self.signing_key
            .verify(self.signed_prekey.as_bytes(), &self.signed_prekey_signature)
            .is_ok()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid key format")]
    InvalidFormat,
    #[error("Signature verification failed")]
    SignatureInvalid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation() {
        let identity = IdentityKeyPair::generate();
        assert_eq!(identity.public_key_bytes().len(), 32);
    }

    #[test]
    fn test_identity_serialization() {
        let identity = IdentityKeyPair::generate();
        let bytes = identity.to_bytes();
        let restored = IdentityKeyPair::from_bytes(&bytes).unwrap();
        assert_eq!(identity.public_key_bytes(), restored.public_key_bytes());
        assert_eq!(
            identity.verifying_key().as_bytes(),
            restored.verifying_key().as_bytes()
        );
    }

    #[test]
    fn test_signed_prekey_verifies() {
        let identity = IdentityKeyPair::generate();
        let prekey = SignedPreKey::generate(1, &identity);
        assert!(prekey.verify(&identity.verifying_key()));
    }

    #[test]
    fn test_signed_prekey_wrong_identity_fails() {
        let identity = IdentityKeyPair::generate();
        let other = IdentityKeyPair::generate();
        let prekey = SignedPreKey::generate(1, &identity);
        assert!(!prekey.verify(&other.verifying_key()));
    }

    #[test]
    fn test_bundle_verifies() {
        let identity = IdentityKeyPair::generate();
        let prekey = SignedPreKey::generate(1, &identity);
        let otpk = OneTimePreKey::generate(7);

        let bundle = PreKeyBundle::new(&identity, &prekey, Some(&otpk));
        assert!(bundle.verify());
        assert_eq!(bundle.one_time_prekey.map(|(id, _)| id), Some(7));
    }

    #[test]
    fn test_bundle_tampered_signature_fails() {
        let identity = IdentityKeyPair::generate();
        let prekey = SignedPreKey::generate(1, &identity);

        let mut bundle = PreKeyBundle::new(&identity, &prekey, None);
        let mut sig = bundle.signed_prekey_signature.to_bytes();
        sig[0] ^= 0x01;
        bundle.signed_prekey_signature = Signature::from_bytes(&sig);
        assert!(!bundle.verify());
    }
}
