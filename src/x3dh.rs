//! X3DH (Extended Triple Diffie-Hellman) key agreement
//!
//! One-shot asynchronous handshake deriving an initial shared secret
//! from a published pre-key bundle, for both initiator and responder.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::keys::{IdentityKeyPair, OneTimePreKey, PreKeyBundle, SignedPreKey};

/// HKDF domain separation string.
const X3DH_INFO: &[u8] = b"e2ee-core/x3dh";

/// Output of one X3DH run; consumed immediately to seed a session.
pub struct X3DHResult {
    shared_key: [u8; 32],
    /// Associated data bound into every AEAD of the resulting session:
    /// initiator identity key followed by responder identity key.
    pub associated_data: Vec<u8>,
    /// Ephemeral public key (transmitted to the responder).
    pub ephemeral_public: X25519PublicKey,
    /// Which one-time pre-key was consumed, if any.
    pub used_one_time_prekey_id: Option<u32>,
}

impl X3DHResult {
    pub fn shared_key(&self) -> &[u8; 32] {
        &self.shared_key
    }
}

impl Drop for X3DHResult {
    fn drop(&mut self) {
        self.shared_key.zeroize();
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum X3DHError {
    /// The signed pre-key signature did not verify. Possible MITM;
    /// fatal to the handshake, never fall back silently.
    #[error("Invalid signed pre-key signature")]
    SignatureInvalid,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

pub struct X3DH;

impl X3DH {
    /// Initiator side: run the handshake against a fetched bundle.
    pub fn initiate(
        identity: &IdentityKeyPair,
        peer_bundle: &PreKeyBundle,
    ) -> Result<X3DHResult, X3DHError> {
        if !peer_bundle.verify() {
            tracing::warn!("x3dh: signed pre-key signature rejected");
            return Err(X3DHError::SignatureInvalid);
        }

        let ephemeral_private = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = X25519PublicKey::from(&ephemeral_private);

        // DH1 = DH(IK_A, SPK_B)
        let dh1 = identity.private_key().diffie_hellman(&peer_bundle.signed_prekey);
        // DH2 = DH(EK_A, IK_B)
        let dh2 = ephemeral_private.diffie_hellman(&peer_bundle.identity_key);
        // DH3 = DH(EK_A, SPK_B)
        let dh3 = ephemeral_private.diffie_hellman(&peer_bundle.signed_prekey);
        // DH4 = DH(EK_A, OPK_B), only when the bundle offers a one-time key
        let dh4 = peer_bundle
            .one_time_prekey
            .as_ref()
            .map(|(_, opk)| ephemeral_private.diffie_hellman(opk));

        let mut dh_concat = Vec::with_capacity(128);
        dh_concat.extend_from_slice(dh1.as_bytes());
        dh_concat.extend_from_slice(dh2.as_bytes());
        dh_concat.extend_from_slice(dh3.as_bytes());
        if let Some(ref dh4) = dh4 {
            dh_concat.extend_from_slice(dh4.as_bytes());
        }

        let shared_key = Self::kdf(&dh_concat)?;
        dh_concat.zeroize();

        let mut associated_data = Vec::with_capacity(64);
        associated_data.extend_from_slice(identity.public_key().as_bytes());
        associated_data.extend_from_slice(peer_bundle.identity_key.as_bytes());

        Ok(X3DHResult {
            shared_key,
            associated_data,
            ephemeral_public,
            used_one_time_prekey_id: peer_bundle.one_time_prekey.as_ref().map(|(id, _)| *id),
        })
    }

    /// Responder side: mirror the agreements with operands swapped.
    ///
    /// No signature check here; the initiator verified our published
    /// signature before sending. Whether a one-time key participated is
    /// agreed via the id carried in the initiation payload.
    pub fn respond(
        identity: &IdentityKeyPair,
        signed_prekey: &SignedPreKey,
        one_time_prekey: Option<&OneTimePreKey>,
        sender_identity_key: &X25519PublicKey,
        sender_ephemeral_key: &X25519PublicKey,
    ) -> Result<X3DHResult, X3DHError> {
        // DH1 = DH(SPK_B, IK_A)
        let dh1 = signed_prekey.private_key().diffie_hellman(sender_identity_key);
        // DH2 = DH(IK_B, EK_A)
        let dh2 = identity.private_key().diffie_hellman(sender_ephemeral_key);
        // DH3 = DH(SPK_B, EK_A)
        let dh3 = signed_prekey.private_key().diffie_hellman(sender_ephemeral_key);
        // DH4 = DH(OPK_B, EK_A)
        let dh4 = one_time_prekey.map(|opk| opk.private_key().diffie_hellman(sender_ephemeral_key));

        let mut dh_concat = Vec::with_capacity(128);
        dh_concat.extend_from_slice(dh1.as_bytes());
        dh_concat.extend_from_slice(dh2.as_bytes());
        dh_concat.extend_from_slice(dh3.as_bytes());
        if let Some(ref dh4) = dh4 {
            dh_concat.extend_from_slice(dh4.as_bytes());
        }

        let shared_key = Self::kdf(&dh_concat)?;
        dh_concat.zeroize();

        // Same byte order as the initiator: sender first.
        let mut associated_data = Vec::with_capacity(64);
        associated_data.extend_from_slice(sender_identity_key.as_bytes());
        associated_data.extend_from_slice(identity.public_key().as_bytes());

        Ok(X3DHResult {
            shared_key,
            associated_data,
            ephemeral_public: *sender_ephemeral_key,
            used_one_time_prekey_id: one_time_prekey.map(|k| k.id),
        })
    }

    /// HKDF-SHA256 over the concatenated agreements, with the standard
    /// 32-byte 0xFF prefix as input key material padding.
    fn kdf(input: &[u8]) -> Result<[u8; 32], X3DHError> {
        let mut ikm = vec![0xFFu8; 32];
        ikm.extend_from_slice(input);

        let hk = Hkdf::<Sha256>::new(None, &ikm);
        let mut output = [0u8; 32];
        hk.expand(X3DH_INFO, &mut output)
            .map_err(|_| X3DHError::KeyDerivationFailed)?;

        ikm.zeroize();
        Ok(output)
    }
}
