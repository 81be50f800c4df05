//! Per-peer session: X3DH handshake output driving a Double Ratchet
//!
//! A `Session` is one end of an ordered peer pair. It is constructed by
//! either `initiate` (against a fetched bundle) or `respond` (from the
//! initiator's first payload), and from then on every 1:1 message goes
//! through its ratchet.

use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::keys::{IdentityKeyPair, OneTimePreKey, PreKeyBundle, SignedPreKey};
use crate::ratchet::{
    DoubleRatchet, MessageHeader, RatchetError, RatchetState, RatchetStep,
};
use crate::x3dh::{X3DHError, X3DH};

/// A secure messaging session with one peer.
pub struct Session {
    /// Peer identity agreement key, as pinned at establishment.
    remote_identity: X25519PublicKey,
    /// AEAD associated data from the handshake (both identity keys).
    associated_data: Vec<u8>,
    ratchet: DoubleRatchet,
}

impl Session {
    /// Create a session as the initiator against a peer's bundle.
    /// Returns the session plus the initiation payload for the peer.
    pub fn initiate(
        local_identity: &IdentityKeyPair,
        remote_bundle: &PreKeyBundle,
    ) -> Result<(Self, InitialMessage), SessionError> {
        let x3dh = X3DH::initiate(local_identity, remote_bundle)?;

        let ratchet = DoubleRatchet::init_sender(x3dh.shared_key(), &remote_bundle.signed_prekey);

        let initial = InitialMessage {
            identity_key: local_identity.public_key(),
            ephemeral_key: x3dh.ephemeral_public,
            signed_prekey_id: remote_bundle.signed_prekey_id,
            used_one_time_prekey_id: x3dh.used_one_time_prekey_id,
            ratchet_key: ratchet.public_key(),
        };

        Ok((
            Self {
                remote_identity: remote_bundle.identity_key,
                associated_data: x3dh.associated_data.clone(),
                ratchet,
            },
            initial,
        ))
    }

    /// Accept a session as the responder from an initiation payload.
    pub fn respond(
        local_identity: &IdentityKeyPair,
        signed_prekey: &SignedPreKey,
        one_time_prekey: Option<&OneTimePreKey>,
        initial: &InitialMessage,
    ) -> Result<Self, SessionError> {
        let x3dh = X3DH::respond(
            local_identity,
            signed_prekey,
            one_time_prekey,
            &initial.identity_key,
            &initial.ephemeral_key,
        )?;

        let ratchet = DoubleRatchet::init_receiver(
            x3dh.shared_key(),
            signed_prekey.private_key(),
            &initial.ratchet_key,
        );

        Ok(Self {
            remote_identity: initial.identity_key,
            associated_data: x3dh.associated_data.clone(),
            ratchet,
        })
    }

    /// Encrypt a message for the peer.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, SessionError> {
        let payload = self.ratchet.encrypt(plaintext, &self.associated_data)?;

        Ok(EncryptedMessage {
            ratchet_public: payload.header.ratchet_public.to_bytes(),
            counter: payload.header.message_number,
            previous_chain_length: payload.header.previous_chain_length,
            iv: payload.iv,
            ciphertext: payload.ciphertext,
        })
    }

    /// Decrypt a message from the peer. Besides the plaintext, the step
    /// reports any skipped message keys the caller must cache.
    pub fn decrypt(&mut self, message: &EncryptedMessage) -> Result<RatchetStep, SessionError> {
        let header = MessageHeader {
            ratchet_public: X25519PublicKey::from(message.ratchet_public),
            previous_chain_length: message.previous_chain_length,
            message_number: message.counter,
        };

        Ok(self
            .ratchet
            .decrypt(&header, &message.iv, &message.ciphertext, &self.associated_data)?)
    }

    /// Decrypt with a cached skipped message key. Does not touch the
    /// ratchet; the caller deletes the cache entry afterwards.
    pub fn decrypt_skipped(
        &self,
        message_key: &[u8; 32],
        message: &EncryptedMessage,
    ) -> Result<Vec<u8>, SessionError> {
        Ok(DoubleRatchet::decrypt_with_key(
            message_key,
            &message.iv,
            &message.ciphertext,
            &self.associated_data,
        )?)
    }

    pub fn remote_identity(&self) -> &X25519PublicKey {
        &self.remote_identity
    }

    /// Snapshot for persistence. Reflects the last committed transition.
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            remote_identity: self.remote_identity.to_bytes(),
            associated_data: self.associated_data.clone(),
            ratchet: self.ratchet.to_state(),
        }
    }

    pub fn from_record(record: &SessionRecord) -> Self {
        Self {
            remote_identity: X25519PublicKey::from(record.remote_identity),
            associated_data: record.associated_data.clone(),
            ratchet: DoubleRatchet::from_state(&record.ratchet),
        }
    }
}

/// Payload sent once to establish a session.
#[derive(Clone, Debug)]
pub struct InitialMessage {
    pub identity_key: X25519PublicKey,
    pub ephemeral_key: X25519PublicKey,
    /// Which signed pre-key the initiator ratcheted against, so the
    /// responder can resolve it even across a rotation.
    pub signed_prekey_id: u32,
    pub used_one_time_prekey_id: Option<u32>,
    /// Initiator's first ratchet public key.
    pub ratchet_key: X25519PublicKey,
}

impl InitialMessage {
    /// Serialize as an opaque signaling blob.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(105);
        bytes.extend_from_slice(self.identity_key.as_bytes());
        bytes.extend_from_slice(self.ephemeral_key.as_bytes());
        bytes.extend_from_slice(self.ratchet_key.as_bytes());
        bytes.extend_from_slice(&self.signed_prekey_id.to_le_bytes());
        match self.used_one_time_prekey_id {
            Some(id) => {
                bytes.push(1);
                bytes.extend_from_slice(&id.to_le_bytes());
            }
            None => bytes.push(0),
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        if bytes.len() < 101 {
            return Err(SessionError::DeserializationFailed);
        }
        let key = |range: std::ops::Range<usize>| -> Result<[u8; 32], SessionError> {
            bytes[range]
                .try_into()
                .map_err(|_| SessionError::DeserializationFailed)
        };
        let spk_id: [u8; 4] = bytes[96..100]
            .try_into()
            .map_err(|_| SessionError::DeserializationFailed)?;
        let used_one_time_prekey_id = match bytes[100] {
            0 => None,
            1 if bytes.len() >= 105 => {
                let id: [u8; 4] = bytes[101..105]
                    .try_into()
                    .map_err(|_| SessionError::DeserializationFailed)?;
                Some(u32::from_le_bytes(id))
            }
            _ => return Err(SessionError::DeserializationFailed),
        };
        Ok(Self {
            identity_key: X25519PublicKey::from(key(0..32)?),
            ephemeral_key: X25519PublicKey::from(key(32..64)?),
            ratchet_key: X25519PublicKey::from(key(64..96)?),
            signed_prekey_id: u32::from_le_bytes(spk_id),
            used_one_time_prekey_id,
        })
    }
}

/// Wire form of a ratchet-encrypted message. Associated data is derived
/// locally on both sides and never transmitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub ratchet_public: [u8; 32],
    pub counter: u32,
    pub previous_chain_length: u32,
    pub iv: [u8; 12],
    pub ciphertext: Vec<u8>,
}

impl EncryptedMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        serde_json::from_slice(bytes).map_err(|_| SessionError::DeserializationFailed)
    }
}

/// Persisted session state.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub remote_identity: [u8; 32],
    pub associated_data: Vec<u8>,
    pub ratchet: RatchetState,
}

impl SessionRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        serde_json::from_slice(bytes).map_err(|_| SessionError::DeserializationFailed)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("X3DH error: {0}")]
    X3DH(#[from] X3DHError),
    #[error("Ratchet error: {0}")]
    Ratchet(#[from] RatchetError),
    #[error("Deserialization failed")]
    DeserializationFailed,
}
