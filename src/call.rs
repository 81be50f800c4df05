//! Per-call media frame encryption
//!
//! Each endpoint generates a random AES-128 key for its outgoing
//! frames and hands it to the peer opaquely through call signaling
//! (ideally wrapped by the pairwise ratchet). Frame transforms sit on
//! the real-time media path: a failed frame is dropped, never fatal to
//! the call, and encryption can fall back to passthrough when the
//! remote endpoint has no frame-transform support. Call keys are never
//! persisted.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes128Gcm, Nonce,
};
use rand::RngCore;
use zeroize::Zeroize;

/// Random IV prepended to every encrypted frame.
pub const FRAME_IV_SIZE: usize = 12;

/// GCM authentication tag appended by the cipher.
pub const FRAME_TAG_SIZE: usize = 16;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("Invalid call key material")]
    InvalidKey,
    #[error("Frame encryption failed")]
    EncryptionFailed,
    /// Authentication failure on one frame. Drop it and continue;
    /// media is loss-tolerant and there is no retry.
    #[error("Frame dropped: decryption failed")]
    FrameDropped,
    /// No peer key installed yet for incoming frames.
    #[error("Peer call key not installed")]
    NoPeerKey,
}

/// One endpoint's frame transforms for a single call.
pub struct CallCrypto {
    local_key: [u8; 16],
    peer_key: Option<[u8; 16]>,
    enabled: bool,
}

impl CallCrypto {
    /// Generate a fresh local key; scoped to this call only.
    pub fn new() -> Self {
        let mut local_key = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut local_key);
        Self {
            local_key,
            peer_key: None,
            enabled: true,
        }
    }

    /// Opaque key payload for the signaling exchange. The caller is
    /// expected to wrap it in the pairwise ratchet before sending.
    pub fn exchange_payload(&self) -> Vec<u8> {
        self.local_key.to_vec()
    }

    /// Install the peer's key received through signaling.
    pub fn install_peer_key(&mut self, payload: &[u8]) -> Result<(), CallError> {
        let key: [u8; 16] = payload.try_into().map_err(|_| CallError::InvalidKey)?;
        self.peer_key = Some(key);
        Ok(())
    }

    /// Fall back to plaintext frames for remote endpoints without
    /// frame-transform support. Does not break call setup.
    pub fn disable_encryption(&mut self) {
        self.enabled = false;
        tracing::warn!("call frame encryption disabled, falling back to plaintext");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Encrypt one outgoing frame: random IV prepended to ciphertext.
    pub fn encrypt_frame(&self, frame: &[u8]) -> Result<Vec<u8>, CallError> {
        if !self.enabled {
            return Ok(frame.to_vec());
        }

        let cipher =
            Aes128Gcm::new_from_slice(&self.local_key).map_err(|_| CallError::InvalidKey)?;
        let mut iv = [0u8; FRAME_IV_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), frame)
            .map_err(|_| CallError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(FRAME_IV_SIZE + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend(ciphertext);
        Ok(out)
    }

    /// Decrypt one incoming frame with the peer's key. A failure means
    /// this frame is dropped; the call continues.
    pub fn decrypt_frame(&self, frame: &[u8]) -> Result<Vec<u8>, CallError> {
        if !self.enabled {
            return Ok(frame.to_vec());
        }

        let peer_key = self.peer_key.ok_or(CallError::NoPeerKey)?;
        if frame.len() < FRAME_IV_SIZE + FRAME_TAG_SIZE {
            return Err(CallError::FrameDropped);
        }

        let cipher = Aes128Gcm::new_from_slice(&peer_key).map_err(|_| CallError::InvalidKey)?;
        cipher
            .decrypt(Nonce::from_slice(&frame[..FRAME_IV_SIZE]), &frame[FRAME_IV_SIZE..])
            .map_err(|_| CallError::FrameDropped)
    }
}

impl Default for CallCrypto {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallCrypto {
    fn drop(&mut self) {
        self.local_key.zeroize();
        if let Some(ref mut key) = self.peer_key {
            key.zeroize();
        }
    }
}
