//! Double Ratchet session state machine
//!
//! Turns an X3DH shared secret into an unbounded stream of single-use
//! message keys with forward secrecy and break-in recovery. Every
//! operation commits state only after its AEAD step succeeds; a failed
//! decrypt leaves the session at its pre-call snapshot.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// Maximum chain-key derivations allowed to fill a delivery gap.
/// Beyond this the message is rejected instead of grinding the CPU.
pub const MAX_SKIP: u32 = 1000;

/// Chain key for the symmetric ratchet.
#[derive(Clone)]
struct ChainKey {
    key: [u8; 32],
    index: u32,
}

impl ChainKey {
    fn new(key: [u8; 32]) -> Self {
        Self { key, index: 0 }
    }

    /// Derive the next message key and advance the chain. The step is
    /// one-way; prior message keys cannot be recovered from the chain.
    fn next(&mut self) -> [u8; 32] {
        let message_key = self.derive_key(0x01);
        self.key = self.derive_key(0x02);
        self.index += 1;
        message_key
    }

    fn derive_key(&self, constant: u8) -> [u8; 32] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key).unwrap();
        mac.update(&[constant]);
        let result = mac.finalize().into_bytes();
        let mut output = [0u8; 32];
        output.copy_from_slice(&result);
        output
    }
}

impl Drop for ChainKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Header carried alongside every ratchet-encrypted message.
#[derive(Clone, Debug)]
pub struct MessageHeader {
    /// Sender's current ratchet public key.
    pub ratchet_public: X25519PublicKey,
    /// Length of the sender's previous sending chain, for the peer's
    /// skipped-key bookkeeping across a ratchet step.
    pub previous_chain_length: u32,
    /// Position within the current sending chain.
    pub message_number: u32,
}

/// Output of a successful encrypt.
#[derive(Clone, Debug)]
pub struct RatchetPayload {
    pub header: MessageHeader,
    pub iv: [u8; 12],
    pub ciphertext: Vec<u8>,
}

/// Output of a successful decrypt: the plaintext plus any message keys
/// that were skipped over and must be cached for out-of-order delivery.
pub struct RatchetStep {
    pub plaintext: Vec<u8>,
    pub skipped: Vec<SkippedMessageKey>,
}

/// A message key cached because the receiving chain advanced past it.
/// Consumed at most once; expired entries are swept by the store.
#[derive(Clone, Serialize, Deserialize)]
pub struct SkippedMessageKey {
    pub ratchet_public: [u8; 32],
    pub message_number: u32,
    pub message_key: [u8; 32],
    /// Unix seconds, for age-based eviction.
    pub created_at: u64,
}

impl Drop for SkippedMessageKey {
    fn drop(&mut self) {
        self.message_key.zeroize();
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RatchetError {
    #[error("Ratchet not initialized")]
    NotInitialized,
    #[error("Encryption failed")]
    EncryptionFailed,
    /// Authentication failure, replay, or a key consumed earlier.
    /// The session state is unchanged.
    #[error("Decryption failed")]
    DecryptionFailed,
    /// The gap to the claimed counter exceeds [`MAX_SKIP`]. The peer
    /// should be asked to resync out of band.
    #[error("Too many skipped messages")]
    TooManySkippedMessages,
}

/// Serializable ratchet state, persisted as part of a session record.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    pub root_key: [u8; 32],
    pub dh_private: [u8; 32],
    pub remote_public: Option<[u8; 32]>,
    pub sending_chain: Option<([u8; 32], u32)>,
    pub receiving_chain: Option<([u8; 32], u32)>,
    pub previous_chain_length: u32,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_private.zeroize();
        if let Some((ref mut k, _)) = self.sending_chain {
            k.zeroize();
        }
        if let Some((ref mut k, _)) = self.receiving_chain {
            k.zeroize();
        }
    }
}

/// Per-peer Double Ratchet state.
#[derive(Clone)]
pub struct DoubleRatchet {
    dh_private: StaticSecret,
    dh_public: X25519PublicKey,
    remote_public: Option<X25519PublicKey>,
    root_key: [u8; 32],
    sending_chain: Option<ChainKey>,
    receiving_chain: Option<ChainKey>,
    previous_chain_length: u32,
}

impl DoubleRatchet {
    /// Initialize as the handshake initiator. Generates a fresh ratchet
    /// key pair and performs the first DH ratchet step against the
    /// peer's signed pre-key, producing the first sending chain.
    pub fn init_sender(shared_key: &[u8; 32], peer_signed_prekey: &X25519PublicKey) -> Self {
        let dh_private = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let dh_public = X25519PublicKey::from(&dh_private);

        let dh_output = dh_private.diffie_hellman(peer_signed_prekey);
        let (root_key, chain_key) = Self::kdf_rk(shared_key, dh_output.as_bytes());

        Self {
            dh_private,
            dh_public,
            remote_public: Some(*peer_signed_prekey),
            root_key,
            sending_chain: Some(ChainKey::new(chain_key)),
            receiving_chain: None,
            previous_chain_length: 0,
        }
    }

    /// Initialize as the handshake responder, seeded with the signed
    /// pre-key pair the initiator ratcheted against. Ratchets once with
    /// the initiator's first ratchet key so both chains exist from the
    /// start.
    pub fn init_receiver(
        shared_key: &[u8; 32],
        signed_prekey: &StaticSecret,
        sender_ratchet_key: &X25519PublicKey,
    ) -> Self {
        let dh_public = X25519PublicKey::from(signed_prekey);

        let mut ratchet = Self {
            dh_private: signed_prekey.clone(),
            dh_public,
            remote_public: None,
            root_key: *shared_key,
            sending_chain: None,
            receiving_chain: None,
            previous_chain_length: 0,
        };
        ratchet.dh_ratchet(sender_ratchet_key);
        ratchet
    }

    /// Our current ratchet public key (goes into outgoing headers).
    pub fn public_key(&self) -> X25519PublicKey {
        self.dh_public
    }

    /// Encrypt one message, binding `associated_data` into the AEAD.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<RatchetPayload, RatchetError> {
        let mut work = self.clone();

        let chain = work.sending_chain.as_mut().ok_or(RatchetError::NotInitialized)?;
        let message_number = chain.index;
        let message_key = chain.next();

        let (iv, ciphertext) = Self::aead_encrypt(&message_key, plaintext, associated_data)?;

        let header = MessageHeader {
            ratchet_public: work.dh_public,
            previous_chain_length: work.previous_chain_length,
            message_number,
        };

        *self = work;
        Ok(RatchetPayload {
            header,
            iv,
            ciphertext,
        })
    }

    /// Decrypt one message. On any error the state is untouched; the
    /// caller is expected to have consulted its skipped-key cache first
    /// for counters behind the current chain position.
    pub fn decrypt(
        &mut self,
        header: &MessageHeader,
        iv: &[u8; 12],
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<RatchetStep, RatchetError> {
        let mut work = self.clone();
        let mut skipped = Vec::new();

        let new_ratchet_key = match work.remote_public {
            Some(pk) => pk != header.ratchet_public,
            None => true,
        };
        if new_ratchet_key {
            // Cache the undelivered tail of the old receiving chain
            // before it becomes unreachable.
            work.skip_receiving(header.previous_chain_length, &mut skipped)?;
            work.dh_ratchet(&header.ratchet_public);
        }

        {
            let chain = work.receiving_chain.as_ref().ok_or(RatchetError::NotInitialized)?;
            if header.message_number < chain.index {
                // Key already consumed on this chain; only a cached
                // skipped key could decrypt it.
                tracing::debug!(
                    counter = header.message_number,
                    position = chain.index,
                    "ratchet: counter behind chain with no cached key"
                );
                return Err(RatchetError::DecryptionFailed);
            }
        }

        work.skip_receiving(header.message_number, &mut skipped)?;
        let message_key = work
            .receiving_chain
            .as_mut()
            .ok_or(RatchetError::NotInitialized)?
            .next();

        let plaintext = Self::aead_decrypt(&message_key, iv, ciphertext, associated_data)?;

        *self = work;
        Ok(RatchetStep { plaintext, skipped })
    }

    /// Decrypt with a previously cached skipped message key. Stateless;
    /// the caller deletes the cache entry on success.
    pub fn decrypt_with_key(
        message_key: &[u8; 32],
        iv: &[u8; 12],
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        Self::aead_decrypt(message_key, iv, ciphertext, associated_data)
    }

    /// Advance the receiving chain up to `until`, caching every skipped
    /// message key, keyed by the peer ratchet key the chain belongs to.
    fn skip_receiving(
        &mut self,
        until: u32,
        out: &mut Vec<SkippedMessageKey>,
    ) -> Result<(), RatchetError> {
        let Some(remote) = self.remote_public else {
            return Ok(());
        };
        let Some(chain) = self.receiving_chain.as_mut() else {
            return Ok(());
        };
        if until > chain.index && until - chain.index > MAX_SKIP {
            return Err(RatchetError::TooManySkippedMessages);
        }
        while chain.index < until {
            let message_number = chain.index;
            let message_key = chain.next();
            out.push(SkippedMessageKey {
                ratchet_public: remote.to_bytes(),
                message_number,
                message_key,
                created_at: unix_now(),
            });
        }
        Ok(())
    }

    /// DH ratchet step: new receiving chain from the peer's new key,
    /// then a fresh own key pair and a new sending chain.
    fn dh_ratchet(&mut self, their_public: &X25519PublicKey) {
        self.remote_public = Some(*their_public);
        self.previous_chain_length =
            self.sending_chain.as_ref().map(|c| c.index).unwrap_or(0);

        let dh_recv = self.dh_private.diffie_hellman(their_public);
        let (root_key, recv_chain_key) = Self::kdf_rk(&self.root_key, dh_recv.as_bytes());
        self.root_key = root_key;
        self.receiving_chain = Some(ChainKey::new(recv_chain_key));

        self.dh_private = StaticSecret::random_from_rng(rand::rngs::OsRng);
        self.dh_public = X25519PublicKey::from(&self.dh_private);

        let dh_send = self.dh_private.diffie_hellman(their_public);
        let (root_key, send_chain_key) = Self::kdf_rk(&self.root_key, dh_send.as_bytes());
        self.root_key = root_key;
        self.sending_chain = Some(ChainKey::new(send_chain_key));
    }

    /// Root key derivation: HKDF-SHA256 keyed by the root key over the
    /// DH output, yielding a new root key and a chain key.
    fn kdf_rk(root_key: &[u8; 32], dh_output: &[u8]) -> ([u8; 32], [u8; 32]) {
        let hk = Hkdf::<Sha256>::new(Some(root_key), dh_output);
        let mut output = [0u8; 64];
        hk.expand(b"e2ee-core/ratchet", &mut output).unwrap();

        let mut new_root = [0u8; 32];
        let mut chain_key = [0u8; 32];
        new_root.copy_from_slice(&output[..32]);
        chain_key.copy_from_slice(&output[32..]);

        output.zeroize();
        (new_root, chain_key)
    }

    fn aead_encrypt(
        key: &[u8; 32],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<([u8; 12], Vec<u8>), RatchetError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| RatchetError::EncryptionFailed)?;

        let mut iv = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|_| RatchetError::EncryptionFailed)?;

        Ok((iv, ciphertext))
    }

    fn aead_decrypt(
        key: &[u8; 32],
        iv: &[u8; 12],
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| RatchetError::DecryptionFailed)?;

        cipher
            .decrypt(
                Nonce::from_slice(iv),
                Payload {
                    msg: ciphertext,
                    aad: associated_data,
                },
            )
            .map_err(|_| RatchetError::DecryptionFailed)
    }

    /// Snapshot for persistence.
    pub fn to_state(&self) -> RatchetState {
        RatchetState {
            root_key: self.root_key,
            dh_private: self.dh_private.to_bytes(),
            remote_public: self.remote_public.map(|pk| pk.to_bytes()),
            sending_chain: self.sending_chain.as_ref().map(|c| (c.key, c.index)),
            receiving_chain: self.receiving_chain.as_ref().map(|c| (c.key, c.index)),
            previous_chain_length: self.previous_chain_length,
        }
    }

    /// Restore from a persisted snapshot.
    pub fn from_state(state: &RatchetState) -> Self {
        let dh_private = StaticSecret::from(state.dh_private);
        let dh_public = X25519PublicKey::from(&dh_private);
        Self {
            dh_private,
            dh_public,
            remote_public: state.remote_public.map(X25519PublicKey::from),
            root_key: state.root_key,
            sending_chain: state
                .sending_chain
                .map(|(key, index)| ChainKey { key, index }),
            receiving_chain: state
                .receiving_chain
                .map(|(key, index)| ChainKey { key, index }),
            previous_chain_length: state.previous_chain_length,
        }
    }
}

impl Drop for DoubleRatchet {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
