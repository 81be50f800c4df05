//! Group message encryption
//!
//! Each room has a symmetric AES-256 key, distributed to members over
//! their pairwise ratchet sessions and then used directly for room
//! messages. Keys are versioned; membership removal forces a new
//! version so removed members cannot read anything sent afterwards,
//! while retained old versions keep already-received history readable
//! until explicitly purged.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zeroize::Zeroize;

use crate::key_manager::{BundleDirectory, DirectoryError};
use crate::keys::IdentityKeyPair;
use crate::manager::{EngineError, SessionManager};
use crate::session::{EncryptedMessage, InitialMessage};
use crate::store::{SessionStore, StoreError};

/// One version of a room's symmetric key.
#[derive(Clone, Serialize, Deserialize)]
pub struct GroupKey {
    pub room_id: String,
    pub key: [u8; 32],
    pub version: u32,
}

impl GroupKey {
    fn generate(room_id: &str, version: u32) -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self {
            room_id: room_id.to_string(),
            key,
            version,
        }
    }
}

impl Drop for GroupKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// All retained key versions for a room, ascending by version.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct GroupKeyRing {
    pub room_id: String,
    pub keys: Vec<GroupKey>,
}

impl GroupKeyRing {
    pub fn current(&self) -> Option<&GroupKey> {
        self.keys.last()
    }

    pub fn by_version(&self, version: u32) -> Option<&GroupKey> {
        self.keys.iter().find(|k| k.version == version)
    }

    fn insert(&mut self, key: GroupKey) {
        if self.by_version(key.version).is_none() {
            self.keys.push(key);
            self.keys.sort_by_key(|k| k.version);
        }
    }
}

/// A room message: ciphertext tagged with the key version used.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupCiphertext {
    pub version: u32,
    pub iv: [u8; 12],
    pub ciphertext: Vec<u8>,
}

/// Per-member outcome of a key distribution round.
pub struct DistributionOutcome {
    pub member: String,
    pub result: Result<MemberDelivery, GroupError>,
}

/// What to deliver to one member: an optional handshake payload (when
/// a pairwise session had to be established first) and the wrapped key.
pub struct MemberDelivery {
    pub handshake: Option<InitialMessage>,
    pub wrapped_key: EncryptedMessage,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GroupError {
    #[error("No group key for room {0}")]
    NoGroupKey(String),
    #[error("Unknown group key version {version} for room {room_id}")]
    UnknownVersion { room_id: String, version: u32 },
    #[error("Member {0} has no published bundle")]
    PeerNotFound(String),
    #[error("Group encryption failed")]
    EncryptionFailed,
    #[error("Group decryption failed")]
    DecryptionFailed,
    #[error("Malformed group key payload")]
    MalformedKeyPayload,
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub struct GroupCrypto<S: SessionStore> {
    store: Arc<S>,
}

impl<S: SessionStore> GroupCrypto<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Create a fresh key for the room: version 1, or previous + 1.
    /// The new version immediately becomes current.
    pub async fn create_key(&self, room_id: &str) -> Result<GroupKey, GroupError> {
        let mut ring = self
            .store
            .get_group_key(room_id)
            .await?
            .unwrap_or_else(|| GroupKeyRing {
                room_id: room_id.to_string(),
                keys: Vec::new(),
            });

        let version = ring.current().map(|k| k.version + 1).unwrap_or(1);
        let key = GroupKey::generate(room_id, version);
        ring.insert(key.clone());
        self.store.save_group_key(&ring).await?;
        tracing::debug!(room_id, version, "group key created");
        Ok(key)
    }

    /// Rotate after membership shrinks. Identical mechanics to
    /// `create_key`; the point is that the removed member never gets
    /// the new version.
    pub async fn rotate_key(&self, room_id: &str) -> Result<GroupKey, GroupError> {
        self.create_key(room_id).await
    }

    /// Wrap the current room key for each member over their pairwise
    /// session, establishing sessions via the directory where missing.
    /// Partial failure is reported per member and does not block the
    /// rest; failed members are retried by the caller.
    pub async fn distribute(
        &self,
        manager: &mut SessionManager<S>,
        local_identity: &IdentityKeyPair,
        directory: &dyn BundleDirectory,
        room_id: &str,
        members: &[String],
    ) -> Result<Vec<DistributionOutcome>, GroupError> {
        let ring = self
            .store
            .get_group_key(room_id)
            .await?
            .ok_or_else(|| GroupError::NoGroupKey(room_id.to_string()))?;
        let key = ring
            .current()
            .ok_or_else(|| GroupError::NoGroupKey(room_id.to_string()))?;
        let payload = serde_json::to_vec(key).map_err(|_| GroupError::MalformedKeyPayload)?;

        let mut outcomes = Vec::with_capacity(members.len());
        for member in members {
            let result = self
                .deliver_to_member(manager, local_identity, directory, member, &payload)
                .await;
            if let Err(ref e) = result {
                tracing::warn!(member, error = %e, "group key delivery failed");
            }
            outcomes.push(DistributionOutcome {
                member: member.clone(),
                result,
            });
        }
        Ok(outcomes)
    }

    async fn deliver_to_member(
        &self,
        manager: &mut SessionManager<S>,
        local_identity: &IdentityKeyPair,
        directory: &dyn BundleDirectory,
        member: &str,
        payload: &[u8],
    ) -> Result<MemberDelivery, GroupError> {
        let handshake = if manager.has_session(member).await? {
            None
        } else {
            let bundle = directory
                .fetch(member)
                .await?
                .ok_or_else(|| GroupError::PeerNotFound(member.to_string()))?;
            Some(
                manager
                    .initiate_session(local_identity, member, &bundle)
                    .await?,
            )
        };

        let wrapped_key = manager.encrypt_message(member, payload).await?;
        Ok(MemberDelivery {
            handshake,
            wrapped_key,
        })
    }

    /// Unwrap a received room key and retain it under its version.
    pub async fn receive_key(
        &self,
        manager: &mut SessionManager<S>,
        sender: &str,
        wrapped: &EncryptedMessage,
    ) -> Result<GroupKey, GroupError> {
        let plaintext = manager.decrypt_message(sender, wrapped).await?;
        let key: GroupKey =
            serde_json::from_slice(&plaintext).map_err(|_| GroupError::MalformedKeyPayload)?;

        let mut ring = self
            .store
            .get_group_key(&key.room_id)
            .await?
            .unwrap_or_else(|| GroupKeyRing {
                room_id: key.room_id.clone(),
                keys: Vec::new(),
            });
        ring.insert(key.clone());
        self.store.save_group_key(&ring).await?;
        tracing::debug!(room_id = %key.room_id, version = key.version, sender, "group key received");
        Ok(key)
    }

    /// Encrypt a room message with the current key version.
    pub async fn encrypt(
        &self,
        room_id: &str,
        plaintext: &[u8],
    ) -> Result<GroupCiphertext, GroupError> {
        let ring = self
            .store
            .get_group_key(room_id)
            .await?
            .ok_or_else(|| GroupError::NoGroupKey(room_id.to_string()))?;
        let key = ring
            .current()
            .ok_or_else(|| GroupError::NoGroupKey(room_id.to_string()))?;

        let cipher =
            Aes256Gcm::new_from_slice(&key.key).map_err(|_| GroupError::EncryptionFailed)?;
        let mut iv = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: plaintext,
                    aad: room_id.as_bytes(),
                },
            )
            .map_err(|_| GroupError::EncryptionFailed)?;

        Ok(GroupCiphertext {
            version: key.version,
            iv,
            ciphertext,
        })
    }

    /// Decrypt a room message with whatever retained version it names.
    /// Old versions keep working until purged.
    pub async fn decrypt(
        &self,
        room_id: &str,
        message: &GroupCiphertext,
    ) -> Result<Vec<u8>, GroupError> {
        let ring = self
            .store
            .get_group_key(room_id)
            .await?
            .ok_or_else(|| GroupError::NoGroupKey(room_id.to_string()))?;
        let key = ring
            .by_version(message.version)
            .ok_or_else(|| GroupError::UnknownVersion {
                room_id: room_id.to_string(),
                version: message.version,
            })?;

        let cipher =
            Aes256Gcm::new_from_slice(&key.key).map_err(|_| GroupError::DecryptionFailed)?;
        cipher
            .decrypt(
                Nonce::from_slice(&message.iv),
                Payload {
                    msg: &message.ciphertext,
                    aad: room_id.as_bytes(),
                },
            )
            .map_err(|_| GroupError::DecryptionFailed)
    }

    /// Discard an old key version once its history is no longer needed.
    pub async fn purge_version(&self, room_id: &str, version: u32) -> Result<(), GroupError> {
        let Some(mut ring) = self.store.get_group_key(room_id).await? else {
            return Ok(());
        };
        ring.keys.retain(|k| k.version != version);
        self.store.save_group_key(&ring).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_manager::{KeyManager, MemoryDirectory};
    use crate::store::MemoryStore;

    struct Member {
        keys: KeyManager,
        manager: SessionManager<MemoryStore>,
        group: GroupCrypto<MemoryStore>,
    }

    fn member(name: &str) -> Member {
        let store = Arc::new(MemoryStore::new());
        Member {
            keys: KeyManager::generate(name),
            manager: SessionManager::new(store.clone()),
            group: GroupCrypto::new(store),
        }
    }

    /// Deliver a wrapped key into the recipient's engine (established
    /// sessions only; the bootstrap test handles the handshake case).
    async fn apply_delivery(sender: &str, to: &mut Member, delivery: &MemberDelivery) {
        assert!(delivery.handshake.is_none());
        to.group
            .receive_key(&mut to.manager, sender, &delivery.wrapped_key)
            .await
            .unwrap();
    }

    async fn establish(a: &mut Member, a_name: &str, b: &mut Member, b_name: &str) {
        let bundle = b.keys.bundle();
        let initial = a
            .manager
            .initiate_session(a.keys.identity(), b_name, &bundle)
            .await
            .unwrap();
        let otpk = initial
            .used_one_time_prekey_id
            .and_then(|id| b.keys.consume_one_time_prekey(id));
        b.manager
            .accept_session(
                b.keys.identity(),
                a_name,
                b.keys.signed_prekey(),
                otpk.as_ref(),
                &initial,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_distribute_and_room_round_trip() {
        let mut alice = member("alice");
        let mut bob = member("bob");
        establish(&mut alice, "alice", &mut bob, "bob").await;

        alice.group.create_key("room-1").await.unwrap();
        let directory = MemoryDirectory::new();
        let outcomes = alice
            .group
            .distribute(
                &mut alice.manager,
                alice.keys.identity(),
                &directory,
                "room-1",
                &["bob".to_string()],
            )
            .await
            .unwrap();
        let delivery = outcomes[0].result.as_ref().unwrap();
        apply_delivery("alice", &mut bob, delivery).await;

        let msg = alice.group.encrypt("room-1", b"hello room").await.unwrap();
        assert_eq!(msg.version, 1);
        assert_eq!(
            bob.group.decrypt("room-1", &msg).await.unwrap(),
            b"hello room"
        );

        // Bob can also send with the shared key.
        let reply = bob.group.encrypt("room-1", b"hi all").await.unwrap();
        assert_eq!(alice.group.decrypt("room-1", &reply).await.unwrap(), b"hi all");
    }

    #[tokio::test]
    async fn test_rotation_locks_out_removed_member() {
        let mut alice = member("alice");
        let mut bob = member("bob");
        let mut mallory = member("mallory");
        establish(&mut alice, "alice", &mut bob, "bob").await;
        establish(&mut alice, "alice", &mut mallory, "mallory").await;

        alice.group.create_key("room-1").await.unwrap();
        let directory = MemoryDirectory::new();
        let outcomes = alice
            .group
            .distribute(
                &mut alice.manager,
                alice.keys.identity(),
                &directory,
                "room-1",
                &["bob".to_string(), "mallory".to_string()],
            )
            .await
            .unwrap();
        for outcome in &outcomes {
            let delivery = outcome.result.as_ref().unwrap();
            let target = if outcome.member == "bob" { &mut bob } else { &mut mallory };
            apply_delivery("alice", target, delivery).await;
        }

        let v1_msg = alice.group.encrypt("room-1", b"everyone").await.unwrap();
        assert!(mallory.group.decrypt("room-1", &v1_msg).await.is_ok());

        // Mallory is removed; rotate and redistribute to Bob only.
        alice.group.rotate_key("room-1").await.unwrap();
        let outcomes = alice
            .group
            .distribute(
                &mut alice.manager,
                alice.keys.identity(),
                &directory,
                "room-1",
                &["bob".to_string()],
            )
            .await
            .unwrap();
        apply_delivery("alice", &mut bob, outcomes[0].result.as_ref().unwrap()).await;

        let v2_msg = alice.group.encrypt("room-1", b"without mallory").await.unwrap();
        assert_eq!(v2_msg.version, 2);

        // Bob reads both the new message and the old history.
        assert_eq!(
            bob.group.decrypt("room-1", &v2_msg).await.unwrap(),
            b"without mallory"
        );
        assert_eq!(
            bob.group.decrypt("room-1", &v1_msg).await.unwrap(),
            b"everyone"
        );

        // Mallory holds only version 1 and cannot read version 2.
        assert!(matches!(
            mallory.group.decrypt("room-1", &v2_msg).await,
            Err(GroupError::UnknownVersion { version: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_partial_failure_does_not_block_others() {
        let mut alice = member("alice");
        let mut bob = member("bob");
        establish(&mut alice, "alice", &mut bob, "bob").await;

        alice.group.create_key("room-1").await.unwrap();
        let directory = MemoryDirectory::new();
        let outcomes = alice
            .group
            .distribute(
                &mut alice.manager,
                alice.keys.identity(),
                &directory,
                "room-1",
                &["ghost".to_string(), "bob".to_string()],
            )
            .await
            .unwrap();

        assert!(matches!(
            outcomes[0].result,
            Err(GroupError::PeerNotFound(_))
        ));
        assert!(outcomes[1].result.is_ok());
    }

    #[tokio::test]
    async fn test_distribution_establishes_missing_session() {
        let mut alice = member("alice");
        let mut bob = member("bob");

        // Bob has published a bundle but no session exists yet.
        let directory = MemoryDirectory::new();
        bob.keys.publish_bundle(&directory).await.unwrap();

        alice.group.create_key("room-1").await.unwrap();
        let outcomes = alice
            .group
            .distribute(
                &mut alice.manager,
                alice.keys.identity(),
                &directory,
                "room-1",
                &["bob".to_string()],
            )
            .await
            .unwrap();

        let delivery = outcomes[0].result.as_ref().unwrap();
        let handshake = delivery.handshake.as_ref().expect("handshake included");

        // Bob processes the handshake, then the wrapped key.
        let otpk = handshake
            .used_one_time_prekey_id
            .and_then(|id| bob.keys.consume_one_time_prekey(id));
        bob.manager
            .accept_session(
                bob.keys.identity(),
                "alice",
                bob.keys.signed_prekey(),
                otpk.as_ref(),
                handshake,
            )
            .await
            .unwrap();
        bob.group
            .receive_key(&mut bob.manager, "alice", &delivery.wrapped_key)
            .await
            .unwrap();

        let msg = alice.group.encrypt("room-1", b"bootstrap").await.unwrap();
        assert_eq!(bob.group.decrypt("room-1", &msg).await.unwrap(), b"bootstrap");
    }

    #[tokio::test]
    async fn test_purged_version_rejected() {
        let alice = member("alice");
        alice.group.create_key("room-1").await.unwrap();
        let msg = alice.group.encrypt("room-1", b"old").await.unwrap();

        alice.group.rotate_key("room-1").await.unwrap();
        assert!(alice.group.decrypt("room-1", &msg).await.is_ok());

        alice.group.purge_version("room-1", 1).await.unwrap();
        assert!(matches!(
            alice.group.decrypt("room-1", &msg).await,
            Err(GroupError::UnknownVersion { version: 1, .. })
        ));
    }
}
