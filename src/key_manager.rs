//! Local key material lifecycle
//!
//! Owns the identity key pair, the current (and previous) signed
//! pre-key, and the one-time pre-key pool; publishes bundles to the
//! directory service and hands consumed pre-keys to the responder side
//! of the handshake.

use async_trait::async_trait;

use crate::keys::{IdentityKeyPair, OneTimePreKey, PreKeyBundle, SignedPreKey};

/// How many one-time pre-keys a fresh manager provisions.
pub const DEFAULT_ONE_TIME_PREKEY_COUNT: usize = 20;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectoryError {
    /// The directory service could not be reached. Callers retry with
    /// backoff; existing sessions are unaffected.
    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

/// The external bundle directory service.
#[async_trait]
pub trait BundleDirectory: Send + Sync {
    /// Publish or replace the caller's bundle. Idempotent.
    async fn publish(&self, user: &str, bundle: &PreKeyBundle) -> Result<(), DirectoryError>;
    /// Fetch a peer's bundle; `None` when the peer is unknown.
    async fn fetch(&self, peer: &str) -> Result<Option<PreKeyBundle>, DirectoryError>;
}

/// Manages the local user's key material.
pub struct KeyManager {
    user_id: String,
    identity: IdentityKeyPair,
    signed_prekey: SignedPreKey,
    /// Retained across one rotation so handshakes captured against the
    /// previous bundle still complete.
    previous_signed_prekey: Option<SignedPreKey>,
    one_time_prekeys: Vec<OneTimePreKey>,
    next_prekey_id: u32,
}

impl KeyManager {
    /// Generate a fresh identity, signed pre-key, and one-time pool.
    pub fn generate(user_id: &str) -> Self {
        let identity = IdentityKeyPair::generate();
        let signed_prekey = SignedPreKey::generate(1, &identity);

        let mut manager = Self {
            user_id: user_id.to_string(),
            identity,
            signed_prekey,
            previous_signed_prekey: None,
            one_time_prekeys: Vec::new(),
            next_prekey_id: 0,
        };
        manager.refill_one_time_prekeys(DEFAULT_ONE_TIME_PREKEY_COUNT);
        manager
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn identity_public_key(&self) -> x25519_dalek::PublicKey {
        self.identity.public_key()
    }

    /// Current bundle, offering one unconsumed one-time pre-key.
    pub fn bundle(&self) -> PreKeyBundle {
        PreKeyBundle::new(
            &self.identity,
            &self.signed_prekey,
            self.one_time_prekeys.first(),
        )
    }

    /// Publish the current bundle. Failure is not fatal to existing
    /// sessions; the caller retries with backoff.
    pub async fn publish_bundle(&self, directory: &dyn BundleDirectory) -> Result<(), DirectoryError> {
        directory.publish(&self.user_id, &self.bundle()).await?;
        tracing::debug!(user = %self.user_id, "published pre-key bundle");
        Ok(())
    }

    pub async fn fetch_bundle(
        &self,
        directory: &dyn BundleDirectory,
        peer: &str,
    ) -> Result<Option<PreKeyBundle>, DirectoryError> {
        directory.fetch(peer).await
    }

    /// Remove a one-time pre-key from the pool, returning it for the
    /// responder handshake. `None` if already consumed; a consumed id
    /// is never offered again.
    pub fn consume_one_time_prekey(&mut self, id: u32) -> Option<OneTimePreKey> {
        let index = self.one_time_prekeys.iter().position(|k| k.id == id)?;
        Some(self.one_time_prekeys.remove(index))
    }

    pub fn remaining_one_time_prekeys(&self) -> usize {
        self.one_time_prekeys.len()
    }

    /// Top the pool back up with `count` fresh keys.
    pub fn refill_one_time_prekeys(&mut self, count: usize) {
        for _ in 0..count {
            self.one_time_prekeys
                .push(OneTimePreKey::generate(self.next_prekey_id));
            self.next_prekey_id += 1;
        }
    }

    pub fn signed_prekey(&self) -> &SignedPreKey {
        &self.signed_prekey
    }

    /// Look up a signed pre-key by the id carried in an initiation
    /// payload. Covers the previous key for one rotation period.
    pub fn signed_prekey_by_id(&self, id: u32) -> Option<&SignedPreKey> {
        if self.signed_prekey.id == id {
            return Some(&self.signed_prekey);
        }
        self.previous_signed_prekey
            .as_ref()
            .filter(|k| k.id == id)
    }

    /// Rotate the signed pre-key. The outgoing key is retained so
    /// in-flight handshakes against the previous bundle still complete.
    pub fn rotate_signed_prekey(&mut self) {
        let next_id = self.signed_prekey.id + 1;
        let fresh = SignedPreKey::generate(next_id, &self.identity);
        self.previous_signed_prekey = Some(std::mem::replace(&mut self.signed_prekey, fresh));
        tracing::debug!(id = next_id, "rotated signed pre-key");
    }

    /// Wipe all local key material and start over with a fresh identity.
    /// Used on logout or device reset; the dropped secrets zeroize.
    pub fn reset(&mut self) {
        self.identity = IdentityKeyPair::generate();
        self.signed_prekey = SignedPreKey::generate(1, &self.identity);
        self.previous_signed_prekey = None;
        self.one_time_prekeys.clear();
        self.next_prekey_id = 0;
        // Drop-in replacement pool so the next bundle is usable.
        self.refill_one_time_prekeys(DEFAULT_ONE_TIME_PREKEY_COUNT);
        tracing::debug!(user = %self.user_id, "key material reset");
    }
}

/// In-memory directory used by tests and local development.
#[derive(Default)]
pub struct MemoryDirectory {
    bundles: tokio::sync::Mutex<std::collections::HashMap<String, PreKeyBundle>>,
    /// When set, the next `publish` call fails once.
    fail_next_publish: std::sync::atomic::AtomicBool,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_publish(&self) {
        self.fail_next_publish
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl BundleDirectory for MemoryDirectory {
    async fn publish(&self, user: &str, bundle: &PreKeyBundle) -> Result<(), DirectoryError> {
        if self
            .fail_next_publish
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(DirectoryError::Unavailable("injected failure".into()));
        }
        self.bundles
            .lock()
            .await
            .insert(user.to_string(), bundle.clone());
        Ok(())
    }

    async fn fetch(&self, peer: &str) -> Result<Option<PreKeyBundle>, DirectoryError> {
        Ok(self.bundles.lock().await.get(peer).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InitialMessage, Session};

    #[test]
    fn test_bundle_offers_one_time_prekey() {
        let manager = KeyManager::generate("alice");
        let bundle = manager.bundle();
        assert!(bundle.verify());
        assert!(bundle.one_time_prekey.is_some());
        assert_eq!(
            manager.remaining_one_time_prekeys(),
            DEFAULT_ONE_TIME_PREKEY_COUNT
        );
    }

    #[test]
    fn test_one_time_prekey_consumed_once() {
        let mut manager = KeyManager::generate("bob");
        let id = manager.bundle().one_time_prekey.map(|(id, _)| id).unwrap();

        assert!(manager.consume_one_time_prekey(id).is_some());
        assert!(manager.consume_one_time_prekey(id).is_none());
        assert_eq!(
            manager.remaining_one_time_prekeys(),
            DEFAULT_ONE_TIME_PREKEY_COUNT - 1
        );

        // The consumed key is no longer offered.
        let offered = manager.bundle().one_time_prekey.map(|(next, _)| next);
        assert_ne!(offered, Some(id));
    }

    #[test]
    fn test_rotation_keeps_in_flight_handshakes_valid() {
        let alice = KeyManager::generate("alice");
        let mut bob = KeyManager::generate("bob");

        // Alice captures Bob's bundle, then Bob rotates.
        let old_bundle = bob.bundle();
        bob.rotate_signed_prekey();

        let (mut alice_session, initial) =
            Session::initiate(alice.identity(), &old_bundle).unwrap();

        // Bob sees only the wire payload and must resolve the signed
        // pre-key from the id it carries, not from his current bundle.
        let received = InitialMessage::from_bytes(&initial.to_bytes()).unwrap();
        let otpk = received
            .used_one_time_prekey_id
            .and_then(|id| bob.consume_one_time_prekey(id));
        let spk = bob
            .signed_prekey_by_id(received.signed_prekey_id)
            .expect("previous signed pre-key retained");
        let mut bob_session =
            Session::respond(bob.identity(), spk, otpk.as_ref(), &received).unwrap();

        let m = alice_session.encrypt(b"still works").unwrap();
        assert_eq!(bob_session.decrypt(&m).unwrap().plaintext, b"still works");
    }

    #[tokio::test]
    async fn test_publish_and_fetch() {
        let directory = MemoryDirectory::new();
        let manager = KeyManager::generate("alice");

        manager.publish_bundle(&directory).await.unwrap();
        let fetched = manager.fetch_bundle(&directory, "alice").await.unwrap();
        assert!(fetched.is_some());
        assert!(manager.fetch_bundle(&directory, "nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_failure_is_retryable() {
        let directory = MemoryDirectory::new();
        let manager = KeyManager::generate("alice");

        directory.fail_next_publish();
        assert!(manager.publish_bundle(&directory).await.is_err());
        // Retry succeeds and is idempotent.
        manager.publish_bundle(&directory).await.unwrap();
        manager.publish_bundle(&directory).await.unwrap();
    }

    #[test]
    fn test_reset_discards_everything() {
        let mut manager = KeyManager::generate("alice");
        let old_identity = manager.identity_public_key();
        let id = manager.bundle().one_time_prekey.map(|(id, _)| id).unwrap();
        manager.consume_one_time_prekey(id);

        manager.reset();
        assert_ne!(manager.identity_public_key(), old_identity);
        assert_eq!(
            manager.remaining_one_time_prekeys(),
            DEFAULT_ONE_TIME_PREKEY_COUNT
        );
    }
}
