//! Durable storage seam implemented by the surrounding application
//!
//! The engine never talks to disk itself; it hands opaque records to a
//! [`SessionStore`] and reads them back. [`MemoryStore`] is the
//! reference implementation used by the tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::group::GroupKeyRing;
use crate::ratchet::{unix_now, SkippedMessageKey};
use crate::session::SessionRecord;

/// Maximum cached skipped keys before the oldest entries are evicted.
pub const MAX_SKIPPED_KEYS: usize = 2000;

/// Maximum age of a cached skipped key before the sweep removes it.
pub const MAX_SKIPPED_KEY_AGE_SECS: u64 = 7 * 24 * 3600;

/// An identity key pinned on first contact. A later mismatch is a
/// security event, never silently accepted.
#[derive(Clone, Serialize, Deserialize)]
pub struct TrustedIdentityKey {
    pub peer: String,
    pub identity_key: [u8; 32],
    pub trusted_at: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Storage backend failure: {0}")]
    Backend(String),
}

/// Key-value persistence for sessions, skipped keys, trusted identity
/// keys, and group key rings.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, peer: &str) -> Result<Option<SessionRecord>, StoreError>;
    async fn save_session(&self, peer: &str, record: &SessionRecord) -> Result<(), StoreError>;
    async fn delete_session(&self, peer: &str) -> Result<(), StoreError>;

    async fn get_skipped_key(
        &self,
        ratchet_key: &[u8; 32],
        counter: u32,
    ) -> Result<Option<SkippedMessageKey>, StoreError>;
    async fn save_skipped_key(&self, entry: SkippedMessageKey) -> Result<(), StoreError>;
    async fn remove_skipped_key(
        &self,
        ratchet_key: &[u8; 32],
        counter: u32,
    ) -> Result<(), StoreError>;
    /// Remove entries older than the age bound. Returns how many went.
    async fn clean_expired_skipped_keys(&self) -> Result<usize, StoreError>;

    async fn get_trusted_key(&self, peer: &str) -> Result<Option<TrustedIdentityKey>, StoreError>;
    async fn save_trusted_key(&self, entry: TrustedIdentityKey) -> Result<(), StoreError>;

    async fn get_group_key(&self, room_id: &str) -> Result<Option<GroupKeyRing>, StoreError>;
    async fn save_group_key(&self, ring: &GroupKeyRing) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryStoreInner {
    sessions: HashMap<String, SessionRecord>,
    skipped: HashMap<([u8; 32], u32), SkippedMessageKey>,
    trusted: HashMap<String, TrustedIdentityKey>,
    groups: HashMap<String, GroupKeyRing>,
}

/// In-memory store, bounded on the skipped-key cache by count and age.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_session(&self, peer: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.inner.lock().await.sessions.get(peer).cloned())
    }

    async fn save_session(&self, peer: &str, record: &SessionRecord) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .sessions
            .insert(peer.to_string(), record.clone());
        Ok(())
    }

    async fn delete_session(&self, peer: &str) -> Result<(), StoreError> {
        self.inner.lock().await.sessions.remove(peer);
        Ok(())
    }

    async fn get_skipped_key(
        &self,
        ratchet_key: &[u8; 32],
        counter: u32,
    ) -> Result<Option<SkippedMessageKey>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .skipped
            .get(&(*ratchet_key, counter))
            .cloned())
    }

    async fn save_skipped_key(&self, entry: SkippedMessageKey) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.skipped.len() >= MAX_SKIPPED_KEYS {
            // Evict the oldest entry to stay bounded.
            if let Some(oldest) = inner
                .skipped
                .iter()
                .min_by_key(|(_, v)| v.created_at)
                .map(|(k, _)| *k)
            {
                inner.skipped.remove(&oldest);
            }
        }
        inner
            .skipped
            .insert((entry.ratchet_public, entry.message_number), entry);
        Ok(())
    }

    async fn remove_skipped_key(
        &self,
        ratchet_key: &[u8; 32],
        counter: u32,
    ) -> Result<(), StoreError> {
        self.inner.lock().await.skipped.remove(&(*ratchet_key, counter));
        Ok(())
    }

    async fn clean_expired_skipped_keys(&self) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let cutoff = unix_now().saturating_sub(MAX_SKIPPED_KEY_AGE_SECS);
        let before = inner.skipped.len();
        inner.skipped.retain(|_, v| v.created_at >= cutoff);
        Ok(before - inner.skipped.len())
    }

    async fn get_trusted_key(&self, peer: &str) -> Result<Option<TrustedIdentityKey>, StoreError> {
        Ok(self.inner.lock().await.trusted.get(peer).cloned())
    }

    async fn save_trusted_key(&self, entry: TrustedIdentityKey) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .trusted
            .insert(entry.peer.clone(), entry);
        Ok(())
    }

    async fn get_group_key(&self, room_id: &str) -> Result<Option<GroupKeyRing>, StoreError> {
        Ok(self.inner.lock().await.groups.get(room_id).cloned())
    }

    async fn save_group_key(&self, ring: &GroupKeyRing) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .groups
            .insert(ring.room_id.clone(), ring.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(counter: u32, created_at: u64) -> SkippedMessageKey {
        SkippedMessageKey {
            ratchet_public: [1u8; 32],
            message_number: counter,
            message_key: [2u8; 32],
            created_at,
        }
    }

    #[tokio::test]
    async fn test_skipped_key_round_trip() {
        let store = MemoryStore::new();
        store.save_skipped_key(entry(4, unix_now())).await.unwrap();

        let hit = store.get_skipped_key(&[1u8; 32], 4).await.unwrap();
        assert!(hit.is_some());

        store.remove_skipped_key(&[1u8; 32], 4).await.unwrap();
        assert!(store.get_skipped_key(&[1u8; 32], 4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_keys_swept() {
        let store = MemoryStore::new();
        store.save_skipped_key(entry(0, 0)).await.unwrap();
        store.save_skipped_key(entry(1, unix_now())).await.unwrap();

        let removed = store.clean_expired_skipped_keys().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_skipped_key(&[1u8; 32], 0).await.unwrap().is_none());
        assert!(store.get_skipped_key(&[1u8; 32], 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let store = MemoryStore::new();
        for i in 0..MAX_SKIPPED_KEYS + 10 {
            store
                .save_skipped_key(entry(i as u32, i as u64))
                .await
                .unwrap();
        }
        let inner = store.inner.lock().await;
        assert!(inner.skipped.len() <= MAX_SKIPPED_KEYS);
        // The oldest entries were the ones evicted.
        assert!(!inner.skipped.contains_key(&([1u8; 32], 0)));
    }

    #[tokio::test]
    async fn test_trusted_key_pinning() {
        let store = MemoryStore::new();
        assert!(store.get_trusted_key("bob").await.unwrap().is_none());

        store
            .save_trusted_key(TrustedIdentityKey {
                peer: "bob".into(),
                identity_key: [7u8; 32],
                trusted_at: unix_now(),
            })
            .await
            .unwrap();

        let pinned = store.get_trusted_key("bob").await.unwrap().unwrap();
        assert_eq!(pinned.identity_key, [7u8; 32]);
    }
}
