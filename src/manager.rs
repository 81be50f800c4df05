//! Store-backed session management
//!
//! `SessionManager` owns the live `Session` objects for one account,
//! loads/persists them through the [`SessionStore`], pins peer identity
//! keys on first use, and consults the skipped-key cache before
//! touching ratchet state. Methods take `&mut self`, so operations on
//! the same manager are mutually exclusive; independent managers share
//! nothing.

use std::collections::HashMap;
use std::sync::Arc;

use crate::keys::{IdentityKeyPair, OneTimePreKey, PreKeyBundle, SignedPreKey};
use crate::ratchet::unix_now;
use crate::session::{EncryptedMessage, InitialMessage, Session, SessionError};
use crate::store::{SessionStore, StoreError, TrustedIdentityKey};

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// No established session for the peer; run a fresh handshake.
    #[error("No session established with {0}")]
    UnknownSession(String),
    /// The peer's identity key differs from the pinned trusted key.
    /// Surfaced prominently; never auto-trusted.
    #[error("Identity key mismatch for {0}")]
    IdentityKeyMismatch(String),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub struct SessionManager<S: SessionStore> {
    store: Arc<S>,
    sessions: HashMap<String, Session>,
}

impl<S: SessionStore> SessionManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            sessions: HashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Initiate a session with a peer from their fetched bundle.
    /// Nothing is persisted unless the handshake succeeds.
    pub async fn initiate_session(
        &mut self,
        local_identity: &IdentityKeyPair,
        peer: &str,
        bundle: &PreKeyBundle,
    ) -> Result<InitialMessage, EngineError> {
        self.check_and_pin(peer, bundle.identity_key.to_bytes()).await?;

        let (session, initial) = Session::initiate(local_identity, bundle)?;
        self.store.save_session(peer, &session.to_record()).await?;
        self.sessions.insert(peer.to_string(), session);
        tracing::debug!(peer, "session initiated");
        Ok(initial)
    }

    /// Accept a session from an initiation payload.
    pub async fn accept_session(
        &mut self,
        local_identity: &IdentityKeyPair,
        peer: &str,
        signed_prekey: &SignedPreKey,
        one_time_prekey: Option<&OneTimePreKey>,
        initial: &InitialMessage,
    ) -> Result<(), EngineError> {
        self.check_and_pin(peer, initial.identity_key.to_bytes()).await?;

        let session = Session::respond(local_identity, signed_prekey, one_time_prekey, initial)?;
        self.store.save_session(peer, &session.to_record()).await?;
        self.sessions.insert(peer.to_string(), session);
        tracing::debug!(peer, "session accepted");
        Ok(())
    }

    pub async fn has_session(&mut self, peer: &str) -> Result<bool, EngineError> {
        if self.sessions.contains_key(peer) {
            return Ok(true);
        }
        Ok(self.store.get_session(peer).await?.is_some())
    }

    /// Encrypt for a peer and persist the advanced session state.
    pub async fn encrypt_message(
        &mut self,
        peer: &str,
        plaintext: &[u8],
    ) -> Result<EncryptedMessage, EngineError> {
        let store = self.store.clone();
        let session = self.load_session(peer).await?;

        let message = session.encrypt(plaintext)?;
        store.save_session(peer, &session.to_record()).await?;
        Ok(message)
    }

    /// Decrypt from a peer. Consults the skipped-key cache first; a
    /// cache hit consumes the entry without touching ratchet state.
    /// Otherwise the ratchet advances, new skipped keys are cached, and
    /// the session is persisted only after the decrypt succeeds.
    pub async fn decrypt_message(
        &mut self,
        peer: &str,
        message: &EncryptedMessage,
    ) -> Result<Vec<u8>, EngineError> {
        let store = self.store.clone();
        let session = self.load_session(peer).await?;

        if let Some(entry) = store
            .get_skipped_key(&message.ratchet_public, message.counter)
            .await?
        {
            let plaintext = session.decrypt_skipped(&entry.message_key, message)?;
            store
                .remove_skipped_key(&message.ratchet_public, message.counter)
                .await?;
            tracing::debug!(peer, counter = message.counter, "decrypted via skipped key");
            return Ok(plaintext);
        }

        let step = session.decrypt(message)?;
        for skipped in step.skipped {
            store.save_skipped_key(skipped).await?;
        }
        store.save_session(peer, &session.to_record()).await?;
        Ok(step.plaintext)
    }

    pub async fn delete_session(&mut self, peer: &str) -> Result<(), EngineError> {
        self.sessions.remove(peer);
        self.store.delete_session(peer).await?;
        Ok(())
    }

    /// Periodic maintenance: drop expired skipped-key cache entries.
    pub async fn sweep_skipped_keys(&self) -> Result<usize, EngineError> {
        Ok(self.store.clean_expired_skipped_keys().await?)
    }

    /// Trust-on-first-use pinning. A pinned key that no longer matches
    /// is a security event, not something to reconcile silently.
    async fn check_and_pin(&self, peer: &str, identity_key: [u8; 32]) -> Result<(), EngineError> {
        match self.store.get_trusted_key(peer).await? {
            Some(pinned) if pinned.identity_key != identity_key => {
                tracing::warn!(
                    peer,
                    offered = %hex::encode(identity_key),
                    pinned = %hex::encode(pinned.identity_key),
                    "identity key mismatch against pinned key"
                );
                Err(EngineError::IdentityKeyMismatch(peer.to_string()))
            }
            Some(_) => Ok(()),
            None => {
                self.store
                    .save_trusted_key(TrustedIdentityKey {
                        peer: peer.to_string(),
                        identity_key,
                        trusted_at: unix_now(),
                    })
                    .await?;
                Ok(())
            }
        }
    }

    async fn load_session(&mut self, peer: &str) -> Result<&mut Session, EngineError> {
        if !self.sessions.contains_key(peer) {
            let record = self
                .store
                .get_session(peer)
                .await?
                .ok_or_else(|| EngineError::UnknownSession(peer.to_string()))?;
            self.sessions
                .insert(peer.to_string(), Session::from_record(&record));
        }
        self.sessions
            .get_mut(peer)
            .ok_or_else(|| EngineError::UnknownSession(peer.to_string()))
    }
}
