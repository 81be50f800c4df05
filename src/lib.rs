//! End-to-end encryption engine
//!
//! Provides:
//! - Identity and pre-key bundle management
//! - X3DH (Extended Triple Diffie-Hellman) key agreement
//! - Double Ratchet message encryption with out-of-order handling
//! - Group message encryption with versioned key distribution
//! - Per-call media frame encryption
//! - Security codes for out-of-band identity verification
//!
//! Transport, signaling, and persistence internals live in the
//! surrounding application; this crate exchanges opaque byte payloads
//! with them and persists through the [`store::SessionStore`] seam.

pub mod call;
pub mod group;
pub mod key_manager;
pub mod keys;
pub mod manager;
pub mod ratchet;
pub mod security_code;
pub mod session;
pub mod store;
pub mod x3dh;

pub use call::{CallCrypto, CallError};
pub use group::{
    DistributionOutcome, GroupCiphertext, GroupCrypto, GroupError, GroupKey, GroupKeyRing,
    MemberDelivery,
};
pub use key_manager::{BundleDirectory, DirectoryError, KeyManager, MemoryDirectory};
pub use keys::{IdentityKeyPair, KeyError, OneTimePreKey, PreKeyBundle, SignedPreKey};
pub use manager::{EngineError, SessionManager};
pub use ratchet::{DoubleRatchet, RatchetError, SkippedMessageKey};
pub use security_code::security_code;
pub use session::{EncryptedMessage, InitialMessage, Session, SessionError, SessionRecord};
pub use store::{MemoryStore, SessionStore, StoreError, TrustedIdentityKey};
pub use x3dh::{X3DHError, X3DHResult, X3DH};
