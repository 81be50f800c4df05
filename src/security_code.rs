//! Human-comparable security codes
//!
//! A stable fingerprint over two identity public keys, compared out of
//! band by both parties to detect identity-key replacement. The inputs
//! are canonicalized by byte order, so both sides compute the same
//! code regardless of who is "mine".

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::PublicKey as X25519PublicKey;

/// Number of five-digit groups in a code.
const GROUPS: usize = 12;

/// Derive the security code for a peer pair.
///
/// Commutative: `security_code(a, b) == security_code(b, a)`. Changing
/// either key changes the code.
pub fn security_code(mine: &X25519PublicKey, theirs: &X25519PublicKey) -> String {
    let (first, second) = if mine.as_bytes() <= theirs.as_bytes() {
        (mine, theirs)
    } else {
        (theirs, mine)
    };

    let mut ikm = Vec::with_capacity(64);
    ikm.extend_from_slice(first.as_bytes());
    ikm.extend_from_slice(second.as_bytes());

    // Expand to five distinct derived bytes per group.
    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = [0u8; GROUPS * 5];
    hk.expand(b"e2ee-core/security-code", &mut okm).unwrap();

    let mut groups = Vec::with_capacity(GROUPS);
    for chunk in okm.chunks_exact(5) {
        let mut value: u64 = 0;
        for byte in chunk {
            value = (value << 8) | u64::from(*byte);
        }
        groups.push(format!("{:05}", value % 100_000));
    }
    groups.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::IdentityKeyPair;

    #[test]
    fn test_commutative() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();

        let code_ab = security_code(&a.public_key(), &b.public_key());
        let code_ba = security_code(&b.public_key(), &a.public_key());
        assert_eq!(code_ab, code_ba);
    }

    #[test]
    fn test_fixed_format() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();

        let code = security_code(&a.public_key(), &b.public_key());
        let groups: Vec<&str> = code.split(' ').collect();
        assert_eq!(groups.len(), GROUPS);
        assert!(groups
            .iter()
            .all(|g| g.len() == 5 && g.chars().all(|c| c.is_ascii_digit())));
    }

    #[test]
    fn test_changes_with_either_key() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();
        let replacement = IdentityKeyPair::generate();

        let original = security_code(&a.public_key(), &b.public_key());
        assert_ne!(
            original,
            security_code(&replacement.public_key(), &b.public_key())
        );
        assert_ne!(
            original,
            security_code(&a.public_key(), &replacement.public_key())
        );
    }

    #[test]
    fn test_groups_are_independently_derived() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();

        // Every group draws on its own slice of the derived output, so
        // the tail of the code must not replay the head.
        let code = security_code(&a.public_key(), &b.public_key());
        let groups: Vec<&str> = code.split(' ').collect();
        assert_ne!(&groups[..5], &groups[7..12]);
    }

    #[test]
    fn test_stable_across_calls() {
        let a = IdentityKeyPair::generate();
        let b = IdentityKeyPair::generate();
        assert_eq!(
            security_code(&a.public_key(), &b.public_key()),
            security_code(&a.public_key(), &b.public_key())
        );
    }
}
