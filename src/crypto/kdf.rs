// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Password-based key derivation for the at-rest database key.

use std::num::NonZeroU32;

use ring::pbkdf2;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the derived symmetric key (AES-256).
pub const KEY_LEN: usize = 32;

/// PBKDF2 iteration count. Never below 100,000.
pub const PBKDF2_ITERATIONS: u32 = 210_000;

const ITERATIONS: NonZeroU32 = NonZeroU32::new(PBKDF2_ITERATIONS).unwrap();

/// Domain separation tag mixed into the per-identity salt.
const SALT_DOMAIN: &[u8] = b"fiscal-pos/store-key/v1";

const SALT_LEN: usize = 16;

/// 256-bit symmetric key held only in process memory.
///
/// Wiped on drop. `Debug` never prints the key bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        // Fold the whole array so comparison time does not depend on the
        // position of the first differing byte.
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Eq for SymmetricKey {}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Derive the database key from an identity secret (the username) and a
/// passphrase.
///
/// The salt is per identity: `SHA-256(domain || identity_secret)` truncated
/// to 16 bytes, so the same credentials always yield the same key. This is
/// deliberately slow; async callers should run it on a blocking thread.
pub fn derive_key(identity_secret: &str, passphrase: &str) -> SymmetricKey {
    let salt = identity_salt(identity_secret);
    let mut out = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        ITERATIONS,
        &salt,
        passphrase.as_bytes(),
        &mut out,
    );
    let key = SymmetricKey::from_bytes(out);
    out.zeroize();
    key
}

fn identity_salt(identity_secret: &str) -> [u8; SALT_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(SALT_DOMAIN);
    hasher.update(identity_secret.as_bytes());
    let digest = hasher.finalize();

    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&digest[..SALT_LEN]);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_key("cashier", "correct horse");
        let b = derive_key("cashier", "correct horse");
        assert_eq!(a, b);
    }

    #[test]
    fn different_passphrase_gives_different_key() {
        let a = derive_key("cashier", "correct horse");
        let b = derive_key("cashier", "battery staple");
        assert_ne!(a, b);
    }

    #[test]
    fn salt_depends_on_identity() {
        assert_ne!(identity_salt("alice"), identity_salt("bob"));
        let a = derive_key("alice", "same-password");
        let b = derive_key("bob", "same-password");
        assert_ne!(a, b);
    }

    #[test]
    fn iteration_count_meets_minimum() {
        assert!(PBKDF2_ITERATIONS >= 100_000);
    }

    #[test]
    fn debug_does_not_leak_key_bytes() {
        let key = SymmetricKey::from_bytes([0xAB; KEY_LEN]);
        let rendered = format!("{key:?}");
        assert_eq!(rendered, "SymmetricKey(..)");
    }
}
