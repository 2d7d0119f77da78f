// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authenticated encryption of the database image.
//!
//! ## Blob Layout
//!
//! ```text
//! +-----------+----------+-----------------+
//! | nonce(12) | tag(16)  | ciphertext(...) |
//! +-----------+----------+-----------------+
//! ```
//!
//! The layout is self-describing: decryption needs only the key.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};

use super::{CryptoError, SymmetricKey};

pub const NONCE_LEN: usize = ring::aead::NONCE_LEN;
pub const TAG_LEN: usize = 16;

/// Associated data bound into every tag.
const STORE_AAD: &[u8] = b"fiscal-pos/store/v1";

fn sealing_key(key: &SymmetricKey) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(&AES_256_GCM, key.as_bytes())
        .map_err(|_| CryptoError::InvalidKey("AES-256-GCM requires a 32-byte key".to_string()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` with a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    let sealing = sealing_key(key)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| CryptoError::Random)?;

    let mut in_out = plaintext.to_vec();
    let tag = sealing
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(STORE_AAD),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Encryption)?;

    let mut blob = Vec::with_capacity(NONCE_LEN + TAG_LEN + in_out.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(tag.as_ref());
    blob.extend_from_slice(&in_out);
    Ok(blob)
}

/// Decrypt a blob produced by [`encrypt`].
///
/// Returns [`CryptoError::Integrity`] for a wrong key, a tampered blob or a
/// blob too short to hold nonce and tag.
pub fn decrypt(blob: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Integrity);
    }
    let opening = sealing_key(key)?;

    let (nonce_bytes, rest) = blob.split_at(NONCE_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| CryptoError::Integrity)?;

    // ring expects ciphertext || tag
    let mut in_out = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    in_out.extend_from_slice(ciphertext);
    in_out.extend_from_slice(tag);

    let plaintext_len = opening
        .open_in_place(nonce, Aad::from(STORE_AAD), &mut in_out)
        .map_err(|_| CryptoError::Integrity)?
        .len();
    in_out.truncate(plaintext_len);
    Ok(in_out)
}
