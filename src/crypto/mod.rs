// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Cryptographic Primitives
//!
//! Everything that touches key material lives here:
//!
//! - [`kdf`] - PBKDF2-HMAC-SHA256 key derivation from user credentials
//! - [`aead`] - AES-256-GCM sealing of the database image
//! - [`signing`] - ECDSA P-256 key pairs, signatures and CSR construction
//!
//! All primitives come from `ring` (plus `rcgen` for PKCS#10 encoding).
//! Failures surface as [`CryptoError`]; nothing here ever falls back to
//! plaintext.

pub mod aead;
pub mod kdf;
pub mod signing;

pub use aead::{decrypt, encrypt, NONCE_LEN, TAG_LEN};
pub use kdf::{derive_key, SymmetricKey, KEY_LEN, PBKDF2_ITERATIONS};
pub use signing::{build_csr, verify_signature, CertificateRequest, CsrSubject, SigningKeyPair};

/// Errors raised by the cryptographic primitives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// Key material has the wrong length or cannot be parsed.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Authentication tag mismatch: wrong key or tampered/corrupted data.
    #[error("integrity check failed: ciphertext was tampered with or the key is wrong")]
    Integrity,

    /// The system random source failed.
    #[error("random number generation failed")]
    Random,

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signing failed: {0}")]
    Signing(String),

    /// Signature did not verify against the public key.
    #[error("signature verification failed")]
    Verification,

    #[error("certificate request construction failed: {0}")]
    Csr(String),

    #[error("encryption failed")]
    Encryption,
}
