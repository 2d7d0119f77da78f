// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! ECDSA P-256 signing keys and certificate signing requests.
//!
//! Keys are kept as PKCS#8 documents so they can be persisted as opaque
//! base64 strings and handed to `rcgen` for CSR construction.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair as CsrKeyPair};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, KeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_ASN1,
    ECDSA_P256_SHA256_ASN1_SIGNING,
};
use zeroize::Zeroizing;

use super::CryptoError;

/// OID 2.5.4.5 (serialNumber).
const OID_SERIAL_NUMBER: [u64; 4] = [2, 5, 4, 5];
/// OID 2.5.4.46 (dnQualifier).
const OID_DN_QUALIFIER: [u64; 4] = [2, 5, 4, 46];

/// A P-256 signing key pair with its PKCS#8 encoding.
pub struct SigningKeyPair {
    pkcs8: Zeroizing<Vec<u8>>,
    key_pair: EcdsaKeyPair,
    rng: SystemRandom,
}

impl SigningKeyPair {
    /// Generate a fresh key pair.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            .map_err(|_| CryptoError::KeyGeneration("P-256 key generation failed".to_string()))?;
        Self::from_pkcs8(document.as_ref())
    }

    /// Load a key pair from a PKCS#8 DER document.
    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8, &rng)
            .map_err(|e| CryptoError::InvalidKey(format!("not a P-256 PKCS#8 key: {e}")))?;
        Ok(Self {
            pkcs8: Zeroizing::new(pkcs8.to_vec()),
            key_pair,
            rng,
        })
    }

    /// PKCS#8 DER encoding of the private key.
    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8
    }

    /// Uncompressed SEC1 public key point.
    pub fn public_key(&self) -> &[u8] {
        self.key_pair.public_key().as_ref()
    }

    /// Sign `payload`; the SHA-256 digest is computed by the algorithm.
    ///
    /// Returns an ASN.1 DER `SEQUENCE { r, s }`.
    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signature = self
            .key_pair
            .sign(&self.rng, payload)
            .map_err(|_| CryptoError::Signing("ECDSA P-256 signing failed".to_string()))?;
        Ok(signature.as_ref().to_vec())
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public_key_len", &self.public_key().len())
            .finish_non_exhaustive()
    }
}

/// Verify a DER signature produced by [`SigningKeyPair::sign`].
pub fn verify_signature(public_key: &[u8], payload: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, public_key)
        .verify(payload, signature)
        .map_err(|_| CryptoError::Verification)
}

/// Subject fields encoded into the CSR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrSubject {
    pub business_name: String,
    pub business_id: String,
    pub branch_id: String,
    pub pos_id: String,
    pub application_id: String,
}

/// A PKCS#10 certificate signing request.
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    pub pem: String,
    pub der: Vec<u8>,
}

/// Build a PKCS#10 CSR over the key pair's public key.
///
/// Subject: `CN` business name, `O` business id, `OU` branch id,
/// `serialNumber` POS id, `dnQualifier` application id.
pub fn build_csr(key_pair: &SigningKeyPair, subject: &CsrSubject) -> Result<CertificateRequest, CryptoError> {
    let csr_key = CsrKeyPair::try_from(key_pair.pkcs8_der())
        .map_err(|e| CryptoError::InvalidKey(format!("key not usable for CSR: {e}")))?;

    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| CryptoError::Csr(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject.business_name.clone());
    dn.push(DnType::OrganizationName, subject.business_id.clone());
    dn.push(DnType::OrganizationalUnitName, subject.branch_id.clone());
    dn.push(
        DnType::CustomDnType(OID_SERIAL_NUMBER.to_vec()),
        subject.pos_id.clone(),
    );
    dn.push(
        DnType::CustomDnType(OID_DN_QUALIFIER.to_vec()),
        subject.application_id.clone(),
    );
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(&csr_key)
        .map_err(|e| CryptoError::Csr(e.to_string()))?;
    let pem = csr.pem().map_err(|e| CryptoError::Csr(e.to_string()))?;

    Ok(CertificateRequest {
        pem,
        der: csr.der().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> CsrSubject {
        CsrSubject {
            business_name: "Corner Bakery LLC".to_string(),
            business_id: "810123456".to_string(),
            branch_id: "1".to_string(),
            pos_id: "7".to_string(),
            application_id: "42".to_string(),
        }
    }

    #[test]
    fn generated_key_signs_and_verifies() {
        let key = SigningKeyPair::generate().unwrap();
        let sig = key.sign(b"coupon-details").unwrap();

        // DER SEQUENCE tag
        assert_eq!(sig[0], 0x30);
        verify_signature(key.public_key(), b"coupon-details", &sig).unwrap();
    }

    #[test]
    fn signature_does_not_verify_for_other_payload() {
        let key = SigningKeyPair::generate().unwrap();
        let sig = key.sign(b"original").unwrap();
        assert_eq!(
            verify_signature(key.public_key(), b"modified", &sig),
            Err(CryptoError::Verification)
        );
    }

    #[test]
    fn pkcs8_roundtrip_preserves_public_key() {
        let key = SigningKeyPair::generate().unwrap();
        let restored = SigningKeyPair::from_pkcs8(key.pkcs8_der()).unwrap();
        assert_eq!(key.public_key(), restored.public_key());

        let sig = restored.sign(b"payload").unwrap();
        verify_signature(key.public_key(), b"payload", &sig).unwrap();
    }

    #[test]
    fn garbage_pkcs8_is_invalid_key() {
        let err = SigningKeyPair::from_pkcs8(b"definitely not a key").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKey(_)));
    }

    #[test]
    fn public_key_is_uncompressed_p256_point() {
        let key = SigningKeyPair::generate().unwrap();
        assert_eq!(key.public_key().len(), 65);
        assert_eq!(key.public_key()[0], 0x04);
    }

    #[test]
    fn csr_is_pem_encoded_pkcs10() {
        let key = SigningKeyPair::generate().unwrap();
        let csr = build_csr(&key, &subject()).unwrap();

        assert!(csr.pem.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
        assert!(!csr.der.is_empty());
        // The DER carries the subject strings verbatim (UTF8String).
        let der = &csr.der;
        let contains = |needle: &str| der.windows(needle.len()).any(|w| w == needle.as_bytes());
        assert!(contains("Corner Bakery LLC"));
        assert!(contains("810123456"));
    }

    #[test]
    fn csr_embeds_public_key() {
        let key = SigningKeyPair::generate().unwrap();
        let csr = build_csr(&key, &subject()).unwrap();
        let point = key.public_key();
        assert!(csr.der.windows(point.len()).any(|w| w == point));
    }
}
