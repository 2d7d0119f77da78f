// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Certificate & Identity Manager
//!
//! Owns the POS signing identity: a P-256 key pair, the certificate the
//! authority issued for it, and the business identifiers it was issued to.
//!
//! ## Onboarding
//!
//! 1. Generate a key pair
//! 2. `verify` the business identifiers with the authority (returns the
//!    registered business name and a verification code)
//! 3. Build a CSR naming the business and have the authority sign it
//! 4. Persist identifiers, certificate and private key through the
//!    preference store, key last so a partial write reads as not onboarded
//!
//! The identity is resident in memory after onboarding or [`load`], and is
//! loaded lazily by the first signing request otherwise.
//!
//! [`load`]: IdentityManager::load

use std::sync::Arc;

use base64ct::{Base64, Encoding};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::crypto::{build_csr, CryptoError, CsrSubject, SigningKeyPair};
use crate::fiscal::client::{FiscalAuthority, SignCsrRequest, VerifyRequest};
use crate::fiscal::coupon::FiscalCoupon;
use crate::fiscal::wire;
use crate::storage::{PreferenceError, PreferenceStore};

// Preference keys
pub const PREF_PRIVATE_KEY: &str = "fiscal.private_key";
pub const PREF_CERTIFICATE: &str = "fiscal.certificate";
pub const PREF_BUSINESS_ID: &str = "fiscal.business_id";
pub const PREF_BRANCH_ID: &str = "fiscal.branch_id";
pub const PREF_POS_ID: &str = "fiscal.pos_id";
pub const PREF_APPLICATION_ID: &str = "fiscal.application_id";
pub const PREF_FISCALIZATION_NO: &str = "fiscal.fiscalization_no";
pub const PREF_BUSINESS_NAME: &str = "fiscal.business_name";

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("signing key unavailable: onboarding has not been completed")]
    KeyUnavailable,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("preference store failure: {0}")]
    Preferences(#[from] PreferenceError),

    #[error("stored credential is corrupt: {0}")]
    CorruptCredential(String),
}

/// Identifiers the authority issued to this business and device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessIdentifiers {
    pub business_id: String,
    pub branch_id: String,
    pub pos_id: String,
    pub application_id: String,
    pub fiscalization_no: String,
    pub business_name: String,
}

/// Identifiers entered by the operator to start onboarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnboardingRequest {
    pub business_id: String,
    pub pos_id: String,
    pub branch_id: String,
    pub application_id: String,
    pub fiscalization_no: String,
}

/// The resident signing identity.
#[derive(Debug)]
pub struct Identity {
    key_pair: SigningKeyPair,
    certificate_der: Vec<u8>,
    identifiers: BusinessIdentifiers,
}

impl Identity {
    pub fn public_key(&self) -> &[u8] {
        self.key_pair.public_key()
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn identifiers(&self) -> &BusinessIdentifiers {
        &self.identifiers
    }
}

/// A coupon ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCoupon {
    /// Base64 of the wire bytes.
    pub details: String,
    /// Base64 DER signature over the bytes of `details`.
    pub signature: String,
}

pub struct IdentityManager<P, A> {
    preferences: Arc<P>,
    authority: Arc<A>,
    resident: RwLock<Option<Arc<Identity>>>,
}

impl<P, A> IdentityManager<P, A>
where
    P: PreferenceStore,
    A: FiscalAuthority,
{
    pub fn new(preferences: Arc<P>, authority: Arc<A>) -> Self {
        Self {
            preferences,
            authority,
            resident: RwLock::new(None),
        }
    }

    /// Whether a usable identity is resident or persisted.
    pub async fn is_onboarded(&self) -> bool {
        if self.resident.read().await.is_some() {
            return true;
        }
        let persisted = |key: &str| match self.preferences.get(key) {
            Ok(value) => value.is_some_and(|v| !v.is_empty()),
            Err(e) => {
                warn!(error = %e, key, "Failed to read preference");
                false
            }
        };
        persisted(PREF_PRIVATE_KEY) && persisted(PREF_CERTIFICATE)
    }

    /// Make the persisted identity resident.
    ///
    /// `Ok(false)` when nothing has been persisted yet.
    pub async fn load(&self) -> Result<bool, IdentityError> {
        let mut resident = self.resident.write().await;
        if resident.is_some() {
            return Ok(true);
        }

        let Some(identity) = self.read_persisted()? else {
            debug!("No persisted fiscal identity");
            return Ok(false);
        };

        info!(
            business_id = %identity.identifiers.business_id,
            pos_id = %identity.identifiers.pos_id,
            "Fiscal identity loaded"
        );
        *resident = Some(Arc::new(identity));
        Ok(true)
    }

    /// Register this POS with the authority and persist the credentials.
    ///
    /// Returns `Ok(false)` when the authority rejects a step or cannot be
    /// reached; `Err` only for local crypto or storage failures.
    pub async fn onboard(&self, request: &OnboardingRequest) -> Result<bool, IdentityError> {
        let key_pair = SigningKeyPair::generate()?;

        let verify_request = VerifyRequest {
            business_id: request.business_id.clone(),
            pos_id: request.pos_id.clone(),
            branch_id: request.branch_id.clone(),
            application_id: request.application_id.clone(),
            fiscalization_no: request.fiscalization_no.clone(),
        };
        let verified = match self.authority.verify(&verify_request).await {
            Ok(verified) => verified,
            Err(e) => {
                warn!(error = %e, business_id = %request.business_id, "Business verification failed");
                return Ok(false);
            }
        };

        let csr = build_csr(
            &key_pair,
            &CsrSubject {
                business_name: verified.business_name.clone(),
                business_id: request.business_id.clone(),
                branch_id: request.branch_id.clone(),
                pos_id: request.pos_id.clone(),
                application_id: request.application_id.clone(),
            },
        )?;

        let sign_request = SignCsrRequest {
            business_id: request.business_id.clone(),
            pos_id: request.pos_id.clone(),
            verification_code: verified.verification_code,
            csr: csr.pem,
        };
        let signed = match self.authority.sign_csr(&sign_request).await {
            Ok(signed) => signed,
            Err(e) => {
                warn!(error = %e, "Certificate signing failed");
                return Ok(false);
            }
        };

        let certificate_der = match decode_certificate(&signed.signed_certificate) {
            Ok(der) => der,
            Err(e) => {
                warn!(error = %e, "Authority returned an unreadable certificate");
                return Ok(false);
            }
        };

        let identity = Identity {
            key_pair,
            certificate_der,
            identifiers: BusinessIdentifiers {
                business_id: request.business_id.clone(),
                branch_id: request.branch_id.clone(),
                pos_id: request.pos_id.clone(),
                application_id: request.application_id.clone(),
                fiscalization_no: request.fiscalization_no.clone(),
                business_name: verified.business_name,
            },
        };
        self.persist(&identity)?;

        info!(
            business_id = %identity.identifiers.business_id,
            pos_id = %identity.identifiers.pos_id,
            "POS onboarded with fiscal authority"
        );
        *self.resident.write().await = Some(Arc::new(identity));
        Ok(true)
    }

    /// Sign `payload` with the resident key. Returns base64 DER.
    pub async fn sign(&self, payload: &[u8]) -> Result<String, IdentityError> {
        let identity = self.identity().await?;
        let signature = identity.key_pair.sign(payload)?;
        Ok(Base64::encode_string(&signature))
    }

    /// Serialize, base64 and sign a coupon.
    ///
    /// The signature covers the base64 text exactly as transmitted.
    pub async fn sign_coupon(&self, coupon: &FiscalCoupon) -> Result<SignedCoupon, IdentityError> {
        let details = Base64::encode_string(&wire::serialize(coupon));
        let signature = self.sign(details.as_bytes()).await?;
        Ok(SignedCoupon { details, signature })
    }

    /// Resident business identifiers, loading them if needed.
    pub async fn identifiers(&self) -> Result<BusinessIdentifiers, IdentityError> {
        Ok(self.identity().await?.identifiers.clone())
    }

    /// The resident identity, loading it if needed.
    pub async fn identity(&self) -> Result<Arc<Identity>, IdentityError> {
        if let Some(identity) = self.resident.read().await.as_ref() {
            return Ok(Arc::clone(identity));
        }
        if !self.load().await? {
            return Err(IdentityError::KeyUnavailable);
        }
        self.resident
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(IdentityError::KeyUnavailable)
    }

    fn read_persisted(&self) -> Result<Option<Identity>, IdentityError> {
        let (Some(key_b64), Some(cert_b64)) = (
            self.preferences.get(PREF_PRIVATE_KEY)?,
            self.preferences.get(PREF_CERTIFICATE)?,
        ) else {
            return Ok(None);
        };

        let pkcs8 = zeroize::Zeroizing::new(
            Base64::decode_vec(&key_b64)
                .map_err(|e| IdentityError::CorruptCredential(format!("private key: {e}")))?,
        );
        let key_pair = SigningKeyPair::from_pkcs8(&pkcs8)
            .map_err(|e| IdentityError::CorruptCredential(format!("private key: {e}")))?;
        let certificate_der = Base64::decode_vec(&cert_b64)
            .map_err(|e| IdentityError::CorruptCredential(format!("certificate: {e}")))?;

        let required = |key: &str| -> Result<String, IdentityError> {
            self.preferences
                .get(key)?
                .ok_or_else(|| IdentityError::CorruptCredential(format!("missing {key}")))
        };

        Ok(Some(Identity {
            key_pair,
            certificate_der,
            identifiers: BusinessIdentifiers {
                business_id: required(PREF_BUSINESS_ID)?,
                branch_id: required(PREF_BRANCH_ID)?,
                pos_id: required(PREF_POS_ID)?,
                application_id: required(PREF_APPLICATION_ID)?,
                fiscalization_no: required(PREF_FISCALIZATION_NO)?,
                business_name: self.preferences.get(PREF_BUSINESS_NAME)?.unwrap_or_default(),
            },
        }))
    }

    fn persist(&self, identity: &Identity) -> Result<(), IdentityError> {
        let ids = &identity.identifiers;
        let prefs = &self.preferences;
        prefs.set(PREF_BUSINESS_ID, &ids.business_id)?;
        prefs.set(PREF_BRANCH_ID, &ids.branch_id)?;
        prefs.set(PREF_POS_ID, &ids.pos_id)?;
        prefs.set(PREF_APPLICATION_ID, &ids.application_id)?;
        prefs.set(PREF_FISCALIZATION_NO, &ids.fiscalization_no)?;
        prefs.set(PREF_BUSINESS_NAME, &ids.business_name)?;
        prefs.set(PREF_CERTIFICATE, &Base64::encode_string(&identity.certificate_der))?;
        let key_b64 = zeroize::Zeroizing::new(Base64::encode_string(identity.key_pair.pkcs8_der()));
        prefs.set(PREF_PRIVATE_KEY, &key_b64)?;
        Ok(())
    }
}

/// Certificate text from the authority: PEM, or bare base64 DER.
fn decode_certificate(text: &str) -> Result<Vec<u8>, String> {
    let trimmed = text.trim();
    if trimmed.starts_with("-----BEGIN") {
        return pem::parse(trimmed)
            .map(|block| block.contents().to_vec())
            .map_err(|e| e.to_string());
    }
    let der = Base64::decode_vec(trimmed).map_err(|e| e.to_string())?;
    if der.is_empty() {
        return Err("empty certificate".to_string());
    }
    Ok(der)
}
