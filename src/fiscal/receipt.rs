// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Receipt QR payloads.
//!
//! Signed form: `business;pos;reference;issued_at;total_minor;signature`,
//! where the signature (base64 DER) covers everything before the last `;`.
//! Anyone holding the POS public key can verify a printed receipt.
//!
//! If signing is not possible the receipt still prints, with an unsigned
//! plain-text summary.

use base64ct::{Base64, Encoding};
use chrono::SecondsFormat;
use tracing::warn;

use super::client::FiscalAuthority;
use super::coupon::to_minor_units;
use crate::crypto::{verify_signature, CryptoError};
use crate::error::FiscalError;
use crate::identity::{BusinessIdentifiers, IdentityManager};
use crate::models::Transaction;
use crate::storage::PreferenceStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptQr {
    pub payload: String,
    /// False when the payload is the unsigned fallback.
    pub signed: bool,
}

pub async fn generate_receipt_qr<P, A>(
    identity: &IdentityManager<P, A>,
    transaction: &Transaction,
) -> ReceiptQr
where
    P: PreferenceStore,
    A: FiscalAuthority,
{
    match signed_payload(identity, transaction).await {
        Ok(payload) => ReceiptQr {
            payload,
            signed: true,
        },
        Err(e) => {
            warn!(transaction_id = %transaction.id, error = %e, "Receipt signing failed, printing unsigned summary");
            ReceiptQr {
                payload: unsigned_summary(transaction),
                signed: false,
            }
        }
    }
}

/// Check a signed payload against the POS public key.
pub fn verify_receipt_qr(payload: &str, public_key: &[u8]) -> Result<(), CryptoError> {
    let (body, signature) = payload.rsplit_once(';').ok_or(CryptoError::Verification)?;
    let der = Base64::decode_vec(signature).map_err(|_| CryptoError::Verification)?;
    verify_signature(public_key, body.as_bytes(), &der)
}

async fn signed_payload<P, A>(
    identity: &IdentityManager<P, A>,
    transaction: &Transaction,
) -> Result<String, FiscalError>
where
    P: PreferenceStore,
    A: FiscalAuthority,
{
    let identifiers = identity.identifiers().await?;
    let body = receipt_body(&identifiers, transaction)?;
    let signature = identity.sign(body.as_bytes()).await?;
    Ok(format!("{body};{signature}"))
}

fn receipt_body(identifiers: &BusinessIdentifiers, transaction: &Transaction) -> Result<String, FiscalError> {
    Ok(format!(
        "{};{};{};{};{}",
        identifiers.business_id,
        identifiers.pos_id,
        transaction.coupon_reference(),
        transaction
            .created_at
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        to_minor_units(transaction.total_amount)?
    ))
}

fn unsigned_summary(transaction: &Transaction) -> String {
    format!(
        "RECEIPT {} TOTAL {} DATE {}",
        transaction.coupon_reference(),
        transaction.total_amount.round_dp(2),
        transaction
            .created_at
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiscal::client::mock::MockAuthority;
    use crate::identity::OnboardingRequest;
    use crate::models::TransactionItem;
    use crate::storage::MemoryPreferences;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn sale() -> Transaction {
        let mut tx = Transaction::new_sale(
            "Walk-in",
            vec![TransactionItem::new(
                "Widget",
                Decimal::ONE,
                Decimal::new(1999, 2),
                Decimal::new(18, 0),
            )],
            "Cash",
        );
        tx.mark_fiscalized(Some("ATK-9".into()));
        tx
    }

    fn manager() -> IdentityManager<MemoryPreferences, MockAuthority> {
        IdentityManager::new(
            Arc::new(MemoryPreferences::new()),
            Arc::new(MockAuthority::new()),
        )
    }

    #[tokio::test]
    async fn signed_payload_verifies_with_public_key() {
        let identity = manager();
        let request = OnboardingRequest {
            business_id: "810123456".into(),
            pos_id: "7".into(),
            branch_id: "01".into(),
            application_id: "app-1".into(),
            fiscalization_no: "FN-42".into(),
        };
        assert!(identity.onboard(&request).await.unwrap());

        let qr = generate_receipt_qr(&identity, &sale()).await;
        assert!(qr.signed);
        assert!(qr.payload.starts_with("810123456;7;ATK-9;"));
        assert!(qr.payload.contains(";1999;"));

        let public_key = identity.identity().await.unwrap().public_key().to_vec();
        verify_receipt_qr(&qr.payload, &public_key).unwrap();

        let tampered = qr.payload.replacen(";1999;", ";1;", 1);
        assert_eq!(
            verify_receipt_qr(&tampered, &public_key),
            Err(CryptoError::Verification)
        );
    }

    #[tokio::test]
    async fn falls_back_to_unsigned_summary() {
        let qr = generate_receipt_qr(&manager(), &sale()).await;
        assert!(!qr.signed);
        assert!(qr.payload.starts_with("RECEIPT ATK-9 TOTAL 19.99"));
    }
}
