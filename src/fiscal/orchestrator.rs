// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Fiscal Submission Orchestrator
//!
//! Drives a transaction through fiscalization:
//!
//! ```text
//! Completed ──▶ (Submitting) ──▶ Fiscalized
//!                    │
//!                    └────────▶ FiscalFailed ──retry──▶ (Submitting)
//! ```
//!
//! `Submitting` is never persisted. It is the in-flight set below, so a
//! crash leaves the record in its last durable state.
//!
//! Each submission runs in its own spawned task: a caller that stops
//! awaiting does not abort the request, and the outcome is still written
//! through the store. Every failure becomes a [`SubmissionOutcome`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};

use super::client::{CouponAcceptance, FiscalAuthority, SubmitCouponRequest};
use super::coupon::{build_coupon, CouponType, TaxRateTable};
use super::receipt::{self, ReceiptQr};
use crate::error::{FailureKind, FiscalError};
use crate::identity::{IdentityError, IdentityManager, OnboardingRequest};
use crate::models::{Transaction, TransactionItem, TransactionKind, TransactionStatus};
use crate::storage::{AuditEvent, AuditEventType, EncryptedStore, PreferenceStore};

/// Upper bound on one submission, on top of the HTTP client timeout.
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// VAT rate applied to return lines.
pub const DEFAULT_RETURN_TAX_RATE: Decimal = Decimal::from_parts(18, 0, 0, false, 0);

/// Result of a fiscal operation, as shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionOutcome {
    pub success: bool,
    /// Local id of the transaction the coupon was built from.
    pub transaction_id: String,
    pub fiscal_transaction_id: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
}

impl SubmissionOutcome {
    fn accepted(transaction_id: &str, acceptance: CouponAcceptance) -> Self {
        Self {
            success: true,
            transaction_id: transaction_id.to_string(),
            fiscal_transaction_id: acceptance.transaction_id,
            message: acceptance.message,
            error: None,
            failure: None,
        }
    }

    fn already_fiscalized(transaction: &Transaction) -> Self {
        Self {
            success: true,
            transaction_id: transaction.id.clone(),
            fiscal_transaction_id: transaction.fiscal_transaction_id.clone(),
            message: Some("Transaction already fiscalized".to_string()),
            error: None,
            failure: None,
        }
    }

    fn failed(transaction_id: &str, err: &FiscalError) -> Self {
        Self {
            success: false,
            transaction_id: transaction_id.to_string(),
            fiscal_transaction_id: None,
            message: None,
            error: Some(err.to_string()),
            failure: Some(err.kind()),
        }
    }
}

/// Counts from one retry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Removes the transaction id from the in-flight set when dropped.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, id: &str) -> Result<Self, FiscalError> {
        let mut ids = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !ids.insert(id.to_string()) {
            return Err(FiscalError::InFlight(id.to_string()));
        }
        Ok(Self {
            set: Arc::clone(set),
            id: id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut ids = self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ids.remove(&self.id);
    }
}

pub struct FiscalOrchestrator<P, A> {
    store: Arc<EncryptedStore>,
    identity: Arc<IdentityManager<P, A>>,
    authority: Arc<A>,
    tax_table: TaxRateTable,
    submit_timeout: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl<P, A> FiscalOrchestrator<P, A>
where
    P: PreferenceStore + 'static,
    A: FiscalAuthority,
{
    pub fn new(
        store: Arc<EncryptedStore>,
        identity: Arc<IdentityManager<P, A>>,
        authority: Arc<A>,
    ) -> Self {
        Self {
            store,
            identity,
            authority,
            tax_table: TaxRateTable::default(),
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_tax_table(mut self, tax_table: TaxRateTable) -> Self {
        self.tax_table = tax_table;
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    pub fn identity(&self) -> &Arc<IdentityManager<P, A>> {
        &self.identity
    }

    /// Onboard through the identity manager and record it in the audit log.
    pub async fn onboard(&self, request: &OnboardingRequest) -> Result<bool, IdentityError> {
        let onboarded = self.identity.onboard(request).await?;
        let mut event = AuditEvent::new(AuditEventType::IdentityOnboarded)
            .with_detail(format!("business {} pos {}", request.business_id, request.pos_id));
        if !onboarded {
            event = event.failed("authority declined onboarding");
        }
        self.record_audit(event).await;
        Ok(onboarded)
    }

    // ========== Sales ==========

    /// Fiscalize a completed sale.
    pub async fn submit_transaction(self: &Arc<Self>, transaction: Transaction) -> SubmissionOutcome {
        let id = transaction.id.clone();

        if !self.identity.is_onboarded().await {
            warn!(transaction_id = %id, "Submission attempted before onboarding");
            return SubmissionOutcome::failed(&id, &FiscalError::NotConfigured);
        }

        match transaction.status {
            TransactionStatus::Fiscalized => {
                return SubmissionOutcome::already_fiscalized(&transaction);
            }
            TransactionStatus::Cancelled | TransactionStatus::Refunded => {
                return SubmissionOutcome::failed(&id, &not_submittable(transaction.status));
            }
            TransactionStatus::Completed | TransactionStatus::FiscalFailed => {}
        }

        if let Err(err) = validate_sale(&transaction) {
            return SubmissionOutcome::failed(&id, &err);
        }

        let guard = match InFlightGuard::acquire(&self.in_flight, &id) {
            Ok(guard) => guard,
            Err(err) => return SubmissionOutcome::failed(&id, &err),
        };

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let _guard = guard;
            this.submit_owned(transaction).await
        });
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => SubmissionOutcome::failed(&id, &FiscalError::Task(e.to_string())),
        }
    }

    /// Resubmit a stored transaction. No network call when already fiscalized.
    pub async fn retry_failed_fiscalization(self: &Arc<Self>, transaction_id: &str) -> SubmissionOutcome {
        let stored = self
            .store
            .with_database(|db| db.get_transaction(transaction_id))
            .await;

        match stored {
            Ok(Some(transaction)) if transaction.status == TransactionStatus::Fiscalized => {
                info!(transaction_id, "Retry skipped, transaction already fiscalized");
                SubmissionOutcome::already_fiscalized(&transaction)
            }
            Ok(Some(transaction)) => self.submit_transaction(transaction).await,
            Ok(None) => SubmissionOutcome::failed(
                transaction_id,
                &FiscalError::NotFound(transaction_id.to_string()),
            ),
            Err(e) => SubmissionOutcome::failed(transaction_id, &FiscalError::Store(e)),
        }
    }

    /// Retry every failed transaction whose failure is retryable.
    pub async fn retry_all_failed(self: &Arc<Self>) -> Result<RetrySummary, FiscalError> {
        let mut summary = RetrySummary::default();
        if !self.identity.is_onboarded().await {
            return Ok(summary);
        }

        let failed = self
            .store
            .with_database(|db| db.list_by_status(TransactionStatus::FiscalFailed))
            .await?;

        for transaction in failed.into_iter().filter(|tx| tx.fiscal_retryable) {
            summary.attempted += 1;
            let outcome = self.retry_failed_fiscalization(&transaction.id).await;
            if outcome.success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        }
        Ok(summary)
    }

    // ========== Reversals ==========

    /// Cancel `original` in full with a linked Cancel coupon.
    ///
    /// The reversal is persisted, and the original marked `Cancelled`, only
    /// if the authority accepts the coupon. Status checks run against the
    /// stored record, not the caller's copy.
    pub async fn cancel_transaction(
        self: &Arc<Self>,
        original: &Transaction,
        reason: &str,
    ) -> SubmissionOutcome {
        self.submit_reversal(
            &original.id,
            Reversal::Cancel {
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// Return `amount` of `original` as a single negative line taxed at
    /// [`DEFAULT_RETURN_TAX_RATE`].
    pub async fn return_transaction(
        self: &Arc<Self>,
        original: &Transaction,
        amount: Decimal,
        reason: &str,
    ) -> SubmissionOutcome {
        self.submit_reversal(
            &original.id,
            Reversal::Return {
                amount,
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// Receipt QR payload for `transaction`; unsigned summary on failure.
    pub async fn generate_receipt_qr(&self, transaction: &Transaction) -> ReceiptQr {
        receipt::generate_receipt_qr(&self.identity, transaction).await
    }

    // ========== Internals ==========

    async fn submit_owned(&self, mut transaction: Transaction) -> SubmissionOutcome {
        // The durable record decides: a stale copy must neither resubmit a
        // fiscalized sale nor revive a reversed one.
        match self
            .store
            .with_database(|db| db.get_transaction(&transaction.id))
            .await
        {
            Ok(Some(stored)) => match stored.status {
                TransactionStatus::Fiscalized => {
                    return SubmissionOutcome::already_fiscalized(&stored);
                }
                TransactionStatus::Cancelled | TransactionStatus::Refunded => {
                    warn!(transaction_id = %stored.id, status = ?stored.status, "Refusing to submit a reversed transaction");
                    return SubmissionOutcome::failed(&stored.id, &not_submittable(stored.status));
                }
                TransactionStatus::Completed | TransactionStatus::FiscalFailed => {
                    if let Err(err) = validate_sale(&stored) {
                        return SubmissionOutcome::failed(&stored.id, &err);
                    }
                    transaction = stored;
                }
            },
            Ok(None) => {}
            Err(e) => return SubmissionOutcome::failed(&transaction.id, &FiscalError::Store(e)),
        }

        match self.fiscalize(&transaction, None).await {
            Ok(acceptance) => {
                transaction.mark_fiscalized(acceptance.transaction_id.clone());
                info!(
                    transaction_id = %transaction.id,
                    fiscal_transaction_id = ?transaction.fiscal_transaction_id,
                    "Transaction fiscalized"
                );
                let event = AuditEvent::new(AuditEventType::CouponSubmitted)
                    .with_transaction(&transaction.id)
                    .with_fiscal_reference(transaction.fiscal_transaction_id.clone());
                let mut outcome = SubmissionOutcome::accepted(&transaction.id, acceptance);
                if let Err(e) = self.persist(&[&transaction], event).await {
                    error!(transaction_id = %transaction.id, error = %e, "Accepted coupon could not be recorded locally");
                    outcome.error = Some(format!("accepted by authority but not saved locally: {e}"));
                    outcome.failure = Some(e.kind());
                }
                outcome
            }
            Err(err) => {
                warn!(transaction_id = %transaction.id, error = %err, "Fiscalization failed");
                transaction.mark_fiscal_failed(err.to_string(), err.kind().is_retryable());
                let event = AuditEvent::new(AuditEventType::CouponRejected)
                    .with_transaction(&transaction.id)
                    .failed(err.to_string());
                if let Err(e) = self.persist(&[&transaction], event).await {
                    error!(transaction_id = %transaction.id, error = %e, "Failed to record fiscal failure");
                }
                SubmissionOutcome::failed(&transaction.id, &err)
            }
        }
    }

    async fn submit_reversal(self: &Arc<Self>, original_id: &str, reversal: Reversal) -> SubmissionOutcome {
        let guard = match InFlightGuard::acquire(&self.in_flight, original_id) {
            Ok(guard) => guard,
            Err(err) => return SubmissionOutcome::failed(original_id, &err),
        };

        let this = Arc::clone(self);
        let id = original_id.to_string();
        let task = tokio::spawn(async move {
            let _guard = guard;
            this.reverse_owned(&id, reversal).await
        });
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => SubmissionOutcome::failed(original_id, &FiscalError::Task(e.to_string())),
        }
    }

    async fn reverse_owned(&self, original_id: &str, plan: Reversal) -> SubmissionOutcome {
        let mut original = match self.load_reversible(original_id, &plan).await {
            Ok(original) => original,
            Err(err) => {
                warn!(original_id, error = %err, coupon_type = ?plan.coupon_type(), "Reversal refused");
                return SubmissionOutcome::failed(original_id, &err);
            }
        };

        let mut reversal = match &plan {
            Reversal::Cancel { reason } => {
                let items = original.items.iter().map(TransactionItem::negated).collect();
                Transaction::new_reversal(&original, TransactionKind::Cancel, items, reason.as_str())
            }
            Reversal::Return { amount, reason } => {
                let line = TransactionItem::new(
                    format!("Return: {}", return_label(&original)),
                    -Decimal::ONE,
                    *amount,
                    DEFAULT_RETURN_TAX_RATE,
                );
                Transaction::new_reversal(&original, TransactionKind::Return, vec![line], reason.as_str())
            }
        };
        let coupon_type = plan.coupon_type();
        let reference = original.coupon_reference().to_string();

        match self.fiscalize(&reversal, Some((coupon_type, reference.clone()))).await {
            Ok(acceptance) => {
                reversal.mark_fiscalized(acceptance.transaction_id.clone());
                original.mark_status(plan.original_status());
                info!(
                    original_id = %original.id,
                    reversal_id = %reversal.id,
                    ?coupon_type,
                    "Reversal fiscalized"
                );
                let event = AuditEvent::new(plan.event_type())
                    .with_transaction(&original.id)
                    .with_fiscal_reference(reversal.fiscal_transaction_id.clone())
                    .with_detail(format!("reversal {} references {reference}", reversal.id));
                let mut outcome = SubmissionOutcome::accepted(&reversal.id, acceptance);
                if let Err(e) = self.persist(&[&original, &reversal], event).await {
                    error!(original_id = %original.id, error = %e, "Accepted reversal could not be recorded locally");
                    outcome.error = Some(format!("accepted by authority but not saved locally: {e}"));
                    outcome.failure = Some(e.kind());
                }
                outcome
            }
            Err(err) => {
                warn!(original_id = %original.id, error = %err, ?coupon_type, "Reversal failed");
                self.record_audit(
                    AuditEvent::new(plan.event_type())
                        .with_transaction(&original.id)
                        .failed(err.to_string()),
                )
                .await;
                SubmissionOutcome::failed(&reversal.id, &err)
            }
        }
    }

    /// Build, sign and submit the coupon for `transaction`.
    async fn fiscalize(
        &self,
        transaction: &Transaction,
        reversal: Option<(CouponType, String)>,
    ) -> Result<CouponAcceptance, FiscalError> {
        let identifiers = self.identity.identifiers().await?;
        let mut coupon = build_coupon(transaction, &identifiers, &self.tax_table)?;
        if let Some((coupon_type, reference)) = reversal {
            coupon = coupon.with_reversal(coupon_type, reference);
        }

        let signed = self.identity.sign_coupon(&coupon).await?;
        let request = SubmitCouponRequest {
            details: signed.details,
            signature: signed.signature,
        };

        info!(
            transaction_id = %transaction.id,
            coupon_type = ?coupon.coupon_type,
            total = coupon.total,
            "Submitting fiscal coupon"
        );
        match tokio::time::timeout(self.submit_timeout, self.authority.submit_coupon(&request)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(FiscalError::Timeout(self.submit_timeout)),
        }
    }

    /// Load the stored original and check `plan` against it and against the
    /// reversals already recorded for it.
    async fn load_reversible(&self, original_id: &str, plan: &Reversal) -> Result<Transaction, FiscalError> {
        if !self.identity.is_onboarded().await {
            return Err(FiscalError::NotConfigured);
        }

        let (stored, previous) = self
            .store
            .with_database(|db| Ok((db.get_transaction(original_id)?, db.list_reversals_of(original_id)?)))
            .await?;
        let original = stored.ok_or_else(|| FiscalError::NotFound(original_id.to_string()))?;

        if original.kind != TransactionKind::Sale {
            return Err(FiscalError::Validation("only sales can be reversed".to_string()));
        }
        if !plan.allowed_from().contains(&original.status) {
            return Err(FiscalError::Validation(format!(
                "transaction in status {:?} cannot be reversed this way",
                original.status
            )));
        }
        validate_sale(&original)?;

        match plan {
            Reversal::Cancel { .. } if !previous.is_empty() => Err(FiscalError::Validation(format!(
                "transaction already has {} reversal(s) and cannot be cancelled in full",
                previous.len()
            ))),
            Reversal::Cancel { .. } => Ok(original),
            Reversal::Return { amount, .. } => {
                if *amount <= Decimal::ZERO {
                    return Err(FiscalError::Validation("return amount must be positive".to_string()));
                }
                let already_returned: Decimal = previous.iter().map(|r| -r.total_amount).sum();
                let remaining = original.total_amount - already_returned;
                if *amount > remaining {
                    return Err(FiscalError::Validation(format!(
                        "return amount {amount} exceeds refundable balance {remaining}"
                    )));
                }
                Ok(original)
            }
        }
    }

    async fn persist(&self, transactions: &[&Transaction], event: AuditEvent) -> Result<(), FiscalError> {
        self.store
            .with_database(|db| {
                db.upsert_transactions(transactions)?;
                db.append_audit(&event)
            })
            .await?;
        Ok(())
    }

    async fn record_audit(&self, event: AuditEvent) {
        if let Err(e) = self.store.with_database(|db| db.append_audit(&event)).await {
            warn!(error = %e, "Failed to write audit event");
        }
    }
}

/// A requested reversal of a stored sale.
#[derive(Debug, Clone)]
enum Reversal {
    Cancel { reason: String },
    Return { amount: Decimal, reason: String },
}

impl Reversal {
    fn coupon_type(&self) -> CouponType {
        match self {
            Self::Cancel { .. } => CouponType::Cancel,
            Self::Return { .. } => CouponType::Return,
        }
    }

    /// Status the original moves to once the reversal is accepted.
    fn original_status(&self) -> TransactionStatus {
        match self {
            Self::Cancel { .. } => TransactionStatus::Cancelled,
            Self::Return { .. } => TransactionStatus::Refunded,
        }
    }

    fn event_type(&self) -> AuditEventType {
        match self {
            Self::Cancel { .. } => AuditEventType::TransactionCancelled,
            Self::Return { .. } => AuditEventType::TransactionRefunded,
        }
    }

    fn allowed_from(&self) -> &'static [TransactionStatus] {
        match self {
            Self::Cancel { .. } => &[TransactionStatus::Completed, TransactionStatus::Fiscalized],
            Self::Return { .. } => &[
                TransactionStatus::Completed,
                TransactionStatus::Fiscalized,
                TransactionStatus::Refunded,
            ],
        }
    }
}

fn not_submittable(status: TransactionStatus) -> FiscalError {
    FiscalError::Validation(format!("transaction is {status:?} and cannot be submitted"))
}

/// Local checks a sale must pass before any coupon is built.
pub fn validate_sale(transaction: &Transaction) -> Result<(), FiscalError> {
    if transaction.customer_name.trim().is_empty() {
        return Err(FiscalError::Validation("customer name is required".to_string()));
    }
    if transaction.items.is_empty() {
        return Err(FiscalError::Validation("transaction has no items".to_string()));
    }
    if transaction.total_amount <= Decimal::ZERO {
        return Err(FiscalError::Validation("total must be positive".to_string()));
    }
    let items_total: Decimal = transaction.items.iter().map(|item| item.total).sum();
    if items_total != transaction.total_amount {
        return Err(FiscalError::Validation(format!(
            "total {} does not match item sum {items_total}",
            transaction.total_amount
        )));
    }
    Ok(())
}

fn return_label(original: &Transaction) -> String {
    match original.items.as_slice() {
        [single] => single.product_name.clone(),
        _ => format!("{} items", original.items.len()),
    }
}
