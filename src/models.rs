// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Transaction Records
//!
//! The business [`Transaction`] is owned by the CRUD layer; the fiscal core
//! reads it, derives coupons from it and updates its fiscal status.
//!
//! ## Status Lifecycle
//!
//! ```text
//! Completed ──submit──▶ Fiscalized
//!     │                     │
//!     └──▶ FiscalFailed ──retry──▶ Fiscalized
//!
//! Completed | Fiscalized ──cancel──▶ Cancelled   (+ new Cancel reversal)
//! Completed | Fiscalized ──return──▶ Refunded    (+ new Return reversal)
//! ```
//!
//! All monetary values are exact decimals. Conversion to integer minor
//! units happens once, in the coupon builder.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fiscal status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Sale completed at the till, not yet accepted by the authority.
    Completed,
    /// Accepted by the fiscal authority.
    Fiscalized,
    /// Last submission failed; eligible for retry.
    FiscalFailed,
    /// Reversed in full by a Cancel coupon.
    Cancelled,
    /// Partially or fully returned by a Return coupon.
    Refunded,
}

impl Default for TransactionStatus {
    fn default() -> Self {
        Self::Completed
    }
}

/// What kind of fiscal event a transaction record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Sale,
    Cancel,
    Return,
}

impl Default for TransactionKind {
    fn default() -> Self {
        Self::Sale
    }
}

/// One line of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionItem {
    pub product_name: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    /// VAT rate in percent (e.g. `18`).
    pub tax_rate: Decimal,
    /// Line total, tax included.
    pub total: Decimal,
    /// Tax included in `total`.
    pub tax_amount: Decimal,
}

impl TransactionItem {
    /// Build a line with tax-inclusive pricing.
    ///
    /// `tax_amount = total * rate / (100 + rate)`, kept at full precision.
    pub fn new(
        product_name: impl Into<String>,
        quantity: Decimal,
        unit_price: Decimal,
        tax_rate: Decimal,
    ) -> Self {
        let total = quantity * unit_price;
        Self {
            product_name: product_name.into(),
            quantity,
            unit_price,
            tax_rate,
            total,
            tax_amount: included_tax(total, tax_rate),
        }
    }

    /// The same line with quantity and amounts negated.
    pub fn negated(&self) -> Self {
        Self {
            product_name: self.product_name.clone(),
            quantity: -self.quantity,
            unit_price: self.unit_price,
            tax_rate: self.tax_rate,
            total: -self.total,
            tax_amount: -self.tax_amount,
        }
    }
}

/// Tax contained in a tax-inclusive amount.
pub fn included_tax(total: Decimal, tax_rate: Decimal) -> Decimal {
    let divisor = Decimal::ONE_HUNDRED + tax_rate;
    if divisor.is_zero() {
        return Decimal::ZERO;
    }
    total * tax_rate / divisor
}

/// A business transaction as persisted in the working database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub customer_name: String,
    pub items: Vec<TransactionItem>,
    /// Grand total, tax included.
    pub total_amount: Decimal,
    /// Free-form payment method as captured at the till ("Cash", "Card", ...).
    pub payment_method: String,
    #[serde(default)]
    pub kind: TransactionKind,
    #[serde(default)]
    pub status: TransactionStatus,
    /// Authority-assigned transaction id once fiscalized.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fiscal_transaction_id: Option<String>,
    /// Last error text returned by a failed submission.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fiscal_error: Option<String>,
    /// Whether the last failure may be retried without operator action.
    #[serde(default)]
    pub fiscal_retryable: bool,
    /// For reversals: the transaction being cancelled or returned.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub original_transaction_id: Option<String>,
    /// For reversals: operator-supplied reason.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Create a completed sale whose total is the sum of its lines.
    pub fn new_sale(
        customer_name: impl Into<String>,
        items: Vec<TransactionItem>,
        payment_method: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let total_amount = items.iter().map(|item| item.total).sum();
        Self {
            id: Uuid::new_v4().to_string(),
            customer_name: customer_name.into(),
            items,
            total_amount,
            payment_method: payment_method.into(),
            kind: TransactionKind::Sale,
            status: TransactionStatus::Completed,
            fiscal_transaction_id: None,
            fiscal_error: None,
            fiscal_retryable: false,
            original_transaction_id: None,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build the linked reversal record for `original`.
    ///
    /// The reversal is a new transaction; the original's amounts are never
    /// mutated.
    pub fn new_reversal(
        original: &Transaction,
        kind: TransactionKind,
        items: Vec<TransactionItem>,
        reason: impl Into<String>,
    ) -> Self {
        let mut reversal = Self::new_sale(
            original.customer_name.clone(),
            items,
            original.payment_method.clone(),
        );
        reversal.kind = kind;
        reversal.original_transaction_id = Some(original.id.clone());
        reversal.reason = Some(reason.into());
        reversal
    }

    /// Identifier used when a later coupon references this one.
    ///
    /// The authority's id once fiscalized, the local id otherwise.
    pub fn coupon_reference(&self) -> &str {
        self.fiscal_transaction_id.as_deref().unwrap_or(&self.id)
    }

    pub fn mark_fiscalized(&mut self, fiscal_transaction_id: Option<String>) {
        self.status = TransactionStatus::Fiscalized;
        if fiscal_transaction_id.is_some() {
            self.fiscal_transaction_id = fiscal_transaction_id;
        }
        self.fiscal_error = None;
        self.fiscal_retryable = false;
        self.updated_at = Utc::now();
    }

    /// Record a failed submission. `retryable` failures are picked up by
    /// the background retry sweep; others wait for an explicit retry.
    pub fn mark_fiscal_failed(&mut self, error: impl Into<String>, retryable: bool) {
        self.status = TransactionStatus::FiscalFailed;
        self.fiscal_error = Some(error.into());
        self.fiscal_retryable = retryable;
        self.updated_at = Utc::now();
    }

    pub fn mark_status(&mut self, status: TransactionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}
