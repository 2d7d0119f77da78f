// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Fiscal Coupon Builder
//!
//! Maps a [`Transaction`] onto the authority's coupon model.
//!
//! Every decimal amount is converted to integer minor units exactly once,
//! per line, with `round(amount * 100)` (midpoint away from zero). Totals
//! are sums of the converted lines, so `total == total_no_tax + total_tax`
//! holds by construction; it is still checked before a coupon is returned.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::FiscalError;
use crate::identity::BusinessIdentifiers;
use crate::models::Transaction;

/// Kind of fiscal event a coupon records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponType {
    Sale,
    Return,
    Cancel,
}

/// Closed set of payment types the authority accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Cash,
    CreditCard,
    Voucher,
    Cheque,
    CryptoCurrency,
    Other,
}

impl PaymentType {
    /// Map a till payment method string. Unknown methods are treated as cash.
    pub fn from_method(method: &str) -> Self {
        match method.trim().to_ascii_lowercase().as_str() {
            "cash" => Self::Cash,
            "card" | "credit card" | "creditcard" | "debit card" => Self::CreditCard,
            "voucher" | "gift card" => Self::Voucher,
            "cheque" | "check" => Self::Cheque,
            "crypto" | "cryptocurrency" => Self::CryptoCurrency,
            "other" => Self::Other,
            _ => Self::Cash,
        }
    }
}

// =============================================================================
// Tax Rate Table
// =============================================================================

/// What to do with a tax rate missing from the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownTaxRatePolicy {
    /// File the line under the highest-rate code.
    #[default]
    HighestRate,
    /// Refuse to build the coupon.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TaxRateEntry {
    rate: Decimal,
    code: String,
}

/// Percentage rate to authority tax code lookup.
#[derive(Debug, Clone)]
pub struct TaxRateTable {
    entries: Vec<TaxRateEntry>,
    policy: UnknownTaxRatePolicy,
}

impl Default for TaxRateTable {
    fn default() -> Self {
        Self::new(UnknownTaxRatePolicy::default())
            .with_rate(Decimal::ZERO, "C")
            .with_rate(Decimal::new(8, 0), "D")
            .with_rate(Decimal::new(18, 0), "E")
            .with_rate(Decimal::new(20, 0), "E")
    }
}

impl TaxRateTable {
    /// Empty table.
    pub fn new(policy: UnknownTaxRatePolicy) -> Self {
        Self {
            entries: Vec::new(),
            policy,
        }
    }

    pub fn with_rate(mut self, rate: Decimal, code: impl Into<String>) -> Self {
        self.entries.retain(|entry| entry.rate != rate);
        self.entries.push(TaxRateEntry {
            rate,
            code: code.into(),
        });
        self
    }

    pub fn with_policy(mut self, policy: UnknownTaxRatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> UnknownTaxRatePolicy {
        self.policy
    }

    /// Tax code for a percentage rate.
    pub fn code_for(&self, rate: Decimal) -> Result<&str, FiscalError> {
        if let Some(entry) = self.entries.iter().find(|entry| entry.rate == rate) {
            return Ok(&entry.code);
        }

        match self.policy {
            UnknownTaxRatePolicy::HighestRate => self
                .entries
                .iter()
                .max_by(|a, b| a.rate.cmp(&b.rate))
                .map(|entry| entry.code.as_str())
                .ok_or_else(|| FiscalError::Validation("tax rate table is empty".to_string())),
            UnknownTaxRatePolicy::Reject => Err(FiscalError::Validation(format!(
                "unsupported tax rate {rate}%"
            ))),
        }
    }
}

// =============================================================================
// Coupon Model
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponItem {
    pub name: String,
    /// Quantity in thousandths of a unit.
    pub quantity_milli: i64,
    pub unit_price: i64,
    pub total: i64,
    pub tax: i64,
    pub tax_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponPayment {
    pub payment_type: PaymentType,
    pub amount: i64,
}

/// Subtotals for one tax code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxGroup {
    pub code: String,
    pub taxable_base: i64,
    pub tax: i64,
}

/// One fiscal event, amounts in integer minor units.
///
/// Immutable once built; reversal coupons are derived with
/// [`with_reversal`](Self::with_reversal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiscalCoupon {
    pub coupon_type: CouponType,
    /// Coupon reference of the original sale (reversals only).
    pub reference_no: Option<String>,
    /// Local transaction this coupon was built from.
    pub transaction_id: String,
    pub business_id: String,
    pub branch_id: String,
    pub pos_id: String,
    pub application_id: String,
    pub fiscalization_no: String,
    pub issued_at: DateTime<Utc>,
    pub total: i64,
    pub total_no_tax: i64,
    pub total_tax: i64,
    pub total_discount: i64,
    pub items: Vec<CouponItem>,
    pub payments: Vec<CouponPayment>,
    pub tax_groups: Vec<TaxGroup>,
}

impl FiscalCoupon {
    /// Turn a sale coupon into a Cancel or Return referencing `reference_no`.
    pub fn with_reversal(mut self, coupon_type: CouponType, reference_no: impl Into<String>) -> Self {
        self.coupon_type = coupon_type;
        self.reference_no = Some(reference_no.into());
        self
    }

    fn check_totals(&self) -> Result<(), FiscalError> {
        let expected = i128::from(self.total_no_tax) + i128::from(self.total_tax)
            - i128::from(self.total_discount);
        if i128::from(self.total) != expected {
            return Err(FiscalError::CouponInvariant(format!(
                "total {} != no_tax {} + tax {} - discount {}",
                self.total, self.total_no_tax, self.total_tax, self.total_discount
            )));
        }
        let paid: i128 = self.payments.iter().map(|p| i128::from(p.amount)).sum();
        if paid != i128::from(self.total) {
            return Err(FiscalError::CouponInvariant(format!(
                "payments {paid} != total {}",
                self.total
            )));
        }
        Ok(())
    }
}

/// Decimal currency amount to integer minor units.
pub fn to_minor_units(amount: Decimal) -> Result<i64, FiscalError> {
    scale_to_i64(amount, Decimal::ONE_HUNDRED)
}

fn scale_to_i64(amount: Decimal, factor: Decimal) -> Result<i64, FiscalError> {
    amount
        .checked_mul(factor)
        .map(|scaled| scaled.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|rounded| rounded.to_i64())
        .ok_or_else(|| FiscalError::Validation(format!("amount {amount} out of range")))
}

fn amount_overflow() -> FiscalError {
    FiscalError::Validation("coupon amounts exceed the representable range".to_string())
}

fn checked_sum(values: impl IntoIterator<Item = i64>) -> Result<i64, FiscalError> {
    values
        .into_iter()
        .try_fold(0i64, |acc, value| acc.checked_add(value))
        .ok_or_else(amount_overflow)
}

/// Build a Sale coupon for `transaction`.
pub fn build_coupon(
    transaction: &Transaction,
    identifiers: &BusinessIdentifiers,
    tax_table: &TaxRateTable,
) -> Result<FiscalCoupon, FiscalError> {
    let mut items = Vec::with_capacity(transaction.items.len());
    let mut groups: BTreeMap<String, TaxGroup> = BTreeMap::new();

    for item in &transaction.items {
        let total = to_minor_units(item.total)?;
        let tax = to_minor_units(item.tax_amount)?;
        let code = tax_table.code_for(item.tax_rate)?.to_string();

        let group = groups.entry(code.clone()).or_insert_with(|| TaxGroup {
            code: code.clone(),
            taxable_base: 0,
            tax: 0,
        });
        let base = total.checked_sub(tax).ok_or_else(amount_overflow)?;
        group.taxable_base = group.taxable_base.checked_add(base).ok_or_else(amount_overflow)?;
        group.tax = group.tax.checked_add(tax).ok_or_else(amount_overflow)?;

        items.push(CouponItem {
            name: item.product_name.clone(),
            quantity_milli: scale_to_i64(item.quantity, Decimal::ONE_THOUSAND)?,
            unit_price: to_minor_units(item.unit_price)?,
            total,
            tax,
            tax_code: code,
        });
    }

    let total = checked_sum(items.iter().map(|item| item.total))?;
    let total_tax = checked_sum(items.iter().map(|item| item.tax))?;
    let total_no_tax = checked_sum(groups.values().map(|group| group.taxable_base))?;

    let coupon = FiscalCoupon {
        coupon_type: CouponType::Sale,
        reference_no: None,
        transaction_id: transaction.id.clone(),
        business_id: identifiers.business_id.clone(),
        branch_id: identifiers.branch_id.clone(),
        pos_id: identifiers.pos_id.clone(),
        application_id: identifiers.application_id.clone(),
        fiscalization_no: identifiers.fiscalization_no.clone(),
        issued_at: Utc::now(),
        total,
        total_no_tax,
        total_tax,
        total_discount: 0,
        items,
        payments: vec![CouponPayment {
            payment_type: PaymentType::from_method(&transaction.payment_method),
            amount: total,
        }],
        tax_groups: groups.into_values().collect(),
    };

    coupon.check_totals()?;
    Ok(coupon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TransactionItem, TransactionKind};
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    fn ids() -> BusinessIdentifiers {
        BusinessIdentifiers {
            business_id: "810123456".into(),
            branch_id: "01".into(),
            pos_id: "7".into(),
            application_id: "app-1".into(),
            fiscalization_no: "FN-42".into(),
            business_name: "Corner Shop".into(),
        }
    }

    fn sale(items: Vec<TransactionItem>, method: &str) -> Transaction {
        Transaction::new_sale("Walk-in", items, method)
    }

    #[test]
    fn hundred_unit_sale_at_eighteen_percent() {
        let tx = sale(
            vec![TransactionItem::new("Widget", dec("1"), dec("100.00"), dec("18"))],
            "Cash",
        );
        let coupon = build_coupon(&tx, &ids(), &TaxRateTable::default()).unwrap();

        assert_eq!(coupon.coupon_type, CouponType::Sale);
        assert_eq!(coupon.total, 10000);
        assert_eq!(coupon.total_tax, 1525);
        assert_eq!(coupon.total_no_tax, 8475);
        assert_eq!(coupon.total_discount, 0);
        assert_eq!(coupon.tax_groups.len(), 1);
        assert_eq!(coupon.tax_groups[0].code, "E");
        assert_eq!(coupon.payments, vec![CouponPayment {
            payment_type: PaymentType::Cash,
            amount: 10000,
        }]);
    }

    #[test]
    fn items_are_grouped_by_tax_code() {
        let tx = sale(
            vec![
                TransactionItem::new("Bread", dec("2"), dec("1.08"), dec("8")),
                TransactionItem::new("Beer", dec("1"), dec("2.40"), dec("20")),
                TransactionItem::new("Soap", dec("3"), dec("1.18"), dec("18")),
                TransactionItem::new("Stamp", dec("1"), dec("0.50"), dec("0")),
            ],
            "Card",
        );
        let coupon = build_coupon(&tx, &ids(), &TaxRateTable::default()).unwrap();

        let codes: Vec<_> = coupon.tax_groups.iter().map(|g| g.code.as_str()).collect();
        assert_eq!(codes, vec!["C", "D", "E"]);

        let group_e = &coupon.tax_groups[2];
        // 2.40 at 20% -> 0.40 tax, 3.54 at 18% -> 0.54 tax
        assert_eq!(group_e.tax, 40 + 54);
        assert_eq!(group_e.taxable_base, (240 - 40) + (354 - 54));

        assert_eq!(coupon.tax_groups[0].tax, 0);
        assert_eq!(coupon.total, 216 + 240 + 354 + 50);
        assert_eq!(coupon.total, coupon.total_no_tax + coupon.total_tax);
        assert_eq!(coupon.payments[0].payment_type, PaymentType::CreditCard);
    }

    #[test]
    fn totals_balance_across_awkward_rounding() {
        let tx = sale(
            vec![
                TransactionItem::new("A", dec("3"), dec("0.33"), dec("18")),
                TransactionItem::new("B", dec("1.25"), dec("7.99"), dec("8")),
                TransactionItem::new("C", dec("7"), dec("0.01"), dec("18")),
            ],
            "Cash",
        );
        let coupon = build_coupon(&tx, &ids(), &TaxRateTable::default()).unwrap();
        assert_eq!(coupon.total, coupon.total_no_tax + coupon.total_tax);
        assert_eq!(coupon.items[1].quantity_milli, 1250);
    }

    #[test]
    fn unknown_rate_uses_highest_code_by_default() {
        let tx = sale(
            vec![TransactionItem::new("Odd", dec("1"), dec("10.00"), dec("13"))],
            "Cash",
        );
        let coupon = build_coupon(&tx, &ids(), &TaxRateTable::default()).unwrap();
        assert_eq!(coupon.items[0].tax_code, "E");
    }

    #[test]
    fn unknown_rate_can_be_rejected() {
        let tx = sale(
            vec![TransactionItem::new("Odd", dec("1"), dec("10.00"), dec("13"))],
            "Cash",
        );
        let table = TaxRateTable::default().with_policy(UnknownTaxRatePolicy::Reject);
        let err = build_coupon(&tx, &ids(), &table).unwrap_err();
        assert!(matches!(err, FiscalError::Validation(_)));
    }

    #[test]
    fn summed_lines_beyond_i64_are_rejected() {
        // Each line fits in minor units on its own, the sum does not
        let line = || TransactionItem::new("Bulk", dec("1"), dec("60000000000000000.00"), dec("0"));
        let tx = sale(vec![line(), line()], "Cash");

        let err = build_coupon(&tx, &ids(), &TaxRateTable::default()).unwrap_err();
        assert!(matches!(err, FiscalError::Validation(_)));
    }

    #[test]
    fn cancel_of_fifty_unit_sale() {
        let mut original = sale(
            vec![TransactionItem::new("Lamp", dec("1"), dec("50.00"), dec("18"))],
            "Cash",
        );
        original.mark_fiscalized(Some("ATK-1".into()));

        let items = original.items.iter().map(TransactionItem::negated).collect();
        let reversal = Transaction::new_reversal(&original, TransactionKind::Cancel, items, "void");
        let coupon = build_coupon(&reversal, &ids(), &TaxRateTable::default())
            .unwrap()
            .with_reversal(CouponType::Cancel, original.coupon_reference());

        assert_eq!(coupon.coupon_type, CouponType::Cancel);
        assert_eq!(coupon.reference_no.as_deref(), Some("ATK-1"));
        assert_eq!(coupon.total, -5000);
        assert_eq!(coupon.total_tax, -763);
        assert_eq!(coupon.total_no_tax, -4237);
        assert_eq!(coupon.items[0].quantity_milli, -1000);
    }

    #[test]
    fn minor_units_round_half_away_from_zero() {
        assert_eq!(to_minor_units(dec("0.005")).unwrap(), 1);
        assert_eq!(to_minor_units(dec("-0.005")).unwrap(), -1);
        assert_eq!(to_minor_units(dec("15.2542")).unwrap(), 1525);
        assert_eq!(to_minor_units(dec("0.004")).unwrap(), 0);
    }

    #[test]
    fn payment_method_mapping() {
        assert_eq!(PaymentType::from_method("Cash"), PaymentType::Cash);
        assert_eq!(PaymentType::from_method("Credit Card"), PaymentType::CreditCard);
        assert_eq!(PaymentType::from_method("voucher"), PaymentType::Voucher);
        assert_eq!(PaymentType::from_method("Check"), PaymentType::Cheque);
        assert_eq!(PaymentType::from_method("crypto"), PaymentType::CryptoCurrency);
        assert_eq!(PaymentType::from_method("other"), PaymentType::Other);
        assert_eq!(PaymentType::from_method("barter"), PaymentType::Cash);
    }
}
