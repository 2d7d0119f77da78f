// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Binary coupon encoding.
//!
//! Protobuf messages (schema version 1) encoded with `prost`. Field numbers
//! are a versioned contract with the authority; append new fields, never
//! renumber. Repeated fields keep the builder's order and prost writes fields
//! in tag order, so the same coupon always encodes to the same bytes.

use prost::Message;

use super::coupon::{CouponType, FiscalCoupon, PaymentType};

pub const WIRE_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CouponTypeCode {
    Unspecified = 0,
    Sale = 1,
    Return = 2,
    Cancel = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PaymentTypeCode {
    Unspecified = 0,
    Cash = 1,
    CreditCard = 2,
    Voucher = 3,
    Cheque = 4,
    CryptoCurrency = 5,
    Other = 6,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CouponMessage {
    #[prost(uint32, tag = "1")]
    pub schema_version: u32,
    #[prost(enumeration = "CouponTypeCode", tag = "2")]
    pub coupon_type: i32,
    #[prost(string, tag = "3")]
    pub reference_no: String,
    #[prost(string, tag = "4")]
    pub business_id: String,
    #[prost(string, tag = "5")]
    pub branch_id: String,
    #[prost(string, tag = "6")]
    pub pos_id: String,
    #[prost(string, tag = "7")]
    pub application_id: String,
    #[prost(string, tag = "8")]
    pub fiscalization_no: String,
    #[prost(string, tag = "9")]
    pub transaction_id: String,
    /// Unix milliseconds, UTC.
    #[prost(int64, tag = "10")]
    pub issued_at: i64,
    #[prost(int64, tag = "11")]
    pub total: i64,
    #[prost(int64, tag = "12")]
    pub total_no_tax: i64,
    #[prost(int64, tag = "13")]
    pub total_tax: i64,
    #[prost(int64, tag = "14")]
    pub total_discount: i64,
    #[prost(message, repeated, tag = "15")]
    pub items: Vec<ItemMessage>,
    #[prost(message, repeated, tag = "16")]
    pub payments: Vec<PaymentMessage>,
    #[prost(message, repeated, tag = "17")]
    pub tax_groups: Vec<TaxGroupMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ItemMessage {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Thousandths of a unit.
    #[prost(int64, tag = "2")]
    pub quantity: i64,
    #[prost(int64, tag = "3")]
    pub unit_price: i64,
    #[prost(int64, tag = "4")]
    pub total: i64,
    #[prost(int64, tag = "5")]
    pub tax: i64,
    #[prost(string, tag = "6")]
    pub tax_code: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PaymentMessage {
    #[prost(enumeration = "PaymentTypeCode", tag = "1")]
    pub payment_type: i32,
    #[prost(int64, tag = "2")]
    pub amount: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TaxGroupMessage {
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(int64, tag = "2")]
    pub taxable_base: i64,
    #[prost(int64, tag = "3")]
    pub tax: i64,
}

impl From<CouponType> for CouponTypeCode {
    fn from(value: CouponType) -> Self {
        match value {
            CouponType::Sale => Self::Sale,
            CouponType::Return => Self::Return,
            CouponType::Cancel => Self::Cancel,
        }
    }
}

impl From<PaymentType> for PaymentTypeCode {
    fn from(value: PaymentType) -> Self {
        match value {
            PaymentType::Cash => Self::Cash,
            PaymentType::CreditCard => Self::CreditCard,
            PaymentType::Voucher => Self::Voucher,
            PaymentType::Cheque => Self::Cheque,
            PaymentType::CryptoCurrency => Self::CryptoCurrency,
            PaymentType::Other => Self::Other,
        }
    }
}

impl From<&FiscalCoupon> for CouponMessage {
    fn from(coupon: &FiscalCoupon) -> Self {
        Self {
            schema_version: WIRE_SCHEMA_VERSION,
            coupon_type: CouponTypeCode::from(coupon.coupon_type) as i32,
            reference_no: coupon.reference_no.clone().unwrap_or_default(),
            business_id: coupon.business_id.clone(),
            branch_id: coupon.branch_id.clone(),
            pos_id: coupon.pos_id.clone(),
            application_id: coupon.application_id.clone(),
            fiscalization_no: coupon.fiscalization_no.clone(),
            transaction_id: coupon.transaction_id.clone(),
            issued_at: coupon.issued_at.timestamp_millis(),
            total: coupon.total,
            total_no_tax: coupon.total_no_tax,
            total_tax: coupon.total_tax,
            total_discount: coupon.total_discount,
            items: coupon
                .items
                .iter()
                .map(|item| ItemMessage {
                    name: item.name.clone(),
                    quantity: item.quantity_milli,
                    unit_price: item.unit_price,
                    total: item.total,
                    tax: item.tax,
                    tax_code: item.tax_code.clone(),
                })
                .collect(),
            payments: coupon
                .payments
                .iter()
                .map(|payment| PaymentMessage {
                    payment_type: PaymentTypeCode::from(payment.payment_type) as i32,
                    amount: payment.amount,
                })
                .collect(),
            tax_groups: coupon
                .tax_groups
                .iter()
                .map(|group| TaxGroupMessage {
                    code: group.code.clone(),
                    taxable_base: group.taxable_base,
                    tax: group.tax,
                })
                .collect(),
        }
    }
}

/// Encode a coupon to its wire bytes.
pub fn serialize(coupon: &FiscalCoupon) -> Vec<u8> {
    CouponMessage::from(coupon).encode_to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiscal::coupon::{CouponItem, CouponPayment, TaxGroup};
    use chrono::{TimeZone, Utc};

    fn coupon() -> FiscalCoupon {
        FiscalCoupon {
            coupon_type: CouponType::Sale,
            reference_no: None,
            transaction_id: "tx-1".into(),
            business_id: "810123456".into(),
            branch_id: "01".into(),
            pos_id: "7".into(),
            application_id: "app-1".into(),
            fiscalization_no: "FN-42".into(),
            issued_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            total: 10000,
            total_no_tax: 8475,
            total_tax: 1525,
            total_discount: 0,
            items: vec![CouponItem {
                name: "Widget".into(),
                quantity_milli: 1000,
                unit_price: 10000,
                total: 10000,
                tax: 1525,
                tax_code: "E".into(),
            }],
            payments: vec![CouponPayment {
                payment_type: PaymentType::CreditCard,
                amount: 10000,
            }],
            tax_groups: vec![TaxGroup {
                code: "E".into(),
                taxable_base: 8475,
                tax: 1525,
            }],
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = serialize(&coupon());
        let b = serialize(&coupon());
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn decoded_message_carries_codes_and_amounts() {
        let bytes = serialize(&coupon().with_reversal(CouponType::Cancel, "ATK-1"));
        let message = CouponMessage::decode(bytes.as_slice()).unwrap();

        assert_eq!(message.schema_version, WIRE_SCHEMA_VERSION);
        assert_eq!(message.coupon_type, CouponTypeCode::Cancel as i32);
        assert_eq!(message.reference_no, "ATK-1");
        assert_eq!(message.total, 10000);
        assert_eq!(message.items[0].quantity, 1000);
        assert_eq!(message.payments[0].payment_type, 2);
        assert_eq!(message.tax_groups[0].code, "E");
        assert_eq!(message.issued_at, coupon().issued_at.timestamp_millis());
    }

    #[test]
    fn list_order_is_preserved() {
        let mut c = coupon();
        c.items.push(CouponItem {
            name: "Second".into(),
            quantity_milli: 500,
            unit_price: 200,
            total: 100,
            tax: 0,
            tax_code: "C".into(),
        });
        let message = CouponMessage::decode(serialize(&c).as_slice()).unwrap();
        let names: Vec<_> = message.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Widget", "Second"]);
    }

    #[test]
    fn enum_codes_match_contract() {
        assert_eq!(CouponTypeCode::Sale as i32, 1);
        assert_eq!(CouponTypeCode::Return as i32, 2);
        assert_eq!(CouponTypeCode::Cancel as i32, 3);
        assert_eq!(PaymentTypeCode::Cash as i32, 1);
        assert_eq!(PaymentTypeCode::CryptoCurrency as i32, 5);
        assert_eq!(PaymentTypeCode::Other as i32, 6);
    }
}
