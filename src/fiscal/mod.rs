// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Fiscalization Pipeline
//!
//! ```text
//! Transaction ─▶ coupon ─▶ wire ─▶ identity (sign) ─▶ client ─▶ status update
//! ```
//!
//! - [`coupon`] - transaction to coupon mapping in integer minor units
//! - [`wire`] - deterministic protobuf encoding of a coupon
//! - [`client`] - the authority's request/response contract and HTTP client
//! - [`orchestrator`] - submission, cancel/return, retry, receipts
//! - [`retry`] - background sweep over retryable failures

pub mod client;
pub mod coupon;
pub mod orchestrator;
pub mod receipt;
pub mod retry;
pub mod wire;

pub use client::{AuthorityError, FiscalAuthority, HttpFiscalAuthority};
pub use coupon::{
    build_coupon, to_minor_units, CouponItem, CouponPayment, CouponType, FiscalCoupon,
    PaymentType, TaxGroup, TaxRateTable, UnknownTaxRatePolicy,
};
pub use orchestrator::{FiscalOrchestrator, RetrySummary, SubmissionOutcome};
pub use receipt::{verify_receipt_qr, ReceiptQr};
pub use retry::{RetryPoller, DEFAULT_RETRY_INTERVAL};
