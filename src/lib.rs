// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Fiscal POS - Encrypted Store & Fiscalization Core
//!
//! Keeps the point-of-sale database encrypted at rest under a key derived
//! from the operator's credentials, and turns completed sales into signed
//! fiscal coupons submitted to the tax authority.
//!
//! ## Modules
//!
//! - `config` - Environment-driven runtime configuration
//! - `crypto` - Key derivation, AES-256-GCM envelope, ECDSA P-256 signing
//! - `error` - Fiscal error taxonomy and failure kinds
//! - `fiscal` - Coupon mapping, wire encoding, authority client, orchestration
//! - `identity` - Device key, certificate onboarding and signing
//! - `models` - Transactions and line items
//! - `storage` - Encrypted store, working database, preferences, audit log

pub mod config;
pub mod crypto;
pub mod error;
pub mod fiscal;
pub mod identity;
pub mod models;
pub mod storage;
