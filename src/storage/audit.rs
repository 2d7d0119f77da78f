// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Audit trail for fiscally significant operations.
//!
//! Events live in the working database, so they are encrypted at rest
//! together with the transactions they describe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Types of auditable events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Store events
    StoreLoaded,
    CredentialChanged,

    // Identity events
    IdentityOnboarded,

    // Fiscal events
    CouponSubmitted,
    CouponRejected,
    TransactionCancelled,
    TransactionRefunded,
}

/// An audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    /// Local transaction the event concerns, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub transaction_id: Option<String>,
    /// Authority-side identifier, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fiscal_reference: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            transaction_id: None,
            fiscal_reference: None,
            success: true,
            detail: None,
        }
    }

    pub fn with_transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn with_fiscal_reference(mut self, reference: Option<String>) -> Self {
        self.fiscal_reference = reference;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Mark the event as a failure with an error message.
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.detail = Some(error.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let event = AuditEvent::new(AuditEventType::CouponSubmitted)
            .with_transaction("tx-1")
            .with_fiscal_reference(Some("ATK-9".to_string()))
            .with_detail("accepted");

        assert!(event.success);
        assert_eq!(event.transaction_id.as_deref(), Some("tx-1"));
        assert_eq!(event.fiscal_reference.as_deref(), Some("ATK-9"));
        assert_eq!(event.detail.as_deref(), Some("accepted"));
    }

    #[test]
    fn failed_event_records_error() {
        let event = AuditEvent::new(AuditEventType::CouponRejected).failed("invalid tax group");
        assert!(!event.success);
        assert_eq!(event.detail.as_deref(), Some("invalid tax group"));
    }

    #[test]
    fn event_type_serializes_snake_case() {
        let json = serde_json::to_string(&AuditEventType::TransactionRefunded).unwrap();
        assert_eq!(json, r#""transaction_refunded""#);
    }
}
