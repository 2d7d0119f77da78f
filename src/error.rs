// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Fiscal pipeline errors and the failure taxonomy callers branch on.

use std::time::Duration;

use serde::Serialize;

use crate::crypto::CryptoError;
use crate::fiscal::client::AuthorityError;
use crate::identity::IdentityError;
use crate::storage::{DbError, StoreError};

/// Message returned when a submission is attempted before onboarding.
pub const NOT_CONFIGURED_MESSAGE: &str =
    "Fiscal system not configured. Complete onboarding before submitting transactions.";

/// Coarse failure classes.
///
/// `TransientNetworkFailure` is safe to retry; `AuthorityRejected` is shown
/// to the user verbatim; `ValidationFailure` never reaches the network.
/// `UnconfirmedSubmission` means the authority answered but the answer could
/// not be read, so the coupon may already be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CryptoFailure,
    CorruptionOrWrongCredential,
    TransientNetworkFailure,
    AuthorityRejected,
    ValidationFailure,
    NotConfigured,
    StorageFailure,
    InFlight,
    UnconfirmedSubmission,
    Internal,
}

impl FailureKind {
    /// Whether the background retry sweep should pick this failure up again.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientNetworkFailure | Self::StorageFailure)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FiscalError {
    #[error("{}", NOT_CONFIGURED_MESSAGE)]
    NotConfigured,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("transaction not found: {0}")]
    NotFound(String),

    /// Builder produced inconsistent totals. Always a bug.
    #[error("coupon invariant violated: {0}")]
    CouponInvariant(String),

    #[error("a submission is already in progress for transaction {0}")]
    InFlight(String),

    #[error("fiscal authority did not answer within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Authority(#[from] AuthorityError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("submission task failed: {0}")]
    Task(String),
}

impl From<DbError> for FiscalError {
    fn from(err: DbError) -> Self {
        Self::Store(StoreError::Database(err))
    }
}

impl From<CryptoError> for FiscalError {
    fn from(err: CryptoError) -> Self {
        Self::Identity(IdentityError::Crypto(err))
    }
}

impl FiscalError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NotConfigured => FailureKind::NotConfigured,
            Self::Validation(_) | Self::NotFound(_) => FailureKind::ValidationFailure,
            Self::CouponInvariant(_) | Self::Task(_) => FailureKind::Internal,
            Self::InFlight(_) => FailureKind::InFlight,
            Self::Timeout(_) => FailureKind::TransientNetworkFailure,
            Self::Identity(err) => match err {
                IdentityError::KeyUnavailable => FailureKind::NotConfigured,
                IdentityError::Preferences(_) => FailureKind::StorageFailure,
                IdentityError::Crypto(_) | IdentityError::CorruptCredential(_) => {
                    FailureKind::CryptoFailure
                }
            },
            Self::Authority(err) => match err {
                AuthorityError::Rejected(_) => FailureKind::AuthorityRejected,
                AuthorityError::Transport(_) | AuthorityError::Http { .. } => {
                    FailureKind::TransientNetworkFailure
                }
                // Resubmitting could register the coupon twice
                AuthorityError::InvalidResponse(_) => FailureKind::UnconfirmedSubmission,
            },
            Self::Store(err) => match err {
                StoreError::InvalidCredentialsOrCorruption => {
                    FailureKind::CorruptionOrWrongCredential
                }
                StoreError::Crypto(_) => FailureKind::CryptoFailure,
                _ => FailureKind::StorageFailure,
            },
        }
    }
}
