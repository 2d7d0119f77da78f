// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Fiscal Retry Poller
//!
//! Background task that periodically resubmits transactions whose last
//! fiscalization failed for a retryable reason (network trouble, timeouts).
//! Authority rejections are left alone until an operator retries them.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken`, the same way the auto-save
//! task does.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::client::FiscalAuthority;
use super::orchestrator::FiscalOrchestrator;
use crate::storage::PreferenceStore;

/// Default interval between retry sweeps.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(300);

pub struct RetryPoller<P, A> {
    orchestrator: Arc<FiscalOrchestrator<P, A>>,
    interval: Duration,
}

impl<P, A> RetryPoller<P, A>
where
    P: PreferenceStore + 'static,
    A: FiscalAuthority,
{
    pub fn new(orchestrator: Arc<FiscalOrchestrator<P, A>>) -> Self {
        Self {
            orchestrator,
            interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run the sweep loop until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(poller.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Fiscal retry poller starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Fiscal retry poller shutting down");
                return;
            }

            self.sweep().await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Fiscal retry poller shutting down");
                    return;
                }
            }
        }
    }

    async fn sweep(&self) {
        match self.orchestrator.retry_all_failed().await {
            Ok(summary) if summary.attempted == 0 => {}
            Ok(summary) => info!(
                attempted = summary.attempted,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "Fiscal retry sweep finished"
            ),
            Err(e) => warn!(error = %e, "Fiscal retry sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiscal::client::mock::{MockAuthority, SubmitMode};
    use crate::identity::{IdentityManager, OnboardingRequest};
    use crate::models::{Transaction, TransactionItem, TransactionStatus};
    use crate::storage::{EncryptedStore, MemoryPreferences, StorePaths};
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn poller_fiscalizes_failed_transaction_and_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path().join("data"), dir.path().join("run"), "pos");
        let store = Arc::new(EncryptedStore::new(paths));
        store.initialize_for_user("cashier", "pw").await.unwrap();

        let authority = Arc::new(MockAuthority::new());
        let identity = Arc::new(IdentityManager::new(
            Arc::new(MemoryPreferences::new()),
            Arc::clone(&authority),
        ));
        let orchestrator = Arc::new(FiscalOrchestrator::new(
            Arc::clone(&store),
            identity,
            Arc::clone(&authority),
        ));
        let request = OnboardingRequest {
            business_id: "1".into(),
            pos_id: "2".into(),
            branch_id: "3".into(),
            application_id: "4".into(),
            fiscalization_no: "5".into(),
        };
        assert!(orchestrator.onboard(&request).await.unwrap());

        authority.set_submit_mode(SubmitMode::Unreachable);
        let tx = Transaction::new_sale(
            "Walk-in",
            vec![TransactionItem::new("Tea", Decimal::ONE, Decimal::TEN, Decimal::ZERO)],
            "Cash",
        );
        assert!(!orchestrator.submit_transaction(tx.clone()).await.success);
        authority.set_submit_mode(SubmitMode::Accept);

        let shutdown = CancellationToken::new();
        let poller = RetryPoller::new(Arc::clone(&orchestrator)).with_interval(Duration::from_millis(20));
        let handle = tokio::spawn(poller.run(shutdown.clone()));

        let mut status = None;
        for _ in 0..100 {
            status = store
                .with_database(|db| db.get_transaction(&tx.id))
                .await
                .unwrap()
                .map(|t| t.status);
            if status == Some(TransactionStatus::Fiscalized) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, Some(TransactionStatus::Fiscalized));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("retry poller did not stop")
            .unwrap();
    }
}
