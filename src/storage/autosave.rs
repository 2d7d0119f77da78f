// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Auto-Save
//!
//! Background task that periodically flushes the working copy to the
//! encrypted at-rest file, bounding how much a crash can lose.
//!
//! A failed save is logged and retried on the next tick. The task stops when
//! its cancellation token fires (store closed or process shutting down) or
//! when it finds the store no longer loaded.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::encrypted_store::{EncryptedStore, StoreError};

/// Default interval between auto-saves.
pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(30);

pub struct AutoSaver {
    store: Arc<EncryptedStore>,
    interval: Duration,
}

impl AutoSaver {
    pub fn new(store: Arc<EncryptedStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Run until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(saver.run(shutdown.child_token()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Auto-save starting");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Auto-save shutting down");
                    return;
                }
            }

            if !self.save_step().await {
                info!("Store no longer loaded, auto-save stopping");
                return;
            }
        }
    }

    /// One save attempt. Returns `false` once the store has been closed.
    async fn save_step(&self) -> bool {
        match self.store.save().await {
            Ok(()) => {
                debug!("Auto-save completed");
                true
            }
            Err(StoreError::NotLoaded) => false,
            Err(e) => {
                warn!(error = %e, "Auto-save failed, retrying next tick");
                true
            }
        }
    }
}
