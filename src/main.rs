// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::process::ExitCode;
use std::sync::Arc;

use fiscal_pos::config::{AppConfig, DEFAULT_LOG_FILTER, LOG_FORMAT_ENV};
use fiscal_pos::fiscal::{FiscalOrchestrator, HttpFiscalAuthority, RetryPoller};
use fiscal_pos::identity::IdentityManager;
use fiscal_pos::storage::{EncryptedStore, JsonFilePreferences};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fiscal POS stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        data_dir = %config.store_paths.data_dir().display(),
        authority = %config.fiscal_api_base_url,
        "Starting fiscal POS"
    );

    let store = Arc::new(EncryptedStore::new(config.store_paths.clone()));
    store
        .initialize_for_user(&config.username, &config.passphrase)
        .await?;
    let auto_save = store.start_auto_save(config.autosave_interval).await?;

    let preferences = Arc::new(JsonFilePreferences::open(&config.preferences_file)?);
    let authority = Arc::new(HttpFiscalAuthority::new(
        &config.fiscal_api_base_url,
        config.http_timeout,
    )?);
    let identity = Arc::new(IdentityManager::new(preferences, Arc::clone(&authority)));
    let orchestrator = Arc::new(FiscalOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&identity),
        authority,
    ));

    if identity.load().await? {
        info!("Fiscal identity loaded");
    } else if let Some(request) = config.onboarding.as_ref() {
        match orchestrator.onboard(request).await {
            Ok(true) => info!(pos_id = %request.pos_id, "POS onboarded with the fiscal authority"),
            Ok(false) => warn!("Fiscal authority declined onboarding, submissions stay disabled"),
            Err(e) => warn!(error = %e, "Onboarding failed, submissions stay disabled"),
        }
    } else {
        warn!("POS is not onboarded, fiscal submissions are disabled");
    }

    let shutdown = CancellationToken::new();
    let poller = RetryPoller::new(Arc::clone(&orchestrator)).with_interval(config.retry_interval);
    let retry_task = tokio::spawn(poller.run(shutdown.clone()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown requested");

    shutdown.cancel();
    if let Err(e) = retry_task.await {
        warn!(error = %e, "Retry poller task ended abnormally");
    }

    store.close().await?;
    if let Err(e) = auto_save.await {
        warn!(error = %e, "Auto-save task ended abnormally");
    }
    info!("Store closed");
    Ok(())
}
