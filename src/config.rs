// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Environment variable names, defaults, and [`AppConfig::from_env`].
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding the encrypted database and preferences | `./data` |
//! | `WORKING_DIR` | Transient directory for the decrypted working copy | `{tmp}/fiscal-pos` |
//! | `DATABASE_NAME` | Base name of the database files | `pos` |
//! | `PREFERENCES_FILE` | JSON preference store path | `{DATA_DIR}/preferences.json` |
//! | `FISCAL_API_BASE_URL` | Fiscal authority API base URL | Required |
//! | `FISCAL_HTTP_TIMEOUT_SECS` | HTTP timeout for authority calls | `15` |
//! | `AUTOSAVE_INTERVAL_SECS` | Auto-save interval | `30` |
//! | `FISCAL_RETRY_INTERVAL_SECS` | Interval of the failed-submission sweep | `300` |
//! | `POS_USERNAME` | Identity secret for key derivation | Required |
//! | `POS_PASSPHRASE` | Passphrase for key derivation | Required |
//! | `FISCAL_BUSINESS_ID` | Onboarding: business id | Optional |
//! | `FISCAL_BRANCH_ID` | Onboarding: branch id | Optional |
//! | `FISCAL_POS_ID` | Onboarding: POS id | Optional |
//! | `FISCAL_APPLICATION_ID` | Onboarding: application id | Optional |
//! | `FISCAL_FISCALIZATION_NO` | Onboarding: fiscalization number | Optional |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |
//!
//! The onboarding variables are used only when all five are set and the POS
//! has not been onboarded yet.

use std::path::PathBuf;
use std::time::Duration;

use zeroize::Zeroizing;

use crate::fiscal::client::DEFAULT_HTTP_TIMEOUT;
use crate::fiscal::DEFAULT_RETRY_INTERVAL;
use crate::identity::OnboardingRequest;
use crate::storage::{StorePaths, DEFAULT_AUTOSAVE_INTERVAL, DEFAULT_DATABASE_NAME};

pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const WORKING_DIR_ENV: &str = "WORKING_DIR";
pub const DATABASE_NAME_ENV: &str = "DATABASE_NAME";
pub const PREFERENCES_FILE_ENV: &str = "PREFERENCES_FILE";
pub const FISCAL_API_BASE_URL_ENV: &str = "FISCAL_API_BASE_URL";
pub const FISCAL_HTTP_TIMEOUT_ENV: &str = "FISCAL_HTTP_TIMEOUT_SECS";
pub const AUTOSAVE_INTERVAL_ENV: &str = "AUTOSAVE_INTERVAL_SECS";
pub const FISCAL_RETRY_INTERVAL_ENV: &str = "FISCAL_RETRY_INTERVAL_SECS";
pub const POS_USERNAME_ENV: &str = "POS_USERNAME";
pub const POS_PASSPHRASE_ENV: &str = "POS_PASSPHRASE";
pub const FISCAL_BUSINESS_ID_ENV: &str = "FISCAL_BUSINESS_ID";
pub const FISCAL_BRANCH_ID_ENV: &str = "FISCAL_BRANCH_ID";
pub const FISCAL_POS_ID_ENV: &str = "FISCAL_POS_ID";
pub const FISCAL_APPLICATION_ID_ENV: &str = "FISCAL_APPLICATION_ID";
pub const FISCAL_FISCALIZATION_NO_ENV: &str = "FISCAL_FISCALIZATION_NO";

/// `json` switches the subscriber to JSON lines.
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_PREFERENCES_FILE: &str = "preferences.json";
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Process configuration.
#[derive(Clone)]
pub struct AppConfig {
    pub store_paths: StorePaths,
    pub preferences_file: PathBuf,
    pub fiscal_api_base_url: String,
    pub http_timeout: Duration,
    pub autosave_interval: Duration,
    pub retry_interval: Duration,
    pub username: String,
    pub passphrase: Zeroizing<String>,
    pub onboarding: Option<OnboardingRequest>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let data_dir = PathBuf::from(env.or_default(DATA_DIR_ENV, DEFAULT_DATA_DIR));
        let name = env.or_default(DATABASE_NAME_ENV, DEFAULT_DATABASE_NAME);
        let store_paths = match env.optional(WORKING_DIR_ENV) {
            Some(working) => StorePaths::new(&data_dir, working, name),
            None => StorePaths::with_default_transient(&data_dir, name),
        };
        let preferences_file = env
            .optional(PREFERENCES_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join(DEFAULT_PREFERENCES_FILE));

        let onboarding = match (
            env.optional(FISCAL_BUSINESS_ID_ENV),
            env.optional(FISCAL_BRANCH_ID_ENV),
            env.optional(FISCAL_POS_ID_ENV),
            env.optional(FISCAL_APPLICATION_ID_ENV),
            env.optional(FISCAL_FISCALIZATION_NO_ENV),
        ) {
            (
                Some(business_id),
                Some(branch_id),
                Some(pos_id),
                Some(application_id),
                Some(fiscalization_no),
            ) => Some(OnboardingRequest {
                business_id,
                pos_id,
                branch_id,
                application_id,
                fiscalization_no,
            }),
            _ => None,
        };

        Ok(Self {
            store_paths,
            preferences_file,
            fiscal_api_base_url: env.required(FISCAL_API_BASE_URL_ENV)?,
            http_timeout: env.seconds(FISCAL_HTTP_TIMEOUT_ENV, DEFAULT_HTTP_TIMEOUT)?,
            autosave_interval: env.seconds(AUTOSAVE_INTERVAL_ENV, DEFAULT_AUTOSAVE_INTERVAL)?,
            retry_interval: env.seconds(FISCAL_RETRY_INTERVAL_ENV, DEFAULT_RETRY_INTERVAL)?,
            username: env.required(POS_USERNAME_ENV)?,
            passphrase: Zeroizing::new(env.required(POS_PASSPHRASE_ENV)?),
            onboarding,
        })
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("store_paths", &self.store_paths)
            .field("preferences_file", &self.preferences_file)
            .field("fiscal_api_base_url", &self.fiscal_api_base_url)
            .field("http_timeout", &self.http_timeout)
            .field("autosave_interval", &self.autosave_interval)
            .field("retry_interval", &self.retry_interval)
            .field("username", &self.username)
            .field("passphrase", &"<redacted>")
            .field("onboarding", &self.onboarding)
            .finish()
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn or_default(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::Missing(name))
    }

    fn seconds(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let Some(raw) = self.optional(name) else {
            return Ok(default);
        };
        match raw.parse::<u64>() {
            Ok(0) => Err(ConfigError::Invalid {
                name,
                reason: "must be greater than zero".to_string(),
            }),
            Ok(secs) => Ok(Duration::from_secs(secs)),
            Err(e) => Err(ConfigError::Invalid {
                name,
                reason: e.to_string(),
            }),
        }
    }
}
