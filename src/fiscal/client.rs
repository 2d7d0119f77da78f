// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Fiscal authority HTTP client.
//!
//! The authority is a black box with three JSON operations:
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | verify business identifiers | `POST /verify` |
//! | sign a CSR | `POST /certificates/sign` |
//! | submit a signed coupon | `POST /coupons` |
//!
//! Transport and HTTP status failures are kept apart from content the
//! authority explicitly rejected; only the former are worth retrying.

use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

const VERIFY_PATH: &str = "verify";
const SIGN_CSR_PATH: &str = "certificates/sign";
const SUBMIT_COUPON_PATH: &str = "coupons";

/// Default HTTP timeout for authority calls.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorityError {
    /// Connection, TLS or timeout failure before a response arrived.
    #[error("fiscal authority unreachable: {0}")]
    Transport(String),

    #[error("fiscal authority returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The authority understood the request and refused it.
    #[error("{0}")]
    Rejected(String),

    #[error("fiscal authority response was invalid: {0}")]
    InvalidResponse(String),
}

// =============================================================================
// Request / Response Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub business_id: String,
    pub pos_id: String,
    pub branch_id: String,
    pub application_id: String,
    pub fiscalization_no: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub business_name: String,
    pub verification_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignCsrRequest {
    pub business_id: String,
    pub pos_id: String,
    pub verification_code: String,
    /// PEM-encoded PKCS#10 request.
    pub csr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignCsrResponse {
    /// PEM, or base64 DER.
    pub signed_certificate: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCouponRequest {
    /// Base64 of the serialized coupon.
    pub details: String,
    /// Base64 signature over the `details` text.
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCouponResponse {
    pub success: bool,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// An accepted coupon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CouponAcceptance {
    pub transaction_id: Option<String>,
    pub message: Option<String>,
}

/// Map a submission body onto acceptance or rejection.
pub fn interpret_submission(response: SubmitCouponResponse) -> Result<CouponAcceptance, AuthorityError> {
    if response.success {
        return Ok(CouponAcceptance {
            transaction_id: response.transaction_id,
            message: response.message,
        });
    }
    let reason = response
        .error
        .or(response.message)
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| "coupon rejected without a reason".to_string());
    Err(AuthorityError::Rejected(reason))
}

/// Classify a non-2xx response.
///
/// A client error carrying a `{success:false, error}` body is a rejection of
/// the content; anything else is an HTTP-level failure.
pub fn classify_http_failure(status: u16, body: String) -> AuthorityError {
    let is_client_error = (400..500).contains(&status) && status != 408 && status != 429;
    if is_client_error {
        if let Ok(parsed) = serde_json::from_str::<SubmitCouponResponse>(&body) {
            if !parsed.success && parsed.error.is_some() {
                if let Err(rejected) = interpret_submission(parsed) {
                    return rejected;
                }
            }
        }
    }
    AuthorityError::Http { status, body }
}

// =============================================================================
// Authority Trait
// =============================================================================

/// The fiscal authority's request/response contract.
pub trait FiscalAuthority: Send + Sync + 'static {
    fn verify(
        &self,
        request: &VerifyRequest,
    ) -> impl Future<Output = Result<VerifyResponse, AuthorityError>> + Send;

    fn sign_csr(
        &self,
        request: &SignCsrRequest,
    ) -> impl Future<Output = Result<SignCsrResponse, AuthorityError>> + Send;

    /// Rejections come back as [`AuthorityError::Rejected`].
    fn submit_coupon(
        &self,
        request: &SubmitCouponRequest,
    ) -> impl Future<Output = Result<CouponAcceptance, AuthorityError>> + Send;
}

/// `reqwest` implementation of [`FiscalAuthority`].
#[derive(Debug, Clone)]
pub struct HttpFiscalAuthority {
    base_url: Url,
    http: Client,
}

impl HttpFiscalAuthority {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AuthorityError> {
        let base_url = normalize_base_url(base_url)?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthorityError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthorityError> {
        self.base_url
            .join(path)
            .map_err(|e| AuthorityError::InvalidResponse(format!("invalid endpoint {path}: {e}")))
    }

    async fn post_json<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, AuthorityError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        debug!(%url, "Calling fiscal authority");

        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| AuthorityError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AuthorityError::Transport(format!("reading response body: {e}")))?;

        if !status.is_success() {
            warn!(status = status.as_u16(), path, "Fiscal authority returned an error status");
            return Err(classify_http_failure(status.as_u16(), text));
        }

        serde_json::from_str(&text)
            .map_err(|e| AuthorityError::InvalidResponse(format!("{path}: {e}")))
    }
}

impl FiscalAuthority for HttpFiscalAuthority {
    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, AuthorityError> {
        self.post_json(VERIFY_PATH, request).await
    }

    async fn sign_csr(&self, request: &SignCsrRequest) -> Result<SignCsrResponse, AuthorityError> {
        self.post_json(SIGN_CSR_PATH, request).await
    }

    async fn submit_coupon(
        &self,
        request: &SubmitCouponRequest,
    ) -> Result<CouponAcceptance, AuthorityError> {
        let response: SubmitCouponResponse = self.post_json(SUBMIT_COUPON_PATH, request).await?;
        interpret_submission(response)
    }
}

/// Parse the base URL, forcing a trailing slash so relative joins append.
fn normalize_base_url(raw: &str) -> Result<Url, AuthorityError> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    Url::parse(&with_slash)
        .map_err(|e| AuthorityError::InvalidResponse(format!("invalid base URL {raw}: {e}")))
}

// =============================================================================
// Test Double
// =============================================================================

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub(crate) enum SubmitMode {
        Accept,
        Reject(String),
        Unreachable,
        /// 2xx with a body that does not parse.
        Garbled,
    }

    /// Scriptable in-process authority that counts calls.
    pub(crate) struct MockAuthority {
        pub verify_calls: AtomicUsize,
        pub sign_calls: AtomicUsize,
        pub submit_calls: AtomicUsize,
        pub submitted: Mutex<Vec<SubmitCouponRequest>>,
        submit_mode: Mutex<SubmitMode>,
        verify_rejects: bool,
        submit_delay: Duration,
    }

    impl MockAuthority {
        pub(crate) fn new() -> Self {
            Self {
                verify_calls: AtomicUsize::new(0),
                sign_calls: AtomicUsize::new(0),
                submit_calls: AtomicUsize::new(0),
                submitted: Mutex::new(Vec::new()),
                submit_mode: Mutex::new(SubmitMode::Accept),
                verify_rejects: false,
                submit_delay: Duration::ZERO,
            }
        }

        pub(crate) fn rejecting_verification() -> Self {
            Self {
                verify_rejects: true,
                ..Self::new()
            }
        }

        pub(crate) fn with_submit_delay(mut self, delay: Duration) -> Self {
            self.submit_delay = delay;
            self
        }

        pub(crate) fn set_submit_mode(&self, mode: SubmitMode) {
            *self.submit_mode.lock().unwrap() = mode;
        }

        pub(crate) fn submit_count(&self) -> usize {
            self.submit_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn network_calls(&self) -> usize {
            self.verify_calls.load(Ordering::SeqCst)
                + self.sign_calls.load(Ordering::SeqCst)
                + self.submit_calls.load(Ordering::SeqCst)
        }
    }

    impl FiscalAuthority for MockAuthority {
        async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse, AuthorityError> {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            if self.verify_rejects {
                return Err(AuthorityError::Rejected("unknown business".into()));
            }
            Ok(VerifyResponse {
                business_name: format!("Business {}", request.business_id),
                verification_code: "VC-1234".into(),
            })
        }

        async fn sign_csr(&self, request: &SignCsrRequest) -> Result<SignCsrResponse, AuthorityError> {
            self.sign_calls.fetch_add(1, Ordering::SeqCst);
            assert!(request.csr.contains("CERTIFICATE REQUEST"));
            Ok(SignCsrResponse {
                signed_certificate: "bW9jay1jZXJ0aWZpY2F0ZQ==".into(),
            })
        }

        async fn submit_coupon(
            &self,
            request: &SubmitCouponRequest,
        ) -> Result<CouponAcceptance, AuthorityError> {
            let n = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.submitted.lock().unwrap().push(request.clone());
            if !self.submit_delay.is_zero() {
                tokio::time::sleep(self.submit_delay).await;
            }
            let mode = self.submit_mode.lock().unwrap().clone();
            match mode {
                SubmitMode::Accept => Ok(CouponAcceptance {
                    transaction_id: Some(format!("ATK-{n}")),
                    message: Some("accepted".into()),
                }),
                SubmitMode::Reject(reason) => Err(AuthorityError::Rejected(reason)),
                SubmitMode::Unreachable => {
                    Err(AuthorityError::Transport("connection refused".into()))
                }
                SubmitMode::Garbled => Err(AuthorityError::InvalidResponse(
                    "coupons: expected value at line 1 column 1".into(),
                )),
            }
        }
    }
}
