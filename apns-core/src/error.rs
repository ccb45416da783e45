//! Structured error types.
//!
//! Two failure shapes matter: [`ConfigError`]/[`DispatchError`] reject a
//! call synchronously (the only two cases where this crate's public API
//! returns `Err` rather than resolving to a [`crate::dispatcher::BatchResult`]),
//! and [`Failure`]/[`PublicFailure`] model a single recipient's outcome,
//! with [`PublicFailure`] being the redacted shape that ever leaves the
//! crate.

use std::fmt;

use serde_json::Value;

/// Rejected synchronously at [`crate::config::ClientConfig::resolve`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("token.keyId must be a non-empty string")]
    EmptyKeyId,
    #[error("token.teamId must be a non-empty string")]
    EmptyTeamId,
    #[error("clientCount must be a finite positive integer")]
    InvalidClientCount,
    #[error("passphrase must be a string")]
    InvalidPassphrase,
    #[error("failed to load TLS credentials: {0}")]
    Tls(String),
}

/// Rejected synchronously by [`crate::dispatcher::Dispatcher::manage_channels`].
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("the action \"{action}\" is not supported")]
pub struct DispatchError {
    pub bundle_id: String,
    pub action: String,
}

/// Why a session could not be established or was torn down.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to dial endpoint: {0}")]
    Dial(#[from] apns_proxy::DialError),
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] std::io::Error),
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
    #[error("HTTP/2 handshake failed: {0}")]
    Handshake(#[source] h2::Error),
    #[error("client session is either closed or destroyed")]
    Unavailable,
    /// A coalesced connect attempt observed by a caller who did not
    /// initiate it; the original error is not `Clone`, so its `Display`
    /// output is preserved instead of the original value.
    #[error("{0}")]
    Shared(String),
}

/// What went wrong classifying a single HTTP/2 request/response cycle.
/// Internal only: a [`FailureKind`] never crosses the public API boundary
/// on its own, only wrapped in [`Failure`]/[`PublicFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Aborted,
    StreamError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Aborted => "aborted",
            FailureKind::StreamError => "stream error",
        };
        f.write_str(s)
    }
}

/// Internal per-recipient failure. Carries `retry_after`, which
/// [`RetryPolicy`](crate::retry::RetryPolicy) consumes and which must never
/// reach a caller — see [`PublicFailure`].
#[derive(Debug, Clone)]
pub struct Failure {
    pub label: String,
    pub status: Option<u16>,
    pub response: Option<Value>,
    pub error: Option<String>,
    pub retry_after: Option<u64>,
}

impl Failure {
    pub fn new(label: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            status: None,
            response: None,
            error: Some(error.into()),
            retry_after: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self.status {
            Some(408 | 429 | 500 | 502 | 503 | 504) => true,
            Some(403) => self.error.as_deref() == Some("ExpiredProviderToken"),
            _ => false,
        }
    }

    pub fn triggers_session_teardown(&self) -> bool {
        self.status == Some(500)
    }

    /// The one, explicit redaction point named in the design notes:
    /// `retry_after` is dropped on every exit path, not just the success
    /// path.
    pub fn redact(self) -> PublicFailure {
        PublicFailure {
            label: self.label,
            status: self.status,
            response: self.response,
            error: self.error,
        }
    }
}

/// The failure shape that actually leaves the crate, inside
/// [`crate::dispatcher::BatchResult::failed`]. Structurally identical to
/// [`Failure`] minus `retry_after`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublicFailure {
    pub label: String,
    pub status: Option<u16>,
    pub response: Option<Value>,
    pub error: Option<String>,
}

impl From<Failure> for PublicFailure {
    fn from(f: Failure) -> Self {
        f.redact()
    }
}
