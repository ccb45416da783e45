//! Request-level retry policy: retries a request against the
//! server-dictated `Retry-After` delay, tears down the session on a 500,
//! and redacts `retry_after` on every exit path.

use std::sync::Arc;

use http::Method;

use crate::error::{Failure, PublicFailure, SessionError};
use crate::notification::BuiltNotification;
use crate::requester::{Requester, Success};
use crate::session::{SessionKind, SessionManager};

pub fn is_retryable(failure: &Failure) -> bool {
    failure.is_retryable()
}

/// Drives [`Requester::request`] up to `connection_retry_limit` additional
/// attempts, sleeping the server's requested delay between them.
///
/// Iterative rather than recursive: recursing into an `async fn` needs
/// `Box::pin` at every level, and an explicit loop over the attempt count
/// reads the same either way.
pub async fn execute(
    requester: &Requester,
    session_manager: &Arc<SessionManager>,
    kind: SessionKind,
    authority_path: &str,
    method: Method,
    built: &BuiltNotification,
    label: &str,
    connection_retry_limit: u8,
) -> Result<Success, PublicFailure> {
    let mut attempt: u8 = 0;

    loop {
        if session_manager.is_shutdown(kind) {
            return Err(Failure::new(label, SessionError::Unavailable.to_string()).redact());
        }

        let session = match session_manager.acquire(kind).await {
            Ok(session) => session,
            Err(error) => {
                return Err(Failure::new(label, error.to_string()).redact());
            }
        };

        let result = requester
            .request(&session, authority_path, method.clone(), built, label)
            .await;

        match result {
            Ok(success) => return Ok(success),
            Err(failure) => {
                let retryable = is_retryable(&failure);
                let exhausted = attempt as u32 + 1 > connection_retry_limit as u32;

                if !retryable || exhausted {
                    if failure.triggers_session_teardown() {
                        session_manager.destroy(kind);
                    }
                    return Err(failure.redact());
                }

                let delay = failure.retry_after.unwrap_or(0);
                tracing::debug!(label, attempt, delay, "retrying APNs request");
                tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_match_spec_table() {
        for status in [408, 429, 500, 502, 503, 504] {
            let mut failure = Failure::new("x", "err");
            failure.status = Some(status);
            assert!(is_retryable(&failure), "status {status} should be retryable");
        }
    }

    #[test]
    fn expired_provider_token_403_is_retryable() {
        let mut failure = Failure::new("x", "ExpiredProviderToken");
        failure.status = Some(403);
        assert!(is_retryable(&failure));
    }

    #[test]
    fn other_403_is_not_retryable() {
        let mut failure = Failure::new("x", "BadDeviceToken");
        failure.status = Some(403);
        assert!(!is_retryable(&failure));
    }

    #[test]
    fn status_500_triggers_teardown() {
        let mut failure = Failure::new("x", "err");
        failure.status = Some(500);
        assert!(failure.triggers_session_teardown());
    }
}
