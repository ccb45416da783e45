//! Issues a single HTTP/2 request on an acquired session and classifies
//! the response into a [`Success`] or a [`crate::error::Failure`].

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method};
use serde_json::Value;

use crate::error::{Failure, FailureKind};
use crate::notification::BuiltNotification;
use crate::session::H2Session;
use crate::token::{TokenSource, TOKEN_EXPIRY_THRESHOLD};

/// Response headers APNs echoes back that callers care about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Echoes {
    pub unique_id: Option<String>,
    pub request_id: Option<String>,
    pub channel_id: Option<String>,
}

impl Echoes {
    fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            unique_id: get("apns-unique-id"),
            request_id: get("apns-request-id"),
            channel_id: get("apns-channel-id"),
        }
    }
}

/// A successful per-recipient outcome. `status`/`error` are present only
/// defensively — a genuine `{200, 201, 204}` response never sets them, and
/// the dispatcher reclassifies any `Success` that does as a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Success {
    pub label: String,
    pub echoes: Echoes,
    pub body: Value,
    pub status: Option<u16>,
    pub error: Option<String>,
}

/// Issues requests on behalf of a single logical client: wraps an optional
/// [`TokenSource`] (absent for `Credentials::Tls` clients, which
/// authenticate at the TLS layer instead) and the configured per-request
/// timeout.
pub struct Requester {
    token_source: Option<Arc<TokenSource>>,
    request_timeout: Duration,
}

impl Requester {
    pub fn new(token_source: Option<Arc<TokenSource>>, request_timeout: Duration) -> Self {
        Self {
            token_source,
            request_timeout,
        }
    }

    pub async fn request(
        &self,
        session: &H2Session,
        path: &str,
        method: Method,
        built: &BuiltNotification,
        label: &str,
    ) -> Result<Success, Failure> {
        match tokio::time::timeout(
            self.request_timeout,
            self.request_inner(session, path, method, built, label),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Failure {
                label: label.to_string(),
                status: None,
                response: None,
                error: Some(timeout_or_abort_message(FailureKind::Timeout)),
                retry_after: None,
            }),
        }
    }

    async fn request_inner(
        &self,
        session: &H2Session,
        path: &str,
        method: Method,
        built: &BuiltNotification,
        label: &str,
    ) -> Result<Success, Failure> {
        let mut request_builder = http::Request::builder()
            .method(method)
            .uri(format!("https://{}{path}", session.authority))
            .version(http::Version::HTTP_2);

        if let Some(headers) = request_builder.headers_mut() {
            *headers = built.headers.clone();
        }

        let mut token_generation = None;
        if let Some(token_source) = &self.token_source {
            let (_, generation) = token_source.current_token();
            if token_source.is_expired(TOKEN_EXPIRY_THRESHOLD) {
                token_source
                    .regenerate(generation)
                    .map_err(|e| Failure::new(label, e.to_string()))?;
            }
            let (token, generation) = token_source.current_token();
            token_generation = Some(generation);
            if let Some(headers) = request_builder.headers_mut() {
                if let Ok(value) = http::HeaderValue::from_str(&format!("bearer {token}")) {
                    headers.insert(http::header::AUTHORIZATION, value);
                }
            }
        }

        let has_body = !built.is_empty_body();
        let request = request_builder
            .body(())
            .map_err(|e| Failure::new(label, format!("failed to build request: {e}")))?;

        let mut send_request = session.send_request.clone();
        let (response_future, mut send_stream) = send_request
            .send_request(request, !has_body)
            .map_err(|e| Failure::new(label, e.to_string()))?;

        if has_body {
            if let Err(error) = send_stream.send_data(built.body.clone(), true) {
                return Err(Failure::new(label, error.to_string()));
            }
        }

        let response = match response_future.await {
            Ok(response) => response,
            Err(error) => {
                return Err(classify_stream_error(label, error));
            }
        };

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(http::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let echoes = Echoes::from_headers(response.headers());

        let mut body = BytesMut::new();
        let mut recv_stream = response.into_body();
        while let Some(chunk) = recv_stream.data().await {
            let chunk = chunk.map_err(|e| classify_stream_error(label, e))?;
            let _ = recv_stream.flow_control().release_capacity(chunk.len());
            body.extend_from_slice(&chunk);
        }

        classify_response(label, status, retry_after, echoes, body.freeze(), token_generation, &self.token_source)
    }
}

fn timeout_or_abort_message(kind: FailureKind) -> String {
    match kind {
        FailureKind::Timeout => "Timeout, aborted, or other unknown error".to_string(),
        FailureKind::Aborted => "Timeout, aborted, or other unknown error".to_string(),
        FailureKind::StreamError => "Timeout, aborted, or other unknown error".to_string(),
    }
}

fn classify_stream_error(label: &str, error: h2::Error) -> Failure {
    let kind = if error.is_io() {
        FailureKind::StreamError
    } else if error.reason() == Some(h2::Reason::CANCEL) {
        FailureKind::Aborted
    } else {
        FailureKind::StreamError
    };
    Failure {
        label: label.to_string(),
        status: None,
        response: None,
        error: Some(timeout_or_abort_message(kind)),
        retry_after: None,
    }
}

fn classify_response(
    label: &str,
    status: u16,
    retry_after: Option<u64>,
    echoes: Echoes,
    body: Bytes,
    token_generation: Option<u64>,
    token_source: &Option<Arc<TokenSource>>,
) -> Result<Success, Failure> {
    let trimmed = std::str::from_utf8(&body).map(str::trim).unwrap_or("");
    let is_empty = trimmed.is_empty();

    if matches!(status, 200 | 201 | 204) {
        let parsed = if is_empty {
            serde_json::json!({})
        } else {
            serde_json::from_str(trimmed).map_err(|e| Failure {
                label: label.to_string(),
                status: Some(status),
                response: None,
                error: Some(format!("Unexpected error processing APNs response: {e}")),
                retry_after,
            })?
        };
        return Ok(Success {
            label: label.to_string(),
            echoes,
            body: parsed,
            status: None,
            error: None,
        });
    }

    if is_empty {
        return Err(Failure {
            label: label.to_string(),
            status: Some(status),
            response: None,
            error: Some(format!(
                "stream ended unexpectedly with status {status} and empty body"
            )),
            retry_after,
        });
    }

    let parsed: Value = serde_json::from_str(trimmed).map_err(|e| Failure {
        label: label.to_string(),
        status: Some(status),
        response: None,
        error: Some(format!("Unexpected error processing APNs response: {e}")),
        retry_after,
    })?;

    let reason = parsed.get("reason").and_then(Value::as_str).map(str::to_string);

    if status == 403 && reason.as_deref() == Some("ExpiredProviderToken") {
        if let (Some(token_source), Some(generation)) = (token_source, token_generation) {
            let _ = token_source.regenerate(generation);
        }
        return Err(Failure {
            label: label.to_string(),
            status: Some(403),
            response: Some(parsed),
            error: Some("ExpiredProviderToken".to_string()),
            retry_after,
        });
    }

    if status == 500 && reason.as_deref() == Some("InternalServerError") {
        return Err(Failure {
            label: label.to_string(),
            status: Some(500),
            response: Some(parsed),
            error: Some("Error 500, stream ended unexpectedly".to_string()),
            retry_after,
        });
    }

    Err(Failure {
        label: label.to_string(),
        status: Some(status),
        response: Some(parsed),
        error: reason,
        retry_after,
    })
}
