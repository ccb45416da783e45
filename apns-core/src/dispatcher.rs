//! Public surface: turns a batch of recipients or notifications into
//! concurrent requests and partitions the results into `sent`/`failed`.

use std::sync::Arc;

use futures::future::join_all;
use http::Method;

use crate::config::ResolvedConfig;
use crate::error::{DispatchError, PublicFailure};
use crate::notification::{BuiltNotification, Notification};
use crate::requester::{Requester, Success};
use crate::retry;
use crate::session::{SessionKind, SessionManager};
use crate::token::TokenSource;

/// Which push-style endpoint family a request targets. Determines both the
/// rendered path and which session (`push` or `manage`) carries it — the
/// session follows from the kind the dispatcher already picked, never from
/// inspecting the rendered path string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Device,
    Channels,
    AllChannels,
    Broadcasts,
}

impl RequestKind {
    fn session(self) -> SessionKind {
        match self {
            RequestKind::Device | RequestKind::Broadcasts => SessionKind::Push,
            RequestKind::Channels | RequestKind::AllChannels => SessionKind::Manage,
        }
    }

    fn path(self, subject: &str) -> String {
        match self {
            RequestKind::Device => format!("/3/device/{subject}"),
            RequestKind::Channels => format!("/1/apps/{subject}/channels"),
            RequestKind::AllChannels => format!("/1/apps/{subject}/all-channels"),
            RequestKind::Broadcasts => format!("/4/broadcasts/apps/{subject}"),
        }
    }
}

/// A channel management action, as named by callers of
/// [`Dispatcher::manage_channels`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAction {
    Create,
    Read,
    ReadAll,
    Delete,
}

impl ChannelAction {
    fn parse(action: &str) -> Option<Self> {
        match action {
            "create" => Some(Self::Create),
            "read" => Some(Self::Read),
            "readAll" => Some(Self::ReadAll),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    fn kind_and_method(self) -> (RequestKind, Method) {
        match self {
            ChannelAction::Create => (RequestKind::Channels, Method::POST),
            ChannelAction::Read => (RequestKind::Channels, Method::GET),
            ChannelAction::ReadAll => (RequestKind::AllChannels, Method::GET),
            ChannelAction::Delete => (RequestKind::Channels, Method::DELETE),
        }
    }
}

/// The result of any `Dispatcher` batch call: every input recipient
/// appears in exactly one of the two lists.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub sent: Vec<Success>,
    pub failed: Vec<PublicFailure>,
}

impl BatchResult {
    fn push_outcome(&mut self, outcome: Result<Success, PublicFailure>) {
        match outcome {
            Ok(success) if success.status.is_none() && success.error.is_none() => {
                self.sent.push(success)
            }
            Ok(success) => self.failed.push(PublicFailure {
                label: success.label,
                status: success.status,
                response: Some(success.body),
                error: success.error,
            }),
            Err(failure) => self.failed.push(failure),
        }
    }
}

/// Fans out concurrent HTTP/2 requests for a single logical client (one
/// `push` session, one `manage` session, one provider token).
pub struct Dispatcher {
    session_manager: Arc<SessionManager>,
    requester: Arc<Requester>,
    connection_retry_limit: u8,
}

impl Dispatcher {
    pub fn new(resolved: &ResolvedConfig) -> Result<Self, crate::error::ConfigError> {
        let session_manager = Arc::new(SessionManager::new(resolved)?);
        let token_source = match &resolved.credentials {
            crate::config::Credentials::Token { key_pem, key_id, team_id } => Some(Arc::new(
                TokenSource::new(key_pem.clone(), key_id.clone(), team_id.clone())
                    .map_err(|e| crate::error::ConfigError::Tls(e.to_string()))?,
            )),
            crate::config::Credentials::Tls { .. } => None,
        };
        let requester = Arc::new(Requester::new(token_source, resolved.request_timeout));
        Ok(Self {
            session_manager,
            requester,
            connection_retry_limit: resolved.connection_retry_limit,
        })
    }

    /// Assembles a dispatcher from its parts directly, bypassing
    /// `SessionManager::new`'s TLS/dialer wiring. Exists for integration
    /// tests that substitute an in-process `h2::server` double via
    /// [`SessionManager::with_dialers`].
    pub fn from_parts(session_manager: Arc<SessionManager>, requester: Arc<Requester>, connection_retry_limit: u8) -> Self {
        Self {
            session_manager,
            requester,
            connection_retry_limit,
        }
    }

    async fn dispatch_one(
        &self,
        kind: RequestKind,
        subject: &str,
        built: &BuiltNotification,
    ) -> Result<Success, PublicFailure> {
        let path = kind.path(subject);
        retry::execute(
            &self.requester,
            &self.session_manager,
            kind.session(),
            &path,
            Method::POST,
            built,
            subject,
            self.connection_retry_limit,
        )
        .await
    }

    /// Sends one notification to each of `recipients` (device tokens).
    pub async fn send(&self, notification: &dyn Notification, recipients: &[String]) -> BatchResult {
        let built = BuiltNotification::build(notification);
        let outcomes = join_all(
            recipients
                .iter()
                .map(|device| self.dispatch_device(device, &built)),
        )
        .await;

        let mut result = BatchResult::default();
        for outcome in outcomes {
            result.push_outcome(outcome);
        }
        result
    }

    async fn dispatch_device(&self, device: &str, built: &BuiltNotification) -> Result<Success, PublicFailure> {
        self.dispatch_one(RequestKind::Device, device, built).await
    }

    /// Creates/reads/deletes channels for `bundle_id`. Rejects an unknown
    /// `action` before any I/O.
    pub async fn manage_channels(
        &self,
        notifications: &[Box<dyn Notification>],
        bundle_id: &str,
        action: &str,
    ) -> Result<BatchResult, DispatchError> {
        let action = ChannelAction::parse(action).ok_or_else(|| DispatchError {
            bundle_id: bundle_id.to_string(),
            action: action.to_string(),
        })?;
        let (kind, method) = action.kind_and_method();

        let outcomes = join_all(notifications.iter().map(|notification| {
            let method = method.clone();
            async move {
                let mut built = BuiltNotification::build(notification.as_ref());
                if action == ChannelAction::Create {
                    built.headers = notification.add_push_type_if_needed(built.headers);
                    let stripped = notification.strip_channel_unrelated_properties(notification.compile());
                    built.body = bytes::Bytes::from(serde_json::to_vec(&stripped).unwrap_or_default());
                }
                let path = kind.path(bundle_id);
                retry::execute(
                    &self.requester,
                    &self.session_manager,
                    kind.session(),
                    &path,
                    method,
                    &built,
                    bundle_id,
                    self.connection_retry_limit,
                )
                .await
            }
        }))
        .await;

        let mut result = BatchResult::default();
        for outcome in outcomes {
            result.push_outcome(outcome);
        }
        Ok(result)
    }

    /// Broadcasts each of `notifications` to `bundle_id`'s broadcast
    /// channel, echoing `apns-channel-id` from the built headers when set.
    pub async fn broadcast(&self, notifications: &[Box<dyn Notification>], bundle_id: &str) -> BatchResult {
        let outcomes = join_all(notifications.iter().map(|notification| async {
            let built = BuiltNotification::build(notification.as_ref());
            let outcome = self.dispatch_one(RequestKind::Broadcasts, bundle_id, &built).await;
            match outcome {
                Ok(mut success) if success.echoes.channel_id.is_none() => {
                    success.echoes.channel_id = built
                        .headers
                        .get("apns-channel-id")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    Ok(success)
                }
                other => other,
            }
        }))
        .await;

        let mut result = BatchResult::default();
        for outcome in outcomes {
            result.push_outcome(outcome);
        }
        result
    }

    pub fn shutdown(&self) {
        self.session_manager.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_kind_resolves_session_from_kind_not_path() {
        assert_eq!(RequestKind::Device.session(), SessionKind::Push);
        assert_eq!(RequestKind::Broadcasts.session(), SessionKind::Push);
        assert_eq!(RequestKind::Channels.session(), SessionKind::Manage);
        assert_eq!(RequestKind::AllChannels.session(), SessionKind::Manage);
    }

    #[test]
    fn paths_match_spec_templates() {
        assert_eq!(RequestKind::Device.path("tok"), "/3/device/tok");
        assert_eq!(RequestKind::Channels.path("com.app"), "/1/apps/com.app/channels");
        assert_eq!(RequestKind::AllChannels.path("com.app"), "/1/apps/com.app/all-channels");
        assert_eq!(RequestKind::Broadcasts.path("com.app"), "/4/broadcasts/apps/com.app");
    }

    #[test]
    fn unrecognized_action_is_rejected() {
        assert_eq!(ChannelAction::parse("explode"), None);
    }

    #[test]
    fn known_actions_map_to_expected_kind_and_method() {
        assert_eq!(
            ChannelAction::Create.kind_and_method(),
            (RequestKind::Channels, Method::POST)
        );
        assert_eq!(
            ChannelAction::ReadAll.kind_and_method(),
            (RequestKind::AllChannels, Method::GET)
        );
        assert_eq!(
            ChannelAction::Delete.kind_and_method(),
            (RequestKind::Channels, Method::DELETE)
        );
    }

    #[test]
    fn batch_result_reclassifies_success_carrying_status_as_failure() {
        let mut result = BatchResult::default();
        result.push_outcome(Ok(Success {
            label: "tok".to_string(),
            echoes: crate::requester::Echoes::default(),
            body: serde_json::json!({}),
            status: Some(400),
            error: Some("BadDeviceToken".to_string()),
        }));
        assert!(result.sent.is_empty());
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].status, Some(400));
    }
}
