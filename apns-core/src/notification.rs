//! The `Notification` trait: the external collaborator seam. Concrete
//! payload builders (alerts, silent pushes, channel messages) live outside
//! this crate; [`SimpleNotification`] is a minimal reference implementation
//! used by this crate's own tests.

use bytes::Bytes;
use http::HeaderMap;
use serde_json::Value;

/// Produces the headers and body APNs expects for a single push.
/// Implementations are called once per recipient by the dispatcher.
pub trait Notification: Send + Sync {
    /// Request headers this notification wants set, e.g. `apns-topic`,
    /// `apns-push-type`, `apns-priority`, `apns-expiration`.
    fn headers(&self) -> HeaderMap;

    /// The JSON request body.
    fn compile(&self) -> Value;

    /// Called by `manage_channels`'s `Create` action before
    /// `strip_channel_unrelated_properties`. The default is a no-op; a
    /// concrete notification type that already sets `apns-push-type`
    /// overrides nothing.
    fn add_push_type_if_needed(&self, headers: HeaderMap) -> HeaderMap {
        headers
    }

    /// Called by `manage_channels`'s `Create` action: channel-create bodies
    /// reject properties that only make sense for device-addressed pushes
    /// (`badge`, `sound`, `mutable-content`, ...). The default implementation
    /// passes the body through unchanged; concrete channel-notification
    /// types should override this to strip such keys from `aps`.
    fn strip_channel_unrelated_properties(&self, body: Value) -> Value {
        body
    }
}

/// What `Notification::headers()`/`compile()` assemble into, ready for the
/// wire. `body` is elided entirely when [`BuiltNotification::is_empty_body`]
/// holds.
#[derive(Debug, Clone)]
pub struct BuiltNotification {
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BuiltNotification {
    pub fn build(notification: &dyn Notification) -> Self {
        let headers = notification.headers();
        let body = notification.compile();
        let body = serde_json::to_vec(&body).unwrap_or_default();
        Self {
            headers,
            body: Bytes::from(body),
        }
    }

    /// True for a body that is empty after trimming ASCII whitespace, or
    /// equal to the literal `{}` — both are elided on send and read back as
    /// an empty JSON object.
    pub fn is_empty_body(&self) -> bool {
        let trimmed = std::str::from_utf8(&self.body)
            .map(str::trim)
            .unwrap_or("");
        trimmed.is_empty() || trimmed == "{}"
    }
}

/// Minimal reference [`Notification`]: a fixed set of headers and a JSON
/// body, set directly. Sufficient for this crate's own tests and for
/// callers with simple enough payloads not to need their own builder.
#[derive(Debug, Clone, Default)]
pub struct SimpleNotification {
    pub topic: Option<String>,
    pub push_type: Option<String>,
    pub priority: Option<u8>,
    pub expiration: Option<i64>,
    pub channel_id: Option<String>,
    pub body: Value,
}

impl SimpleNotification {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }
}

impl Notification for SimpleNotification {
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(topic) = &self.topic {
            if let Ok(v) = http::HeaderValue::from_str(topic) {
                headers.insert("apns-topic", v);
            }
        }
        if let Some(push_type) = &self.push_type {
            if let Ok(v) = http::HeaderValue::from_str(push_type) {
                headers.insert("apns-push-type", v);
            }
        }
        if let Some(priority) = self.priority {
            headers.insert("apns-priority", u16::from(priority).into());
        }
        if let Some(expiration) = self.expiration {
            headers.insert("apns-expiration", expiration.into());
        }
        if let Some(channel_id) = &self.channel_id {
            if let Ok(v) = http::HeaderValue::from_str(channel_id) {
                headers.insert("apns-channel-id", v);
            }
        }
        headers
    }

    fn compile(&self) -> Value {
        self.body.clone()
    }

    fn add_push_type_if_needed(&self, mut headers: HeaderMap) -> HeaderMap {
        if !headers.contains_key("apns-push-type") {
            headers.insert("apns-push-type", http::HeaderValue::from_static("background"));
        }
        headers
    }

    fn strip_channel_unrelated_properties(&self, body: Value) -> Value {
        match body {
            Value::Object(mut map) => {
                if let Some(Value::Object(mut aps)) = map.remove("aps") {
                    for key in ["badge", "sound", "mutable-content"] {
                        aps.remove(key);
                    }
                    if !aps.is_empty() {
                        map.insert("aps".to_string(), Value::Object(aps));
                    }
                }
                Value::Object(map)
            }
            other => other,
        }
    }
}
