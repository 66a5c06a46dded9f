//! Push payload decoding and the notification registry.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_TITLE: &str = "New Notification";
pub const DEFAULT_BODY: &str = "You have a new notification.";
pub const DEFAULT_URL: &str = "/";
pub const DEFAULT_ICON: &str = "/icons/icon-192x192.png";

/// Fields of a push message, each falling back to a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub url: String,
    pub icon: String,
}

impl Default for PushPayload {
    fn default() -> Self {
        Self {
            title: DEFAULT_TITLE.to_string(),
            body: DEFAULT_BODY.to_string(),
            url: DEFAULT_URL.to_string(),
            icon: DEFAULT_ICON.to_string(),
        }
    }
}

impl PushPayload {
    /// Decode a push body. Never fails: a missing body, a body that is not
    /// a JSON object, or a field that is not a non-empty string all yield
    /// the default for that field.
    pub fn decode(data: Option<&[u8]>) -> Self {
        let mut payload = Self::default();

        let Some(data) = data else {
            debug!("Push without payload, using defaults");
            return payload;
        };

        let fields = match serde_json::from_slice::<Value>(data) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => {
                debug!(kind = json_kind(&other), "Push payload is not an object");
                return payload;
            }
            Err(e) => {
                debug!(error = %e, "Push payload is not JSON");
                return payload;
            }
        };

        let field = |name: &str| -> Option<String> {
            match fields.get(name) {
                Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
                Some(other) => {
                    debug!(field = name, kind = json_kind(other), "Ignoring push field");
                    None
                }
                None => None,
            }
        };

        if let Some(title) = field("title") {
            payload.title = title;
        }
        if let Some(body) = field("body") {
            payload.body = body;
        }
        if let Some(url) = field("url") {
            payload.url = url;
        }
        if let Some(icon) = field("icon") {
            payload.icon = icon;
        }
        payload
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ==================== Notifications ====================

/// Unique identifier for a shown notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification-{}", self.0)
    }
}

/// A displayed notification. `url` is opaque data used on click.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub url: String,
}

/// Notifications currently on screen.
#[derive(Debug, Default)]
pub struct Notifications {
    shown: HashMap<NotificationId, Notification>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Display a notification for a decoded payload.
    pub fn show(&mut self, payload: PushPayload) -> Notification {
        let notification = Notification {
            id: NotificationId::new(),
            title: payload.title,
            body: payload.body,
            icon: payload.icon,
            url: payload.url,
        };
        debug!(id = %notification.id, title = %notification.title, "Showing notification");
        self.shown.insert(notification.id, notification.clone());
        notification
    }

    /// Close a notification, returning it if it was shown.
    pub fn close(&mut self, id: NotificationId) -> Option<Notification> {
        self.shown.remove(&id)
    }

    pub fn get(&self, id: NotificationId) -> Option<&Notification> {
        self.shown.get(&id)
    }

    /// Shown notifications, oldest first.
    pub fn list(&self) -> Vec<&Notification> {
        let mut all: Vec<&Notification> = self.shown.values().collect();
        all.sort_by_key(|n| n.id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_payload() {
        let payload = PushPayload::decode(Some(
            br#"{"title":"Build finished","body":"3 tests failed","url":"/builds/42","icon":"/i.png"}"#,
        ));
        assert_eq!(payload.title, "Build finished");
        assert_eq!(payload.body, "3 tests failed");
        assert_eq!(payload.url, "/builds/42");
        assert_eq!(payload.icon, "/i.png");
    }

    #[test]
    fn test_missing_payload_uses_defaults() {
        let payload = PushPayload::decode(None);
        assert_eq!(payload.title, "New Notification");
        assert_eq!(payload.body, "You have a new notification.");
        assert_eq!(payload.url, "/");
    }

    #[test]
    fn test_partial_payload() {
        let payload = PushPayload::decode(Some(br#"{"title":"Hi"}"#));
        assert_eq!(payload.title, "Hi");
        assert_eq!(payload.body, DEFAULT_BODY);
        assert_eq!(payload.url, DEFAULT_URL);
    }

    #[test]
    fn test_malformed_payloads() {
        let cases: [&[u8]; 7] = [
            b"not json",
            b"",
            b"[1,2,3]",
            b"\"just a string\"",
            b"null",
            b"{\"title\":",
            &[0xff, 0xfe, 0x00],
        ];
        for raw in cases {
            assert_eq!(PushPayload::decode(Some(raw)), PushPayload::default());
        }
    }

    #[test]
    fn test_wrong_field_types_fall_back_per_field() {
        let payload = PushPayload::decode(Some(br#"{"title":7,"body":"ok","url":{"a":1},"icon":""}"#));
        assert_eq!(payload.title, DEFAULT_TITLE);
        assert_eq!(payload.body, "ok");
        assert_eq!(payload.url, DEFAULT_URL);
        assert_eq!(payload.icon, DEFAULT_ICON);
    }

    #[test]
    fn test_show_and_close() {
        let mut notifications = Notifications::new();
        let first = notifications.show(PushPayload::default());
        let second = notifications.show(PushPayload::decode(Some(br#"{"title":"b"}"#)));

        let titles: Vec<&str> = notifications.list().iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec![DEFAULT_TITLE, "b"]);

        assert_eq!(notifications.close(first.id).map(|n| n.id), Some(first.id));
        assert!(notifications.close(first.id).is_none());
        assert!(notifications.get(second.id).is_some());
    }
}
