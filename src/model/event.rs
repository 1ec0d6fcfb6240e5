//! Tracked events.
//!
//! An event is immutable once queued. Its fingerprint is derived on demand
//! from the type and the salient payload fields, never from the timestamp,
//! and is not stored on the event.

use serde::{Deserialize, Serialize};

use super::session::SessionEndReason;
use super::{Metadata, now_ms};

/// Kind of a tracked event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    SessionEnd,
    PageView,
    Click,
    Scroll,
    WebVital,
    Custom,
    Error,
    ViewportVisible,
}

impl EventType {
    /// Session lifecycle events bypass sampling, dedup and rate limits.
    pub fn is_session_lifecycle(self) -> bool {
        matches!(self, EventType::SessionStart | EventType::SessionEnd)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::SessionStart => "session_start",
            EventType::SessionEnd => "session_end",
            EventType::PageView => "page_view",
            EventType::Click => "click",
            EventType::Scroll => "scroll",
            EventType::WebVital => "web_vital",
            EventType::Custom => "custom",
            EventType::Error => "error",
            EventType::ViewportVisible => "viewport_visible",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
}

/// Type-specific data carried by an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    PageView {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        referrer: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    Click {
        x: f64,
        y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Scroll {
        depth_percent: u8,
        direction: ScrollDirection,
    },
    WebVital {
        name: String,
        value: f64,
    },
    Custom {
        name: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Viewport {
        selector: String,
        dwell_ms: u64,
    },
    SessionEnd {
        reason: SessionEndReason,
    },
}

impl Payload {
    /// The event type this payload belongs to.
    pub fn event_type(&self) -> EventType {
        match self {
            Payload::PageView { .. } => EventType::PageView,
            Payload::Click { .. } => EventType::Click,
            Payload::Scroll { .. } => EventType::Scroll,
            Payload::WebVital { .. } => EventType::WebVital,
            Payload::Custom { .. } => EventType::Custom,
            Payload::Error { .. } => EventType::Error,
            Payload::Viewport { .. } => EventType::ViewportVisible,
            Payload::SessionEnd { .. } => EventType::SessionEnd,
        }
    }
}

/// A structured event handed to the event manager by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Stable dedup key for an event. Not stored on the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u64);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Click coordinates are bucketed so jittery double-clicks collapse.
const CLICK_COORDINATE_BUCKET: f64 = 10.0;

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            timestamp: now_ms(),
            payload: None,
            metadata: None,
        }
    }

    pub fn with_payload(payload: Payload) -> Self {
        Self {
            event_type: payload.event_type(),
            timestamp: now_ms(),
            payload: Some(payload),
            metadata: None,
        }
    }

    pub fn page_view(url: impl Into<String>) -> Self {
        Self::with_payload(Payload::PageView {
            url: url.into(),
            referrer: None,
            title: None,
        })
    }

    pub fn click(x: f64, y: f64, element: Option<String>) -> Self {
        Self::with_payload(Payload::Click {
            x,
            y,
            element,
            text: None,
        })
    }

    pub fn scroll(depth_percent: u8, direction: ScrollDirection) -> Self {
        Self::with_payload(Payload::Scroll {
            depth_percent: depth_percent.min(100),
            direction,
        })
    }

    pub fn web_vital(name: impl Into<String>, value: f64) -> Self {
        Self::with_payload(Payload::WebVital {
            name: name.into(),
            value,
        })
    }

    /// A custom event. `metadata` must already be sanitized.
    pub fn custom(name: impl Into<String>, metadata: Option<Metadata>) -> Self {
        let mut event = Self::with_payload(Payload::Custom { name: name.into() });
        event.metadata = metadata;
        event
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_payload(Payload::Error {
            message: message.into(),
            source: None,
        })
    }

    pub fn session_start() -> Self {
        Self::new(EventType::SessionStart)
    }

    pub fn session_end(reason: SessionEndReason) -> Self {
        Self::with_payload(Payload::SessionEnd { reason })
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Structural check applied to anything a transform hook hands back.
    ///
    /// The payload, when present, must agree with the declared type and the
    /// timestamp must be positive.
    pub fn is_well_formed(&self) -> bool {
        if self.timestamp <= 0 {
            return false;
        }
        match &self.payload {
            Some(payload) => payload.event_type() == self.event_type && payload_is_valid(payload),
            None => !matches!(
                self.event_type,
                EventType::PageView | EventType::Click | EventType::Custom
            ),
        }
    }

    /// Derive the dedup fingerprint (FNV-1a over type and salient fields).
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Fnv1a::new();
        hasher.write_str(&self.event_type.to_string());

        match &self.payload {
            Some(Payload::PageView { url, .. }) => hasher.write_str(url),
            Some(Payload::Click { x, y, element, .. }) => {
                let bx = (x / CLICK_COORDINATE_BUCKET).round() as i64;
                let by = (y / CLICK_COORDINATE_BUCKET).round() as i64;
                hasher.write_str(&format!("{bx}:{by}"));
                hasher.write_str(element.as_deref().unwrap_or(""));
            }
            Some(Payload::Scroll {
                depth_percent,
                direction,
            }) => hasher.write_str(&format!("{depth_percent}:{direction:?}")),
            Some(Payload::WebVital { name, .. }) => hasher.write_str(name),
            Some(Payload::Custom { name }) => hasher.write_str(name),
            Some(Payload::Error { message, .. }) => hasher.write_str(message),
            Some(Payload::Viewport { selector, .. }) => hasher.write_str(selector),
            Some(Payload::SessionEnd { reason }) => hasher.write_str(&reason.to_string()),
            None => {}
        }

        if let Some(metadata) = &self.metadata {
            // serde_json maps are key-ordered, so this is canonical.
            hasher.write_str(&serde_json::Value::Object(metadata.clone()).to_string());
        }

        Fingerprint(hasher.finish())
    }
}

fn payload_is_valid(payload: &Payload) -> bool {
    match payload {
        Payload::PageView { url, .. } => !url.is_empty(),
        Payload::Click { x, y, .. } => x.is_finite() && y.is_finite(),
        Payload::Scroll { depth_percent, .. } => *depth_percent <= 100,
        Payload::WebVital { name, value } => !name.is_empty() && value.is_finite(),
        Payload::Custom { name } => !name.trim().is_empty(),
        Payload::Error { .. } | Payload::Viewport { .. } | Payload::SessionEnd { .. } => true,
    }
}

struct Fnv1a(u64);

impl Fnv1a {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    fn new() -> Self {
        Self(Self::OFFSET)
    }

    fn write_str(&mut self, s: &str) {
        for byte in s.as_bytes() {
            self.0 ^= u64::from(*byte);
            self.0 = self.0.wrapping_mul(Self::PRIME);
        }
        // field separator so ("ab","c") != ("a","bc")
        self.0 ^= 0xff;
        self.0 = self.0.wrapping_mul(Self::PRIME);
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(value: serde_json::Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn fingerprint_ignores_timestamp() {
        let a = Event::custom("purchase", Some(metadata(json!({"sku": "A1"})))).at(1_000);
        let b = Event::custom("purchase", Some(metadata(json!({"sku": "A1"})))).at(9_000);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_metadata() {
        let a = Event::custom("purchase", Some(metadata(json!({"sku": "A1"}))));
        let b = Event::custom("purchase", Some(metadata(json!({"sku": "B2"}))));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn nearby_clicks_share_a_fingerprint() {
        let a = Event::click(101.0, 49.0, Some("button#buy".into()));
        let b = Event::click(99.0, 51.0, Some("button#buy".into()));
        assert_eq!(a.fingerprint(), b.fingerprint());

        let far = Event::click(300.0, 51.0, Some("button#buy".into()));
        assert_ne!(a.fingerprint(), far.fingerprint());
    }

    #[test]
    fn payload_must_match_declared_type() {
        let mut event = Event::page_view("https://example.com/");
        assert!(event.is_well_formed());

        event.event_type = EventType::Click;
        assert!(!event.is_well_formed());
    }

    #[test]
    fn custom_event_without_name_is_malformed() {
        let event = Event::custom("   ", None);
        assert!(!event.is_well_formed());
    }

    #[test]
    fn serializes_type_field_in_snake_case() {
        let event = Event::session_start().at(42);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "session_start");
        assert_eq!(value["timestamp"], 42);
    }
}
