use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// String-keyed payload carried by every event.
pub type Payload = Map<String, Value>;

/// Priority bands drive throttling, health adjustment, and drop decisions.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize, Default,
)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl EventPriority {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// One band lower, saturating at `Low`.
    pub fn demoted(self) -> EventPriority {
        match self {
            EventPriority::Low | EventPriority::Normal => EventPriority::Low,
            EventPriority::High => EventPriority::Normal,
            EventPriority::Critical => EventPriority::High,
        }
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPriority::Low => write!(f, "low"),
            EventPriority::Normal => write!(f, "normal"),
            EventPriority::High => write!(f, "high"),
            EventPriority::Critical => write!(f, "critical"),
        }
    }
}

/// A named, timestamped, priority-tagged payload. Immutable once published;
/// the replay store, queues, and windows all hold clones of the same value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub payload: Payload,
    pub priority: EventPriority,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        name: impl Into<String>,
        payload: Payload,
        priority: EventPriority,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            payload,
            priority,
            timestamp,
        }
    }

    /// The `processing_time` payload field, when positive.
    pub fn processing_time(&self) -> Option<f64> {
        self.payload
            .get("processing_time")
            .and_then(Value::as_f64)
            .filter(|t| *t > 0.0)
    }

    /// Whether the payload carries a truthy `error` or `failed` field.
    pub fn is_error(&self) -> bool {
        ["error", "failed"]
            .iter()
            .filter_map(|key| self.payload.get(*key))
            .any(value_is_truthy)
    }
}

fn value_is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Dispatch metadata stamped into the payload under `_bus_meta` just before
/// routing, so handlers and downstream tooling see how the event travelled.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchStamp {
    pub event_name: String,
    pub timestamp: DateTime<Utc>,
    pub priority: EventPriority,
    pub source: String,
    pub target_systems: Vec<String>,
    pub health_adjusted: bool,
    pub integration_event: bool,
}

/// Payload key carrying the [`DispatchStamp`].
pub const BUS_META_KEY: &str = "_bus_meta";

/// Payload key carrying per-enqueue queue metadata.
pub const QUEUE_META_KEY: &str = "_queue_meta";

impl Event {
    /// Writes the dispatch stamp into the payload. Replaces any stale stamp
    /// left over from a previous hop.
    pub fn stamp(&mut self, stamp: &DispatchStamp) {
        self.payload.insert(
            BUS_META_KEY.to_string(),
            serde_json::to_value(stamp).unwrap_or(Value::Null),
        );
    }

    /// Attaches `{queued_at, queue_depth, subscription_id}` on enqueue.
    pub fn stamp_queued(
        &mut self,
        queued_at: DateTime<Utc>,
        queue_depth: usize,
        subscription_id: &crate::subscription::SubscriptionId,
    ) {
        self.payload.insert(
            QUEUE_META_KEY.to_string(),
            json!({
                "queued_at": queued_at,
                "queue_depth": queue_depth,
                "subscription_id": subscription_id.to_string(),
            }),
        );
    }
}

/// Builds a [`Payload`] from `key => value` pairs; values go through
/// `serde_json::json!`.
#[macro_export]
macro_rules! payload {
    () => { $crate::event::Payload::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::event::Payload::new();
        $(map.insert(($key).to_string(), ::serde_json::json!($value));)+
        map
    }};
}
