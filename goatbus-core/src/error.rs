use thiserror::Error;

use crate::replay::ReplaySessionId;
use crate::subscription::SubscriptionId;

/// Failures surfaced by bus internals.
///
/// None of these ever escape `publish`: the dispatch pipeline converts them
/// into accounting, log lines, and signals, and callers observe booleans.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("dependencies not ready; operation cached")]
    DependenciesNotReady,

    #[error("schema validation failed for '{event}': {errors:?}")]
    SchemaViolation { event: String, errors: Vec<String> },

    #[error("event '{0}' has no registered schema and is not exempt")]
    SchemaEnforcement(String),

    #[error("event dropped under backpressure")]
    BackpressureDrop,

    #[error("queue overflow for subscription {subscription_id}: {dropped} event(s) lost")]
    QueueOverflow {
        subscription_id: SubscriptionId,
        dropped: u64,
    },

    #[error("handler failed for subscription {0}")]
    HandlerFailure(SubscriptionId),

    #[error("subscription {0} is no longer valid")]
    InvalidSubscription(SubscriptionId),

    #[error("replay session not found: {0}")]
    ReplaySessionNotFound(ReplaySessionId),

    #[error("time window not found: {0}")]
    WindowNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BusError>;
