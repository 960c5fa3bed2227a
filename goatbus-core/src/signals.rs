use std::fmt;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::backpressure::BackpressureAction;
use crate::batch::IntegrationCategory;
use crate::event::EventPriority;
use crate::subscription::SubscriptionId;

/// Observable bus notifications, fanned out to observers over a broadcast
/// channel. Dropped when nobody is listening.
#[derive(Clone, Debug)]
pub enum BusSignal {
    EventPublished {
        name: String,
        priority: EventPriority,
        timestamp: DateTime<Utc>,
    },
    SubscriberQueueOverflow {
        subscription_id: SubscriptionId,
        event: String,
        dropped: u64,
    },
    IntegrationEventProcessed {
        category: IntegrationCategory,
        batch_size: usize,
    },
    BatchProcessingCompleted {
        key: String,
        processed: usize,
        failed: usize,
        duration_ms: f64,
    },
    DependencyConnectionFailed {
        name: String,
        attempts: u32,
    },
    DependenciesResolved {
        replayed_operations: usize,
    },
    SystemHealthRoutingUpdated {
        system: String,
        routed: bool,
        score: f64,
    },
    FrameBudgetExceeded {
        frame_ms: f64,
        budget_ms: f64,
    },
    ThrottleAdjusted {
        pressure: f64,
        previous: f64,
        current: f64,
        actions: Vec<BackpressureAction>,
        timestamp: DateTime<Utc>,
    },
}

/// Lightweight in-process hub that fans bus notifications out to observers.
pub struct SignalHub {
    sender: broadcast::Sender<BusSignal>,
    capacity: usize,
}

impl fmt::Debug for SignalHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalHub")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl SignalHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusSignal> {
        self.sender.subscribe()
    }

    /// Best-effort emit; a hub with no observers swallows the signal.
    pub fn emit(&self, signal: BusSignal) {
        let _ = self.sender.send(signal);
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Sender handle for observers that forward signals from sync contexts
    /// (e.g. throttle-change callbacks).
    pub fn sender(&self) -> broadcast::Sender<BusSignal> {
        self.sender.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn observers_receive_emitted_signals() {
        let hub = SignalHub::new(16);
        let mut rx = hub.subscribe();
        hub.emit(BusSignal::FrameBudgetExceeded {
            frame_ms: 20.0,
            budget_ms: 16.0,
        });

        match rx.recv().await.unwrap() {
            BusSignal::FrameBudgetExceeded { frame_ms, .. } => assert_eq!(frame_ms, 20.0),
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[test]
    fn emitting_without_observers_is_fine() {
        let hub = SignalHub::new(4);
        hub.emit(BusSignal::DependenciesResolved {
            replayed_operations: 0,
        });
        assert_eq!(hub.observer_count(), 0);
    }
}
