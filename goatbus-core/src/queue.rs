use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::event::Event;
use crate::subscription::SubscriptionId;

/// Overflow policy shared by every queue. FIFO of the surviving items is
/// preserved in all three modes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest queued event to make room.
    #[default]
    DropOldest,
    /// Discard the incoming event.
    DropNewest,
    /// Reject the enqueue outright.
    Block,
}

impl DropPolicy {
    /// Parses the configuration spelling ("drop_oldest", ...).
    pub fn parse(value: &str) -> Option<DropPolicy> {
        match value {
            "drop_oldest" => Some(DropPolicy::DropOldest),
            "drop_newest" => Some(DropPolicy::DropNewest),
            "block" => Some(DropPolicy::Block),
            _ => None,
        }
    }
}

/// Counters maintained by each persistent queue.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct QueueMetrics {
    pub queued: u64,
    pub processed: u64,
    pub dropped: u64,
    pub max_depth: usize,
    pub avg_depth: f64,
    pub backpressure_events: u64,
}

/// What happened to an enqueue attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnqueueOutcome {
    /// Accepted with room to spare.
    Accepted,
    /// Accepted after evicting the oldest event.
    AcceptedDroppedOldest,
    /// The incoming event was discarded (`drop_newest` or `block`).
    Rejected,
}

impl EnqueueOutcome {
    pub fn accepted(self) -> bool {
        !matches!(self, EnqueueOutcome::Rejected)
    }

    pub fn dropped_existing(self) -> bool {
        matches!(self, EnqueueOutcome::AcceptedDroppedOldest)
    }
}

/// Bounded FIFO absorbing events while a subscriber is saturated.
pub struct PersistentQueue {
    subscription_id: SubscriptionId,
    capacity: usize,
    items: VecDeque<Event>,
    metrics: QueueMetrics,
    depth_accum: f64,
    depth_samples: u64,
}

impl fmt::Debug for PersistentQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentQueue")
            .field("subscription_id", &self.subscription_id)
            .field("capacity", &self.capacity)
            .field("depth", &self.items.len())
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl PersistentQueue {
    pub fn new(subscription_id: SubscriptionId, capacity: usize) -> Self {
        Self {
            subscription_id,
            capacity: capacity.max(1),
            items: VecDeque::new(),
            metrics: QueueMetrics::default(),
            depth_accum: 0.0,
            depth_samples: 0,
        }
    }

    /// Applies the drop policy at capacity and stamps queue metadata on the
    /// stored event. Crossing `threshold · capacity` counts one
    /// backpressure event regardless of outcome.
    pub fn enqueue(
        &mut self,
        mut event: Event,
        policy: DropPolicy,
        threshold: f64,
        now: DateTime<Utc>,
    ) -> EnqueueOutcome {
        if (self.items.len() + 1) as f64 >= threshold * self.capacity as f64 {
            self.metrics.backpressure_events += 1;
        }

        let outcome = if self.items.len() >= self.capacity {
            match policy {
                DropPolicy::DropOldest => {
                    self.items.pop_front();
                    self.metrics.dropped += 1;
                    EnqueueOutcome::AcceptedDroppedOldest
                }
                DropPolicy::DropNewest | DropPolicy::Block => {
                    self.metrics.dropped += 1;
                    EnqueueOutcome::Rejected
                }
            }
        } else {
            EnqueueOutcome::Accepted
        };

        if outcome.accepted() {
            event.stamp_queued(now, self.items.len() + 1, &self.subscription_id);
            self.items.push_back(event);
            self.metrics.queued += 1;
            self.metrics.max_depth = self.metrics.max_depth.max(self.items.len());
            self.depth_accum += self.items.len() as f64;
            self.depth_samples += 1;
            self.metrics.avg_depth = self.depth_accum / self.depth_samples as f64;
        }
        outcome
    }

    pub fn dequeue(&mut self) -> Option<Event> {
        let event = self.items.pop_front();
        if event.is_some() {
            self.metrics.processed += 1;
        }
        event
    }

    /// Puts an event back at the head after a failed delivery attempt,
    /// preserving FIFO of the remainder.
    pub fn requeue_front(&mut self, event: Event) {
        self.metrics.processed = self.metrics.processed.saturating_sub(1);
        self.items.push_front(event);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fill_fraction(&self) -> f64 {
        self.items.len() as f64 / self.capacity as f64
    }

    pub fn clear(&mut self) -> usize {
        let drained = self.items.len();
        self.items.clear();
        drained
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.metrics
    }
}

/// Process-wide ring of recently published events; oldest out on overflow.
pub struct GlobalBacklog {
    ring: VecDeque<Event>,
    capacity: usize,
    dropped: u64,
}

impl fmt::Debug for GlobalBacklog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalBacklog")
            .field("capacity", &self.capacity)
            .field("depth", &self.ring.len())
            .field("dropped", &self.dropped)
            .finish()
    }
}

impl GlobalBacklog {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, event: Event) {
        if self.ring.len() >= self.capacity {
            self.ring.pop_front();
            self.dropped += 1;
        }
        self.ring.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn fill_fraction(&self) -> f64 {
        self.ring.len() as f64 / self.capacity as f64
    }

    pub fn clear(&mut self) -> usize {
        let drained = self.ring.len();
        self.ring.clear();
        drained
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

struct QueueState {
    backlog: GlobalBacklog,
    queues: HashMap<SubscriptionId, PersistentQueue>,
    policy: DropPolicy,
    threshold: f64,
}

/// Owns the global backlog and every per-subscriber persistent queue.
pub struct QueueManager {
    inner: Mutex<QueueState>,
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueManager")
    }
}

impl QueueManager {
    pub fn new(backlog_capacity: usize, policy: DropPolicy, threshold: f64) -> Self {
        Self {
            inner: Mutex::new(QueueState {
                backlog: GlobalBacklog::new(backlog_capacity),
                queues: HashMap::new(),
                policy,
                threshold,
            }),
        }
    }

    pub async fn create_queue(&self, id: SubscriptionId, capacity: usize) {
        let mut state = self.inner.lock().await;
        state
            .queues
            .entry(id)
            .or_insert_with(|| PersistentQueue::new(id, capacity));
    }

    pub async fn remove_queue(&self, id: SubscriptionId) -> bool {
        let mut state = self.inner.lock().await;
        state.queues.remove(&id).is_some()
    }

    pub async fn enqueue(
        &self,
        id: SubscriptionId,
        event: Event,
        now: DateTime<Utc>,
    ) -> Option<EnqueueOutcome> {
        let mut state = self.inner.lock().await;
        let policy = state.policy;
        let threshold = state.threshold;
        state
            .queues
            .get_mut(&id)
            .map(|queue| queue.enqueue(event, policy, threshold, now))
    }

    pub async fn dequeue(&self, id: SubscriptionId) -> Option<Event> {
        let mut state = self.inner.lock().await;
        state.queues.get_mut(&id)?.dequeue()
    }

    pub async fn requeue_front(&self, id: SubscriptionId, event: Event) {
        let mut state = self.inner.lock().await;
        if let Some(queue) = state.queues.get_mut(&id) {
            queue.requeue_front(event);
        }
    }

    pub async fn queue_depth(&self, id: SubscriptionId) -> Option<usize> {
        let state = self.inner.lock().await;
        state.queues.get(&id).map(PersistentQueue::len)
    }

    pub async fn queue_metrics(&self, id: SubscriptionId) -> Option<QueueMetrics> {
        let state = self.inner.lock().await;
        state.queues.get(&id).map(PersistentQueue::metrics)
    }

    pub async fn queued_subscriber_ids(&self) -> Vec<SubscriptionId> {
        let state = self.inner.lock().await;
        state.queues.keys().copied().collect()
    }

    pub async fn append_backlog(&self, event: Event) {
        let mut state = self.inner.lock().await;
        state.backlog.push(event);
    }

    pub async fn backlog_len(&self) -> usize {
        let state = self.inner.lock().await;
        state.backlog.len()
    }

    pub async fn clear_backlog(&self) -> usize {
        let mut state = self.inner.lock().await;
        state.backlog.clear()
    }

    /// Worst fill fraction across the backlog and all subscriber queues;
    /// feeds the backpressure controller's queue-utilization metric.
    pub async fn utilization(&self) -> f64 {
        let state = self.inner.lock().await;
        let mut utilization = state.backlog.fill_fraction();
        for queue in state.queues.values() {
            utilization = utilization.max(queue.fill_fraction());
        }
        utilization
    }

    /// Drops queues whose subscription no longer exists.
    pub async fn drop_orphans(&self, live: &HashSet<SubscriptionId>) -> usize {
        let mut state = self.inner.lock().await;
        let before = state.queues.len();
        state.queues.retain(|id, _| live.contains(id));
        before - state.queues.len()
    }

    pub async fn set_policy(&self, policy: DropPolicy) {
        let mut state = self.inner.lock().await;
        state.policy = policy;
    }

    pub async fn set_threshold(&self, threshold: f64) {
        let mut state = self.inner.lock().await;
        state.threshold = threshold.clamp(0.0, 1.0);
    }

    pub async fn policy(&self) -> DropPolicy {
        let state = self.inner.lock().await;
        state.policy
    }

    pub async fn snapshot(&self) -> serde_json::Value {
        let state = self.inner.lock().await;
        let queues: Vec<serde_json::Value> = state
            .queues
            .values()
            .map(|queue| {
                json!({
                    "subscription_id": queue.subscription_id.to_string(),
                    "depth": queue.len(),
                    "capacity": queue.capacity(),
                    "metrics": queue.metrics(),
                })
            })
            .collect();
        json!({
            "backlog": {
                "depth": state.backlog.len(),
                "dropped": state.backlog.dropped(),
            },
            "drop_policy": state.policy,
            "subscriber_queues": queues,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPriority;
    use crate::payload;

    fn event(name: &str, secs: i64) -> Event {
        Event::new(
            name,
            payload! { "seq" => secs },
            EventPriority::Normal,
            DateTime::from_timestamp(secs, 0).unwrap(),
        )
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(100, 0).unwrap()
    }

    #[test]
    fn drop_oldest_keeps_the_tail() {
        let mut queue = PersistentQueue::new(SubscriptionId::new(), 3);
        for i in 0..5 {
            queue.enqueue(event("e", i), DropPolicy::DropOldest, 0.8, now());
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.metrics().dropped, 2);

        let survivors: Vec<i64> = std::iter::from_fn(|| queue.dequeue())
            .map(|e| e.payload.get("seq").and_then(|v| v.as_i64()).unwrap())
            .collect();
        assert_eq!(survivors, vec![2, 3, 4]);
    }

    #[test]
    fn drop_newest_discards_the_incoming_event() {
        let mut queue = PersistentQueue::new(SubscriptionId::new(), 2);
        queue.enqueue(event("e", 0), DropPolicy::DropNewest, 0.8, now());
        queue.enqueue(event("e", 1), DropPolicy::DropNewest, 0.8, now());
        let outcome = queue.enqueue(event("e", 2), DropPolicy::DropNewest, 0.8, now());

        assert_eq!(outcome, EnqueueOutcome::Rejected);
        assert_eq!(queue.metrics().dropped, 1);
        let survivors: Vec<i64> = std::iter::from_fn(|| queue.dequeue())
            .map(|e| e.payload.get("seq").and_then(|v| v.as_i64()).unwrap())
            .collect();
        assert_eq!(survivors, vec![0, 1]);
    }

    #[test]
    fn block_rejects_at_capacity() {
        let mut queue = PersistentQueue::new(SubscriptionId::new(), 1);
        assert!(queue
            .enqueue(event("e", 0), DropPolicy::Block, 0.8, now())
            .accepted());
        let outcome = queue.enqueue(event("e", 1), DropPolicy::Block, 0.8, now());
        assert_eq!(outcome, EnqueueOutcome::Rejected);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn threshold_crossings_count_backpressure_events() {
        let mut queue = PersistentQueue::new(SubscriptionId::new(), 10);
        for i in 0..10 {
            queue.enqueue(event("e", i), DropPolicy::DropOldest, 0.8, now());
        }
        // Depths 8, 9, 10 sit at or above the 0.8 threshold.
        assert_eq!(queue.metrics().backpressure_events, 3);
    }

    #[test]
    fn enqueue_stamps_queue_metadata() {
        let id = SubscriptionId::new();
        let mut queue = PersistentQueue::new(id, 4);
        queue.enqueue(event("e", 0), DropPolicy::DropOldest, 0.8, now());
        let stored = queue.dequeue().unwrap();
        let meta = stored.payload.get(crate::event::QUEUE_META_KEY).unwrap();
        assert_eq!(meta.get("queue_depth").and_then(|v| v.as_u64()), Some(1));
        assert_eq!(
            meta.get("subscription_id").and_then(|v| v.as_str()),
            Some(id.to_string().as_str())
        );
    }

    #[test]
    fn backlog_evicts_oldest() {
        let mut backlog = GlobalBacklog::new(2);
        backlog.push(event("a", 0));
        backlog.push(event("b", 1));
        backlog.push(event("c", 2));
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog.dropped(), 1);
    }

    #[tokio::test]
    async fn manager_drops_orphan_queues() {
        let manager = QueueManager::new(16, DropPolicy::DropOldest, 0.8);
        let keep = SubscriptionId::new();
        let orphan = SubscriptionId::new();
        manager.create_queue(keep, 4).await;
        manager.create_queue(orphan, 4).await;

        let live: HashSet<SubscriptionId> = [keep].into_iter().collect();
        assert_eq!(manager.drop_orphans(&live).await, 1);
        assert!(manager.queue_depth(keep).await.is_some());
        assert!(manager.queue_depth(orphan).await.is_none());
    }

    #[test]
    fn requeue_front_preserves_fifo() {
        let mut queue = PersistentQueue::new(SubscriptionId::new(), 4);
        for i in 0..3 {
            queue.enqueue(event("e", i), DropPolicy::DropOldest, 0.8, now());
        }
        let head = queue.dequeue().unwrap();
        queue.requeue_front(head);

        let order: Vec<i64> = std::iter::from_fn(|| queue.dequeue())
            .map(|e| e.payload.get("seq").and_then(|v| v.as_i64()).unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }
}
