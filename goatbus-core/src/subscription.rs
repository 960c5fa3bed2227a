use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::event::Event;

/// Unique identifier for subscriptions. Opaque and time-ordered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handler invoked for each delivered event.
///
/// Failures stay inside the bus: an `Err` feeds the subscription's
/// consecutive-failure counter and never propagates to the publisher.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<()>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

struct FnHandler {
    f: Box<dyn Fn(Event) -> HandlerFuture + Send + Sync>,
}

#[async_trait]
impl EventHandler for FnHandler {
    async fn handle(&self, event: Event) -> Result<()> {
        (self.f)(event).await
    }
}

/// Wraps an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        f: Box::new(move |event| -> HandlerFuture { Box::pin(f(event)) }),
    })
}

/// Per-subscription policy supplied at subscribe time.
#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    /// Absorb events into a bounded per-subscriber queue while the handler
    /// is saturated.
    pub enable_queue: bool,
    /// Concurrent in-flight handler invocations allowed.
    pub max_concurrent: usize,
    /// Mirror published events into a per-subscriber replay ring.
    pub enable_replay: bool,
    /// Capacity of the per-subscriber queue and replay ring.
    pub queue_size: usize,
    /// Host system this subscriber belongs to; drives health routing.
    pub system: Option<String>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            enable_queue: false,
            max_concurrent: 1,
            enable_replay: false,
            queue_size: 100,
            system: None,
        }
    }
}

/// Weak handle to a subscription owner. The bus never extends owner
/// lifetime; a collected owner invalidates the subscription.
pub type OwnerRef = Weak<dyn Any + Send + Sync>;

/// A binding of handler + weak owner to an event name.
pub struct Subscription {
    pub id: SubscriptionId,
    pub event: String,
    pub created_at: DateTime<Utc>,
    pub max_concurrent: usize,
    pub queue_enabled: bool,
    pub queue_size: usize,
    pub replay_enabled: bool,
    pub system: Option<String>,
    handler: Arc<dyn EventHandler>,
    owner: Option<OwnerRef>,
    processing: AtomicUsize,
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
}

/// Consecutive handler failures after which a subscription is flagged
/// degraded (but kept).
pub const DEGRADE_AFTER_FAILURES: u32 = 3;

impl Subscription {
    fn new(
        id: SubscriptionId,
        event: String,
        handler: Arc<dyn EventHandler>,
        owner: Option<OwnerRef>,
        options: &SubscribeOptions,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            event,
            created_at,
            max_concurrent: options.max_concurrent.max(1),
            queue_enabled: options.enable_queue,
            queue_size: options.queue_size.max(1),
            replay_enabled: options.enable_replay,
            system: options.system.clone(),
            handler,
            owner,
            processing: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn handler(&self) -> Arc<dyn EventHandler> {
        Arc::clone(&self.handler)
    }

    /// Valid while the owner (if any) is still alive.
    pub fn is_valid(&self) -> bool {
        match &self.owner {
            Some(owner) => owner.upgrade().is_some(),
            None => true,
        }
    }

    fn owned_by(&self, owner: &Arc<dyn Any + Send + Sync>) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|weak| Weak::ptr_eq(weak, &Arc::downgrade(owner)))
    }

    /// Claims an invocation slot if fewer than `max_concurrent` are in
    /// flight.
    pub fn try_begin(&self) -> bool {
        let mut current = self.processing.load(Ordering::Acquire);
        loop {
            if current >= self.max_concurrent {
                return false;
            }
            match self.processing.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn finish(&self) {
        self.processing.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn in_flight(&self) -> usize {
        self.processing.load(Ordering::Acquire)
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.degraded.store(false, Ordering::Release);
    }

    /// Returns the new consecutive-failure count; flips the degraded flag at
    /// the threshold.
    pub fn record_failure(&self) -> u32 {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= DEGRADE_AFTER_FAILURES {
            self.degraded.store(true, Ordering::Release);
        }
        failures
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event", &self.event)
            .field("system", &self.system)
            .field("max_concurrent", &self.max_concurrent)
            .field("queue_enabled", &self.queue_enabled)
            .field("replay_enabled", &self.replay_enabled)
            .field("in_flight", &self.in_flight())
            .field("degraded", &self.is_degraded())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    by_event: HashMap<String, Vec<Arc<Subscription>>>,
    index: HashMap<SubscriptionId, String>,
}

/// Maps event names to ordered subscription lists.
///
/// Iteration follows registration order; dispatch relies on that for the
/// per-name delivery-order guarantee.
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryState>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SubscriptionRegistry")
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryState::default()),
        }
    }

    /// Registers a subscription under a fresh id.
    pub async fn subscribe(
        &self,
        event: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        owner: Option<Arc<dyn Any + Send + Sync>>,
        options: &SubscribeOptions,
        now: DateTime<Utc>,
    ) -> Arc<Subscription> {
        self.subscribe_with_id(SubscriptionId::new(), event, handler, owner, options, now)
            .await
    }

    /// Registers under a caller-chosen id. Used when replaying operations
    /// that were cached while dependencies were unresolved, so the id handed
    /// out at cache time stays authoritative.
    pub async fn subscribe_with_id(
        &self,
        id: SubscriptionId,
        event: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        owner: Option<Arc<dyn Any + Send + Sync>>,
        options: &SubscribeOptions,
        now: DateTime<Utc>,
    ) -> Arc<Subscription> {
        let event = event.into();
        let owner = owner.as_ref().map(Arc::downgrade);
        let subscription = Arc::new(Subscription::new(
            id,
            event.clone(),
            handler,
            owner,
            options,
            now,
        ));

        let mut state = self.inner.lock().await;
        state
            .by_event
            .entry(event.clone())
            .or_default()
            .push(Arc::clone(&subscription));
        state.index.insert(id, event);
        subscription
    }

    pub async fn unsubscribe(&self, event: &str, id: SubscriptionId) -> bool {
        let mut state = self.inner.lock().await;
        let Some(list) = state.by_event.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|sub| sub.id != id);
        let removed = list.len() < before;
        if list.is_empty() {
            state.by_event.remove(event);
        }
        if removed {
            state.index.remove(&id);
        }
        removed
    }

    /// Removes every subscription whose owner is `owner`; returns their ids
    /// so the caller can drop queues and replay rings.
    pub async fn unsubscribe_all(&self, owner: &Arc<dyn Any + Send + Sync>) -> Vec<SubscriptionId> {
        let mut state = self.inner.lock().await;
        let mut removed = Vec::new();
        state.by_event.retain(|_, list| {
            list.retain(|sub| {
                if sub.owned_by(owner) {
                    removed.push(sub.id);
                    false
                } else {
                    true
                }
            });
            !list.is_empty()
        });
        for id in &removed {
            state.index.remove(id);
        }
        removed
    }

    /// Prunes subscriptions whose owners have been collected.
    pub async fn cleanup_invalid(&self) -> Vec<SubscriptionId> {
        let mut state = self.inner.lock().await;
        let mut removed = Vec::new();
        state.by_event.retain(|_, list| {
            list.retain(|sub| {
                if sub.is_valid() {
                    true
                } else {
                    removed.push(sub.id);
                    false
                }
            });
            !list.is_empty()
        });
        for id in &removed {
            state.index.remove(id);
        }
        removed
    }

    pub async fn find_by_id(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        let state = self.inner.lock().await;
        let event = state.index.get(&id)?;
        state
            .by_event
            .get(event)?
            .iter()
            .find(|sub| sub.id == id)
            .cloned()
    }

    /// Snapshot of the ordered subscriber list for one event name.
    pub async fn subscribers_of(&self, event: &str) -> Vec<Arc<Subscription>> {
        let state = self.inner.lock().await;
        state.by_event.get(event).cloned().unwrap_or_default()
    }

    /// Every live subscription across all event names.
    pub async fn all(&self) -> Vec<Arc<Subscription>> {
        let state = self.inner.lock().await;
        state.by_event.values().flatten().cloned().collect()
    }

    /// Distinct host systems subscribed to `event` (valid subscriptions
    /// only); these become the publish's target set for health routing.
    pub async fn systems_for(&self, event: &str) -> Vec<String> {
        let state = self.inner.lock().await;
        let mut systems = Vec::new();
        if let Some(list) = state.by_event.get(event) {
            for sub in list {
                if !sub.is_valid() {
                    continue;
                }
                if let Some(system) = &sub.system {
                    if !systems.contains(system) {
                        systems.push(system.clone());
                    }
                }
            }
        }
        systems
    }

    pub async fn subscription_count(&self) -> usize {
        let state = self.inner.lock().await;
        state.index.len()
    }

    pub async fn event_names(&self) -> Vec<String> {
        let state = self.inner.lock().await;
        state.by_event.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> Arc<dyn EventHandler> {
        handler_fn(|_event| async { Ok(()) })
    }

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(0, 0).unwrap()
    }

    #[tokio::test]
    async fn subscribers_keep_registration_order() {
        let registry = SubscriptionRegistry::new();
        let first = registry
            .subscribe("tick", noop_handler(), None, &SubscribeOptions::default(), epoch())
            .await;
        let second = registry
            .subscribe("tick", noop_handler(), None, &SubscribeOptions::default(), epoch())
            .await;

        let subs = registry.subscribers_of("tick").await;
        assert_eq!(
            subs.iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![first.id, second.id]
        );
    }

    #[tokio::test]
    async fn dropping_the_owner_invalidates_the_subscription() {
        let registry = SubscriptionRegistry::new();
        let owner: Arc<dyn Any + Send + Sync> = Arc::new("holder".to_string());
        let sub = registry
            .subscribe(
                "tick",
                noop_handler(),
                Some(Arc::clone(&owner)),
                &SubscribeOptions::default(),
                epoch(),
            )
            .await;

        assert!(sub.is_valid());
        drop(owner);
        assert!(!sub.is_valid());

        let removed = registry.cleanup_invalid().await;
        assert_eq!(removed, vec![sub.id]);
        assert!(registry.subscribers_of("tick").await.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_all_removes_only_that_owner() {
        let registry = SubscriptionRegistry::new();
        let owner_a: Arc<dyn Any + Send + Sync> = Arc::new(1u32);
        let owner_b: Arc<dyn Any + Send + Sync> = Arc::new(2u32);
        registry
            .subscribe(
                "tick",
                noop_handler(),
                Some(Arc::clone(&owner_a)),
                &SubscribeOptions::default(),
                epoch(),
            )
            .await;
        let keep = registry
            .subscribe(
                "tick",
                noop_handler(),
                Some(Arc::clone(&owner_b)),
                &SubscribeOptions::default(),
                epoch(),
            )
            .await;

        let removed = registry.unsubscribe_all(&owner_a).await;
        assert_eq!(removed.len(), 1);

        let remaining = registry.subscribers_of("tick").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, keep.id);
    }

    #[tokio::test]
    async fn concurrency_slots_are_bounded() {
        let registry = SubscriptionRegistry::new();
        let options = SubscribeOptions {
            max_concurrent: 2,
            ..Default::default()
        };
        let sub = registry
            .subscribe("tick", noop_handler(), None, &options, epoch())
            .await;

        assert!(sub.try_begin());
        assert!(sub.try_begin());
        assert!(!sub.try_begin());
        sub.finish();
        assert!(sub.try_begin());
    }

    #[tokio::test]
    async fn three_consecutive_failures_degrade() {
        let registry = SubscriptionRegistry::new();
        let sub = registry
            .subscribe("tick", noop_handler(), None, &SubscribeOptions::default(), epoch())
            .await;

        sub.record_failure();
        sub.record_failure();
        assert!(!sub.is_degraded());
        sub.record_failure();
        assert!(sub.is_degraded());

        sub.record_success();
        assert!(!sub.is_degraded());
    }
}
