use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use goatbus_contracts::collaborator::{DiscoveryStrategy, HostCollaborator};
use goatbus_contracts::type_oracle::TypeOracle;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::backpressure::{
    BackpressureController, PressureSample, ThrottleCallback, ThrottleChange,
};
use crate::batch::{self, BatchProcessor, ReadyBatch};
use crate::clock::{BusClock, SystemClock};
use crate::config::BusConfig;
use crate::event::{DispatchStamp, Event, EventPriority, Payload};
use crate::gate::{DependencyGate, PendingOperation};
use crate::health::{HealthRouter, SystemHealth};
use crate::queue::{DropPolicy, QueueManager};
use crate::replay::{ReplaySessionId, ReplayStatus, ReplayStore};
use crate::schema::{SchemaDef, SchemaRegistry, ValidationReport};
use crate::signals::{BusSignal, SignalHub};
use crate::subscription::{
    DEGRADE_AFTER_FAILURES, EventHandler, SubscribeOptions, Subscription, SubscriptionId,
    SubscriptionRegistry,
};
use crate::throughput::ThroughputMonitor;
use crate::window::{Aggregation, TimeWindowEngine};

/// Replay speed used by `subscribe_with_backlog`.
const BACKLOG_REPLAY_SPEED: f64 = 10.0;

/// Per-publish delivery accounting.
#[derive(Clone, Copy, Debug, Default)]
struct DeliveryOutcome {
    delivered: usize,
    queued: usize,
    failed: usize,
}

enum DeliveryResult {
    Invoked { success: bool },
    Queued,
    Dropped,
    Skipped,
}

/// Result of one queue-draining pass.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct DrainReport {
    pub processed: usize,
    pub failed: usize,
    pub subscribers_processed: usize,
}

#[derive(Debug, Default)]
struct DispatchCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    queued: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    deferred: AtomicU64,
    schema_rejections: AtomicU64,
}

impl DispatchCounters {
    fn snapshot(&self) -> Value {
        json!({
            "published": self.published.load(Ordering::Relaxed),
            "delivered": self.delivered.load(Ordering::Relaxed),
            "queued": self.queued.load(Ordering::Relaxed),
            "failed": self.failed.load(Ordering::Relaxed),
            "dropped_backpressure": self.dropped.load(Ordering::Relaxed),
            "deferred": self.deferred.load(Ordering::Relaxed),
            "schema_rejections": self.schema_rejections.load(Ordering::Relaxed),
        })
    }
}

struct DeferredRing {
    ring: VecDeque<Event>,
    capacity: usize,
    dropped: u64,
}

impl DeferredRing {
    fn push(&mut self, event: Event) {
        if self.ring.len() >= self.capacity {
            self.ring.pop_front();
            self.dropped += 1;
        }
        self.ring.push_back(event);
    }

    fn take(&mut self, max: usize) -> Vec<Event> {
        let take = max.min(self.ring.len());
        self.ring.drain(..take).collect()
    }
}

/// Helper for constructing a bus with explicit dependencies.
pub struct EventBusBuilder {
    config: BusConfig,
    clock: Arc<dyn BusClock>,
    oracle: Option<Arc<dyn TypeOracle>>,
    strategies: Vec<Arc<dyn DiscoveryStrategy>>,
    required: Vec<String>,
    optional: Vec<String>,
    signal_capacity: usize,
}

impl fmt::Debug for EventBusBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBusBuilder")
            .field("required", &self.required)
            .field("optional", &self.optional)
            .field("strategies", &self.strategies.len())
            .field("signal_capacity", &self.signal_capacity)
            .finish()
    }
}

impl Default for EventBusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self {
            config: BusConfig::default(),
            clock: Arc::new(SystemClock),
            oracle: None,
            strategies: Vec::new(),
            required: Vec::new(),
            optional: Vec::new(),
            signal_capacity: 256,
        }
    }

    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn BusClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_type_oracle(mut self, oracle: Arc<dyn TypeOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_discovery_strategy(mut self, strategy: Arc<dyn DiscoveryStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Declares a collaborator that must be bound before the bus accepts
    /// operations directly; until then they are cached and replayed.
    pub fn require_dependency(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    pub fn optional_dependency(mut self, name: impl Into<String>) -> Self {
        self.optional.push(name.into());
        self
    }

    pub fn signal_capacity(mut self, capacity: usize) -> Self {
        self.signal_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> EventBus {
        let signals = SignalHub::new(self.signal_capacity);
        let sender = signals.sender();
        let throttle_observer: ThrottleCallback = Arc::new(move |change: &ThrottleChange| {
            let _ = sender.send(BusSignal::ThrottleAdjusted {
                pressure: change.pressure,
                previous: change.previous,
                current: change.current,
                actions: change.actions.clone(),
                timestamp: change.timestamp,
            });
        });

        let backpressure = BackpressureController::with_callbacks(
            &self.config.backpressure,
            vec![throttle_observer],
        );

        EventBus {
            registry: SubscriptionRegistry::new(),
            schemas: SchemaRegistry::new(self.oracle),
            queues: QueueManager::new(
                self.config.queues.backlog_capacity,
                self.config.queues.drop_policy,
                self.config.queues.backpressure_threshold,
            ),
            replay: ReplayStore::new(self.config.replay.global_buffer_capacity),
            windows: TimeWindowEngine::new(self.config.windows.default_max_events),
            backpressure,
            monitor: ThroughputMonitor::new(self.config.monitor.latency_sample_capacity),
            health: HealthRouter::new(self.config.health),
            batches: BatchProcessor::new(&self.config.batching),
            gate: DependencyGate::new(
                self.required,
                self.optional,
                self.strategies,
                self.config.maintenance.dependency_retry_budget,
            ),
            deferred: Mutex::new(DeferredRing {
                ring: VecDeque::new(),
                capacity: self.config.backpressure.deferred_capacity.max(1),
                dropped: 0,
            }),
            memory_pressure: Mutex::new(None),
            counters: DispatchCounters::default(),
            signals,
            clock: self.clock,
            config: RwLock::new(self.config),
        }
    }
}

/// The dispatch pipeline: publish entry point composing schema validation,
/// flow control, replay capture, windowing, batching, health routing, and
/// delivery.
pub struct EventBus {
    config: RwLock<BusConfig>,
    clock: Arc<dyn BusClock>,
    registry: SubscriptionRegistry,
    schemas: SchemaRegistry,
    queues: QueueManager,
    replay: ReplayStore,
    windows: TimeWindowEngine,
    backpressure: BackpressureController,
    monitor: ThroughputMonitor,
    health: HealthRouter,
    batches: BatchProcessor,
    gate: DependencyGate,
    deferred: Mutex<DeferredRing>,
    memory_pressure: Mutex<Option<f64>>,
    counters: DispatchCounters,
    signals: SignalHub,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("signals", &self.signals)
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EventBus {
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    /// Observer stream for bus signals.
    pub fn signals(&self) -> broadcast::Receiver<BusSignal> {
        self.signals.subscribe()
    }

    // ---------------------------------------------------------------- publish

    /// Publishes at NORMAL priority. Returns true iff no delivery failed;
    /// drops and schema rejections return false, deferrals return true.
    pub async fn publish(&self, name: impl Into<String>, payload: Payload) -> bool {
        self.publish_with(name, payload, EventPriority::Normal).await
    }

    pub async fn publish_with(
        &self,
        name: impl Into<String>,
        payload: Payload,
        priority: EventPriority,
    ) -> bool {
        let name = name.into();
        if !self.gate.is_ready().await {
            self.gate
                .cache(PendingOperation::Publish {
                    name,
                    payload,
                    priority,
                })
                .await;
            return true;
        }
        self.publish_ready(name, payload, priority).await
    }

    async fn publish_ready(
        &self,
        name: String,
        payload: Payload,
        priority: EventPriority,
    ) -> bool {
        let config = self.config.read().await.clone();
        let now = self.clock.now();

        if config.features.backpressure_control {
            let sample = PressureSample {
                queue_utilization: Some(self.queues.utilization().await),
                processing_rate: Some(
                    self.monitor.recent_events_per_second().await
                        / config.backpressure.max_events_per_second.max(1.0),
                ),
                memory_pressure: *self.memory_pressure.lock().await,
                frame_budget_used: self
                    .monitor
                    .last_frame_ms()
                    .await
                    .map(|ms| ms / config.monitor.frame_budget_ms),
            };
            self.backpressure.update_metrics(sample, now).await;

            if self.backpressure.should_drop(priority).await {
                warn!(event = %name, priority = %priority, "dropping event under backpressure");
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            if self.backpressure.should_defer(&name).await {
                debug!(event = %name, "deferring non-critical event");
                self.counters.deferred.fetch_add(1, Ordering::Relaxed);
                let event = Event::new(name, payload, priority, now);
                self.deferred.lock().await.push(event);
                return true;
            }
        }

        if config.features.frame_monitoring {
            self.monitor.start_frame().await;
        }

        let has_schema = self.schemas.contains(&name);
        let exempt = config.schema.exempt_events.contains(&name);
        if config.features.validate_payloads && has_schema {
            let report = self.schemas.validate(&name, &payload);
            if !report.valid {
                warn!(event = %name, errors = ?report.errors, "rejecting event that failed schema validation");
                self.counters.schema_rejections.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        if config.schema.enforce_registration && !has_schema && !exempt {
            warn!(event = %name, "rejecting unregistered event under schema enforcement");
            self.counters.schema_rejections.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if config.schema.warn_unregistered && !has_schema && !exempt {
            warn!(event = %name, "publishing event with no registered schema");
        }

        let mut event = Event::new(name.clone(), payload, priority, now);
        self.replay.record(&event).await;
        self.windows.ingest(&event, now).await;
        self.queues.append_backlog(event.clone()).await;

        let targets = self.registry.systems_for(&name).await;
        let (adjusted, adjustment) = self.health.adjust_priority(priority, &targets);
        event.priority = adjusted;

        let category = batch::integration_category(&name);
        event.stamp(&DispatchStamp {
            event_name: name.clone(),
            timestamp: now,
            priority: adjusted,
            source: config.source_tag.clone(),
            target_systems: targets,
            health_adjusted: adjustment != 0,
            integration_event: category.is_some(),
        });

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        self.signals.emit(BusSignal::EventPublished {
            name: name.clone(),
            priority: adjusted,
            timestamp: now,
        });

        if config.features.orchestration_batching {
            if let Some(category) = category {
                if let Some(ready) = self.batches.push_integration(category, event, now).await {
                    self.process_batch(ready, &config).await;
                }
                self.close_frame(&config).await;
                return true;
            }
            if batch::is_orchestration_event(&name) {
                if let Some(phase) = batch::phase_key(&event) {
                    if let Some(ready) = self.batches.push_phase(phase, event, now).await {
                        self.process_batch(ready, &config).await;
                    }
                    self.close_frame(&config).await;
                    return true;
                }
            }
        }

        let outcome = self.deliver(&event, adjustment).await;
        self.close_frame(&config).await;
        outcome.failed == 0
    }

    async fn close_frame(&self, config: &BusConfig) {
        if !config.features.frame_monitoring {
            return;
        }
        let frame_ms = self.monitor.end_frame().await;
        if frame_ms > config.monitor.frame_budget_ms {
            warn!(frame_ms, budget_ms = config.monitor.frame_budget_ms, "frame budget exceeded");
            self.signals.emit(BusSignal::FrameBudgetExceeded {
                frame_ms,
                budget_ms: config.monitor.frame_budget_ms,
            });
        }
    }

    // --------------------------------------------------------------- delivery

    /// Delivers one event to its subscribers in registration order.
    async fn deliver(&self, event: &Event, adjustment: i32) -> DeliveryOutcome {
        let subscribers = self.registry.subscribers_of(&event.name).await;
        let mut outcome = DeliveryOutcome::default();
        for subscription in subscribers {
            match self
                .deliver_to(&subscription, event.clone(), adjustment)
                .await
            {
                DeliveryResult::Invoked { success: true } => outcome.delivered += 1,
                DeliveryResult::Invoked { success: false } => outcome.failed += 1,
                DeliveryResult::Queued => outcome.queued += 1,
                DeliveryResult::Dropped => outcome.failed += 1,
                DeliveryResult::Skipped => {}
            }
        }
        outcome
    }

    /// Single-subscriber delivery: invoke when a concurrency slot is free,
    /// fall back to the persistent queue, drop otherwise.
    async fn deliver_to(
        &self,
        subscription: &Arc<Subscription>,
        event: Event,
        adjustment: i32,
    ) -> DeliveryResult {
        if !subscription.is_valid() {
            debug!(subscription = %subscription.id, "skipping invalid subscription");
            return DeliveryResult::Skipped;
        }
        if let Some(system) = &subscription.system {
            if !self.health.should_route(system, adjustment) {
                debug!(subscription = %subscription.id, system = %system, "health router filtered delivery");
                return DeliveryResult::Skipped;
            }
        }

        if subscription.try_begin() {
            let name = event.name.clone();
            let started = Instant::now();
            let result = subscription.handler().handle(event).await;
            subscription.finish();
            self.monitor
                .record_latency(&name, started.elapsed().as_secs_f64() * 1_000_000.0)
                .await;

            return match result {
                Ok(()) => {
                    subscription.record_success();
                    self.monitor.record_event(&name).await;
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    DeliveryResult::Invoked { success: true }
                }
                Err(error) => {
                    self.monitor.record_failure().await;
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    let failures = subscription.record_failure();
                    if failures == DEGRADE_AFTER_FAILURES {
                        warn!(
                            subscription = %subscription.id,
                            event = %name,
                            "subscription degraded after repeated handler failures"
                        );
                    } else {
                        warn!(subscription = %subscription.id, event = %name, error = %error, "handler failed");
                    }
                    DeliveryResult::Invoked { success: false }
                }
            };
        }

        if subscription.queue_enabled {
            let name = event.name.clone();
            let now = self.clock.now();
            return match self.queues.enqueue(subscription.id, event, now).await {
                Some(enqueue) if enqueue.accepted() => {
                    if enqueue.dropped_existing() {
                        self.signals.emit(BusSignal::SubscriberQueueOverflow {
                            subscription_id: subscription.id,
                            event: name,
                            dropped: 1,
                        });
                    }
                    self.counters.queued.fetch_add(1, Ordering::Relaxed);
                    DeliveryResult::Queued
                }
                Some(_) => {
                    self.signals.emit(BusSignal::SubscriberQueueOverflow {
                        subscription_id: subscription.id,
                        event: name,
                        dropped: 1,
                    });
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    DeliveryResult::Dropped
                }
                None => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    DeliveryResult::Dropped
                }
            };
        }

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        DeliveryResult::Dropped
    }

    /// Processes one flushed batch, cooperatively yielding between chunks
    /// when high-throughput mode is on and the batch is large.
    async fn process_batch(&self, ready: ReadyBatch, config: &BusConfig) {
        let started = Instant::now();
        let yield_threshold = self.batches.yield_threshold().await;
        let cooperative =
            config.features.high_throughput_mode && ready.events.len() > yield_threshold;

        let mut processed = 0;
        let mut failed = 0;
        let total = ready.events.len();
        for (index, event) in ready.events.into_iter().enumerate() {
            let outcome = self.deliver(&event, 0).await;
            processed += outcome.delivered + outcome.queued;
            failed += outcome.failed;
            if cooperative && index + 1 < total && (index + 1) % yield_threshold == 0 {
                tokio::task::yield_now().await;
            }
        }

        let duration_ms = started.elapsed().as_secs_f64() * 1_000.0;
        if let Some(category) = ready.category {
            self.signals.emit(BusSignal::IntegrationEventProcessed {
                category,
                batch_size: total,
            });
        }
        self.signals.emit(BusSignal::BatchProcessingCompleted {
            key: ready.key,
            processed,
            failed,
            duration_ms,
        });
    }

    /// Forces both batch maps empty, delivering everything.
    pub async fn force_process_all_batches(&self) {
        let config = self.config.read().await.clone();
        let now = self.clock.now();
        for ready in self.batches.drain_all(now).await {
            self.process_batch(ready, &config).await;
        }
    }

    // ----------------------------------------------------------- subscription

    pub async fn subscribe(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        self.subscribe_inner(name.into(), handler, None, options).await
    }

    pub async fn subscribe_owned(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        owner: Arc<dyn Any + Send + Sync>,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        self.subscribe_inner(name.into(), handler, Some(owner), options)
            .await
    }

    async fn subscribe_inner(
        &self,
        name: String,
        handler: Arc<dyn EventHandler>,
        owner: Option<Arc<dyn Any + Send + Sync>>,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        if !self.gate.is_ready().await {
            self.gate
                .cache(PendingOperation::Subscribe {
                    id,
                    name,
                    handler,
                    owner,
                    options,
                })
                .await;
            return id;
        }
        self.register_subscription(id, name, handler, owner, &options)
            .await;
        id
    }

    /// Queue and replay-ring creation is atomic with registration: both
    /// exist before the id is handed back.
    async fn register_subscription(
        &self,
        id: SubscriptionId,
        name: String,
        handler: Arc<dyn EventHandler>,
        owner: Option<Arc<dyn Any + Send + Sync>>,
        options: &SubscribeOptions,
    ) {
        let now = self.clock.now();
        let subscription = self
            .registry
            .subscribe_with_id(id, name, handler, owner, options, now)
            .await;
        if subscription.queue_enabled {
            self.queues.create_queue(id, subscription.queue_size).await;
        }
        if subscription.replay_enabled {
            self.replay.create_ring(id, subscription.queue_size).await;
        }
    }

    /// Subscribe, then replay the backlog from `from` at 10× speed into the
    /// new subscription.
    pub async fn subscribe_with_backlog(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        owner: Option<Arc<dyn Any + Send + Sync>>,
        from: DateTime<Utc>,
    ) -> SubscriptionId {
        let name = name.into();
        let id = self
            .subscribe_inner(name.clone(), handler, owner, SubscribeOptions::default())
            .await;
        let now = self.clock.now();
        let filters: HashSet<String> = [name].into_iter().collect();
        self.replay
            .start_session(id, from, now, &filters, BACKLOG_REPLAY_SPEED, now)
            .await;
        id
    }

    pub async fn unsubscribe(&self, name: &str, id: SubscriptionId) -> bool {
        let removed = self.registry.unsubscribe(name, id).await;
        if removed {
            self.queues.remove_queue(id).await;
            self.replay.drop_ring(id).await;
        }
        removed
    }

    pub async fn unsubscribe_all(&self, owner: &Arc<dyn Any + Send + Sync>) -> usize {
        let removed = self.registry.unsubscribe_all(owner).await;
        for id in &removed {
            self.queues.remove_queue(*id).await;
            self.replay.drop_ring(*id).await;
        }
        removed.len()
    }

    pub async fn find_subscription(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.registry.find_by_id(id).await
    }

    // ----------------------------------------------------------------- schema

    pub fn register_schema(&self, name: impl Into<String>, def: SchemaDef) {
        self.schemas.register(name, def);
    }

    pub fn register_bulk_schemas(&self, defs: HashMap<String, SchemaDef>) {
        self.schemas.register_bulk(defs);
    }

    pub fn validate_payload(&self, name: &str, payload: &Payload) -> ValidationReport {
        self.schemas.validate(name, payload)
    }

    // ---------------------------------------------------------------- windows

    pub async fn create_time_window(
        &self,
        id: impl Into<String>,
        duration_secs: f64,
        slide_secs: f64,
        filters: Vec<String>,
        aggregations: Vec<Aggregation>,
    ) -> bool {
        let now = self.clock.now();
        self.windows
            .create(
                id,
                duration_secs,
                slide_secs,
                filters.into_iter().collect(),
                aggregations,
                now,
            )
            .await
    }

    pub async fn remove_time_window(&self, id: &str) -> bool {
        self.windows.remove(id).await
    }

    pub async fn get_window_aggregation(&self, id: &str) -> Option<HashMap<String, Value>> {
        self.windows.aggregation(id).await
    }

    pub async fn get_events_in_time_window(&self, id: &str) -> Option<Vec<Event>> {
        self.windows.events(id).await
    }

    // ----------------------------------------------------------------- replay

    pub async fn get_events_between_timestamps(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filters: Vec<String>,
    ) -> Vec<Event> {
        self.replay
            .range(start, end, &filters.into_iter().collect())
            .await
    }

    pub async fn get_events_from_last_seconds(
        &self,
        seconds: f64,
        filters: Vec<String>,
    ) -> Vec<Event> {
        let now = self.clock.now();
        let start = now - crate::clock::secs_f64(seconds);
        self.replay
            .range(start, now, &filters.into_iter().collect())
            .await
    }

    /// Starts a controlled replay of matching backlog events into one
    /// subscription. `end` defaults to now.
    pub async fn start_event_replay(
        &self,
        subscription_id: SubscriptionId,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        filters: Vec<String>,
        speed: f64,
    ) -> ReplaySessionId {
        let now = self.clock.now();
        self.replay
            .start_session(
                subscription_id,
                start,
                end.unwrap_or(now),
                &filters.into_iter().collect(),
                speed,
                now,
            )
            .await
    }

    pub async fn pause_replay(&self, id: ReplaySessionId) -> bool {
        self.replay.pause(id).await
    }

    pub async fn resume_replay(&self, id: ReplaySessionId) -> bool {
        self.replay.resume(id).await
    }

    pub async fn stop_replay(&self, id: ReplaySessionId) -> bool {
        self.replay.stop(id).await
    }

    pub async fn get_replay_status(&self, id: ReplaySessionId) -> Option<ReplayStatus> {
        self.replay.status(id).await
    }

    // ------------------------------------------------------------------ flow

    pub async fn enable_backpressure_control(&self, enabled: bool) {
        self.config.write().await.features.backpressure_control = enabled;
        self.backpressure.set_enabled(enabled).await;
    }

    pub async fn set_backpressure_threshold(&self, metric: &str, value: f64) -> bool {
        let applied = self.backpressure.set_threshold(metric, value).await;
        if applied {
            let mut config = self.config.write().await;
            match metric {
                "queue_utilization" => config.backpressure.thresholds.queue_utilization = value,
                "processing_rate" => config.backpressure.thresholds.processing_rate = value,
                "memory_pressure" => config.backpressure.thresholds.memory_pressure = value,
                "frame_budget" => config.backpressure.thresholds.frame_budget = value,
                _ => {}
            }
        }
        applied
    }

    pub async fn get_backpressure_status(&self) -> Value {
        self.backpressure.status().await
    }

    /// Publisher-side pacing hint. Hosts that can slow their producers ask
    /// this before publishing; unlike `DROP_LOW_PRIORITY`, every priority
    /// band is eligible, scaled by `1/max(priority, 1)`.
    pub async fn should_throttle_publisher(&self, priority: EventPriority) -> bool {
        self.backpressure.should_throttle_publisher(priority).await
    }

    /// Host-reported memory pressure sample, folded into the next metrics
    /// update. `None` removes the metric from pressure evaluation.
    pub async fn set_memory_pressure(&self, value: Option<f64>) {
        *self.memory_pressure.lock().await = value;
    }

    pub async fn set_queue_drop_policy(&self, policy: DropPolicy) {
        self.config.write().await.queues.drop_policy = policy;
        self.queues.set_policy(policy).await;
    }

    pub async fn update_system_health(&self, system: &str, health: SystemHealth) {
        if let Some(change) = self.health.update(system, health) {
            info!(system = %change.system, routed = change.routed, score = change.score, "health routing updated");
            self.signals.emit(BusSignal::SystemHealthRoutingUpdated {
                system: change.system,
                routed: change.routed,
                score: change.score,
            });
        }
    }

    pub fn route_recommendation(
        &self,
        event: &str,
        systems: &[String],
    ) -> crate::health::RouteRecommendation {
        self.health.recommend(event, systems)
    }

    // ----------------------------------------------------------------- queues

    /// Drains per-subscriber queues, at most `max_per_subscriber` events
    /// each. Events a saturated subscriber cannot take go back to the head
    /// of its queue.
    pub async fn process_queued_events(&self, max_per_subscriber: usize) -> DrainReport {
        let mut report = DrainReport::default();
        for id in self.queues.queued_subscriber_ids().await {
            let Some(subscription) = self.registry.find_by_id(id).await else {
                continue;
            };
            if !subscription.is_valid() {
                continue;
            }

            let mut touched = false;
            for _ in 0..max_per_subscriber.max(1) {
                let Some(event) = self.queues.dequeue(id).await else {
                    break;
                };
                if !subscription.try_begin() {
                    self.queues.requeue_front(id, event).await;
                    break;
                }
                touched = true;
                let name = event.name.clone();
                let result = subscription.handler().handle(event).await;
                subscription.finish();
                match result {
                    Ok(()) => {
                        subscription.record_success();
                        self.monitor.record_event(&name).await;
                        report.processed += 1;
                    }
                    Err(error) => {
                        warn!(subscription = %id, event = %name, error = %error, "queued delivery failed");
                        self.monitor.record_failure().await;
                        subscription.record_failure();
                        report.failed += 1;
                    }
                }
            }
            if touched {
                report.subscribers_processed += 1;
            }
            tokio::task::yield_now().await;
        }
        report
    }

    // ------------------------------------------------------------ maintenance

    /// One maintenance pass: prune invalid subscriptions, retry collaborator
    /// discovery, re-deliver deferred events (unless an emergency flush is
    /// pending), drop orphaned queues, advance and reap replay sessions,
    /// flush aged batches, and drain subscriber queues.
    pub async fn perform_maintenance(&self) -> Value {
        let config = self.config.read().await.clone();
        let now = self.clock.now();

        let removed = self.registry.cleanup_invalid().await;
        for id in &removed {
            self.queues.remove_queue(*id).await;
            self.replay.drop_ring(*id).await;
        }

        self.gate.evict_dead().await;
        let (exhausted, became_ready) = self.gate.attempt_discovery().await;
        for (name, attempts) in exhausted {
            warn!(collaborator = %name, attempts, "collaborator discovery exhausted retry budget");
            self.signals
                .emit(BusSignal::DependencyConnectionFailed { name, attempts });
        }
        if became_ready {
            self.on_dependencies_resolved().await;
        }
        tokio::task::yield_now().await;

        let mut deferred_delivered = 0;
        if !self.backpressure.needs_emergency_flush().await {
            let batch = {
                let mut deferred = self.deferred.lock().await;
                deferred.take(config.maintenance.deferred_batch)
            };
            for event in batch {
                let outcome = self.deliver(&event, 0).await;
                deferred_delivered += outcome.delivered + outcome.queued;
            }
        }
        tokio::task::yield_now().await;

        let live: HashSet<SubscriptionId> =
            self.registry.all().await.iter().map(|sub| sub.id).collect();
        let orphans = self.queues.drop_orphans(&live).await;

        let mut replay_delivered = 0;
        for (target, event) in self.replay.take_due(now).await {
            if let Some(subscription) = self.registry.find_by_id(target).await {
                if matches!(
                    self.deliver_to(&subscription, event, 0).await,
                    DeliveryResult::Invoked { success: true } | DeliveryResult::Queued
                ) {
                    replay_delivered += 1;
                }
            }
        }
        let reaped = self
            .replay
            .reap_sessions(now, config.replay.session_max_age_secs)
            .await;

        for ready in self.batches.take_due(now).await {
            self.process_batch(ready, &config).await;
        }
        tokio::task::yield_now().await;

        let drain = self
            .process_queued_events(config.maintenance.drain_max_per_subscriber)
            .await;

        let summary = json!({
            "invalid_subscriptions_removed": removed.len(),
            "orphan_queues_dropped": orphans,
            "deferred_processed": deferred_delivered,
            "replay_sessions_reaped": reaped,
            "replay_events_delivered": replay_delivered,
            "queued_events_processed": drain.processed,
            "queued_events_failed": drain.failed,
        });
        info!(summary = %summary, "maintenance pass complete");
        summary
    }

    // ------------------------------------------------------------ dependencies

    /// Binds a collaborator slot directly, opening the gate if it was the
    /// last required one.
    pub async fn set_dependency(&self, name: &str, instance: Arc<dyn HostCollaborator>) {
        let transition = self.gate.bind(name, instance).await;
        if transition.became_ready {
            self.on_dependencies_resolved().await;
        }
    }

    /// Connects an external system. Cached while dependencies are
    /// unresolved, like publish and subscribe.
    pub async fn connect_external_system(&self, name: &str, instance: Arc<dyn HostCollaborator>) {
        if !self.gate.is_ready().await {
            self.gate
                .cache(PendingOperation::ConnectExternalSystem {
                    name: name.to_string(),
                    instance,
                })
                .await;
            return;
        }
        instance.on_connected();
        let transition = self.gate.bind(name, instance).await;
        if transition.became_ready {
            self.on_dependencies_resolved().await;
        }
    }

    async fn on_dependencies_resolved(&self) {
        let pending = self.gate.drain_pending().await;
        let replayed = pending.len();
        info!(operations = replayed, "dependencies resolved; replaying cached operations");
        for operation in pending {
            match operation {
                PendingOperation::Publish {
                    name,
                    payload,
                    priority,
                } => {
                    self.publish_ready(name, payload, priority).await;
                }
                PendingOperation::Subscribe {
                    id,
                    name,
                    handler,
                    owner,
                    options,
                } => {
                    self.register_subscription(id, name, handler, owner, &options)
                        .await;
                }
                PendingOperation::ConnectExternalSystem { name, instance } => {
                    instance.on_connected();
                    self.gate.bind(&name, instance).await;
                }
            }
        }
        self.signals.emit(BusSignal::DependenciesResolved {
            replayed_operations: replayed,
        });
    }

    // ------------------------------------------------------------------ stats

    pub async fn get_performance_stats(&self) -> Value {
        let throughput = self.monitor.stats().await;
        json!({
            "counters": self.counters.snapshot(),
            "subscriptions": self.registry.subscription_count().await,
            "backlog_depth": self.queues.backlog_len().await,
            "throughput": throughput,
        })
    }

    pub async fn get_enhanced_performance_stats(&self) -> Value {
        let mut stats = self.get_performance_stats().await;
        if let Value::Object(map) = &mut stats {
            {
                let deferred = self.deferred.lock().await;
                map.insert(
                    "deferred".to_string(),
                    json!({
                        "depth": deferred.ring.len(),
                        "dropped": deferred.dropped,
                    }),
                );
            }
            map.insert("backpressure".to_string(), self.backpressure.status().await);
            map.insert("queues".to_string(), self.queues.snapshot().await);
            map.insert("replay".to_string(), self.replay.snapshot().await);
            map.insert("windows".to_string(), self.windows.snapshot().await);
            map.insert("batches".to_string(), self.batches.occupancy().await);
            map.insert("health".to_string(), self.health.snapshot());
            map.insert("dependencies".to_string(), self.gate.status().await);
        }
        stats
    }

    // ------------------------------------------------------------------ config

    pub async fn export_configuration(&self) -> Value {
        let config = self.config.read().await;
        config.export().unwrap_or(Value::Null)
    }

    /// Exports the current policy through a host transport.
    pub async fn save_configuration(
        &self,
        transport: &dyn goatbus_contracts::transport::ConfigTransport,
    ) -> bool {
        let snapshot = self.export_configuration().await;
        match transport.store(&snapshot) {
            Ok(()) => true,
            Err(error) => {
                warn!(error = %error, "configuration transport rejected snapshot");
                false
            }
        }
    }

    /// Imports policy from a host transport, if it has a snapshot stored.
    pub async fn load_configuration(
        &self,
        transport: &dyn goatbus_contracts::transport::ConfigTransport,
    ) -> bool {
        match transport.load() {
            Ok(Some(snapshot)) => self.import_configuration(&snapshot).await,
            Ok(None) => false,
            Err(error) => {
                warn!(error = %error, "configuration transport failed to load");
                false
            }
        }
    }

    /// Feeds structured sections of bus internals to a host debug probe.
    pub async fn debug_dump(&self, probe: &dyn goatbus_contracts::debug_probe::DebugProbe) {
        probe.dump("stats", &self.get_enhanced_performance_stats().await);
        probe.dump("config", &self.export_configuration().await);
    }

    /// Restores policy from an exported snapshot. Buffered events, rings,
    /// and sessions are untouched; existing ring capacities keep their
    /// construction-time sizes.
    pub async fn import_configuration(&self, snapshot: &Value) -> bool {
        let Ok(config) = BusConfig::import(snapshot) else {
            warn!("rejecting malformed configuration snapshot");
            return false;
        };

        self.backpressure.apply_tuning(&config.backpressure).await;
        self.backpressure
            .set_enabled(config.features.backpressure_control)
            .await;
        self.queues.set_policy(config.queues.drop_policy).await;
        self.queues
            .set_threshold(config.queues.backpressure_threshold)
            .await;
        self.batches.apply_tuning(&config.batching).await;
        self.health.set_thresholds(config.health);
        *self.config.write().await = config;
        true
    }
}
