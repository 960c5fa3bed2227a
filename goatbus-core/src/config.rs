use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::backpressure::PressureThresholds;
use crate::error::Result;
use crate::queue::DropPolicy;

/// Global knobs that tune bus behaviour.
///
/// All fields carry defaults so hosts can progressively adopt flow-control
/// features without supplying a full configuration payload. The whole tree
/// round-trips through `export` / `import`; only policy travels, never
/// buffered events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Feature switches for the dispatch pipeline.
    pub features: FeatureFlags,
    /// Schema registration and validation policy.
    pub schema: SchemaPolicy,
    /// Backlog and per-subscriber queue sizing and overflow behaviour.
    pub queues: QueueTuning,
    /// Replay ring sizing and session aging.
    pub replay: ReplayTuning,
    /// Time-window defaults.
    pub windows: WindowTuning,
    /// Pressure thresholds, throttle behaviour, and deferral policy.
    pub backpressure: BackpressureTuning,
    /// Batch trigger sizes and cooperative-yield tuning.
    pub batching: BatchTuning,
    /// Health-routing thresholds.
    pub health: HealthTuning,
    /// Frame-budget monitoring.
    pub monitor: MonitorTuning,
    /// Maintenance pass limits.
    pub maintenance: MaintenanceTuning,
    /// Tag stamped into dispatch metadata as the event source.
    pub source_tag: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            features: FeatureFlags::default(),
            schema: SchemaPolicy::default(),
            queues: QueueTuning::default(),
            replay: ReplayTuning::default(),
            windows: WindowTuning::default(),
            backpressure: BackpressureTuning::default(),
            batching: BatchTuning::default(),
            health: HealthTuning::default(),
            monitor: MonitorTuning::default(),
            maintenance: MaintenanceTuning::default(),
            source_tag: "goatbus".to_string(),
        }
    }
}

impl BusConfig {
    /// Serializes the full policy tree.
    pub fn export(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuilds a config from a previously exported tree. Unknown fields are
    /// ignored; missing fields fall back to defaults via serde.
    pub fn import(snapshot: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(snapshot.clone())?)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Validate payloads against registered schemas on publish.
    pub validate_payloads: bool,
    /// Track per-publish frame timing and emit budget warnings.
    pub frame_monitoring: bool,
    /// Feed metrics into the backpressure controller and honour its verdicts.
    pub backpressure_control: bool,
    /// Route integration/orchestration events through the batch processor
    /// instead of immediate dispatch.
    pub orchestration_batching: bool,
    /// Enables cooperative (chunked, yielding) batch processing for large
    /// batches.
    pub high_throughput_mode: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            validate_payloads: true,
            frame_monitoring: true,
            backpressure_control: true,
            orchestration_batching: true,
            high_throughput_mode: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaPolicy {
    /// Reject events published without a registered schema unless exempt.
    pub enforce_registration: bool,
    /// Log a warning for unregistered, non-exempt events.
    pub warn_unregistered: bool,
    /// Event names excused from enforcement and warnings.
    #[serde(default)]
    pub exempt_events: HashSet<String>,
}

impl Default for SchemaPolicy {
    fn default() -> Self {
        Self {
            enforce_registration: false,
            warn_unregistered: true,
            exempt_events: HashSet::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueTuning {
    /// Global backlog ring capacity.
    pub backlog_capacity: usize,
    /// Capacity for per-subscriber queues sized by the bus rather than the
    /// subscriber.
    pub subscriber_queue_capacity: usize,
    /// Overflow policy shared by every queue.
    pub drop_policy: DropPolicy,
    /// Fill fraction at which a queue starts counting backpressure events.
    pub backpressure_threshold: f64,
}

impl Default for QueueTuning {
    fn default() -> Self {
        Self {
            backlog_capacity: 10_000,
            subscriber_queue_capacity: 1_000,
            drop_policy: DropPolicy::DropOldest,
            backpressure_threshold: 0.8,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplayTuning {
    /// Global replay ring capacity.
    pub global_buffer_capacity: usize,
    /// Sessions older than this are reaped by maintenance (seconds).
    pub session_max_age_secs: f64,
}

impl Default for ReplayTuning {
    fn default() -> Self {
        Self {
            global_buffer_capacity: 50_000,
            session_max_age_secs: 3_600.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WindowTuning {
    /// Event cap applied to windows created without an explicit limit.
    pub default_max_events: usize,
}

impl Default for WindowTuning {
    fn default() -> Self {
        Self {
            default_max_events: 1_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackpressureTuning {
    /// Per-metric pressure thresholds.
    pub thresholds: PressureThresholds,
    /// Scale the throttle factor with pressure instead of holding it at 1.0.
    pub adaptive: bool,
    /// Seed for the throttle/drop decision RNG, so load-shedding behaviour
    /// is reproducible.
    pub rng_seed: u64,
    /// Event names eligible for deferral under DEFER_NON_CRITICAL.
    #[serde(default = "default_non_critical_events")]
    pub non_critical_events: HashSet<String>,
    /// Deferred ring capacity; oldest deferred events drop on overflow.
    pub deferred_capacity: usize,
    /// Normalization ceiling for the processing-rate metric.
    pub max_events_per_second: f64,
}

fn default_non_critical_events() -> HashSet<String> {
    [
        "debug_info_updated",
        "metrics_collected",
        "status_report",
        "performance_stats",
        "subscription_stats",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl Default for BackpressureTuning {
    fn default() -> Self {
        Self {
            thresholds: PressureThresholds::default(),
            adaptive: true,
            rng_seed: 0x60A7_B005,
            non_critical_events: default_non_critical_events(),
            deferred_capacity: 500,
            max_events_per_second: 10_000.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchTuning {
    /// Batch size that triggers immediate processing.
    pub max_batch_size: usize,
    /// Age that triggers processing of a partially filled batch (ms).
    pub batch_timeout_ms: u64,
    /// Cooperative mode chunk size; batches beyond this yield between chunks.
    pub yield_threshold: usize,
}

impl Default for BatchTuning {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            batch_timeout_ms: 100,
            yield_threshold: 100,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HealthTuning {
    /// Health score a system must exceed to stay routed.
    pub routing_threshold: f64,
    /// Score below which a system counts as degraded in recommendations.
    pub warning_threshold: f64,
    /// Score below which a system counts as critical.
    pub critical_threshold: f64,
}

impl Default for HealthTuning {
    fn default() -> Self {
        Self {
            routing_threshold: 0.2,
            warning_threshold: 0.5,
            critical_threshold: 0.1,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MonitorTuning {
    /// Per-frame wall-time budget (ms); exceeding it emits a signal.
    pub frame_budget_ms: f64,
    /// Bounded ring size for per-event handler latency samples.
    pub latency_sample_capacity: usize,
}

impl Default for MonitorTuning {
    fn default() -> Self {
        Self {
            frame_budget_ms: 16.0,
            latency_sample_capacity: 1_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MaintenanceTuning {
    /// Deferred events re-dispatched per maintenance pass.
    pub deferred_batch: usize,
    /// Per-subscriber dequeue limit when draining queues.
    pub drain_max_per_subscriber: usize,
    /// Discovery attempts per required collaborator before reporting a
    /// connection failure.
    pub dependency_retry_budget: u32,
}

impl Default for MaintenanceTuning {
    fn default() -> Self {
        Self {
            deferred_batch: 10,
            drain_max_per_subscriber: 5,
            dependency_retry_budget: 5,
        }
    }
}

impl BusConfig {
    pub fn with_source_tag(mut self, tag: impl Into<String>) -> Self {
        self.source_tag = tag.into();
        self
    }
}
