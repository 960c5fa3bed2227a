use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::BackpressureTuning;
use crate::event::EventPriority;

/// Load-shedding measures the controller can activate. Tiers are
/// cumulative: higher pressure keeps the lower tiers' actions active.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureAction {
    EmergencyFlush,
    DropLowPriority,
    ThrottlePublishers,
    BatchAggressively,
    DeferNonCritical,
}

/// Per-metric pressure thresholds. Pressure for each metric is
/// `current / threshold`, so a metric at its threshold contributes 1.0.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PressureThresholds {
    pub queue_utilization: f64,
    pub processing_rate: f64,
    pub memory_pressure: f64,
    pub frame_budget: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            queue_utilization: 0.8,
            processing_rate: 0.9,
            memory_pressure: 0.85,
            frame_budget: 0.8,
        }
    }
}

/// One metrics snapshot. Absent metrics simply do not contribute.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct PressureSample {
    pub queue_utilization: Option<f64>,
    pub processing_rate: Option<f64>,
    pub memory_pressure: Option<f64>,
    pub frame_budget_used: Option<f64>,
}

/// Payload delivered to throttle-change observers.
#[derive(Clone, Debug)]
pub struct ThrottleChange {
    pub pressure: f64,
    pub previous: f64,
    pub current: f64,
    pub actions: Vec<BackpressureAction>,
    pub timestamp: DateTime<Utc>,
}

/// Observer invoked when the throttle factor moves by more than 0.1.
pub type ThrottleCallback = Arc<dyn Fn(&ThrottleChange) + Send + Sync>;

struct ControllerState {
    enabled: bool,
    adaptive: bool,
    thresholds: PressureThresholds,
    non_critical: HashSet<String>,
    pressure: f64,
    throttle: f64,
    actions: HashSet<BackpressureAction>,
    last_sample: PressureSample,
    rng: StdRng,
    callbacks: Vec<ThrottleCallback>,
    drops: u64,
    defers: u64,
}

/// Derives a scalar pressure level from metrics and turns it into a
/// throttle factor plus an action set.
pub struct BackpressureController {
    inner: Mutex<ControllerState>,
}

impl fmt::Debug for BackpressureController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BackpressureController")
    }
}

/// Piecewise throttle curve; monotonically non-increasing in pressure.
fn throttle_for(pressure: f64) -> f64 {
    if pressure <= 0.5 {
        1.0
    } else if pressure <= 1.0 {
        1.0 - (pressure - 0.5)
    } else {
        (0.5 - (pressure - 1.0) * 0.4).max(0.1)
    }
}

fn actions_for(pressure: f64) -> HashSet<BackpressureAction> {
    let mut actions = HashSet::new();
    if pressure > 0.6 {
        actions.insert(BackpressureAction::DeferNonCritical);
    }
    if pressure > 0.8 {
        actions.insert(BackpressureAction::ThrottlePublishers);
        actions.insert(BackpressureAction::BatchAggressively);
    }
    if pressure > 0.9 {
        actions.insert(BackpressureAction::EmergencyFlush);
        actions.insert(BackpressureAction::DropLowPriority);
    }
    actions
}

impl BackpressureController {
    pub fn new(tuning: &BackpressureTuning) -> Self {
        Self::with_callbacks(tuning, Vec::new())
    }

    /// Constructor variant taking observers up front, for callers wiring
    /// the controller before any async context exists.
    pub fn with_callbacks(tuning: &BackpressureTuning, callbacks: Vec<ThrottleCallback>) -> Self {
        Self {
            inner: Mutex::new(ControllerState {
                enabled: true,
                adaptive: tuning.adaptive,
                thresholds: tuning.thresholds,
                non_critical: tuning.non_critical_events.clone(),
                pressure: 0.0,
                throttle: 1.0,
                actions: HashSet::new(),
                last_sample: PressureSample::default(),
                rng: StdRng::seed_from_u64(tuning.rng_seed),
                callbacks,
                drops: 0,
                defers: 0,
            }),
        }
    }

    /// Recomputes pressure, throttle, and the action set from a metrics
    /// snapshot. Fires registered callbacks when the throttle moves by more
    /// than 0.1.
    pub async fn update_metrics(&self, sample: PressureSample, now: DateTime<Utc>) {
        let change = {
            let mut state = self.inner.lock().await;
            if !state.enabled {
                return;
            }

            let t = state.thresholds;
            let ratios = [
                sample.queue_utilization.map(|v| v / t.queue_utilization),
                sample.processing_rate.map(|v| v / t.processing_rate),
                sample.memory_pressure.map(|v| v / t.memory_pressure),
                sample.frame_budget_used.map(|v| v / t.frame_budget),
            ];
            let pressure = ratios
                .into_iter()
                .flatten()
                .fold(0.0_f64, f64::max)
                .clamp(0.0, 2.0);

            let previous = state.throttle;
            let throttle = if state.adaptive {
                throttle_for(pressure)
            } else {
                1.0
            };

            state.pressure = pressure;
            state.throttle = throttle;
            state.actions = actions_for(pressure);
            state.last_sample = sample;

            if (throttle - previous).abs() > 0.1 {
                let change = ThrottleChange {
                    pressure,
                    previous,
                    current: throttle,
                    actions: state.actions.iter().copied().collect(),
                    timestamp: now,
                };
                Some((change, state.callbacks.clone()))
            } else {
                None
            }
        };

        if let Some((change, callbacks)) = change {
            for callback in callbacks {
                callback(&change);
            }
        }
    }

    /// Whether this publish should be shed. Only LOW priority is eligible,
    /// and only while DROP_LOW_PRIORITY is active; a uniform sample above
    /// the throttle factor seals the drop.
    pub async fn should_drop(&self, priority: EventPriority) -> bool {
        let mut state = self.inner.lock().await;
        if !state.enabled
            || priority > EventPriority::Low
            || !state.actions.contains(&BackpressureAction::DropLowPriority)
        {
            return false;
        }
        let dropped = state.rng.random::<f64>() > state.throttle;
        if dropped {
            state.drops += 1;
        }
        dropped
    }

    /// Whether this event should move to the deferred ring instead of
    /// dispatching now.
    pub async fn should_defer(&self, event: &str) -> bool {
        let mut state = self.inner.lock().await;
        let defer = state.enabled
            && state.actions.contains(&BackpressureAction::DeferNonCritical)
            && state.non_critical.contains(event);
        if defer {
            state.defers += 1;
        }
        defer
    }

    /// Publisher-side pacing. All priorities are eligible, but acceptance
    /// scales with `throttle · 1/max(priority, 1)` so CRITICAL publishers
    /// are throttled least.
    pub async fn should_throttle_publisher(&self, priority: EventPriority) -> bool {
        let mut state = self.inner.lock().await;
        if !state.enabled
            || !state
                .actions
                .contains(&BackpressureAction::ThrottlePublishers)
        {
            return false;
        }
        let scale = 1.0 / f64::from(priority.as_u8()).max(1.0);
        let sample: f64 = state.rng.random();
        sample > state.throttle * scale
    }

    pub async fn needs_emergency_flush(&self) -> bool {
        let state = self.inner.lock().await;
        state.enabled && state.actions.contains(&BackpressureAction::EmergencyFlush)
    }

    pub async fn register_callback(&self, callback: ThrottleCallback) {
        let mut state = self.inner.lock().await;
        state.callbacks.push(callback);
    }

    pub async fn set_enabled(&self, enabled: bool) {
        let mut state = self.inner.lock().await;
        state.enabled = enabled;
        if !enabled {
            state.pressure = 0.0;
            state.throttle = 1.0;
            state.actions.clear();
        }
    }

    pub async fn set_adaptive(&self, adaptive: bool) {
        let mut state = self.inner.lock().await;
        state.adaptive = adaptive;
    }

    /// Updates one named threshold; returns false for unknown metric names.
    pub async fn set_threshold(&self, metric: &str, value: f64) -> bool {
        let mut state = self.inner.lock().await;
        match metric {
            "queue_utilization" => state.thresholds.queue_utilization = value,
            "processing_rate" => state.thresholds.processing_rate = value,
            "memory_pressure" => state.thresholds.memory_pressure = value,
            "frame_budget" => state.thresholds.frame_budget = value,
            _ => return false,
        }
        true
    }

    pub async fn apply_tuning(&self, tuning: &BackpressureTuning) {
        let mut state = self.inner.lock().await;
        state.thresholds = tuning.thresholds;
        state.adaptive = tuning.adaptive;
        state.non_critical = tuning.non_critical_events.clone();
    }

    pub async fn throttle(&self) -> f64 {
        self.inner.lock().await.throttle
    }

    pub async fn pressure(&self) -> f64 {
        self.inner.lock().await.pressure
    }

    pub async fn status(&self) -> serde_json::Value {
        let state = self.inner.lock().await;
        json!({
            "enabled": state.enabled,
            "adaptive": state.adaptive,
            "pressure": state.pressure,
            "throttle": state.throttle,
            "actions": state.actions.iter().copied().collect::<Vec<_>>(),
            "thresholds": state.thresholds,
            "last_sample": state.last_sample,
            "dropped": state.drops,
            "deferred": state.defers,
        })
    }
}
