use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Instant;

use serde_json::json;
use tokio::sync::Mutex;

/// Frames retained for the recent frame-time average.
const FRAME_TIME_WINDOW: usize = 60;
/// Frames retained for the recent events-per-frame average.
const EVENTS_PER_FRAME_WINDOW: usize = 10;

#[derive(Default)]
struct LatencyRing {
    samples_us: VecDeque<f64>,
    total_samples: u64,
}

impl LatencyRing {
    fn record(&mut self, micros: f64, cap: usize) {
        if self.samples_us.len() >= cap {
            self.samples_us.pop_front();
        }
        self.samples_us.push_back(micros);
        self.total_samples += 1;
    }

    fn stats(&self) -> (f64, f64, f64) {
        if self.samples_us.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let mut min = f64::INFINITY;
        let mut max = 0.0_f64;
        let mut sum = 0.0;
        for sample in &self.samples_us {
            min = min.min(*sample);
            max = max.max(*sample);
            sum += sample;
        }
        (sum / self.samples_us.len() as f64, min, max)
    }
}

struct MonitorState {
    started: Instant,
    total_events: u64,
    failed_events: u64,
    frame_start: Option<Instant>,
    frame_events: u64,
    last_frame_ms: Option<f64>,
    frame_times_ms: VecDeque<f64>,
    events_per_frame: VecDeque<u64>,
    counts: HashMap<String, u64>,
    latencies: HashMap<String, LatencyRing>,
    sample_cap: usize,
}

/// Tracks per-frame wall time, per-event counters, and handler latencies.
pub struct ThroughputMonitor {
    inner: Mutex<MonitorState>,
}

impl fmt::Debug for ThroughputMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ThroughputMonitor")
    }
}

impl ThroughputMonitor {
    pub fn new(sample_cap: usize) -> Self {
        Self {
            inner: Mutex::new(MonitorState {
                started: Instant::now(),
                total_events: 0,
                failed_events: 0,
                frame_start: None,
                frame_events: 0,
                last_frame_ms: None,
                frame_times_ms: VecDeque::new(),
                events_per_frame: VecDeque::new(),
                counts: HashMap::new(),
                latencies: HashMap::new(),
                sample_cap: sample_cap.max(1),
            }),
        }
    }

    pub async fn start_frame(&self) {
        let mut state = self.inner.lock().await;
        state.frame_start = Some(Instant::now());
        state.frame_events = 0;
    }

    /// Closes the frame and returns its wall time in milliseconds (0.0 when
    /// no frame was open).
    pub async fn end_frame(&self) -> f64 {
        let mut state = self.inner.lock().await;
        let Some(start) = state.frame_start.take() else {
            return 0.0;
        };
        let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;
        state.last_frame_ms = Some(elapsed_ms);
        if state.frame_times_ms.len() >= FRAME_TIME_WINDOW {
            state.frame_times_ms.pop_front();
        }
        state.frame_times_ms.push_back(elapsed_ms);
        if state.events_per_frame.len() >= EVENTS_PER_FRAME_WINDOW {
            state.events_per_frame.pop_front();
        }
        let frame_events = state.frame_events;
        state.events_per_frame.push_back(frame_events);
        elapsed_ms
    }

    pub async fn record_event(&self, name: &str) {
        let mut state = self.inner.lock().await;
        state.total_events += 1;
        state.frame_events += 1;
        *state.counts.entry(name.to_string()).or_default() += 1;
    }

    pub async fn record_failure(&self) {
        let mut state = self.inner.lock().await;
        state.failed_events += 1;
    }

    pub async fn record_latency(&self, name: &str, micros: f64) {
        let mut state = self.inner.lock().await;
        let cap = state.sample_cap;
        state
            .latencies
            .entry(name.to_string())
            .or_default()
            .record(micros, cap);
    }

    pub async fn last_frame_ms(&self) -> Option<f64> {
        self.inner.lock().await.last_frame_ms
    }

    /// Compares the last closed frame against a budget.
    pub async fn is_frame_budget_exceeded(&self, budget_ms: f64) -> bool {
        self.inner
            .lock()
            .await
            .last_frame_ms
            .is_some_and(|ms| ms > budget_ms)
    }

    /// Recent throughput in events/second, derived from the retained frame
    /// ring; falls back to the lifetime average when no frames closed yet.
    pub async fn recent_events_per_second(&self) -> f64 {
        let state = self.inner.lock().await;
        let frame_secs: f64 = state.frame_times_ms.iter().sum::<f64>() / 1_000.0;
        if frame_secs > 0.0 {
            let events: u64 = state.events_per_frame.iter().sum();
            events as f64 / frame_secs
        } else {
            let uptime = state.started.elapsed().as_secs_f64();
            if uptime > 0.0 {
                state.total_events as f64 / uptime
            } else {
                0.0
            }
        }
    }

    pub async fn failure_rate(&self) -> f64 {
        let state = self.inner.lock().await;
        let attempts = state.total_events + state.failed_events;
        if attempts == 0 {
            0.0
        } else {
            state.failed_events as f64 / attempts as f64
        }
    }

    pub async fn stats(&self) -> serde_json::Value {
        let state = self.inner.lock().await;
        let uptime = state.started.elapsed().as_secs_f64();
        let average_eps = if uptime > 0.0 {
            state.total_events as f64 / uptime
        } else {
            0.0
        };
        let recent_events_per_frame = if state.events_per_frame.is_empty() {
            0.0
        } else {
            state.events_per_frame.iter().sum::<u64>() as f64
                / state.events_per_frame.len() as f64
        };
        let recent_frame_avg_ms = if state.frame_times_ms.is_empty() {
            0.0
        } else {
            state.frame_times_ms.iter().sum::<f64>() / state.frame_times_ms.len() as f64
        };

        let per_event: serde_json::Map<String, serde_json::Value> = state
            .counts
            .iter()
            .map(|(name, count)| {
                let (avg_us, min_us, max_us) = state
                    .latencies
                    .get(name)
                    .map(LatencyRing::stats)
                    .unwrap_or_default();
                let sample_count = state
                    .latencies
                    .get(name)
                    .map(|ring| ring.total_samples)
                    .unwrap_or_default();
                (
                    name.clone(),
                    json!({
                        "count": count,
                        "avg_us": avg_us,
                        "min_us": min_us,
                        "max_us": max_us,
                        "sample_count": sample_count,
                    }),
                )
            })
            .collect();

        json!({
            "total_events_processed": state.total_events,
            "failed_events": state.failed_events,
            "uptime_seconds": uptime,
            "average_events_per_second": average_eps,
            "recent_events_per_frame": recent_events_per_frame,
            "recent_frame_avg_ms": recent_frame_avg_ms,
            "last_frame_ms": state.last_frame_ms,
            "per_event": per_event,
        })
    }
}
