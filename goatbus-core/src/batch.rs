use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::clock::secs_f64;
use crate::config::BatchTuning;
use crate::event::Event;

/// Integration batch lanes. The name sets routing into each lane are
/// closed; anything else either phase-batches or dispatches immediately.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationCategory {
    SchemaUpdates,
    ConfigAdjustments,
    TemplateUpdates,
    ResourceOptimizations,
}

impl fmt::Display for IntegrationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrationCategory::SchemaUpdates => f.write_str("schema_updates"),
            IntegrationCategory::ConfigAdjustments => f.write_str("config_adjustments"),
            IntegrationCategory::TemplateUpdates => f.write_str("template_updates"),
            IntegrationCategory::ResourceOptimizations => {
                f.write_str("resource_optimizations")
            }
        }
    }
}

static INTEGRATION_EVENTS: Lazy<HashMap<&'static str, IntegrationCategory>> = Lazy::new(|| {
    use IntegrationCategory::*;
    let mut map = HashMap::new();
    for name in [
        "schedule_schema_analysis",
        "trigger_schema_analysis",
        "schema_analysis_completed",
        "system_schema_analysis_complete",
        "integrate_schema_analysis_results",
        "schema_template_sync_requested",
        "schema_template_sync_completed",
    ] {
        map.insert(name, SchemaUpdates);
    }
    for name in [
        "config_auto_adjusted",
        "request_config_adjustment",
        "config_adjustment_completed",
        "immediate_config_adjustments_applied",
        "config_adjustments_scheduled",
    ] {
        map.insert(name, ConfigAdjustments);
    }
    for name in [
        "template_auto_updated",
        "template_updates_queued_for_review",
        "template_updates_from_feedback",
        "template_updates_from_scaling",
        "template_review_required",
        "template_updated_notify_systems",
    ] {
        map.insert(name, TemplateUpdates);
    }
    for name in [
        "resource_scaling_completed",
        "resource_forecast_generated",
        "resource_profile_recommendations",
        "apply_resource_profile",
        "coordinate_profile_application",
    ] {
        map.insert(name, ResourceOptimizations);
    }
    map
});

static ORCHESTRATION_EVENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "system_registered",
        "system_state_changed",
        "dependency_resolved",
        "phase_system_completed",
        "system_health_status_updated",
    ]
});

/// Lane an integration event belongs to, if any.
pub fn integration_category(event: &str) -> Option<IntegrationCategory> {
    INTEGRATION_EVENTS.get(event).copied()
}

/// Whether the event belongs to the orchestration (phase-batched) set.
pub fn is_orchestration_event(event: &str) -> bool {
    ORCHESTRATION_EVENTS.contains(&event)
}

/// Phase key for orchestration events: `_orchestrator_meta.active_phase`
/// first, `phase_name` as fallback.
pub fn phase_key(event: &Event) -> Option<String> {
    event
        .payload
        .get("_orchestrator_meta")
        .and_then(|meta| meta.get("active_phase"))
        .and_then(|phase| phase.as_str())
        .or_else(|| event.payload.get("phase_name").and_then(|p| p.as_str()))
        .map(str::to_string)
}

struct PendingBatch {
    items: Vec<Event>,
    last_flush: DateTime<Utc>,
}

struct BatchState {
    phase: HashMap<String, PendingBatch>,
    integration: HashMap<IntegrationCategory, PendingBatch>,
    max_batch_size: usize,
    timeout_secs: f64,
    yield_threshold: usize,
    batches_flushed: u64,
}

/// Phase- and integration-keyed batch maps with size/time flush triggers.
///
/// The processor only accumulates and decides when a batch is ready; actual
/// delivery stays with the dispatch pipeline so handler accounting lives in
/// one place.
pub struct BatchProcessor {
    inner: Mutex<BatchState>,
}

impl fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BatchProcessor")
    }
}

/// A batch handed back for delivery.
#[derive(Debug)]
pub struct ReadyBatch {
    pub key: String,
    pub category: Option<IntegrationCategory>,
    pub events: Vec<Event>,
}

impl BatchProcessor {
    pub fn new(tuning: &BatchTuning) -> Self {
        Self {
            inner: Mutex::new(BatchState {
                phase: HashMap::new(),
                integration: HashMap::new(),
                max_batch_size: tuning.max_batch_size.max(1),
                timeout_secs: tuning.batch_timeout_ms as f64 / 1_000.0,
                yield_threshold: tuning.yield_threshold.max(1),
                batches_flushed: 0,
            }),
        }
    }

    /// Adds an event to its integration lane; returns the batch when the
    /// size or age trigger fires.
    pub async fn push_integration(
        &self,
        category: IntegrationCategory,
        event: Event,
        now: DateTime<Utc>,
    ) -> Option<ReadyBatch> {
        let mut state = self.inner.lock().await;
        let max = state.max_batch_size;
        let timeout = state.timeout_secs;
        let batch = state
            .integration
            .entry(category)
            .or_insert_with(|| PendingBatch {
                items: Vec::new(),
                last_flush: now,
            });
        batch.items.push(event);

        let size_due = batch.items.len() >= max;
        let time_due = (now - batch.last_flush) >= secs_f64(timeout);
        if size_due || time_due {
            let events = std::mem::take(&mut batch.items);
            batch.last_flush = now;
            state.batches_flushed += 1;
            Some(ReadyBatch {
                key: category.to_string(),
                category: Some(category),
                events,
            })
        } else {
            None
        }
    }

    /// Adds an orchestration event under its phase key.
    pub async fn push_phase(
        &self,
        phase: String,
        event: Event,
        now: DateTime<Utc>,
    ) -> Option<ReadyBatch> {
        let mut state = self.inner.lock().await;
        let max = state.max_batch_size;
        let timeout = state.timeout_secs;
        let batch = state.phase.entry(phase.clone()).or_insert_with(|| PendingBatch {
            items: Vec::new(),
            last_flush: now,
        });
        batch.items.push(event);

        let size_due = batch.items.len() >= max;
        let time_due = (now - batch.last_flush) >= secs_f64(timeout);
        if size_due || time_due {
            let events = std::mem::take(&mut batch.items);
            batch.last_flush = now;
            state.batches_flushed += 1;
            Some(ReadyBatch {
                key: phase,
                category: None,
                events,
            })
        } else {
            None
        }
    }

    /// Batches whose age trigger has fired; called by maintenance.
    pub async fn take_due(&self, now: DateTime<Utc>) -> Vec<ReadyBatch> {
        let mut state = self.inner.lock().await;
        let timeout = state.timeout_secs;
        let mut ready = Vec::new();

        for (category, batch) in state.integration.iter_mut() {
            if !batch.items.is_empty() && (now - batch.last_flush) >= secs_f64(timeout) {
                let events = std::mem::take(&mut batch.items);
                batch.last_flush = now;
                ready.push(ReadyBatch {
                    key: category.to_string(),
                    category: Some(*category),
                    events,
                });
            }
        }
        for (phase, batch) in state.phase.iter_mut() {
            if !batch.items.is_empty() && (now - batch.last_flush) >= secs_f64(timeout) {
                let events = std::mem::take(&mut batch.items);
                batch.last_flush = now;
                ready.push(ReadyBatch {
                    key: phase.clone(),
                    category: None,
                    events,
                });
            }
        }
        state.batches_flushed += ready.len() as u64;
        ready
    }

    /// Drains both maps unconditionally.
    pub async fn drain_all(&self, now: DateTime<Utc>) -> Vec<ReadyBatch> {
        let mut state = self.inner.lock().await;
        let mut ready = Vec::new();
        for (category, batch) in state.integration.iter_mut() {
            if !batch.items.is_empty() {
                let events = std::mem::take(&mut batch.items);
                batch.last_flush = now;
                ready.push(ReadyBatch {
                    key: category.to_string(),
                    category: Some(*category),
                    events,
                });
            }
        }
        for (phase, batch) in state.phase.iter_mut() {
            if !batch.items.is_empty() {
                let events = std::mem::take(&mut batch.items);
                batch.last_flush = now;
                ready.push(ReadyBatch {
                    key: phase.clone(),
                    category: None,
                    events,
                });
            }
        }
        state.batches_flushed += ready.len() as u64;
        ready
    }

    /// Chunk size for cooperative processing.
    pub async fn yield_threshold(&self) -> usize {
        self.inner.lock().await.yield_threshold
    }

    pub async fn apply_tuning(&self, tuning: &BatchTuning) {
        let mut state = self.inner.lock().await;
        state.max_batch_size = tuning.max_batch_size.max(1);
        state.timeout_secs = tuning.batch_timeout_ms as f64 / 1_000.0;
        state.yield_threshold = tuning.yield_threshold.max(1);
    }

    pub async fn occupancy(&self) -> serde_json::Value {
        let state = self.inner.lock().await;
        let phase: serde_json::Map<String, serde_json::Value> = state
            .phase
            .iter()
            .map(|(k, b)| (k.clone(), json!(b.items.len())))
            .collect();
        let integration: serde_json::Map<String, serde_json::Value> = state
            .integration
            .iter()
            .map(|(k, b)| (k.to_string(), json!(b.items.len())))
            .collect();
        json!({
            "phase": phase,
            "integration": integration,
            "batches_flushed": state.batches_flushed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPriority;
    use crate::payload;

    fn ts(secs: f64) -> DateTime<Utc> {
        DateTime::from_timestamp_micros((secs * 1_000_000.0) as i64).unwrap()
    }

    fn event(name: &str, payload: crate::event::Payload) -> Event {
        Event::new(name, payload, EventPriority::Normal, ts(0.0))
    }

    #[test]
    fn closed_name_sets_route_to_their_lanes() {
        assert_eq!(
            integration_category("trigger_schema_analysis"),
            Some(IntegrationCategory::SchemaUpdates)
        );
        assert_eq!(
            integration_category("config_auto_adjusted"),
            Some(IntegrationCategory::ConfigAdjustments)
        );
        assert_eq!(
            integration_category("template_review_required"),
            Some(IntegrationCategory::TemplateUpdates)
        );
        assert_eq!(
            integration_category("apply_resource_profile"),
            Some(IntegrationCategory::ResourceOptimizations)
        );
        assert_eq!(integration_category("player_hit"), None);

        assert!(is_orchestration_event("system_registered"));
        assert!(!is_orchestration_event("trigger_schema_analysis"));
    }

    #[test]
    fn phase_key_prefers_orchestrator_meta() {
        let with_meta = event(
            "system_registered",
            payload! { "_orchestrator_meta" => ::serde_json::json!({ "active_phase": "boot" }), "phase_name" => "late" },
        );
        assert_eq!(phase_key(&with_meta), Some("boot".to_string()));

        let fallback = event("system_registered", payload! { "phase_name" => "combat" });
        assert_eq!(phase_key(&fallback), Some("combat".to_string()));

        let none = event("system_registered", payload!());
        assert_eq!(phase_key(&none), None);
    }

    #[tokio::test]
    async fn size_trigger_flushes_the_batch() {
        let processor = BatchProcessor::new(&BatchTuning {
            max_batch_size: 3,
            batch_timeout_ms: 60_000,
            yield_threshold: 100,
        });

        for i in 0..2 {
            let ready = processor
                .push_integration(
                    IntegrationCategory::SchemaUpdates,
                    event("trigger_schema_analysis", payload! { "i" => i }),
                    ts(0.0),
                )
                .await;
            assert!(ready.is_none());
        }
        let ready = processor
            .push_integration(
                IntegrationCategory::SchemaUpdates,
                event("trigger_schema_analysis", payload! { "i" => 2 }),
                ts(0.0),
            )
            .await
            .expect("size trigger");
        assert_eq!(ready.events.len(), 3);
        assert_eq!(ready.key, "schema_updates");
    }

    #[tokio::test]
    async fn age_trigger_flushes_partial_batches() {
        let processor = BatchProcessor::new(&BatchTuning {
            max_batch_size: 50,
            batch_timeout_ms: 100,
            yield_threshold: 100,
        });

        assert!(
            processor
                .push_phase(
                    "boot".to_string(),
                    event("system_registered", payload! { "phase_name" => "boot" }),
                    ts(0.0),
                )
                .await
                .is_none()
        );

        // Nothing due before the timeout.
        assert!(processor.take_due(ts(0.05)).await.is_empty());

        let due = processor.take_due(ts(0.2)).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, "boot");
        assert_eq!(due[0].events.len(), 1);
    }

    #[tokio::test]
    async fn drain_all_empties_both_maps() {
        let processor = BatchProcessor::new(&BatchTuning::default());
        processor
            .push_integration(
                IntegrationCategory::TemplateUpdates,
                event("template_auto_updated", payload!()),
                ts(0.0),
            )
            .await;
        processor
            .push_phase(
                "combat".to_string(),
                event("system_state_changed", payload! { "phase_name" => "combat" }),
                ts(0.0),
            )
            .await;

        let drained = processor.drain_all(ts(0.0)).await;
        assert_eq!(drained.len(), 2);
        assert!(processor.take_due(ts(100.0)).await.is_empty());
    }
}
