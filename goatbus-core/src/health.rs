use std::fmt;
use std::sync::RwLock;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::HealthTuning;
use crate::event::EventPriority;

/// Reported health for one host system. Health score is
/// `1 − failure_probability`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemHealth {
    pub failure_probability: f64,
    pub current_state: String,
}

impl SystemHealth {
    pub fn score(&self) -> f64 {
        (1.0 - self.failure_probability).clamp(0.0, 1.0)
    }
}

#[derive(Clone, Debug)]
struct HealthEntry {
    health: SystemHealth,
    routed: bool,
}

/// Emitted when a system's route decision flips across the routing
/// threshold.
#[derive(Clone, Debug)]
pub struct RoutingChange {
    pub system: String,
    pub routed: bool,
    pub score: f64,
}

/// Aggregate recommendation for a set of target systems.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallRecommendation {
    Proceed,
    ProceedWithCaution,
    Block,
}

#[derive(Clone, Debug, Serialize)]
pub struct RouteRecommendation {
    pub recommended: Vec<String>,
    pub blocked: Vec<String>,
    pub degraded: Vec<String>,
    pub overall: OverallRecommendation,
}

/// Per-system health cache driving routing and priority decisions.
pub struct HealthRouter {
    systems: DashMap<String, HealthEntry>,
    thresholds: RwLock<HealthTuning>,
}

impl fmt::Debug for HealthRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthRouter")
            .field("systems", &self.systems.len())
            .finish()
    }
}

impl HealthRouter {
    pub fn new(thresholds: HealthTuning) -> Self {
        Self {
            systems: DashMap::new(),
            thresholds: RwLock::new(thresholds),
        }
    }

    fn routing_threshold(&self) -> f64 {
        self.thresholds
            .read()
            .map(|t| t.routing_threshold)
            .unwrap_or(0.2)
    }

    fn warning_threshold(&self) -> f64 {
        self.thresholds
            .read()
            .map(|t| t.warning_threshold)
            .unwrap_or(0.5)
    }

    /// Updates the cache; returns a change when the route decision flipped.
    pub fn update(&self, system: &str, health: SystemHealth) -> Option<RoutingChange> {
        let score = health.score();
        let routed = score > self.routing_threshold();
        let previous = self
            .systems
            .insert(
                system.to_string(),
                HealthEntry {
                    health,
                    routed,
                },
            )
            .map(|entry| entry.routed);

        if previous != Some(routed) && (previous.is_some() || !routed) {
            Some(RoutingChange {
                system: system.to_string(),
                routed,
                score,
            })
        } else {
            None
        }
    }

    /// Health score for a system; unknown systems count as fully healthy.
    pub fn score(&self, system: &str) -> f64 {
        self.systems
            .get(system)
            .map(|entry| entry.health.score())
            .unwrap_or(1.0)
    }

    /// Whether delivery to a system should proceed. The base is the cached
    /// route decision; when the publish carried a negative priority
    /// adjustment the bar rises by `|adjustment| · 0.1`.
    pub fn should_route(&self, system: &str, priority_adjustment: i32) -> bool {
        let Some(entry) = self.systems.get(system) else {
            return true;
        };
        let base = entry.routed;
        if priority_adjustment < 0 {
            let margin = f64::from(priority_adjustment.unsigned_abs()) * 0.1;
            entry.health.score() > self.routing_threshold() + margin
        } else {
            base
        }
    }

    /// Splits target systems into recommended / blocked / degraded with an
    /// aggregate verdict.
    pub fn recommend(&self, _event: &str, systems: &[String]) -> RouteRecommendation {
        let routing = self.routing_threshold();
        let warning = self.warning_threshold();
        let mut recommended = Vec::new();
        let mut blocked = Vec::new();
        let mut degraded = Vec::new();

        for system in systems {
            let score = self.score(system);
            if score <= routing {
                blocked.push(system.clone());
            } else if score < warning {
                degraded.push(system.clone());
                recommended.push(system.clone());
            } else {
                recommended.push(system.clone());
            }
        }

        let overall = if !systems.is_empty() && blocked.len() == systems.len() {
            OverallRecommendation::Block
        } else if !degraded.is_empty() {
            OverallRecommendation::ProceedWithCaution
        } else {
            OverallRecommendation::Proceed
        };

        RouteRecommendation {
            recommended,
            blocked,
            degraded,
            overall,
        }
    }

    /// Publish-time priority adjustment from the minimum health over the
    /// target systems. Returns the adjusted priority and the signed band
    /// delta.
    pub fn adjust_priority(
        &self,
        priority: EventPriority,
        targets: &[String],
    ) -> (EventPriority, i32) {
        if targets.is_empty() {
            return (priority, 0);
        }
        let min_health = targets
            .iter()
            .map(|system| self.score(system))
            .fold(1.0_f64, f64::min);

        let adjusted = if min_health < 0.5 {
            EventPriority::Low
        } else if min_health < 0.8 {
            priority.demoted()
        } else {
            priority
        };
        let delta = i32::from(adjusted.as_u8()) - i32::from(priority.as_u8());
        (adjusted, delta)
    }

    pub fn set_thresholds(&self, thresholds: HealthTuning) {
        if let Ok(mut guard) = self.thresholds.write() {
            *guard = thresholds;
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let systems: serde_json::Map<String, serde_json::Value> = self
            .systems
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    json!({
                        "failure_probability": entry.value().health.failure_probability,
                        "current_state": entry.value().health.current_state,
                        "score": entry.value().health.score(),
                        "routed": entry.value().routed,
                    }),
                )
            })
            .collect();
        json!({ "systems": systems })
    }
}
