use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use goatbus_contracts::collaborator::{DiscoveryStrategy, HostCollaborator};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use crate::event::{EventPriority, Payload};
use crate::subscription::{EventHandler, SubscribeOptions, SubscriptionId};

/// An operation accepted before the bus's collaborators were resolved,
/// replayed in order once the gate opens.
pub enum PendingOperation {
    Publish {
        name: String,
        payload: Payload,
        priority: EventPriority,
    },
    Subscribe {
        id: SubscriptionId,
        name: String,
        handler: Arc<dyn EventHandler>,
        owner: Option<Arc<dyn Any + Send + Sync>>,
        options: SubscribeOptions,
    },
    ConnectExternalSystem {
        name: String,
        instance: Arc<dyn HostCollaborator>,
    },
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingOperation::Publish { name, priority, .. } => f
                .debug_struct("Publish")
                .field("name", name)
                .field("priority", priority)
                .finish(),
            PendingOperation::Subscribe { id, name, .. } => f
                .debug_struct("Subscribe")
                .field("id", id)
                .field("name", name)
                .finish(),
            PendingOperation::ConnectExternalSystem { name, .. } => f
                .debug_struct("ConnectExternalSystem")
                .field("name", name)
                .finish(),
        }
    }
}

struct CollaboratorSlot {
    required: bool,
    instance: Option<Arc<dyn HostCollaborator>>,
    attempts: u32,
    failure_reported: bool,
}

struct GateState {
    slots: HashMap<String, CollaboratorSlot>,
    pending: VecDeque<PendingOperation>,
    ready: bool,
    retry_budget: u32,
}

impl GateState {
    fn compute_ready(&self) -> bool {
        self.slots.values().all(|slot| {
            !slot.required
                || slot
                    .instance
                    .as_ref()
                    .is_some_and(|instance| instance.is_alive())
        })
    }
}

/// Outcome of binding a collaborator.
#[derive(Debug, Default)]
pub struct GateTransition {
    /// The bind completed the required set; pending operations should be
    /// replayed now.
    pub became_ready: bool,
}

/// Caches operations until required collaborators are bound, then replays
/// them in arrival order.
pub struct DependencyGate {
    inner: Mutex<GateState>,
    strategies: Vec<Arc<dyn DiscoveryStrategy>>,
}

impl fmt::Debug for DependencyGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyGate")
            .field("strategies", &self.strategies.len())
            .finish()
    }
}

impl DependencyGate {
    pub fn new(
        required: Vec<String>,
        optional: Vec<String>,
        strategies: Vec<Arc<dyn DiscoveryStrategy>>,
        retry_budget: u32,
    ) -> Self {
        let mut slots = HashMap::new();
        for name in required {
            slots.insert(
                name,
                CollaboratorSlot {
                    required: true,
                    instance: None,
                    attempts: 0,
                    failure_reported: false,
                },
            );
        }
        for name in optional {
            slots.entry(name).or_insert(CollaboratorSlot {
                required: false,
                instance: None,
                attempts: 0,
                failure_reported: false,
            });
        }
        let ready = slots
            .values()
            .all(|slot| !slot.required || slot.instance.is_some());
        Self {
            inner: Mutex::new(GateState {
                slots,
                pending: VecDeque::new(),
                ready,
                retry_budget,
            }),
            strategies,
        }
    }

    /// A gate with no required collaborators; ready from the start.
    pub fn open() -> Self {
        Self::new(Vec::new(), Vec::new(), Vec::new(), 0)
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.lock().await.ready
    }

    /// Queues an operation for replay once the gate opens.
    pub async fn cache(&self, operation: PendingOperation) {
        let mut state = self.inner.lock().await;
        debug!(operation = ?operation, "caching operation until dependencies resolve");
        state.pending.push_back(operation);
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Binds a collaborator into its slot (creating an optional slot for
    /// unknown names) and reports whether the gate just opened.
    pub async fn bind(
        &self,
        name: &str,
        instance: Arc<dyn HostCollaborator>,
    ) -> GateTransition {
        let mut state = self.inner.lock().await;
        let slot = state
            .slots
            .entry(name.to_string())
            .or_insert(CollaboratorSlot {
                required: false,
                instance: None,
                attempts: 0,
                failure_reported: false,
            });
        slot.instance = Some(instance);
        slot.attempts = 0;
        slot.failure_reported = false;

        let was_ready = state.ready;
        state.ready = state.compute_ready();
        GateTransition {
            became_ready: !was_ready && state.ready,
        }
    }

    /// Takes the pending operations for replay. Caller must only invoke
    /// this after the gate reports ready.
    pub async fn drain_pending(&self) -> Vec<PendingOperation> {
        let mut state = self.inner.lock().await;
        state.pending.drain(..).collect()
    }

    /// Runs the discovery strategies over unresolved slots. Returns the
    /// names of required collaborators that just exhausted their retry
    /// budget, plus whether the gate became ready.
    pub async fn attempt_discovery(&self) -> (Vec<(String, u32)>, bool) {
        let mut state = self.inner.lock().await;
        let mut exhausted = Vec::new();

        let unresolved: Vec<String> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.instance.is_none())
            .map(|(name, _)| name.clone())
            .collect();

        for name in unresolved {
            let located = self
                .strategies
                .iter()
                .find_map(|strategy| strategy.locate(&name));
            let budget = state.retry_budget;
            if let Some(slot) = state.slots.get_mut(&name) {
                match located {
                    Some(instance) => {
                        slot.instance = Some(instance);
                        slot.failure_reported = false;
                    }
                    None => {
                        slot.attempts += 1;
                        if slot.required && slot.attempts >= budget && !slot.failure_reported {
                            slot.failure_reported = true;
                            exhausted.push((name, slot.attempts));
                        }
                    }
                }
            }
        }

        let was_ready = state.ready;
        state.ready = state.compute_ready();
        (exhausted, !was_ready && state.ready)
    }

    /// Drops collaborators that report dead; the gate may close again.
    pub async fn evict_dead(&self) -> usize {
        let mut state = self.inner.lock().await;
        let mut evicted = 0;
        for slot in state.slots.values_mut() {
            if slot
                .instance
                .as_ref()
                .is_some_and(|instance| !instance.is_alive())
            {
                slot.instance = None;
                evicted += 1;
            }
        }
        if evicted > 0 {
            state.ready = state.compute_ready();
        }
        evicted
    }

    pub async fn collaborator(&self, name: &str) -> Option<Arc<dyn HostCollaborator>> {
        let state = self.inner.lock().await;
        state.slots.get(name).and_then(|slot| slot.instance.clone())
    }

    pub async fn status(&self) -> serde_json::Value {
        let state = self.inner.lock().await;
        let slots: serde_json::Map<String, serde_json::Value> = state
            .slots
            .iter()
            .map(|(name, slot)| {
                (
                    name.clone(),
                    json!({
                        "required": slot.required,
                        "bound": slot.instance.is_some(),
                        "attempts": slot.attempts,
                    }),
                )
            })
            .collect();
        json!({
            "ready": state.ready,
            "pending_operations": state.pending.len(),
            "slots": slots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSystem(&'static str);
    impl HostCollaborator for FakeSystem {
        fn name(&self) -> &str {
            self.0
        }
    }

    struct LookupTable(HashMap<String, Arc<dyn HostCollaborator>>);
    impl DiscoveryStrategy for LookupTable {
        fn locate(&self, name: &str) -> Option<Arc<dyn HostCollaborator>> {
            self.0.get(name).cloned()
        }
    }

    #[tokio::test]
    async fn gate_without_requirements_is_open() {
        let gate = DependencyGate::open();
        assert!(gate.is_ready().await);
    }

    #[tokio::test]
    async fn binding_the_last_requirement_opens_the_gate() {
        let gate = DependencyGate::new(
            vec!["combat".to_string(), "ui".to_string()],
            vec![],
            vec![],
            3,
        );
        assert!(!gate.is_ready().await);

        let first = gate.bind("combat", Arc::new(FakeSystem("combat"))).await;
        assert!(!first.became_ready);

        let second = gate.bind("ui", Arc::new(FakeSystem("ui"))).await;
        assert!(second.became_ready);
        assert!(gate.is_ready().await);
    }

    #[tokio::test]
    async fn pending_operations_replay_in_order() {
        let gate = DependencyGate::new(vec!["combat".to_string()], vec![], vec![], 3);
        gate.cache(PendingOperation::Publish {
            name: "first".to_string(),
            payload: Payload::new(),
            priority: EventPriority::Normal,
        })
        .await;
        gate.cache(PendingOperation::Publish {
            name: "second".to_string(),
            payload: Payload::new(),
            priority: EventPriority::Normal,
        })
        .await;

        let drained = gate.drain_pending().await;
        let names: Vec<&str> = drained
            .iter()
            .map(|op| match op {
                PendingOperation::Publish { name, .. } => name.as_str(),
                _ => "?",
            })
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn discovery_reports_exhausted_required_slots_once() {
        let gate = DependencyGate::new(
            vec!["ghost".to_string()],
            vec![],
            vec![Arc::new(LookupTable(HashMap::new())) as Arc<dyn DiscoveryStrategy>],
            2,
        );

        let (exhausted, _) = gate.attempt_discovery().await;
        assert!(exhausted.is_empty());
        let (exhausted, _) = gate.attempt_discovery().await;
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].0, "ghost");
        // Already reported; stays quiet.
        let (exhausted, _) = gate.attempt_discovery().await;
        assert!(exhausted.is_empty());
    }

    #[tokio::test]
    async fn discovery_can_open_the_gate() {
        let mut table: HashMap<String, Arc<dyn HostCollaborator>> = HashMap::new();
        table.insert("combat".to_string(), Arc::new(FakeSystem("combat")));
        let gate = DependencyGate::new(
            vec!["combat".to_string()],
            vec![],
            vec![Arc::new(LookupTable(table)) as Arc<dyn DiscoveryStrategy>],
            3,
        );

        let (exhausted, became_ready) = gate.attempt_discovery().await;
        assert!(exhausted.is_empty());
        assert!(became_ready);
    }
}
