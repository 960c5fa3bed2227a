//! Scenarios for the host-facing seams: collaborator discovery, config
//! transport, debug probes, and host-defined payload types.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use goatbus_contracts::collaborator::{DiscoveryStrategy, HostCollaborator};
use goatbus_contracts::debug_probe::DebugProbe;
use goatbus_contracts::transport::ConfigTransport;
use goatbus_contracts::type_oracle::{HostTypeTag, TypeOracle};
use serde_json::Value;

use goatbus_core::payload;
use goatbus_core::schema::SchemaDef;
use goatbus_core::signals::BusSignal;
use goatbus_core::subscription::{SubscribeOptions, handler_fn};
use goatbus_core::{BusConfig, EventBus};

struct NamedSystem(&'static str);

impl HostCollaborator for NamedSystem {
    fn name(&self) -> &str {
        self.0
    }
}

struct Registry(Mutex<HashMap<String, Arc<dyn HostCollaborator>>>);

impl DiscoveryStrategy for Registry {
    fn locate(&self, name: &str) -> Option<Arc<dyn HostCollaborator>> {
        self.0.lock().unwrap().get(name).cloned()
    }
}

#[tokio::test]
async fn discovery_resolves_dependencies_during_maintenance() {
    let registry = Arc::new(Registry(Mutex::new(HashMap::new())));
    let bus = EventBus::builder()
        .require_dependency("world")
        .with_discovery_strategy(Arc::clone(&registry) as Arc<dyn DiscoveryStrategy>)
        .build();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(
        "spawn",
        handler_fn(move |event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(event.name);
                Ok(())
            }
        }),
        SubscribeOptions::default(),
    )
    .await;
    assert!(bus.publish("spawn", payload!()).await);
    assert!(seen.lock().unwrap().is_empty(), "gate holds operations");

    // The host brings the collaborator up; the next maintenance pass finds
    // it and replays the cached subscribe + publish.
    registry
        .0
        .lock()
        .unwrap()
        .insert("world".to_string(), Arc::new(NamedSystem("world")));
    bus.perform_maintenance().await;

    assert_eq!(*seen.lock().unwrap(), vec!["spawn".to_string()]);
}

#[tokio::test]
async fn exhausted_discovery_raises_the_failure_signal() {
    let bus = EventBus::builder()
        .require_dependency("ghost")
        .with_discovery_strategy(Arc::new(Registry(Mutex::new(HashMap::new())))
            as Arc<dyn DiscoveryStrategy>)
        .build();
    let mut signals = bus.signals();

    // Default retry budget is 5 maintenance passes.
    for _ in 0..6 {
        bus.perform_maintenance().await;
    }

    let mut failed = None;
    while let Ok(signal) = signals.try_recv() {
        if let BusSignal::DependencyConnectionFailed { name, attempts } = signal {
            failed = Some((name, attempts));
        }
    }
    let (name, attempts) = failed.expect("dependency_connection_failed signal");
    assert_eq!(name, "ghost");
    assert_eq!(attempts, 5);
}

#[derive(Default)]
struct MemoryTransport {
    stored: Mutex<Option<Value>>,
}

impl ConfigTransport for MemoryTransport {
    fn store(&self, snapshot: &Value) -> Result<(), String> {
        *self.stored.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<Value>, String> {
        Ok(self.stored.lock().unwrap().clone())
    }
}

#[tokio::test]
async fn configuration_travels_through_a_host_transport() {
    let transport = MemoryTransport::default();

    let mut config = BusConfig::default();
    config.batching.max_batch_size = 9;
    let source = EventBus::builder().with_config(config).build();
    assert!(source.save_configuration(&transport).await);

    let target = EventBus::builder().build();
    assert!(target.load_configuration(&transport).await);
    let exported = target.export_configuration().await;
    assert_eq!(exported["batching"]["max_batch_size"], serde_json::json!(9));
}

#[tokio::test]
async fn debug_probe_receives_stats_and_config() {
    struct CollectingProbe(Mutex<Vec<String>>);
    impl DebugProbe for CollectingProbe {
        fn dump(&self, section: &str, _data: &Value) {
            self.0.lock().unwrap().push(section.to_string());
        }
    }

    let bus = EventBus::builder().build();
    bus.publish("tick", payload!()).await;

    let probe = CollectingProbe(Mutex::new(Vec::new()));
    bus.debug_dump(&probe).await;
    let sections = probe.0.lock().unwrap();
    assert!(sections.contains(&"stats".to_string()));
    assert!(sections.contains(&"config".to_string()));
}

#[tokio::test]
async fn host_type_tags_validate_through_the_oracle() {
    struct NodeOracle;
    impl TypeOracle for NodeOracle {
        fn value_satisfies(&self, tag: &HostTypeTag, value: &Value) -> bool {
            match tag {
                // A "node" payload value is a path string in this host.
                HostTypeTag::Node => value.as_str().is_some_and(|s| s.starts_with('/')),
                _ => true,
            }
        }
    }

    let bus = EventBus::builder()
        .with_type_oracle(Arc::new(NodeOracle))
        .build();
    bus.register_schema(
        "attach",
        SchemaDef {
            required: vec!["target".to_string()],
            field_types: [("target".to_string(), "node".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        },
    );

    assert!(bus.publish("attach", payload! { "target" => "/root/Player" }).await);
    assert!(!bus.publish("attach", payload! { "target" => "Player" }).await);
}
