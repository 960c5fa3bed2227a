//! In-process, single-node publish/subscribe event bus for interactive
//! real-time applications.
//!
//! The core is the dispatch and flow-control engine: subscription registry,
//! schema validation, bounded per-subscriber and global queues, a replay
//! store with time-range queries and controlled replay sessions, a
//! sliding/tumbling time-window aggregator, an adaptive backpressure
//! controller, phase- and integration-keyed batching, throughput
//! monitoring, and health-aware routing. Host integration is interface-only
//! through `goatbus-contracts`.

pub mod backpressure;
pub mod batch;
pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod gate;
pub mod health;
pub mod queue;
pub mod replay;
pub mod schema;
pub mod signals;
pub mod subscription;
pub mod throughput;
pub mod window;

pub use backpressure::{BackpressureAction, PressureSample, PressureThresholds};
pub use batch::IntegrationCategory;
pub use bus::{DrainReport, EventBus, EventBusBuilder};
pub use clock::{BusClock, ManualClock, SystemClock};
pub use config::BusConfig;
pub use error::{BusError, Result};
pub use event::{Event, EventPriority, Payload};
pub use health::SystemHealth;
pub use queue::DropPolicy;
pub use replay::{ReplaySessionId, ReplayStatus};
pub use schema::{SchemaDef, ValidationReport};
pub use signals::BusSignal;
pub use subscription::{
    EventHandler, SubscribeOptions, SubscriptionId, handler_fn,
};
pub use window::Aggregation;
