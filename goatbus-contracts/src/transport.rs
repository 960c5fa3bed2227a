//! Configuration import/export transport.
//!
//! The core hands policy snapshots over as [`serde_json::Value`] trees; how
//! those trees reach disk, the network, or an editor panel is a host
//! concern.

use std::fmt;

use serde_json::Value;

/// Moves configuration snapshots between the bus and host storage.
pub trait ConfigTransport: Send + Sync {
    /// Persists an exported configuration snapshot.
    fn store(&self, snapshot: &Value) -> Result<(), String>;

    /// Loads a previously stored snapshot, or `None` when the host has
    /// nothing saved.
    fn load(&self) -> Result<Option<Value>, String>;
}

impl fmt::Debug for dyn ConfigTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConfigTransport")
    }
}
