//! Debug output surface for host-side inspection panels.

use std::fmt;

use serde_json::Value;

/// Receives structured dumps of bus internals on demand.
///
/// The core never pretty-prints; it emits one `Value` tree per section
/// ("subscriptions", "queues", "windows", ...) and the host decides how to
/// render it.
pub trait DebugProbe: Send + Sync {
    /// Delivers one named section of a debug dump.
    fn dump(&self, section: &str, data: &Value);
}

impl fmt::Debug for dyn DebugProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DebugProbe")
    }
}
