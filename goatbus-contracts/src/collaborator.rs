//! External systems the bus coordinates with but never owns.

use std::fmt;
use std::sync::Arc;

/// A named host-side system bound into one of the bus's collaborator slots.
///
/// The bus only ever reads collaborators through this surface; it never
/// extends their lifetime beyond the `Arc` handed to it and never calls back
/// into the host outside these methods.
pub trait HostCollaborator: Send + Sync {
    /// Stable name the bus uses for slot lookup and diagnostics.
    fn name(&self) -> &str;

    /// Whether the collaborator is still usable. Hosts backed by scene-graph
    /// nodes return `false` once the node has left the tree.
    fn is_alive(&self) -> bool {
        true
    }

    /// Receives a host-defined notification when the bus connects an
    /// external system to it.
    fn on_connected(&self) {}
}

impl fmt::Debug for dyn HostCollaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCollaborator")
            .field("name", &self.name())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// A single way of locating a collaborator in the host runtime.
///
/// Concrete strategies (singleton lookup by name, scene-graph node by name,
/// node by class tag, group membership) live host-side; the bus tries each
/// registered strategy in order and takes the first hit.
pub trait DiscoveryStrategy: Send + Sync {
    /// Attempts to resolve `name` to a live collaborator instance.
    fn locate(&self, name: &str) -> Option<Arc<dyn HostCollaborator>>;
}

impl fmt::Debug for dyn DiscoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DiscoveryStrategy")
    }
}
