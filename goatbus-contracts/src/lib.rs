//! Trait surfaces that describe how the GoatBus core talks to its host.
//!
//! The bus core owns dispatch, queueing, and flow control; everything that
//! touches the host runtime — collaborator lookup, logging sinks,
//! configuration transport, debug dumps, host-defined payload types — is
//! declared here and implemented on the host side.

pub mod collaborator;
pub mod debug_probe;
pub mod sink;
pub mod transport;
pub mod type_oracle;

/// Frequently used trait combinators for host integration crates.
pub mod prelude {
    pub use super::collaborator::{DiscoveryStrategy, HostCollaborator};
    pub use super::debug_probe::DebugProbe;
    pub use super::sink::{LogCrateSink, LogLevel, LogSink};
    pub use super::transport::ConfigTransport;
    pub use super::type_oracle::{HostTypeTag, TypeOracle};
}
