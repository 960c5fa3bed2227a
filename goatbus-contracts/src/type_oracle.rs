//! Host-defined payload type checks.
//!
//! Schema field tags like `node`, `resource`, `class:<name>` and
//! `interface:<m1,m2>` refer to types only the host runtime can recognise.
//! The core forwards those checks here; without a bound oracle they pass.

use std::fmt;

use serde_json::Value;

/// A schema type tag the core cannot verify on its own.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum HostTypeTag {
    /// A live host scene-graph node.
    Node,
    /// A host resource handle.
    Resource,
    /// Nominal check against a named host class.
    Class(String),
    /// Structural check: the value must expose every listed method.
    Interface(Vec<String>),
    /// Nominal check against a named Resource subclass.
    ResourceClass(String),
}

impl fmt::Display for HostTypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostTypeTag::Node => f.write_str("node"),
            HostTypeTag::Resource => f.write_str("resource"),
            HostTypeTag::Class(name) => write!(f, "class:{name}"),
            HostTypeTag::Interface(methods) => {
                write!(f, "interface:{}", methods.join(","))
            }
            HostTypeTag::ResourceClass(name) => write!(f, "resource:{name}"),
        }
    }
}

/// Answers host-defined type questions during schema validation.
pub trait TypeOracle: Send + Sync {
    /// Whether `value` satisfies `tag`. Implementations should be permissive
    /// for values they cannot interpret.
    fn value_satisfies(&self, tag: &HostTypeTag, value: &Value) -> bool;
}

impl fmt::Debug for dyn TypeOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TypeOracle")
    }
}
