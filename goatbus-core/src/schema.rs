use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use goatbus_contracts::type_oracle::{HostTypeTag, TypeOracle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::event::Payload;

/// Type tag attached to a schema field.
///
/// Host-defined tags (`node`, `resource`, nominal classes, structural
/// interfaces) defer to a bound [`TypeOracle`]; without one they pass, as do
/// tags the parser does not recognise.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Mapping,
    Vector2,
    Vector3,
    Host(HostTypeTag),
    Unknown(String),
}

impl FieldType {
    /// Parses a tag spelling. Unrecognised spellings become
    /// [`FieldType::Unknown`] and always validate.
    pub fn parse(tag: &str) -> FieldType {
        match tag {
            "string" => FieldType::String,
            "integer" | "int" => FieldType::Integer,
            "float" => FieldType::Float,
            "boolean" | "bool" => FieldType::Boolean,
            "array" => FieldType::Array,
            "mapping" | "dictionary" => FieldType::Mapping,
            "2d-vector" | "vector2" => FieldType::Vector2,
            "3d-vector" | "vector3" => FieldType::Vector3,
            "node" => FieldType::Host(HostTypeTag::Node),
            "resource" => FieldType::Host(HostTypeTag::Resource),
            _ => {
                if let Some(name) = tag.strip_prefix("class:") {
                    FieldType::Host(HostTypeTag::Class(name.to_string()))
                } else if let Some(methods) = tag.strip_prefix("interface:") {
                    FieldType::Host(HostTypeTag::Interface(
                        methods.split(',').map(|m| m.trim().to_string()).collect(),
                    ))
                } else if let Some(name) = tag.strip_prefix("resource:") {
                    FieldType::Host(HostTypeTag::ResourceClass(name.to_string()))
                } else {
                    FieldType::Unknown(tag.to_string())
                }
            }
        }
    }

    fn matches(&self, value: &Value, oracle: Option<&Arc<dyn TypeOracle>>) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Mapping => value.is_object(),
            FieldType::Vector2 => is_vector(value, 2),
            FieldType::Vector3 => is_vector(value, 3),
            FieldType::Host(tag) => oracle.is_none_or(|o| o.value_satisfies(tag, value)),
            FieldType::Unknown(_) => true,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => f.write_str("string"),
            FieldType::Integer => f.write_str("integer"),
            FieldType::Float => f.write_str("float"),
            FieldType::Boolean => f.write_str("boolean"),
            FieldType::Array => f.write_str("array"),
            FieldType::Mapping => f.write_str("mapping"),
            FieldType::Vector2 => f.write_str("2d-vector"),
            FieldType::Vector3 => f.write_str("3d-vector"),
            FieldType::Host(tag) => write!(f, "{tag}"),
            FieldType::Unknown(tag) => f.write_str(tag),
        }
    }
}

/// Accepts `[x, y]` / `[x, y, z]` arrays or `{x, y[, z]}` objects with
/// numeric components.
fn is_vector(value: &Value, dimensions: usize) -> bool {
    match value {
        Value::Array(items) => items.len() == dimensions && items.iter().all(Value::is_number),
        Value::Object(map) => {
            let keys = ["x", "y", "z"];
            map.len() == dimensions
                && keys[..dimensions]
                    .iter()
                    .all(|k| map.get(*k).is_some_and(Value::is_number))
        }
        _ => false,
    }
}

/// Wire shape for registering a schema.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SchemaDef {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    #[serde(default)]
    pub field_types: HashMap<String, String>,
}

/// A registered per-event field contract.
#[derive(Clone, Debug)]
pub struct EventSchema {
    pub event: String,
    pub required: Vec<String>,
    pub optional: Vec<String>,
    pub field_types: HashMap<String, FieldType>,
}

impl EventSchema {
    /// Normalises a definition: a field listed as required is dropped from
    /// the optional list so each name appears in at most one of the two.
    pub fn from_def(event: impl Into<String>, def: SchemaDef) -> Self {
        let event = event.into();
        let mut optional = def.optional;
        optional.retain(|field| {
            let duplicated = def.required.contains(field);
            if duplicated {
                warn!(event = %event, field = %field, "field listed as both required and optional; keeping required");
            }
            !duplicated
        });
        let field_types = def
            .field_types
            .into_iter()
            .map(|(field, tag)| (field, FieldType::parse(&tag)))
            .collect();
        Self {
            event,
            required: def.required,
            optional,
            field_types,
        }
    }
}

/// Outcome of validating a payload against a registered schema.
#[derive(Clone, Debug, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }
}

/// Stores per-event-name field contracts and validates payloads.
pub struct SchemaRegistry {
    schemas: DashMap<String, EventSchema>,
    oracle: Option<Arc<dyn TypeOracle>>,
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("schemas", &self.schemas.len())
            .field("oracle", &self.oracle.is_some())
            .finish()
    }
}

impl SchemaRegistry {
    pub fn new(oracle: Option<Arc<dyn TypeOracle>>) -> Self {
        Self {
            schemas: DashMap::new(),
            oracle,
        }
    }

    /// Registers or replaces the schema for one event name.
    pub fn register(&self, event: impl Into<String>, def: SchemaDef) {
        let event = event.into();
        let schema = EventSchema::from_def(event.clone(), def);
        self.schemas.insert(event, schema);
    }

    pub fn register_bulk(&self, defs: HashMap<String, SchemaDef>) {
        for (event, def) in defs {
            self.register(event, def);
        }
    }

    pub fn contains(&self, event: &str) -> bool {
        self.schemas.contains_key(event)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Validates a payload. Events without a registered schema pass; extra
    /// fields are permitted.
    pub fn validate(&self, event: &str, payload: &Payload) -> ValidationReport {
        let Some(schema) = self.schemas.get(event) else {
            return ValidationReport::ok();
        };

        let mut errors = Vec::new();
        for field in &schema.required {
            if !payload.contains_key(field) {
                errors.push(format!("Missing required field: {field}"));
            }
        }
        for (field, expected) in &schema.field_types {
            if let Some(value) = payload.get(field) {
                if !expected.matches(value, self.oracle.as_ref()) {
                    errors.push(format!("Field '{field}' expected {expected}"));
                }
            }
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload;

    fn move_schema() -> SchemaDef {
        SchemaDef {
            required: vec!["x".to_string(), "y".to_string()],
            optional: vec!["speed".to_string()],
            field_types: [
                ("x".to_string(), "float".to_string()),
                ("y".to_string(), "float".to_string()),
                ("speed".to_string(), "float".to_string()),
            ]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn valid_payload_passes() {
        let registry = SchemaRegistry::new(None);
        registry.register("move", move_schema());

        let report = registry.validate("move", &payload! { "x" => 1.0, "y" => 2.0 });
        assert!(report.valid);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn missing_required_field_is_reported_by_name() {
        let registry = SchemaRegistry::new(None);
        registry.register("move", move_schema());

        let report = registry.validate("move", &payload! { "x" => 1.0 });
        assert!(!report.valid);
        assert!(report.errors.contains(&"Missing required field: y".to_string()));
    }

    #[test]
    fn wrong_type_is_an_error_and_extra_fields_pass() {
        let registry = SchemaRegistry::new(None);
        registry.register("move", move_schema());

        let report = registry.validate(
            "move",
            &payload! { "x" => "fast", "y" => 2.0, "bonus" => true },
        );
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("'x' expected float"));
    }

    #[test]
    fn unknown_tags_pass() {
        let registry = SchemaRegistry::new(None);
        registry.register(
            "spawn",
            SchemaDef {
                required: vec!["thing".to_string()],
                field_types: [("thing".to_string(), "wobbly".to_string())]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
        );

        let report = registry.validate("spawn", &payload! { "thing" => 42 });
        assert!(report.valid);
    }

    #[test]
    fn host_tags_pass_without_an_oracle() {
        let registry = SchemaRegistry::new(None);
        registry.register(
            "spawn",
            SchemaDef {
                required: vec!["scene".to_string()],
                field_types: [("scene".to_string(), "node".to_string())]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
        );
        assert!(registry.validate("spawn", &payload! { "scene" => "Player" }).valid);
    }

    #[test]
    fn host_tags_consult_the_oracle() {
        struct DenyAll;
        impl TypeOracle for DenyAll {
            fn value_satisfies(&self, _tag: &HostTypeTag, _value: &Value) -> bool {
                false
            }
        }

        let registry = SchemaRegistry::new(Some(Arc::new(DenyAll)));
        registry.register(
            "spawn",
            SchemaDef {
                required: vec!["scene".to_string()],
                field_types: [("scene".to_string(), "class:Enemy".to_string())]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
        );
        assert!(!registry.validate("spawn", &payload! { "scene" => "x" }).valid);
    }

    #[test]
    fn vectors_accept_arrays_and_objects() {
        let registry = SchemaRegistry::new(None);
        registry.register(
            "aim",
            SchemaDef {
                required: vec!["dir".to_string()],
                field_types: [("dir".to_string(), "2d-vector".to_string())]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
        );

        assert!(registry.validate("aim", &payload! { "dir" => [1.0, 2.0] }).valid);
        assert!(
            registry
                .validate("aim", &payload! { "dir" => ::serde_json::json!({ "x": 1.0, "y": 2.0 }) })
                .valid
        );
        assert!(!registry.validate("aim", &payload! { "dir" => [1.0] }).valid);
    }

    #[test]
    fn reregistration_replaces_and_dedupes_required_optional() {
        let registry = SchemaRegistry::new(None);
        registry.register(
            "hit",
            SchemaDef {
                required: vec!["damage".to_string()],
                optional: vec!["damage".to_string(), "source".to_string()],
                ..Default::default()
            },
        );
        // Re-register with a different contract.
        registry.register(
            "hit",
            SchemaDef {
                required: vec!["amount".to_string()],
                ..Default::default()
            },
        );

        let report = registry.validate("hit", &payload! { "damage" => 3 });
        assert!(report.errors.contains(&"Missing required field: amount".to_string()));
    }
}
