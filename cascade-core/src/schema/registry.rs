//! Schema registry: one cached, closed-world schema per target type.

use crate::error::AiError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde_json::Value;
use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

/// Longest label accepted by strict structured-output backends
pub const MAX_LABEL_LEN: usize = 64;

/// Label used when neither the raw name nor the fallback survive sanitizing
pub const DEFAULT_LABEL: &str = "CascadeSchema";

/// Registered schema metadata for one target type.
pub struct SchemaEntry {
    pub type_id: TypeId,
    /// Full Rust type path, e.g. `my_app::plan::Assumptions`
    pub qualified_name: String,
    /// Label declared to backends
    pub label: String,
    /// Closed schema document
    pub schema: Value,
    /// Module the type is defined in
    pub module: String,
    validator: jsonschema::Validator,
}

impl SchemaEntry {
    pub fn validator(&self) -> &jsonschema::Validator {
        &self.validator
    }

    /// Type name without module path or generic arguments
    pub fn bare_name(&self) -> &str {
        bare_type_name(&self.qualified_name)
    }
}

impl fmt::Debug for SchemaEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaEntry")
            .field("qualified_name", &self.qualified_name)
            .field("label", &self.label)
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}

/// Cache of [`SchemaEntry`] keyed by type identity.
///
/// Owned by the application context and shared by reference; registration
/// is idempotent and safe to race.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entries: DashMap<TypeId, Arc<SchemaEntry>>,
    labels: DashMap<String, TypeId>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or refresh) the schema for `T`.
    ///
    /// An unchanged entry is returned as the same `Arc`. Fails if another
    /// type already owns the sanitized label.
    pub fn register<T: JsonSchema + 'static>(&self) -> Result<Arc<SchemaEntry>, AiError> {
        let type_id = TypeId::of::<T>();
        let qualified_name = std::any::type_name::<T>().to_string();
        let declared = T::schema_name();
        let label = sanitize_label(Some(declared.as_ref()), bare_type_name(&qualified_name));

        let schema = close_objects(serde_json::to_value(schemars::schema_for!(T))?);

        if let Some(current) = self.entries.get(&type_id) {
            if current.schema == schema && current.label == label {
                return Ok(current.value().clone());
            }
        }

        let validator = jsonschema::options().build(&schema).map_err(|e| {
            AiError::configuration(format!(
                "Failed to compile schema for {}: {}",
                qualified_name, e
            ))
        })?;

        // Only a compiled schema may own its label
        self.claim_label(&label, type_id, &qualified_name)?;

        let module = qualified_name
            .rsplit_once("::")
            .map(|(module, _)| module.to_string())
            .unwrap_or_default();

        tracing::debug!("Registering schema {} as '{}'", qualified_name, label);
        let fresh = Arc::new(SchemaEntry {
            type_id,
            qualified_name,
            label,
            schema,
            module,
            validator,
        });
        self.entries.insert(type_id, fresh.clone());
        Ok(fresh)
    }

    /// Return the entry for `T`, registering it on first access
    pub fn get_or_register<T: JsonSchema + 'static>(&self) -> Result<Arc<SchemaEntry>, AiError> {
        match self.get::<T>() {
            Some(entry) => Ok(entry),
            None => self.register::<T>(),
        }
    }

    pub fn get<T: 'static>(&self) -> Option<Arc<SchemaEntry>> {
        self.entries
            .get(&TypeId::of::<T>())
            .map(|entry| entry.value().clone())
    }

    /// Snapshot of every registered entry, for diagnostics
    pub fn entries(&self) -> Vec<Arc<SchemaEntry>> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn claim_label(&self, label: &str, type_id: TypeId, qualified_name: &str) -> Result<(), AiError> {
        match self.labels.entry(label.to_string()) {
            Entry::Occupied(owner) if *owner.get() != type_id => {
                let existing = self
                    .entries
                    .iter()
                    .find(|e| e.type_id == *owner.get())
                    .map(|e| e.qualified_name.clone())
                    .unwrap_or_else(|| "another type".to_string());
                Err(AiError::LabelCollision {
                    label: label.to_string(),
                    existing,
                    incoming: qualified_name.to_string(),
                })
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(vacant) => {
                vacant.insert(type_id);
                Ok(())
            }
        }
    }
}

/// Make `raw` acceptable as a structured-output schema name.
///
/// Characters outside `[A-Za-z0-9_-]` become `_`, trailing `_` are dropped
/// and the result is capped at [`MAX_LABEL_LEN`]. Empty input falls back to
/// `fallback`, then to [`DEFAULT_LABEL`].
pub fn sanitize_label(raw: Option<&str>, fallback: &str) -> String {
    fn scrub(name: &str) -> String {
        let replaced: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .take(MAX_LABEL_LEN)
            .collect();
        replaced.trim_end_matches('_').to_string()
    }

    let primary = raw.filter(|name| !name.is_empty()).unwrap_or(fallback);
    let sanitized = scrub(primary);
    if !sanitized.is_empty() {
        return sanitized;
    }
    let sanitized = scrub(fallback);
    if sanitized.is_empty() {
        DEFAULT_LABEL.to_string()
    } else {
        sanitized
    }
}

/// `a::b::Name<c::D>` -> `Name`
pub fn bare_type_name(type_name: &str) -> &str {
    let without_generics = type_name.split('<').next().unwrap_or(type_name);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}

/// Mark every object node that does not already constrain extra keys as
/// `additionalProperties: false`. Map-shaped objects keep their value schema.
pub fn close_objects(node: Value) -> Value {
    match node {
        Value::Object(map) => {
            let is_object = match map.get("type") {
                Some(Value::String(t)) => t == "object",
                Some(Value::Array(types)) => types.iter().any(|t| t == "object"),
                _ => false,
            };

            let mut closed: serde_json::Map<String, Value> = map
                .into_iter()
                .map(|(key, value)| {
                    if key == "additionalProperties" {
                        (key, value)
                    } else {
                        (key, close_objects(value))
                    }
                })
                .collect();

            if is_object && !closed.contains_key("additionalProperties") {
                closed.insert("additionalProperties".into(), Value::Bool(false));
            }
            Value::Object(closed)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(close_objects).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Lever {
        name: String,
        options: Vec<String>,
        detail: LeverDetail,
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct LeverDetail {
        score: u32,
    }

    mod first {
        #[derive(schemars::JsonSchema)]
        pub struct Plan {
            pub title: String,
        }
    }

    mod second {
        #[derive(schemars::JsonSchema)]
        pub struct Plan {
            pub steps: Vec<String>,
        }
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label(Some("planexe.Lever"), "x"), "planexe_Lever");
        assert_eq!(sanitize_label(Some("Lever..."), "x"), "Lever");
        assert_eq!(sanitize_label(Some("_private"), "x"), "_private");
        assert_eq!(sanitize_label(None, "Fallback Name"), "Fallback_Name");
        assert_eq!(sanitize_label(Some(""), "ok-name"), "ok-name");
        assert_eq!(sanitize_label(Some("..."), "###"), DEFAULT_LABEL);
        assert_eq!(sanitize_label(Some(&"a".repeat(100)), "x").len(), MAX_LABEL_LEN);
    }

    #[test]
    fn test_bare_type_name() {
        assert_eq!(bare_type_name("a::b::Name"), "Name");
        assert_eq!(bare_type_name("a::Wrapper<b::Inner>"), "Wrapper");
        assert_eq!(bare_type_name("Plain"), "Plain");
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = SchemaRegistry::new();
        let first = registry.register::<Lever>().unwrap();
        let second = registry.register::<Lever>().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(first.label, "Lever");
        assert!(first.qualified_name.ends_with("::Lever"));
        assert!(first.module.ends_with("registry::tests"));
    }

    #[test]
    fn test_schema_is_closed_recursively() {
        let registry = SchemaRegistry::new();
        let entry = registry.register::<Lever>().unwrap();

        assert_eq!(entry.schema["additionalProperties"], json!(false));
        assert_eq!(
            entry.schema["$defs"]["LeverDetail"]["additionalProperties"],
            json!(false)
        );
    }

    #[test]
    fn test_close_objects_keeps_map_values() {
        let closed = close_objects(json!({
            "type": "object",
            "properties": {
                "tags": {"type": "object", "additionalProperties": {"type": "string"}},
                "inner": {"type": ["object", "null"], "properties": {}}
            }
        }));

        assert_eq!(closed["additionalProperties"], json!(false));
        assert_eq!(
            closed["properties"]["tags"]["additionalProperties"],
            json!({"type": "string"})
        );
        assert_eq!(
            closed["properties"]["inner"]["additionalProperties"],
            json!(false)
        );
    }

    #[test]
    fn test_label_collision_is_rejected() {
        let registry = SchemaRegistry::new();
        registry.register::<first::Plan>().unwrap();

        let err = registry.register::<second::Plan>().unwrap_err();
        match err {
            AiError::LabelCollision {
                label,
                existing,
                incoming,
            } => {
                assert_eq!(label, "Plan");
                assert!(existing.ends_with("first::Plan"));
                assert!(incoming.ends_with("second::Plan"));
            }
            other => panic!("expected collision, got {other:?}"),
        }
        assert_eq!(registry.len(), 1);
    }

    struct BadPattern;

    impl JsonSchema for BadPattern {
        fn schema_name() -> std::borrow::Cow<'static, str> {
            "Ticket".into()
        }

        fn json_schema(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
            schemars::json_schema!({
                "type": "object",
                "properties": { "code": { "type": "string", "pattern": "(unclosed" } }
            })
        }
    }

    #[derive(JsonSchema)]
    #[schemars(rename = "Ticket")]
    #[allow(dead_code)]
    struct Ticket {
        code: String,
    }

    #[test]
    fn test_failed_compile_leaves_label_free() {
        let registry = SchemaRegistry::new();

        let err = registry.register::<BadPattern>().unwrap_err();
        assert!(matches!(err, AiError::Configuration(_)));
        assert!(registry.is_empty());

        let entry = registry.register::<Ticket>().unwrap();
        assert_eq!(entry.label, "Ticket");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_or_register() {
        let registry = SchemaRegistry::new();
        assert!(registry.get::<Lever>().is_none());
        let entry = registry.get_or_register::<Lever>().unwrap();
        assert!(Arc::ptr_eq(&entry, &registry.get::<Lever>().unwrap()));
        assert_eq!(registry.entries().len(), 1);
    }
}
