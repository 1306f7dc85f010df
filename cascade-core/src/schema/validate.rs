//! Lenient validation of structured payloads.
//!
//! Validation runs in explicit phases:
//! 1. [`check`] the payload against the closed schema
//! 2. [`repair`] missing top-level fields from the policy
//! 3. [`check`] once more, then deserialize into the target type
//!
//! Undeclared properties are pruned before checking, so they never fail a
//! payload and never reach the returned instance.

use super::policy::{PolicyStore, SchemaPolicy};
use super::registry::{SchemaEntry, SchemaRegistry};
use crate::error::AiError;
use jsonschema::error::ValidationErrorKind;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Placeholder used for free-text fields that had to be defaulted
pub const TEXT_PLACEHOLDER: &str = "N/A";

const MAX_DEFAULT_DEPTH: usize = 16;

/// A validated instance together with the schema it was checked against.
#[derive(Debug, Clone)]
pub struct Structured<T> {
    pub value: T,
    /// Payload as accepted, pruned to the declared shape
    pub payload: Value,
    pub entry: Arc<SchemaEntry>,
    /// Top-level fields that were filled in by repair
    pub repaired: Vec<String>,
}

/// Failure of one [`check`] pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Violations {
    /// Required top-level properties absent from the payload
    pub missing: Vec<String>,
    /// Every other violation, rendered as `path: message`
    pub fatal: Vec<String>,
}

impl Violations {
    /// Whether repair can possibly fix this payload
    pub fn only_missing(&self) -> bool {
        self.fatal.is_empty() && !self.missing.is_empty()
    }

    fn into_messages(self) -> Vec<String> {
        self.missing
            .into_iter()
            .map(|field| format!("missing required field '{}'", field))
            .chain(self.fatal)
            .collect()
    }
}

/// Structural check against the entry's closed schema.
///
/// Extra properties are ignored here; see [`prune`].
pub fn check(entry: &SchemaEntry, payload: &Value) -> Result<(), Violations> {
    let mut violations = Violations::default();
    for error in entry.validator().iter_errors(payload) {
        let path = error.instance_path.to_string();
        match &error.kind {
            ValidationErrorKind::AdditionalProperties { .. } => {}
            ValidationErrorKind::Required { property } if is_root(&path) => {
                let field = property
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| property.to_string());
                violations.missing.push(field);
            }
            _ => {
                let at = if path.is_empty() { "/" } else { path.as_str() };
                violations.fatal.push(format!("{}: {}", at, error));
            }
        }
    }

    if violations.missing.is_empty() && violations.fatal.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

fn is_root(path: &str) -> bool {
    path.is_empty() || path == "/"
}

/// Fill each missing field from the policy.
///
/// Returns the patched payload and the filled field names, or the fields
/// that could not be recovered.
pub fn repair(
    entry: &SchemaEntry,
    payload: &Value,
    missing: &[String],
    policy: &SchemaPolicy,
) -> Result<(Value, Vec<String>), Vec<String>> {
    let Value::Object(fields) = payload else {
        return Err(missing.to_vec());
    };

    let mut patched = fields.clone();
    let mut filled = Vec::with_capacity(missing.len());
    let mut unrecoverable = Vec::new();

    for field in missing {
        if let Some(value) = policy.default_overrides.get(field) {
            patched.insert(field.clone(), value.clone());
            filled.push(field.clone());
            continue;
        }
        if policy.required.contains(field) || !policy.allow_missing {
            unrecoverable.push(field.clone());
            continue;
        }
        let property = entry
            .schema
            .get("properties")
            .and_then(|properties| properties.get(field))
            .unwrap_or(&Value::Null);
        patched.insert(field.clone(), default_for(property, &entry.schema, 0));
        filled.push(field.clone());
    }

    if unrecoverable.is_empty() {
        Ok((Value::Object(patched), filled))
    } else {
        Err(unrecoverable)
    }
}

/// Derive a placeholder value from a schema node
pub fn default_for(node: &Value, root: &Value, depth: usize) -> Value {
    if depth > MAX_DEFAULT_DEPTH {
        return Value::Null;
    }
    let node = resolve(node, root);

    if let Some(constant) = node.get("const") {
        return constant.clone();
    }
    if let Some(first) = node
        .get("enum")
        .and_then(Value::as_array)
        .and_then(|values| values.first())
    {
        return first.clone();
    }
    for combinator in ["oneOf", "anyOf", "allOf"] {
        if let Some(first) = node
            .get(combinator)
            .and_then(Value::as_array)
            .and_then(|branches| branches.first())
        {
            return default_for(first, root, depth + 1);
        }
    }

    let kind = match node.get("type") {
        Some(Value::String(kind)) => kind.as_str(),
        Some(Value::Array(kinds)) => kinds
            .iter()
            .filter_map(Value::as_str)
            .find(|kind| *kind != "null")
            .unwrap_or("null"),
        _ => return Value::Null,
    };

    match kind {
        "string" => Value::String(TEXT_PLACEHOLDER.to_string()),
        "integer" | "number" => Value::from(0),
        "boolean" => Value::Bool(false),
        "array" => Value::Array(Vec::new()),
        "object" => {
            let mut object = Map::new();
            let required = node.get("required").and_then(Value::as_array);
            let properties = node.get("properties");
            for name in required.into_iter().flatten().filter_map(Value::as_str) {
                let child = properties
                    .and_then(|properties| properties.get(name))
                    .unwrap_or(&Value::Null);
                object.insert(name.to_string(), default_for(child, root, depth + 1));
            }
            Value::Object(object)
        }
        _ => Value::Null,
    }
}

/// Drop properties the closed schema does not declare.
pub fn prune(value: &mut Value, node: &Value, root: &Value, depth: usize) {
    if depth > MAX_DEFAULT_DEPTH {
        return;
    }
    let node = resolve(node, root);

    match value {
        Value::Object(fields) => {
            match node.get("additionalProperties") {
                Some(Value::Bool(false)) => {
                    let declared = node.get("properties").and_then(Value::as_object);
                    fields.retain(|key, _| declared.is_some_and(|d| d.contains_key(key)));
                }
                Some(values @ Value::Object(_)) => {
                    for field in fields.values_mut() {
                        prune(field, values, root, depth + 1);
                    }
                }
                _ => {}
            }
            if let Some(properties) = node.get("properties").and_then(Value::as_object) {
                for (key, field) in fields.iter_mut() {
                    if let Some(child) = properties.get(key) {
                        prune(field, child, root, depth + 1);
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(child) = node.get("items") {
                for item in items.iter_mut() {
                    prune(item, child, root, depth + 1);
                }
            }
        }
        _ => return,
    }

    // Optional values are `anyOf: [T, null]`; only an unambiguous branch is followed
    for combinator in ["anyOf", "oneOf"] {
        if let Some(branches) = node.get(combinator).and_then(Value::as_array) {
            let mut concrete = branches.iter().filter(|b| b.get("type") != Some(&Value::from("null")));
            if let (Some(only), None) = (concrete.next(), concrete.next()) {
                prune(value, only, root, depth + 1);
            }
        }
    }
}

fn resolve<'a>(node: &'a Value, root: &'a Value) -> &'a Value {
    let mut current = node;
    for _ in 0..MAX_DEFAULT_DEPTH {
        let Some(reference) = current.get("$ref").and_then(Value::as_str) else {
            break;
        };
        let Some(target) = reference
            .strip_prefix('#')
            .and_then(|pointer| root.pointer(pointer))
        else {
            break;
        };
        current = target;
    }
    current
}

/// Validate a payload against an entry and policy, repairing at most once.
pub fn validate_payload(
    entry: &SchemaEntry,
    policy: &SchemaPolicy,
    mut payload: Value,
) -> Result<(Value, Vec<String>), AiError> {
    prune(&mut payload, &entry.schema, &entry.schema, 0);

    let original = match check(entry, &payload) {
        Ok(()) => return Ok((payload, Vec::new())),
        Err(violations) => violations,
    };

    if !original.only_missing() {
        return Err(AiError::schema_validation(
            &entry.label,
            original.into_messages(),
        ));
    }

    match repair(entry, &payload, &original.missing, policy) {
        Ok((patched, filled)) => match check(entry, &patched) {
            Ok(()) => {
                tracing::warn!(
                    "Repaired {} missing field(s) for '{}': {}",
                    filled.len(),
                    entry.label,
                    filled.join(", ")
                );
                Ok((patched, filled))
            }
            Err(_) => Err(AiError::schema_validation(
                &entry.label,
                original.into_messages(),
            )),
        },
        Err(unrecoverable) => {
            tracing::debug!(
                "Cannot repair '{}', unrecoverable fields: {}",
                entry.label,
                unrecoverable.join(", ")
            );
            Err(AiError::schema_validation(
                &entry.label,
                original.into_messages(),
            ))
        }
    }
}

/// Validates payloads for registered types using the shared policy store.
#[derive(Debug, Clone, Default)]
pub struct SchemaValidator {
    registry: Arc<SchemaRegistry>,
    policies: Arc<PolicyStore>,
}

impl SchemaValidator {
    pub fn new(registry: Arc<SchemaRegistry>, policies: Arc<PolicyStore>) -> Self {
        Self { registry, policies }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    /// Check `payload` as a `T`, repairing missing fields once if allowed
    pub fn validate<T>(&self, payload: Value) -> Result<Structured<T>, AiError>
    where
        T: JsonSchema + DeserializeOwned + 'static,
    {
        let entry = self.registry.get_or_register::<T>()?;
        let policy = self.policies.lookup(&entry.qualified_name);
        let (payload, repaired) = validate_payload(&entry, &policy, payload)?;

        let value = serde_json::from_value(payload.clone())
            .map_err(|e| AiError::schema_validation(&entry.label, vec![e.to_string()]))?;

        Ok(Structured {
            value,
            payload,
            entry,
            repaired,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, JsonSchema, PartialEq)]
    #[serde(rename_all = "lowercase")]
    enum Purpose {
        Business,
        Personal,
        Other,
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Topic {
        topic: String,
        purpose: Purpose,
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Assumptions {
        summary: String,
        assumptions: Vec<String>,
        confidence: u8,
        reviewed: bool,
        purpose: Purpose,
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Review {
        title: String,
        findings: Vec<Finding>,
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Finding {
        label: String,
    }

    fn validator() -> SchemaValidator {
        SchemaValidator::default()
    }

    #[test]
    fn test_valid_payload_passes_untouched() {
        let result = validator()
            .validate::<Topic>(json!({"topic": "Solar farm", "purpose": "business"}))
            .unwrap();
        assert_eq!(result.value.topic, "Solar farm");
        assert_eq!(result.value.purpose, Purpose::Business);
        assert!(result.repaired.is_empty());
        assert_eq!(result.entry.label, "Topic");
    }

    #[test]
    fn test_policy_overrides_fill_empty_payload() {
        let validator = validator();
        validator.policies().set_policy::<Topic>(
            SchemaPolicy::new()
                .default_value("topic", json!("TBD"))
                .default_value("purpose", json!("other")),
        );

        let result = validator.validate::<Topic>(json!({})).unwrap();
        assert_eq!(result.value.topic, "TBD");
        assert_eq!(result.value.purpose, Purpose::Other);
        assert_eq!(result.repaired.len(), 2);
    }

    #[test]
    fn test_type_defaults_when_missing_allowed() {
        let result = validator()
            .validate::<Assumptions>(json!({"summary": "short"}))
            .unwrap();
        assert!(result.value.assumptions.is_empty());
        assert_eq!(result.value.confidence, 0);
        assert!(!result.value.reviewed);
        assert_eq!(result.value.purpose, Purpose::Business);
        assert_eq!(result.value.summary, "short");
    }

    #[test]
    fn test_missing_rejected_without_allow_missing() {
        let validator = validator();
        validator
            .policies()
            .set_policy_by_name("Assumptions", SchemaPolicy::new().allow_missing(false));

        let err = validator
            .validate::<Assumptions>(json!({"summary": "short"}))
            .unwrap_err();
        match err {
            AiError::SchemaValidation { label, errors } => {
                assert_eq!(label, "Assumptions");
                assert!(errors.iter().any(|e| e.contains("assumptions")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_required_subset_is_never_defaulted() {
        let validator = validator();
        validator
            .policies()
            .set_policy::<Topic>(SchemaPolicy::new().require("topic"));

        let err = validator
            .validate::<Topic>(json!({"purpose": "personal"}))
            .unwrap_err();
        assert!(matches!(err, AiError::SchemaValidation { .. }));
    }

    #[test]
    fn test_bad_override_reports_original_error() {
        let validator = validator();
        validator.policies().set_policy::<Topic>(
            SchemaPolicy::new().default_value("purpose", json!("unknown")),
        );

        let err = validator
            .validate::<Topic>(json!({"topic": "x"}))
            .unwrap_err();
        match err {
            AiError::SchemaValidation { errors, .. } => {
                assert_eq!(errors, vec!["missing required field 'purpose'".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_type_mismatch_is_not_repaired() {
        let err = validator()
            .validate::<Topic>(json!({"topic": 7}))
            .unwrap_err();
        assert!(matches!(err, AiError::SchemaValidation { .. }));
    }

    #[test]
    fn test_extra_properties_are_dropped() {
        let result = validator()
            .validate::<Review>(json!({
                "title": "Risks",
                "severity": "high",
                "findings": [{"label": "budget", "note": "drop me"}]
            }))
            .unwrap();

        assert_eq!(
            result.payload,
            json!({"title": "Risks", "findings": [{"label": "budget"}]})
        );
        assert_eq!(result.value.findings[0].label, "budget");
    }

    #[test]
    fn test_default_for_nested_object() {
        let schema = json!({
            "type": "object",
            "properties": {"inner": {"$ref": "#/$defs/Inner"}},
            "$defs": {
                "Inner": {
                    "type": "object",
                    "properties": {"name": {"type": "string"}, "tags": {"type": "array"}},
                    "required": ["name", "tags"]
                }
            }
        });
        let value = default_for(&schema["properties"]["inner"], &schema, 0);
        assert_eq!(value, json!({"name": TEXT_PLACEHOLDER, "tags": []}));
    }
}
