//! Schema-driven validation and config diffing.
//!
//! Every domain model (capture thread, pipeline, plugin instance) carries an open key/value
//! config. When a [`SchemaDefinition`] is known for it, the functions here type-check,
//! default, project and diff that config. They are pure and never panic on malformed input.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Open key/value configuration blob as exchanged with remote nodes.
pub type Config = Map<String, Value>;

/// Immutable description of a configurable unit, supplied by a schema catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<SchemaOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaOptions {
    /// Instances of this schema may act as collector or collected in a link.
    #[serde(default)]
    pub linkable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub key: String,
    /// `integer`, `float`, `boolean`, `string`, `object` or `array(<type>)`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, rename = "allowedValues", skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<AllowedValues>,
}

/// Constraint on field values: a numeric interval or an enumerated set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AllowedValues {
    Set(Vec<Value>),
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
}

impl std::fmt::Display for AllowedValues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllowedValues::Set(values) => {
                let items: Vec<String> = values.iter().map(Value::to_string).collect();
                write!(f, "one of [{}]", items.join(", "))
            }
            AllowedValues::Range { min, max } => {
                let bound = |b: &Option<f64>| b.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
                write!(f, "[{}, {}]", bound(min), bound(max))
            }
        }
    }
}

impl SchemaDefinition {
    pub fn field(&self, key: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.key == key)
    }

    pub fn is_linkable(&self) -> bool {
        self.options.as_ref().is_some_and(|o| o.linkable)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FieldType {
    Integer,
    Float,
    Boolean,
    String,
    Object,
    Array(Box<FieldType>),
}

impl FieldType {
    fn parse(kind: &str) -> Option<Self> {
        match kind.trim() {
            "integer" => Some(Self::Integer),
            "float" => Some(Self::Float),
            "boolean" => Some(Self::Boolean),
            "string" => Some(Self::String),
            "object" => Some(Self::Object),
            other => {
                let inner = other.strip_prefix("array(")?.strip_suffix(')')?;
                Some(Self::Array(Box::new(Self::parse(inner)?)))
            }
        }
    }

    fn check(&self, value: &Value, allowed: Option<&AllowedValues>) -> bool {
        match self {
            FieldType::Integer => {
                let is_integer = value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|v| v.is_finite() && v.fract() == 0.0);
                is_integer && within_range(value, allowed)
            }
            FieldType::Float => value.is_number() && within_range(value, allowed),
            FieldType::Boolean => value.is_boolean(),
            FieldType::String => match (value, allowed) {
                (Value::String(_), Some(AllowedValues::Set(set))) => set.contains(value),
                (Value::String(_), _) => true,
                _ => false,
            },
            FieldType::Object => true,
            FieldType::Array(inner) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|item| inner.check(item, allowed))),
        }
    }
}

fn within_range(value: &Value, allowed: Option<&AllowedValues>) -> bool {
    let Some(AllowedValues::Range { min, max }) = allowed else {
        return true;
    };
    let Some(v) = value.as_f64() else {
        return false;
    };
    min.is_none_or(|m| v >= m) && max.is_none_or(|m| v <= m)
}

/// Structural type check of `value` against a schema type string.
///
/// Unknown or malformed type strings yield `false`.
pub fn check_type(value: &Value, kind: &str, allowed: Option<&AllowedValues>) -> bool {
    FieldType::parse(kind).is_some_and(|t| t.check(value, allowed))
}

/// Type-checks every key of `obj` the schema knows about. Unknown keys are ignored.
pub fn validate_against_schema(obj: &Config, schema: &SchemaDefinition) -> Vec<String> {
    let mut errors = Vec::new();
    for field in &schema.fields {
        let Some(value) = obj.get(&field.key) else {
            continue;
        };
        if value.is_null() || check_type(value, &field.kind, field.allowed_values.as_ref()) {
            continue;
        }
        let message = match &field.allowed_values {
            Some(allowed) => format!(
                "Invalid value for {}: received {}, expected {} within {}",
                field.key, value, field.kind, allowed
            ),
            None => format!(
                "Invalid value for {}: received {}, expected {}",
                field.key, value, field.kind
            ),
        };
        errors.push(message);
    }
    errors
}

/// Fills absent/null required fields (or all fields with `add_optionals`) from their declared default.
pub fn apply_defaults_to_object(mut obj: Config, schema: &SchemaDefinition, add_optionals: bool) -> Config {
    for field in &schema.fields {
        if !(field.required || add_optionals) {
            continue;
        }
        let absent = obj.get(&field.key).is_none_or(Value::is_null);
        if let (true, Some(default)) = (absent, &field.default) {
            obj.insert(field.key.clone(), default.clone());
        }
    }
    obj
}

pub fn missing_mandatory_fields(obj: &Config, schema: &SchemaDefinition) -> Vec<String> {
    schema
        .fields
        .iter()
        .filter(|f| f.required && obj.get(&f.key).is_none_or(Value::is_null))
        .map(|f| f.key.clone())
        .collect()
}

pub fn check_mandatory_fields(obj: &Config, schema: &SchemaDefinition) -> bool {
    missing_mandatory_fields(obj, schema).is_empty()
}

/// Full construction-time check: mandatory fields first, then types. All messages are collected.
pub fn validate_config(obj: &Config, schema: &SchemaDefinition) -> Result<(), ValidationError> {
    let mut messages: Vec<String> = missing_mandatory_fields(obj, schema)
        .into_iter()
        .map(|key| format!("Missing mandatory field {key}"))
        .collect();
    messages.extend(validate_against_schema(obj, schema));
    if messages.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(messages))
    }
}

/// Keeps only schema-known keys, defaulting required ones that are absent.
pub fn project_config(obj: &Config, schema: &SchemaDefinition) -> Config {
    let mut projected = Config::new();
    for field in &schema.fields {
        if let Some(value) = obj.get(&field.key) {
            projected.insert(field.key.clone(), value.clone());
        }
    }
    apply_defaults_to_object(projected, schema, false)
}

/// Shallow diff of `modified` against `original`: the keys of `modified` whose value changed.
///
/// Nested objects and arrays compare structurally. Returns `None` when nothing changed.
pub fn compute_differences(original: &Config, modified: &Config) -> Option<Config> {
    let patch: Config = modified
        .iter()
        .filter(|(key, value)| original.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    (!patch.is_empty()).then_some(patch)
}
