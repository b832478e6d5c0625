use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult, Violation};
use crate::logging::log_validation_failure;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Any,
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl FieldKind {
    fn matches(&self, v: &Value) -> bool {
        match self {
            FieldKind::Any => true,
            FieldKind::String => v.is_string(),
            FieldKind::Number => v.is_number(),
            FieldKind::Integer => v.is_i64() || v.is_u64(),
            FieldKind::Boolean => v.is_boolean(),
            FieldKind::Object => v.is_object(),
            FieldKind::Array => v.is_array(),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Any => "any",
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "type", default)]
    pub kind: FieldKind,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
}

impl FieldRule {
    pub fn required(kind: FieldKind) -> Self {
        Self {
            required: true,
            kind,
            allowed: None,
        }
    }

    pub fn optional(kind: FieldKind) -> Self {
        Self {
            required: false,
            kind,
            allowed: None,
        }
    }

    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.allowed = Some(values.into_iter().map(Into::into).collect());
        self
    }
}

/// Top-level field rules for a component type's state. Fields not listed
/// are accepted as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSchema {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldRule>,
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, rule: FieldRule) -> Self {
        self.fields.insert(name.into(), rule);
        self
    }
}

/// Per-field required/type/enum checks; reports every violation.
pub fn validate_state_against_schema(state: &Value, schema: &StateSchema) -> CoreResult<()> {
    let Some(obj) = state.as_object() else {
        return Err(CoreError::invalid("state", "expected object"));
    };
    let mut out = Vec::new();
    for (name, rule) in &schema.fields {
        match obj.get(name) {
            None | Some(Value::Null) => {
                if rule.required {
                    out.push(Violation::new(name.clone(), "required"));
                }
            }
            Some(v) => {
                if !rule.kind.matches(v) {
                    out.push(Violation::new(name.clone(), format!("expected {}", rule.kind.as_str())));
                    continue;
                }
                if let Some(allowed) = &rule.allowed {
                    if !allowed.contains(v) {
                        let names: Vec<String> = allowed.iter().map(|a| a.to_string()).collect();
                        out.push(Violation::new(name.clone(), format!("must be one of {}", names.join("|"))));
                    }
                }
            }
        }
    }
    if out.is_empty() {
        return Ok(());
    }
    let lines: Vec<String> = out.iter().map(|v| v.to_string()).collect();
    log_validation_failure("state", &lines);
    Err(CoreError::Validation(out))
}
