//! Tool registry: loads tool schemas once, then validates names and
//! input/output shapes against them.

use std::collections::HashMap;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OrchestratorError;
use crate::model::ExecutionTarget;

/// The primitive types a schema field may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            // Integers must not accept booleans, even though serde_json
            // represents both as distinct `Value` variants already - this
            // guards against callers handing us a JSON number disguised as
            // a bool-like value via untyped construction.
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::String => value.is_string(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }
}

/// A single declared field in a tool's params or output schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

/// A tool's full schema entry: its parameter shape, its output shape, and
/// the locale it runs in by default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(default)]
    pub params_schema: HashMap<String, FieldSchema>,
    #[serde(default)]
    pub output_schema: HashMap<String, FieldSchema>,
    #[serde(default)]
    pub default_execution_target: Option<ExecutionTarget>,
}

/// Where a registry's schemas come from. Implementations may read a file,
/// a config object, or hand back an embedded table; the registry doesn't
/// care which.
pub trait SchemaSource: Send + Sync {
    fn load_schemas(&self) -> anyhow::Result<HashMap<String, ToolSchema>>;
}

/// A schema source backed by a plain in-memory table, for tests and for
/// applications that build their tool set programmatically.
pub struct InMemorySchemaSource {
    schemas: HashMap<String, ToolSchema>,
}

impl InMemorySchemaSource {
    pub fn new(schemas: HashMap<String, ToolSchema>) -> Self {
        Self { schemas }
    }
}

impl SchemaSource for InMemorySchemaSource {
    fn load_schemas(&self) -> anyhow::Result<HashMap<String, ToolSchema>> {
        Ok(self.schemas.clone())
    }
}

/// A schema source backed by the §6.3 JSON document shape:
/// `{ tool_name: { params_schema: {...}, output_schema: {...} } }`.
pub struct JsonSchemaSource {
    document: Value,
}

impl JsonSchemaSource {
    pub fn new(document: Value) -> Self {
        Self { document }
    }
}

impl SchemaSource for JsonSchemaSource {
    fn load_schemas(&self) -> anyhow::Result<HashMap<String, ToolSchema>> {
        let table: HashMap<String, ToolSchema> = serde_json::from_value(self.document.clone())?;
        Ok(table)
    }
}

/// Validates tool names and the shape of inputs/outputs against schemas
/// loaded once at startup. Read-only after `load()`: no lock is needed for
/// lookups.
pub struct ToolRegistry {
    schemas: OnceCell<HashMap<String, ToolSchema>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            schemas: OnceCell::new(),
        }
    }

    /// Idempotent: the first call populates the registry from `source`;
    /// later calls are no-ops.
    pub fn load(&self, source: &dyn SchemaSource) -> anyhow::Result<()> {
        if self.schemas.get().is_some() {
            return Ok(());
        }
        let schemas = source.load_schemas()?;
        let _ = self.schemas.set(schemas);
        Ok(())
    }

    fn schemas(&self) -> &HashMap<String, ToolSchema> {
        self.schemas.get_or_init(HashMap::new)
    }

    pub fn has(&self, name: &str) -> bool {
        self.schemas().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<ToolSchema> {
        self.schemas().get(name).cloned()
    }

    /// Checks required fields are present and type-agreeing, and fills in
    /// declared defaults for missing optional fields. Returns the input map
    /// with defaults applied.
    pub fn validate_inputs(
        &self,
        tool: &str,
        inputs: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>, OrchestratorError> {
        let schema = self
            .get(tool)
            .ok_or_else(|| OrchestratorError::UnknownTool {
                tool: tool.to_string(),
            })?;
        validate_against(&schema.params_schema, inputs, tool)
    }

    /// Checks declared output field names are present; extra fields are
    /// allowed.
    pub fn validate_output(
        &self,
        tool: &str,
        data: &HashMap<String, Value>,
    ) -> Result<(), OrchestratorError> {
        let schema = self
            .get(tool)
            .ok_or_else(|| OrchestratorError::UnknownTool {
                tool: tool.to_string(),
            })?;
        validate_against(&schema.output_schema, data, tool).map(|_| ())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn validate_against(
    schema: &HashMap<String, FieldSchema>,
    values: &HashMap<String, Value>,
    tool: &str,
) -> Result<HashMap<String, Value>, OrchestratorError> {
    let mut filled = values.clone();
    for (field, declared) in schema {
        match filled.get(field) {
            Some(value) => {
                if !declared.field_type.accepts(value) {
                    return Err(OrchestratorError::ValidationError {
                        tool: tool.to_string(),
                        reason: format!(
                            "field '{field}' expected type {:?}, got {value}",
                            declared.field_type
                        ),
                    });
                }
            }
            None => {
                if let Some(default) = &declared.default {
                    filled.insert(field.clone(), default.clone());
                } else if declared.required {
                    return Err(OrchestratorError::ValidationError {
                        tool: tool.to_string(),
                        reason: format!("missing required field '{field}'"),
                    });
                }
            }
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_field(required: bool) -> FieldSchema {
        FieldSchema {
            field_type: FieldType::String,
            required,
            default: None,
        }
    }

    fn int_field(required: bool) -> FieldSchema {
        FieldSchema {
            field_type: FieldType::Integer,
            required,
            default: None,
        }
    }

    fn registry_with(tool: &str, schema: ToolSchema) -> ToolRegistry {
        let registry = ToolRegistry::new();
        let mut table = HashMap::new();
        table.insert(tool.to_string(), schema);
        registry
            .load(&InMemorySchemaSource::new(table))
            .expect("load should succeed");
        registry
    }

    #[test]
    fn unknown_tool_has_returns_false() {
        let registry = ToolRegistry::new();
        registry
            .load(&InMemorySchemaSource::new(HashMap::new()))
            .unwrap();
        assert!(!registry.has("web_search"));
    }

    #[test]
    fn load_is_idempotent() {
        let registry = ToolRegistry::new();
        let mut first = HashMap::new();
        first.insert("a".to_string(), ToolSchema::default());
        registry.load(&InMemorySchemaSource::new(first)).unwrap();

        let mut second = HashMap::new();
        second.insert("b".to_string(), ToolSchema::default());
        registry.load(&InMemorySchemaSource::new(second)).unwrap();

        assert!(registry.has("a"));
        assert!(!registry.has("b"));
    }

    #[test]
    fn validate_inputs_rejects_missing_required_field() {
        let mut params = HashMap::new();
        params.insert("query".to_string(), string_field(true));
        let registry = registry_with(
            "web_search",
            ToolSchema {
                params_schema: params,
                ..Default::default()
            },
        );

        let err = registry
            .validate_inputs("web_search", &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ValidationError { .. }));
    }

    #[test]
    fn validate_inputs_fills_declared_default() {
        let mut params = HashMap::new();
        params.insert(
            "limit".to_string(),
            FieldSchema {
                field_type: FieldType::Integer,
                required: false,
                default: Some(Value::from(10)),
            },
        );
        let registry = registry_with(
            "web_search",
            ToolSchema {
                params_schema: params,
                ..Default::default()
            },
        );

        let filled = registry
            .validate_inputs("web_search", &HashMap::new())
            .unwrap();
        assert_eq!(filled.get("limit"), Some(&Value::from(10)));
    }

    #[test]
    fn integer_field_rejects_boolean() {
        let mut params = HashMap::new();
        params.insert("count".to_string(), int_field(true));
        let registry = registry_with(
            "counter",
            ToolSchema {
                params_schema: params,
                ..Default::default()
            },
        );

        let mut inputs = HashMap::new();
        inputs.insert("count".to_string(), Value::from(true));
        let err = registry.validate_inputs("counter", &inputs).unwrap_err();
        assert!(matches!(err, OrchestratorError::ValidationError { .. }));
    }

    #[test]
    fn validate_output_allows_extra_fields() {
        let mut output = HashMap::new();
        output.insert("path".to_string(), string_field(true));
        let registry = registry_with(
            "create_file",
            ToolSchema {
                output_schema: output,
                ..Default::default()
            },
        );

        let mut data = HashMap::new();
        data.insert("path".to_string(), Value::from("/tmp/x"));
        data.insert("extra".to_string(), Value::from("ignored"));
        assert!(registry.validate_output("create_file", &data).is_ok());
    }

    #[test]
    fn unknown_tool_is_rejected_at_validation() {
        let registry = ToolRegistry::new();
        registry
            .load(&InMemorySchemaSource::new(HashMap::new()))
            .unwrap();
        let err = registry
            .validate_inputs("missing", &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownTool { .. }));
    }
}
