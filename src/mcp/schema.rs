//! JSON Schema translation for tool inputs
//!
//! Servers describe tool inputs with JSON-Schema-like documents. Those are
//! translated once at discovery time into a structural validator so bad
//! arguments are rejected before they reach the wire, and so the schema can
//! be rendered back out for the model API. A schema the translator cannot
//! understand degrades to accept-all rather than blocking registration.

use serde_json::{Map, Value, json};
use std::collections::HashSet;

/// Structural type of a single field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    /// Free-form string, optionally restricted to an allowed set
    String { allowed: Option<Vec<String>> },
    /// Any JSON number; covers both `number` and `integer` schemas
    Number,
    Boolean,
    Array(Box<FieldType>),
    Object(InputSchema),
    /// Unrecognized or unconstrained
    Any,
}

/// One declared property of an object schema
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
    pub required: bool,
    pub description: Option<String>,
}

/// Translated object schema. An empty field list accepts any object.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InputSchema {
    pub fields: Vec<FieldSpec>,
}

impl InputSchema {
    /// Permissive schema: any object, no required fields
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Translate a JSON-Schema-like value. Anything that is not an
    /// object schema degrades to [`InputSchema::accept_all`].
    pub fn translate(schema: &Value) -> Self {
        let Some(obj) = schema.as_object() else {
            return Self::accept_all();
        };
        if obj.get("type").and_then(Value::as_str) != Some("object") {
            return Self::accept_all();
        }

        let required: HashSet<&str> = obj
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let Some(properties) = obj.get("properties").and_then(Value::as_object) else {
            return Self::accept_all();
        };

        let fields = properties
            .iter()
            .map(|(name, prop)| FieldSpec {
                name: name.clone(),
                ty: translate_type(prop),
                required: required.contains(name.as_str()),
                description: prop
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
            .collect();

        Self { fields }
    }

    /// Names of required fields, in declaration order
    pub fn required_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Check an input value against the schema. Undeclared extra
    /// properties are allowed, matching JSON Schema defaults.
    pub fn validate(&self, input: &Value) -> Result<(), String> {
        let Some(obj) = input.as_object() else {
            return Err(format!("expected an object, got {}", json_type_name(input)));
        };

        for field in &self.fields {
            match obj.get(&field.name) {
                Some(value) => check_type(value, &field.ty, &field.name)?,
                None if field.required => {
                    return Err(match &field.description {
                        Some(desc) => {
                            format!("missing required field '{}' ({})", field.name, desc)
                        }
                        None => format!("missing required field '{}'", field.name),
                    });
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Render back to a JSON schema for the model API
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for field in &self.fields {
            let mut prop = type_to_json_schema(&field.ty);
            if let Some(desc) = &field.description {
                if let Some(prop_obj) = prop.as_object_mut() {
                    prop_obj.insert("description".to_string(), json!(desc));
                }
            }
            properties.insert(field.name.clone(), prop);
            if field.required {
                required.push(json!(field.name));
            }
        }

        json!({
            "type": "object",
            "properties": Value::Object(properties),
            "required": required,
        })
    }
}

fn translate_type(prop: &Value) -> FieldType {
    match prop.get("type").and_then(Value::as_str) {
        Some("string") => FieldType::String {
            allowed: prop.get("enum").and_then(Value::as_array).map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            }),
        },
        Some("number") | Some("integer") => FieldType::Number,
        Some("boolean") => FieldType::Boolean,
        Some("array") => FieldType::Array(Box::new(
            prop.get("items").map(translate_type).unwrap_or(FieldType::Any),
        )),
        Some("object") => FieldType::Object(InputSchema::translate(prop)),
        _ => FieldType::Any,
    }
}

fn check_type(value: &Value, ty: &FieldType, field: &str) -> Result<(), String> {
    match ty {
        FieldType::Any => Ok(()),
        FieldType::String { allowed } => {
            let Some(s) = value.as_str() else {
                return Err(format!(
                    "field '{}' must be a string, got {}",
                    field,
                    json_type_name(value)
                ));
            };
            if let Some(allowed) = allowed {
                if !allowed.iter().any(|a| a == s) {
                    return Err(format!(
                        "field '{}' must be one of: {}",
                        field,
                        allowed.join(", ")
                    ));
                }
            }
            Ok(())
        }
        FieldType::Number => {
            if value.is_number() {
                Ok(())
            } else {
                Err(format!(
                    "field '{}' must be a number, got {}",
                    field,
                    json_type_name(value)
                ))
            }
        }
        FieldType::Boolean => {
            if value.is_boolean() {
                Ok(())
            } else {
                Err(format!(
                    "field '{}' must be a boolean, got {}",
                    field,
                    json_type_name(value)
                ))
            }
        }
        FieldType::Array(item) => {
            let Some(items) = value.as_array() else {
                return Err(format!(
                    "field '{}' must be an array, got {}",
                    field,
                    json_type_name(value)
                ));
            };
            for (i, entry) in items.iter().enumerate() {
                check_type(entry, item, &format!("{}[{}]", field, i))?;
            }
            Ok(())
        }
        FieldType::Object(schema) => schema
            .validate(value)
            .map_err(|e| format!("in field '{}': {}", field, e)),
    }
}

fn type_to_json_schema(ty: &FieldType) -> Value {
    match ty {
        FieldType::String { allowed: None } => json!({"type": "string"}),
        FieldType::String {
            allowed: Some(values),
        } => json!({"type": "string", "enum": values}),
        FieldType::Number => json!({"type": "number"}),
        FieldType::Boolean => json!({"type": "boolean"}),
        FieldType::Array(item) => json!({"type": "array", "items": type_to_json_schema(item)}),
        FieldType::Object(schema) => schema.to_json_schema(),
        FieldType::Any => json!({}),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
