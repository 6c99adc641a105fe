//! Argument models derived from a tool's declared `inputSchema`.
//!
//! Every property becomes an [`ArgField`] with one of a closed set of kinds.
//! Required/optional handling and defaults are plain data, so two discoveries
//! of the same schema always compare equal.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{McpError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    String,
    Int,
    Float,
    Bool,
    Array,
    Any,
}

impl ArgKind {
    fn from_schema_type(value: Option<&Value>) -> Self {
        let ty = match value {
            Some(Value::String(s)) => s.as_str(),
            // ["string", "null"] style unions: first non-null entry wins
            Some(Value::Array(types)) => types
                .iter()
                .filter_map(Value::as_str)
                .find(|t| *t != "null")
                .unwrap_or("any"),
            _ => "any",
        };
        match ty {
            "string" => ArgKind::String,
            "integer" => ArgKind::Int,
            "number" => ArgKind::Float,
            "boolean" => ArgKind::Bool,
            "array" => ArgKind::Array,
            _ => ArgKind::Any,
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ArgKind::String => value.is_string(),
            ArgKind::Int => value.is_i64() || value.is_u64(),
            ArgKind::Float => value.is_number(),
            ArgKind::Bool => value.is_boolean(),
            ArgKind::Array => value.is_array(),
            ArgKind::Any => true,
        }
    }
}

impl std::fmt::Display for ArgKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ArgKind::String => "string",
            ArgKind::Int => "int",
            ArgKind::Float => "float",
            ArgKind::Bool => "bool",
            ArgKind::Array => "array",
            ArgKind::Any => "any",
        };
        f.write_str(name)
    }
}

/// What happens when the caller leaves a field out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArgDefault {
    /// The caller must pass a real value.
    Required,
    /// The field may be omitted; nothing is sent.
    Omit,
    /// The field is filled with this value when omitted.
    Value(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgField {
    pub name: String,
    pub kind: ArgKind,
    #[serde(default)]
    pub description: String,
    pub default: ArgDefault,
}

impl ArgField {
    pub fn is_required(&self) -> bool {
        self.default == ArgDefault::Required
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArgumentModel {
    pub fields: Vec<ArgField>,
}

impl ArgumentModel {
    /// Derives a model from a JSON-Schema-like object. Fields are ordered by
    /// property name.
    pub fn from_schema(schema: &Value) -> Self {
        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
            return Self::default();
        };

        let fields = properties
            .iter()
            .map(|(name, info)| {
                let kind = ArgKind::from_schema_type(info.get("type"));
                let description = info
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let default = if required.contains(&name.as_str()) {
                    ArgDefault::Required
                } else if kind == ArgKind::Bool {
                    ArgDefault::Value(info.get("default").cloned().unwrap_or(Value::Bool(false)))
                } else {
                    match info.get("default") {
                        Some(value) if !value.is_null() => ArgDefault::Value(value.clone()),
                        _ => ArgDefault::Omit,
                    }
                };
                ArgField {
                    name: name.clone(),
                    kind,
                    description,
                    default,
                }
            })
            .collect();

        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&ArgField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &ArgField> {
        self.fields.iter().filter(|f| f.is_required())
    }

    /// Checks that every required field carries a real value and that known
    /// fields have the declared kind. Unknown fields are passed through.
    pub fn validate(&self, args: &Map<String, Value>) -> Result<()> {
        for field in &self.fields {
            match args.get(&field.name) {
                None | Some(Value::Null) if field.is_required() => {
                    return Err(McpError::InvalidArguments(format!(
                        "missing required field '{}'",
                        field.name
                    )));
                }
                Some(value) if !value.is_null() && !field.kind.accepts(value) => {
                    return Err(McpError::InvalidArguments(format!(
                        "field '{}' expects {}, got {}",
                        field.name, field.kind, value
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Fills omitted fields that carry a default value.
    pub fn apply_defaults(&self, args: &mut Map<String, Value>) {
        for field in &self.fields {
            if let ArgDefault::Value(value) = &field.default {
                let absent = args.get(&field.name).map_or(true, Value::is_null);
                if absent {
                    args.insert(field.name.clone(), value.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn weather_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "lat": {"type": "number", "description": "Latitude"},
                "lon": {"type": "number"},
                "days": {"type": "integer"},
                "units": {"type": "string", "default": "metric"},
                "detailed": {"type": "boolean"},
                "tags": {"type": "array"},
                "extra": {}
            },
            "required": ["lat", "lon"]
        })
    }

    #[test]
    fn test_kinds_and_defaults() {
        let model = ArgumentModel::from_schema(&weather_schema());
        assert_eq!(model.fields.len(), 7);

        let lat = model.field("lat").unwrap();
        assert_eq!(lat.kind, ArgKind::Float);
        assert_eq!(lat.default, ArgDefault::Required);
        assert_eq!(lat.description, "Latitude");

        assert_eq!(model.field("days").unwrap().kind, ArgKind::Int);
        assert_eq!(model.field("days").unwrap().default, ArgDefault::Omit);
        assert_eq!(
            model.field("units").unwrap().default,
            ArgDefault::Value(json!("metric"))
        );
        assert_eq!(
            model.field("detailed").unwrap().default,
            ArgDefault::Value(json!(false))
        );
        assert_eq!(model.field("tags").unwrap().kind, ArgKind::Array);
        assert_eq!(model.field("extra").unwrap().kind, ArgKind::Any);
        assert_eq!(model.required_fields().count(), 2);
    }

    #[test]
    fn test_nullable_union_type() {
        let model = ArgumentModel::from_schema(&json!({
            "properties": {"country": {"type": ["null", "string"]}}
        }));
        assert_eq!(model.field("country").unwrap().kind, ArgKind::String);
    }

    #[test]
    fn test_missing_properties_yields_empty_model() {
        let model = ArgumentModel::from_schema(&json!({"type": "object"}));
        assert!(model.fields.is_empty());
    }

    #[test]
    fn test_validate_missing_required() {
        let model = ArgumentModel::from_schema(&weather_schema());
        let args = json!({"lat": 1.0, "lon": null});
        let err = model.validate(args.as_object().unwrap()).unwrap_err();
        assert!(err.to_string().contains("lon"));
    }

    #[test]
    fn test_validate_kind_mismatch() {
        let model = ArgumentModel::from_schema(&weather_schema());
        let args = json!({"lat": 1.0, "lon": 2, "days": "three"});
        let err = model.validate(args.as_object().unwrap()).unwrap_err();
        assert!(err.to_string().contains("days"));
    }

    #[test]
    fn test_validate_accepts_ints_for_floats_and_unknown_fields() {
        let model = ArgumentModel::from_schema(&weather_schema());
        let args = json!({"lat": 40, "lon": -74.006, "surprise": true});
        assert!(model.validate(args.as_object().unwrap()).is_ok());
    }

    #[test]
    fn test_apply_defaults_fills_bools_not_optionals() {
        let model = ArgumentModel::from_schema(&weather_schema());
        let mut args = json!({"lat": 1.0, "lon": 2.0, "detailed": null})
            .as_object()
            .cloned()
            .unwrap();
        model.apply_defaults(&mut args);
        assert_eq!(args.get("detailed"), Some(&json!(false)));
        assert_eq!(args.get("units"), Some(&json!("metric")));
        assert!(!args.contains_key("days"));
    }
}
