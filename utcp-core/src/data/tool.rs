//! Tool definitions and the recursive JSON-Schema carrier.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::data::call_template::CallTemplate;
use crate::interfaces::serializer::JsonSerializer;

/// Recursive JSON-Schema record. Carries the standard keywords and keeps
/// any unrecognized ones in `extra` so arbitrary schemas round-trip.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JsonSchema {
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(rename = "$id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<SchemaType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<indexmap::IndexMap<String, JsonSchema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<SchemaItems>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(rename = "const", default, skip_serializing_if = "Option::is_none")]
    pub const_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(
        rename = "additionalProperties",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub additional_properties: Option<AdditionalProperties>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(rename = "minLength", default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u64>,
    #[serde(rename = "maxLength", default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u64>,
    /// Unrecognized keywords, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `type` is a single name or a list of alternatives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaType {
    One(String),
    Many(Vec<String>),
}

/// `items` is a schema or a positional list of schemas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaItems {
    One(Box<JsonSchema>),
    Many(Vec<JsonSchema>),
}

/// `additionalProperties` is a boolean or a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdditionalProperties {
    Allowed(bool),
    Schema(Box<JsonSchema>),
}

/// Serializer for standalone schema records.
pub fn json_schema_serializer() -> JsonSerializer<JsonSchema> {
    JsonSerializer::new("JsonSchema")
}

/// Definition of a callable UTCP tool.
///
/// Inside the repository a tool's name is globally unique and prefixed with
/// the owning manual's name (`manual.tool`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: JsonSchema,
    #[serde(default)]
    pub outputs: JsonSchema,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_response_size: Option<u64>,
    pub tool_call_template: CallTemplate,
}

/// Serializer for tool records.
pub fn tool_serializer() -> JsonSerializer<Tool> {
    JsonSerializer::new("Tool")
}
