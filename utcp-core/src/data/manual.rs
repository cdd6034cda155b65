//! Manuals: the catalog a provider publishes during discovery, and the
//! result record a transport returns from registration.

use serde::{Deserialize, Serialize};

use crate::data::call_template::CallTemplate;
use crate::data::tool::Tool;
use crate::interfaces::serializer::JsonSerializer;

/// Standard shape of a provider's discovery response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtcpManual {
    #[serde(default = "UtcpManual::default_utcp_version")]
    pub utcp_version: String,
    #[serde(default = "UtcpManual::default_manual_version")]
    pub manual_version: String,
    pub tools: Vec<Tool>,
}

impl UtcpManual {
    pub fn new(tools: Vec<Tool>) -> Self {
        Self {
            utcp_version: Self::default_utcp_version(),
            manual_version: Self::default_manual_version(),
            tools,
        }
    }

    /// Empty manual used by transports when discovery fails.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    fn default_utcp_version() -> String {
        crate::UTCP_VERSION.into()
    }

    fn default_manual_version() -> String {
        "1.0.0".into()
    }
}

/// Serializer for manual records.
pub fn manual_serializer() -> JsonSerializer<UtcpManual> {
    JsonSerializer::new("UtcpManual")
}

/// Outcome of registering one manual. Ordinary discovery failures are
/// reported here with `success = false` rather than raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterManualResult {
    pub manual_call_template: CallTemplate,
    pub manual: UtcpManual,
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl RegisterManualResult {
    pub fn success(manual_call_template: CallTemplate, manual: UtcpManual) -> Self {
        Self {
            manual_call_template,
            manual,
            success: true,
            errors: Vec::new(),
        }
    }

    pub fn failure(manual_call_template: CallTemplate, errors: Vec<String>) -> Self {
        Self {
            manual_call_template,
            manual: UtcpManual::empty(),
            success: false,
            errors,
        }
    }
}

/// Whether a discovery response is an OpenAPI document rather than a
/// native manual.
pub fn looks_like_openapi(value: &serde_json::Value) -> bool {
    value.as_object().is_some_and(|map| {
        map.contains_key("openapi") || map.contains_key("swagger") || map.contains_key("paths")
    })
}

/// Validate a discovery response as a manual.
///
/// Providers in the wild return tools without a `tool_call_template`
/// (inherit the manual's own template) or with the legacy `tool_provider`
/// key; both are normalized before validation.
pub fn manual_from_discovery(
    mut value: serde_json::Value,
    manual_call_template: &CallTemplate,
) -> crate::error::UtcpResult<UtcpManual> {
    let fallback = manual_call_template.to_value()?;
    if let Some(tools) = value.get_mut("tools").and_then(|t| t.as_array_mut()) {
        for tool in tools {
            let Some(map) = tool.as_object_mut() else {
                continue;
            };
            if let Some(legacy) = map.remove("tool_provider") {
                map.entry("tool_call_template").or_insert(legacy);
            }
            map.entry("tool_call_template").or_insert_with(|| fallback.clone());
        }
    }
    crate::interfaces::serializer::Serializer::validate_value(&manual_serializer(), &value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::serializer::Serializer;
    use serde_json::json;

    #[test]
    fn manual_versions_default_when_absent() {
        let serializer = manual_serializer();
        let manual = serializer.validate_value(&json!({"tools": []})).unwrap();
        assert_eq!(manual.utcp_version, crate::UTCP_VERSION);
        assert_eq!(manual.manual_version, "1.0.0");
        assert!(manual.tools.is_empty());
    }

    #[test]
    fn manual_without_tools_is_invalid() {
        let serializer = manual_serializer();
        let err = serializer.validate_value(&json!({"manual_version": "1.0.0"}));
        assert!(err.is_err());
    }
}
