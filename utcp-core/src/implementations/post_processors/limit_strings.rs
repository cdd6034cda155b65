//! Post-processor that caps the length of every string leaf.

use std::any::Any;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::in_scope;
use crate::client::UtcpClient;
use crate::data::call_template::CallTemplate;
use crate::data::tool::Tool;
use crate::interfaces::post_processor::PostProcessor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitStringsPostProcessor {
    #[serde(default = "LimitStringsPostProcessor::default_limit")]
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_include_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_manuals: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_include_manuals: Option<Vec<String>>,
}

impl Default for LimitStringsPostProcessor {
    fn default() -> Self {
        Self {
            limit: Self::default_limit(),
            exclude_tools: None,
            only_include_tools: None,
            exclude_manuals: None,
            only_include_manuals: None,
        }
    }
}

impl LimitStringsPostProcessor {
    pub const PROCESSOR_TYPE: &'static str = "limit_strings";

    fn default_limit() -> usize {
        10_000
    }

    fn truncate(&self, value: Value) -> Value {
        match value {
            Value::String(text) => {
                if text.chars().count() > self.limit {
                    Value::String(text.chars().take(self.limit).collect())
                } else {
                    Value::String(text)
                }
            }
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|item| self.truncate(item)).collect())
            }
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, nested)| (key, self.truncate(nested)))
                    .collect(),
            ),
            other => other,
        }
    }
}

impl PostProcessor for LimitStringsPostProcessor {
    fn post_processor_type(&self) -> &str {
        Self::PROCESSOR_TYPE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn post_process(
        &self,
        _caller: &UtcpClient,
        tool: &Tool,
        _tool_call_template: &CallTemplate,
        result: Value,
    ) -> Value {
        if !in_scope(
            tool,
            &self.exclude_tools,
            &self.only_include_tools,
            &self.exclude_manuals,
            &self.only_include_manuals,
        ) {
            return result;
        }
        self.truncate(result)
    }
}
