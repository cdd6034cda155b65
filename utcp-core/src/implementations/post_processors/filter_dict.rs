//! Post-processor that keeps or removes dictionary keys by name.

use std::any::Any;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::in_scope;
use crate::client::UtcpClient;
use crate::data::call_template::CallTemplate;
use crate::data::tool::Tool;
use crate::interfaces::post_processor::PostProcessor;

/// Filters mapping keys inside tool results, recursing into nested mappings
/// and sequences. In include mode, children of unlisted keys are still
/// scanned and kept when something inside them survives; empty residual
/// containers are dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterDictPostProcessor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_keys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_include_keys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_include_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_manuals: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_include_manuals: Option<Vec<String>>,
}

impl FilterDictPostProcessor {
    pub const PROCESSOR_TYPE: &'static str = "filter_dict";

    fn filter(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.filter_map(map)),
            Value::Array(items) => {
                let mut output = Vec::new();
                for item in items {
                    let processed = self.filter(item);
                    match &processed {
                        Value::Object(map) if !map.is_empty() => output.push(processed),
                        Value::Array(list) if !list.is_empty() => output.push(processed),
                        _ => {}
                    }
                }
                Value::Array(output)
            }
            other => other,
        }
    }

    fn filter_map(&self, map: Map<String, Value>) -> Map<String, Value> {
        let mut output = Map::new();
        if let Some(excluded) = &self.exclude_keys {
            for (key, value) in map {
                if !excluded.contains(&key) {
                    output.insert(key, self.filter(value));
                }
            }
            return output;
        }
        if let Some(included) = &self.only_include_keys {
            for (key, value) in map {
                if included.contains(&key) {
                    output.insert(key, self.filter(value));
                } else {
                    // Unlisted keys survive only through non-empty children.
                    let processed = self.filter(value);
                    match &processed {
                        Value::Object(child) if !child.is_empty() => {
                            output.insert(key, processed);
                        }
                        Value::Array(child) if !child.is_empty() => {
                            output.insert(key, processed);
                        }
                        _ => {}
                    }
                }
            }
            return output;
        }
        for (key, value) in map {
            output.insert(key, self.filter(value));
        }
        output
    }
}

impl PostProcessor for FilterDictPostProcessor {
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
        if self.exclude_keys.is_none() && self.only_include_keys.is_none() {
            return result;
        }
        self.filter(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn excluding(keys: &[&str]) -> FilterDictPostProcessor {
        FilterDictPostProcessor {
            exclude_keys: Some(keys.iter().map(|k| k.to_string()).collect()),
            ..Default::default()
        }
    }

    fn including(keys: &[&str]) -> FilterDictPostProcessor {
        FilterDictPostProcessor {
            only_include_keys: Some(keys.iter().map(|k| k.to_string()).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn exclude_removes_keys_at_every_depth() {
        let processor = excluding(&["secret"]);
        let result = processor.filter(json!({
            "secret": "x",
            "data": {"secret": "y", "kept": 1}
        }));
        assert_eq!(result, json!({"data": {"kept": 1}}));
    }

    #[test]
    fn include_keeps_listed_keys_and_surviving_children() {
        let processor = including(&["id"]);
        let result = processor.filter(json!({
            "id": 7,
            "meta": {"id": 8, "noise": true},
            "noise": "dropped"
        }));
        assert_eq!(result, json!({"id": 7, "meta": {"id": 8}}));
    }

    #[test]
    fn empty_residual_containers_are_dropped_from_sequences() {
        let processor = including(&["id"]);
        let result = processor.filter(json!([{"noise": 1}, {"id": 2}, [{"id": 3}]]));
        assert_eq!(result, json!([{"id": 2}, [{"id": 3}]]));
    }

    #[test]
    fn non_container_values_pass_through() {
        let processor = excluding(&["x"]);
        assert_eq!(processor.filter(json!("text")), json!("text"));
        assert_eq!(processor.filter(json!(42)), json!(42));
    }
}
