//! Client configuration.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::data::call_template::CallTemplate;
use crate::data::variable_loader::VariableLoader;
use crate::interfaces::serializer::JsonSerializer;

pub use crate::interfaces::post_processor::ToolPostProcessor;
pub use crate::interfaces::tool_repository::ToolRepository;
pub use crate::interfaces::tool_search::ToolSearchStrategy;

/// Configuration for a UTCP client.
///
/// Variable resolution order: the `variables` table first, then each loader
/// in `load_variables_from` in order, then the process environment. The
/// repository, search strategy and post-processors are polymorphic records
/// materialized into live implementations through the plugin registry.
/// Unknown keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UtcpClientConfig {
    #[serde(default)]
    pub variables: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_variables_from: Option<Vec<VariableLoader>>,
    #[serde(default)]
    pub tool_repository: ToolRepository,
    #[serde(default)]
    pub tool_search_strategy: ToolSearchStrategy,
    #[serde(default)]
    pub post_processing: Vec<ToolPostProcessor>,
    #[serde(default)]
    pub manual_call_templates: Vec<CallTemplate>,
}

impl Default for UtcpClientConfig {
    fn default() -> Self {
        Self {
            variables: IndexMap::new(),
            load_variables_from: None,
            tool_repository: ToolRepository::default(),
            tool_search_strategy: ToolSearchStrategy::default(),
            post_processing: Vec::new(),
            manual_call_templates: Vec::new(),
        }
    }
}

/// Serializer for configuration records.
pub type UtcpClientConfigSerializer = JsonSerializer<UtcpClientConfig>;

pub fn client_config_serializer() -> UtcpClientConfigSerializer {
    JsonSerializer::new("UtcpClientConfig")
}
