//! Pluggable ranking of repository tools for a query.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::tool::Tool;
use crate::error::UtcpResult;
use crate::interfaces::serializer::{discriminator, Serializer};
use crate::interfaces::tool_repository::ToolRepository;
use crate::plugins;

/// Discriminator of the default tag/description matching strategy.
pub const DEFAULT_SEARCH_STRATEGY: &str = "tag_and_description_word_match";

#[async_trait]
pub trait ToolSearch: fmt::Debug + Send + Sync + 'static {
    fn strategy_type(&self) -> &str;

    fn as_any(&self) -> &dyn Any;

    /// Return up to `limit` tools ordered by relevance. `limit` of zero
    /// yields an empty list; a negative limit is rejected. When
    /// `any_of_tags_required` is given, tools sharing none of those tags are
    /// filtered out before scoring.
    async fn search_tools(
        &self,
        tool_repository: &ToolRepository,
        query: &str,
        limit: i64,
        any_of_tags_required: Option<&[String]>,
    ) -> UtcpResult<Vec<Tool>>;
}

/// Handle to a search strategy implementation.
#[derive(Debug, Clone)]
pub struct ToolSearchStrategy {
    inner: Arc<dyn ToolSearch>,
}

impl ToolSearchStrategy {
    pub fn new<S: ToolSearch>(strategy: S) -> Self {
        Self {
            inner: Arc::new(strategy),
        }
    }

    pub fn strategy_type(&self) -> &str {
        self.inner.strategy_type()
    }

    pub fn downcast_ref<S: ToolSearch>(&self) -> Option<&S> {
        self.inner.as_any().downcast_ref()
    }

    pub async fn search_tools(
        &self,
        tool_repository: &ToolRepository,
        query: &str,
        limit: i64,
        any_of_tags_required: Option<&[String]>,
    ) -> UtcpResult<Vec<Tool>> {
        self.inner
            .search_tools(tool_repository, query, limit, any_of_tags_required)
            .await
    }

    pub fn to_value(&self) -> UtcpResult<Value> {
        ToolSearchStrategyConfigSerializer.to_value(self)
    }

    pub fn from_value(value: &Value) -> UtcpResult<Self> {
        ToolSearchStrategyConfigSerializer.validate_value(value)
    }
}

impl Default for ToolSearchStrategy {
    fn default() -> Self {
        plugins::ensure_plugins_initialized();
        Self::from_value(&serde_json::json!({
            "tool_search_strategy_type": DEFAULT_SEARCH_STRATEGY
        }))
        .expect("default search strategy is installed by plugin initialization")
    }
}

impl Serialize for ToolSearchStrategy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = self.to_value().map_err(serde::ser::Error::custom)?;
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ToolSearchStrategy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        ToolSearchStrategy::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Dispatcher serializer for search strategy configurations.
pub struct ToolSearchStrategyConfigSerializer;

impl Serializer<ToolSearchStrategy> for ToolSearchStrategyConfigSerializer {
    fn to_value(&self, obj: &ToolSearchStrategy) -> UtcpResult<Value> {
        plugins::ensure_plugins_initialized();
        plugins::tool_search_strategy_serializer(obj.strategy_type())?.to_value(obj)
    }

    fn validate_value(&self, value: &Value) -> UtcpResult<ToolSearchStrategy> {
        plugins::ensure_plugins_initialized();
        let tag = discriminator(value, "tool_search_strategy_type", "ToolSearchStrategy")?;
        plugins::tool_search_strategy_serializer(tag)?.validate_value(value)
    }
}
