//! The concurrent tool repository contract.
//!
//! A repository holds, per manual name, the manual call template and the
//! manual (with its tools), while also exposing a flat globally indexed view
//! of every tool. All operations are concurrent-safe; reads return defensive
//! copies that share no mutable state with the store.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::call_template::CallTemplate;
use crate::data::manual::UtcpManual;
use crate::data::tool::Tool;
use crate::error::UtcpResult;
use crate::interfaces::serializer::{discriminator, Serializer};
use crate::plugins;

/// Discriminator of the default in-memory repository.
pub const DEFAULT_REPOSITORY: &str = "in_memory";

#[async_trait]
pub trait ConcurrentToolRepository: fmt::Debug + Send + Sync + 'static {
    fn repository_type(&self) -> &str;

    fn as_any(&self) -> &dyn Any;

    /// Insert or replace a manual atomically: the previous tool set for the
    /// manual disappears and the new set becomes visible together.
    async fn save_manual(
        &self,
        manual_call_template: CallTemplate,
        manual: UtcpManual,
    ) -> UtcpResult<()>;

    async fn remove_manual(&self, manual_name: &str) -> UtcpResult<bool>;

    /// Remove a single tool, also detaching it from its owning manual.
    async fn remove_tool(&self, tool_name: &str) -> UtcpResult<bool>;

    async fn get_tool(&self, tool_name: &str) -> UtcpResult<Option<Tool>>;

    async fn get_tools(&self) -> UtcpResult<Vec<Tool>>;

    async fn get_tools_by_manual(&self, manual_name: &str) -> UtcpResult<Option<Vec<Tool>>>;

    async fn get_manual(&self, manual_name: &str) -> UtcpResult<Option<UtcpManual>>;

    async fn get_manuals(&self) -> UtcpResult<Vec<UtcpManual>>;

    async fn get_manual_template(&self, manual_name: &str) -> UtcpResult<Option<CallTemplate>>;

    async fn get_manual_templates(&self) -> UtcpResult<Vec<CallTemplate>>;
}

/// Handle to a repository implementation, configured through the registry.
#[derive(Debug, Clone)]
pub struct ToolRepository {
    inner: Arc<dyn ConcurrentToolRepository>,
}

impl ToolRepository {
    pub fn new<R: ConcurrentToolRepository>(repository: R) -> Self {
        Self {
            inner: Arc::new(repository),
        }
    }

    pub fn repository_type(&self) -> &str {
        self.inner.repository_type()
    }

    pub fn downcast_ref<R: ConcurrentToolRepository>(&self) -> Option<&R> {
        self.inner.as_any().downcast_ref()
    }

    pub async fn save_manual(
        &self,
        manual_call_template: CallTemplate,
        manual: UtcpManual,
    ) -> UtcpResult<()> {
        self.inner.save_manual(manual_call_template, manual).await
    }

    pub async fn remove_manual(&self, manual_name: &str) -> UtcpResult<bool> {
        self.inner.remove_manual(manual_name).await
    }

    pub async fn remove_tool(&self, tool_name: &str) -> UtcpResult<bool> {
        self.inner.remove_tool(tool_name).await
    }

    pub async fn get_tool(&self, tool_name: &str) -> UtcpResult<Option<Tool>> {
        self.inner.get_tool(tool_name).await
    }

    pub async fn get_tools(&self) -> UtcpResult<Vec<Tool>> {
        self.inner.get_tools().await
    }

    pub async fn get_tools_by_manual(&self, manual_name: &str) -> UtcpResult<Option<Vec<Tool>>> {
        self.inner.get_tools_by_manual(manual_name).await
    }

    pub async fn get_manual(&self, manual_name: &str) -> UtcpResult<Option<UtcpManual>> {
        self.inner.get_manual(manual_name).await
    }

    pub async fn get_manuals(&self) -> UtcpResult<Vec<UtcpManual>> {
        self.inner.get_manuals().await
    }

    pub async fn get_manual_template(
        &self,
        manual_name: &str,
    ) -> UtcpResult<Option<CallTemplate>> {
        self.inner.get_manual_template(manual_name).await
    }

    pub async fn get_manual_templates(&self) -> UtcpResult<Vec<CallTemplate>> {
        self.inner.get_manual_templates().await
    }

    pub fn to_value(&self) -> UtcpResult<Value> {
        ToolRepositoryConfigSerializer.to_value(self)
    }

    pub fn from_value(value: &Value) -> UtcpResult<Self> {
        ToolRepositoryConfigSerializer.validate_value(value)
    }
}

impl Default for ToolRepository {
    fn default() -> Self {
        plugins::ensure_plugins_initialized();
        Self::from_value(&serde_json::json!({ "tool_repository_type": DEFAULT_REPOSITORY }))
            .expect("default in-memory repository is installed by plugin initialization")
    }
}

impl Serialize for ToolRepository {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = self.to_value().map_err(serde::ser::Error::custom)?;
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ToolRepository {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        ToolRepository::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Dispatcher serializer for repository configurations. Validation
/// constructs a fresh live instance of the configured implementation.
pub struct ToolRepositoryConfigSerializer;

impl Serializer<ToolRepository> for ToolRepositoryConfigSerializer {
    fn to_value(&self, obj: &ToolRepository) -> UtcpResult<Value> {
        plugins::ensure_plugins_initialized();
        plugins::tool_repository_serializer(obj.repository_type())?.to_value(obj)
    }

    fn validate_value(&self, value: &Value) -> UtcpResult<ToolRepository> {
        plugins::ensure_plugins_initialized();
        let tag = discriminator(value, "tool_repository_type", "ToolRepository")?;
        plugins::tool_repository_serializer(tag)?.validate_value(value)
    }
}
