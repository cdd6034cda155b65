//! Chainable transformations applied to every tool result.
//!
//! Processors run left-to-right after each unary call; for streaming calls
//! the configured chain is applied to each yielded element independently.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::UtcpClient;
use crate::data::call_template::CallTemplate;
use crate::data::tool::Tool;
use crate::error::UtcpResult;
use crate::interfaces::serializer::{discriminator, Serializer};
use crate::plugins;

pub trait PostProcessor: fmt::Debug + Send + Sync + 'static {
    fn post_processor_type(&self) -> &str;

    fn as_any(&self) -> &dyn Any;

    /// Transform one result value. `tool_call_template` is the template the
    /// call was dispatched with.
    fn post_process(
        &self,
        caller: &UtcpClient,
        tool: &Tool,
        tool_call_template: &CallTemplate,
        result: Value,
    ) -> Value;
}

/// Handle to a post-processor implementation.
#[derive(Debug, Clone)]
pub struct ToolPostProcessor {
    inner: Arc<dyn PostProcessor>,
}

impl ToolPostProcessor {
    pub fn new<P: PostProcessor>(processor: P) -> Self {
        Self {
            inner: Arc::new(processor),
        }
    }

    pub fn post_processor_type(&self) -> &str {
        self.inner.post_processor_type()
    }

    pub fn downcast_ref<P: PostProcessor>(&self) -> Option<&P> {
        self.inner.as_any().downcast_ref()
    }

    pub fn post_process(
        &self,
        caller: &UtcpClient,
        tool: &Tool,
        tool_call_template: &CallTemplate,
        result: Value,
    ) -> Value {
        self.inner
            .post_process(caller, tool, tool_call_template, result)
    }

    pub fn to_value(&self) -> UtcpResult<Value> {
        ToolPostProcessorConfigSerializer.to_value(self)
    }

    pub fn from_value(value: &Value) -> UtcpResult<Self> {
        ToolPostProcessorConfigSerializer.validate_value(value)
    }
}

impl PartialEq for ToolPostProcessor {
    fn eq(&self, other: &Self) -> bool {
        match (self.to_value(), other.to_value()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl Serialize for ToolPostProcessor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = self.to_value().map_err(serde::ser::Error::custom)?;
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ToolPostProcessor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        ToolPostProcessor::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Dispatcher serializer for post-processor configurations.
pub struct ToolPostProcessorConfigSerializer;

impl Serializer<ToolPostProcessor> for ToolPostProcessorConfigSerializer {
    fn to_value(&self, obj: &ToolPostProcessor) -> UtcpResult<Value> {
        plugins::ensure_plugins_initialized();
        plugins::tool_post_processor_serializer(obj.post_processor_type())?.to_value(obj)
    }

    fn validate_value(&self, value: &Value) -> UtcpResult<ToolPostProcessor> {
        plugins::ensure_plugins_initialized();
        let tag = discriminator(value, "tool_post_processor_type", "ToolPostProcessor")?;
        plugins::tool_post_processor_serializer(tag)?.validate_value(value)
    }
}

/// Serde-backed serializer for one concrete post-processor variant.
pub struct PostProcessorVariantSerializer<P> {
    tag: &'static str,
    _marker: std::marker::PhantomData<fn() -> P>,
}

impl<P> PostProcessorVariantSerializer<P> {
    pub const fn new(tag: &'static str) -> Self {
        Self {
            tag,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<P> Serializer<ToolPostProcessor> for PostProcessorVariantSerializer<P>
where
    P: PostProcessor + Serialize + serde::de::DeserializeOwned + Clone,
{
    fn to_value(&self, obj: &ToolPostProcessor) -> UtcpResult<Value> {
        let processor: &P = obj.downcast_ref().ok_or_else(|| {
            crate::error::UtcpError::validation(
                self.tag,
                "post processor does not match its registered type",
            )
        })?;
        let mut value = serde_json::to_value(processor)
            .map_err(|err| crate::error::UtcpError::validation(self.tag, err))?;
        if let Value::Object(map) = &mut value {
            map.insert(
                "tool_post_processor_type".into(),
                Value::String(self.tag.into()),
            );
        }
        Ok(value)
    }

    fn validate_value(&self, value: &Value) -> UtcpResult<ToolPostProcessor> {
        let processor: P = serde_json::from_value(value.clone())
            .map_err(|err| crate::error::UtcpError::validation(self.tag, err))?;
        Ok(ToolPostProcessor::new(processor))
    }
}
