//! Call templates: typed descriptors of how to reach an endpoint.
//!
//! A call template appears in two roles. The *manual* template tells a
//! transport how to discover a provider's catalog; each discovered tool then
//! carries its own *tool* template describing how to invoke it. The two need
//! not use the same transport. Templates form a tagged polymorphic family
//! dispatched on `call_template_type` through the plugin registry, so every
//! protocol crate contributes its own variants.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::auth::Auth;
use crate::error::{UtcpError, UtcpResult};
use crate::interfaces::serializer::{discriminator, Serializer};
use crate::plugins;

/// One concrete call template variant.
pub trait CallTemplateKind: fmt::Debug + Send + Sync + 'static {
    /// Unique identifier of the template. Free-form input is normalized by
    /// the client: every non-identifier character becomes `_`.
    fn name(&self) -> &str;

    /// The discriminator bound to a communication protocol in the registry.
    fn call_template_type(&self) -> &str;

    fn auth(&self) -> Option<&Auth> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Polymorphic handle to a [`CallTemplateKind`].
#[derive(Debug, Clone)]
pub struct CallTemplate {
    inner: Arc<dyn CallTemplateKind>,
}

impl CallTemplate {
    pub fn new<T: CallTemplateKind>(template: T) -> Self {
        Self {
            inner: Arc::new(template),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn call_template_type(&self) -> &str {
        self.inner.call_template_type()
    }

    pub fn auth(&self) -> Option<&Auth> {
        self.inner.auth()
    }

    pub fn downcast_ref<T: CallTemplateKind>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref()
    }

    pub fn to_value(&self) -> UtcpResult<Value> {
        CallTemplateSerializer.to_value(self)
    }

    pub fn from_value(value: &Value) -> UtcpResult<Self> {
        CallTemplateSerializer.validate_value(value)
    }

    /// Rebuild this template with a different name, going through the
    /// serializer round trip so the concrete variant revalidates itself.
    pub fn with_name(&self, name: &str) -> UtcpResult<Self> {
        let mut value = self.to_value()?;
        if let Value::Object(map) = &mut value {
            map.insert("name".into(), Value::String(name.into()));
        }
        Self::from_value(&value)
    }
}

impl PartialEq for CallTemplate {
    fn eq(&self, other: &Self) -> bool {
        match (self.to_value(), other.to_value()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl Serialize for CallTemplate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = self.to_value().map_err(serde::ser::Error::custom)?;
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CallTemplate {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        CallTemplate::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Dispatcher serializer for the call template family.
pub struct CallTemplateSerializer;

impl Serializer<CallTemplate> for CallTemplateSerializer {
    fn to_value(&self, obj: &CallTemplate) -> UtcpResult<Value> {
        plugins::ensure_plugins_initialized();
        plugins::call_template_serializer(obj.call_template_type())?.to_value(obj)
    }

    fn validate_value(&self, value: &Value) -> UtcpResult<CallTemplate> {
        plugins::ensure_plugins_initialized();
        let tag = discriminator(value, "call_template_type", "CallTemplate")?;
        plugins::call_template_serializer(tag)?.validate_value(value)
    }
}

/// Serde-backed serializer for one concrete template variant. Injects the
/// `call_template_type` tag into the record; serde tolerates it on input.
pub struct CallTemplateVariantSerializer<T> {
    tag: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CallTemplateVariantSerializer<T> {
    pub const fn new(tag: &'static str) -> Self {
        Self {
            tag,
            _marker: PhantomData,
        }
    }
}

impl<T> Serializer<CallTemplate> for CallTemplateVariantSerializer<T>
where
    T: CallTemplateKind + Serialize + DeserializeOwned + Clone,
{
    fn to_value(&self, obj: &CallTemplate) -> UtcpResult<Value> {
        let template: &T = obj.downcast_ref().ok_or_else(|| {
            UtcpError::validation(self.tag, "call template does not match its registered type")
        })?;
        let mut value =
            serde_json::to_value(template).map_err(|err| UtcpError::validation(self.tag, err))?;
        if let Value::Object(map) = &mut value {
            map.insert(
                "call_template_type".into(),
                Value::String(self.tag.into()),
            );
        }
        Ok(value)
    }

    fn validate_value(&self, value: &Value) -> UtcpResult<CallTemplate> {
        let template: T = serde_json::from_value(value.clone())
            .map_err(|err| UtcpError::validation(self.tag, err))?;
        Ok(CallTemplate::new(template))
    }
}

/// Default for template names when the record omits one.
pub fn random_template_name() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
