//! Variable loaders: pluggable external sources consulted during variable
//! substitution, after the configuration table and before the environment.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{UtcpError, UtcpResult};
use crate::interfaces::serializer::{discriminator, Serializer};
use crate::plugins;

/// One concrete variable source.
#[async_trait]
pub trait VariableSource: fmt::Debug + Send + Sync + 'static {
    fn variable_loader_type(&self) -> &str;

    /// Look up a variable. `Ok(None)` means the source does not know it.
    async fn get(&self, key: &str) -> UtcpResult<Option<String>>;

    fn as_any(&self) -> &dyn Any;
}

/// Polymorphic handle to a [`VariableSource`].
#[derive(Debug, Clone)]
pub struct VariableLoader {
    inner: Arc<dyn VariableSource>,
}

impl VariableLoader {
    pub fn new<S: VariableSource>(source: S) -> Self {
        Self {
            inner: Arc::new(source),
        }
    }

    pub fn variable_loader_type(&self) -> &str {
        self.inner.variable_loader_type()
    }

    pub async fn get(&self, key: &str) -> UtcpResult<Option<String>> {
        self.inner.get(key).await
    }

    pub fn downcast_ref<S: VariableSource>(&self) -> Option<&S> {
        self.inner.as_any().downcast_ref()
    }

    pub fn to_value(&self) -> UtcpResult<Value> {
        VariableLoaderSerializer.to_value(self)
    }

    pub fn from_value(value: &Value) -> UtcpResult<Self> {
        VariableLoaderSerializer.validate_value(value)
    }
}

impl PartialEq for VariableLoader {
    fn eq(&self, other: &Self) -> bool {
        match (self.to_value(), other.to_value()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl Serialize for VariableLoader {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = self.to_value().map_err(serde::ser::Error::custom)?;
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VariableLoader {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        VariableLoader::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Dispatcher serializer for the variable-loader family.
pub struct VariableLoaderSerializer;

impl Serializer<VariableLoader> for VariableLoaderSerializer {
    fn to_value(&self, obj: &VariableLoader) -> UtcpResult<Value> {
        plugins::ensure_plugins_initialized();
        plugins::variable_loader_serializer(obj.variable_loader_type())?.to_value(obj)
    }

    fn validate_value(&self, value: &Value) -> UtcpResult<VariableLoader> {
        plugins::ensure_plugins_initialized();
        let tag = discriminator(value, "variable_loader_type", "VariableLoader")?;
        plugins::variable_loader_serializer(tag)?.validate_value(value)
    }
}

/// Serde-backed serializer for one concrete loader variant.
pub struct VariableLoaderVariantSerializer<S> {
    tag: &'static str,
    _marker: PhantomData<fn() -> S>,
}

impl<S> VariableLoaderVariantSerializer<S> {
    pub const fn new(tag: &'static str) -> Self {
        Self {
            tag,
            _marker: PhantomData,
        }
    }
}

impl<S> Serializer<VariableLoader> for VariableLoaderVariantSerializer<S>
where
    S: VariableSource + Serialize + DeserializeOwned + Clone,
{
    fn to_value(&self, obj: &VariableLoader) -> UtcpResult<Value> {
        let source: &S = obj.downcast_ref().ok_or_else(|| {
            UtcpError::validation(self.tag, "variable loader does not match its registered type")
        })?;
        let mut value =
            serde_json::to_value(source).map_err(|err| UtcpError::validation(self.tag, err))?;
        if let Value::Object(map) = &mut value {
            map.insert(
                "variable_loader_type".into(),
                Value::String(self.tag.into()),
            );
        }
        Ok(value)
    }

    fn validate_value(&self, value: &Value) -> UtcpResult<VariableLoader> {
        let source: S = serde_json::from_value(value.clone())
            .map_err(|err| UtcpError::validation(self.tag, err))?;
        Ok(VariableLoader::new(source))
    }
}

/// Loads variables from a `KEY=VALUE` dot-env file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DotEnvVariableLoader {
    pub env_file_path: String,
}

impl DotEnvVariableLoader {
    pub const LOADER_TYPE: &'static str = "dotenv";
}

#[async_trait]
impl VariableSource for DotEnvVariableLoader {
    fn variable_loader_type(&self) -> &str {
        Self::LOADER_TYPE
    }

    async fn get(&self, key: &str) -> UtcpResult<Option<String>> {
        let path = self.env_file_path.clone();
        let wanted = key.to_string();
        let result = tokio::task::spawn_blocking(move || {
            let iter = match dotenvy::from_path_iter(&path) {
                Ok(iter) => iter,
                Err(err) => {
                    warn!(path = %path, error = %err, "failed to read env file");
                    return None;
                }
            };
            for item in iter {
                match item {
                    Ok((name, value)) if name == wanted => return Some(value),
                    Ok(_) => {}
                    Err(err) => {
                        warn!(path = %path, error = %err, "malformed env file entry");
                        return None;
                    }
                }
            }
            None
        })
        .await
        .map_err(|err| UtcpError::Configuration(format!("env file read task failed: {err}")))?;
        Ok(result)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[tokio::test]
    async fn reads_values_from_env_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "API_KEY=secret").unwrap();
        writeln!(file, "OTHER=value").unwrap();

        let loader = DotEnvVariableLoader {
            env_file_path: file.path().to_string_lossy().into_owned(),
        };
        assert_eq!(loader.get("API_KEY").await.unwrap(), Some("secret".into()));
        assert_eq!(loader.get("MISSING").await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_file_yields_no_value() {
        let loader = DotEnvVariableLoader {
            env_file_path: "/nonexistent/.env".into(),
        };
        assert_eq!(loader.get("API_KEY").await.unwrap(), None);
    }

    #[test]
    fn dotenv_loader_round_trips() {
        let record = json!({"variable_loader_type": "dotenv", "env_file_path": ".env"});
        let loader = VariableLoader::from_value(&record).unwrap();
        assert_eq!(loader.to_value().unwrap(), record);
    }
}
