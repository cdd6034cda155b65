//! Text communication protocol.
//!
//! Serves manuals and tool content from local text files, exactly like the
//! `file` protocol but registered under its own wire tag so providers that
//! publish `text` templates keep working. Tool calls return the file's
//! textual content; streaming yields it as a single chunk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Once;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use utcp_core::plugins::{register_call_template, register_communication_protocol};
use utcp_core::{
    looks_like_openapi, manual_from_discovery, random_template_name, Auth, CallTemplate,
    CallTemplateKind, CallTemplateVariantSerializer, CommunicationProtocol, RegisterManualResult,
    ToolCallStream, UtcpClient, UtcpError, UtcpResult,
};

pub const TEXT_TEMPLATE_TYPE: &str = "text";

/// Call template pointing at a local text file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextCallTemplate {
    #[serde(default = "random_template_name")]
    pub name: String,
    /// Path to the file; relative paths resolve against the client's root
    /// directory.
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_tools: Option<Auth>,
}

impl CallTemplateKind for TextCallTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    fn call_template_type(&self) -> &str {
        TEXT_TEMPLATE_TYPE
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn resolve_path(caller: &UtcpClient, file_path: &str) -> PathBuf {
    let path = Path::new(file_path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        caller.root_dir().join(path)
    }
}

fn parse_by_extension(path: &Path, content: &str) -> Result<Value> {
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        serde_yaml::from_str(content)
            .with_context(|| format!("'{}' is not valid YAML", path.display()))
    } else {
        serde_json::from_str(content)
            .with_context(|| format!("'{}' is not valid JSON", path.display()))
    }
}

#[derive(Debug, Default)]
pub struct TextCommunicationProtocol;

impl TextCommunicationProtocol {
    pub fn new() -> Self {
        Self
    }

    fn template<'a>(&self, call_template: &'a CallTemplate) -> UtcpResult<&'a TextCallTemplate> {
        call_template.downcast_ref().ok_or_else(|| {
            UtcpError::InvalidArgument("the text protocol requires a text call template".into())
        })
    }
}

#[async_trait]
impl CommunicationProtocol for TextCommunicationProtocol {
    async fn register_manual(
        &self,
        caller: &UtcpClient,
        manual_call_template: &CallTemplate,
    ) -> UtcpResult<RegisterManualResult> {
        let template = self.template(manual_call_template)?;
        let path = resolve_path(caller, &template.file_path);
        debug!(manual = %template.name, path = %path.display(), "reading text manual");

        let outcome: Result<Value> = async {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("cannot read manual file '{}'", path.display()))?;
            parse_by_extension(&path, &content)
        }
        .await;

        let discovered = match outcome {
            Ok(value) => value,
            Err(err) => {
                warn!(manual = %template.name, error = %err, "text manual discovery failed");
                return Ok(RegisterManualResult::failure(
                    manual_call_template.clone(),
                    vec![format!("{err:#}")],
                ));
            }
        };

        if looks_like_openapi(&discovered) {
            return Ok(RegisterManualResult::failure(
                manual_call_template.clone(),
                vec![format!(
                    "'{}' holds an OpenAPI specification; provide a native UTCP manual instead",
                    path.display()
                )],
            ));
        }

        match manual_from_discovery(discovered, manual_call_template) {
            Ok(manual) => {
                info!(
                    manual = %template.name,
                    tools = manual.tools.len(),
                    path = %path.display(),
                    "loaded text manual"
                );
                Ok(RegisterManualResult::success(
                    manual_call_template.clone(),
                    manual,
                ))
            }
            Err(err) => Ok(RegisterManualResult::failure(
                manual_call_template.clone(),
                vec![err.to_string()],
            )),
        }
    }

    async fn deregister_manual(
        &self,
        _caller: &UtcpClient,
        manual_call_template: &CallTemplate,
    ) -> UtcpResult<()> {
        debug!(manual = manual_call_template.name(), "deregistering text manual (no-op)");
        Ok(())
    }

    async fn call_tool(
        &self,
        caller: &UtcpClient,
        tool_name: &str,
        _arguments: &Map<String, Value>,
        tool_call_template: &CallTemplate,
    ) -> UtcpResult<Value> {
        let template = self.template(tool_call_template)?;
        let path = resolve_path(caller, &template.file_path);
        debug!(tool = tool_name, path = %path.display(), "reading text content");

        let content = tokio::fs::read_to_string(&path).await.map_err(|err| {
            UtcpError::Transport(anyhow!(err).context(format!(
                "cannot read file '{}' for tool '{tool_name}'",
                path.display()
            )))
        })?;
        Ok(Value::String(content))
    }

    async fn call_tool_streaming(
        &self,
        caller: &UtcpClient,
        tool_name: &str,
        arguments: &Map<String, Value>,
        tool_call_template: &CallTemplate,
    ) -> UtcpResult<ToolCallStream> {
        let content = self
            .call_tool(caller, tool_name, arguments, tool_call_template)
            .await?;
        Ok(futures::stream::iter([Ok(content)]).boxed())
    }
}

static REGISTER: Once = Once::new();

/// Bind the text protocol and its call template serializer into the
/// plugin registry. Idempotent.
pub fn register() {
    REGISTER.call_once(|| {
        utcp_core::plugins::ensure_plugins_initialized();
        register_call_template(
            TEXT_TEMPLATE_TYPE,
            Arc::new(CallTemplateVariantSerializer::<TextCallTemplate>::new(
                TEXT_TEMPLATE_TYPE,
            )),
            false,
        );
        register_communication_protocol(
            TEXT_TEMPLATE_TYPE,
            Arc::new(TextCommunicationProtocol::new()),
            false,
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[tokio::test]
    async fn manual_and_content_round() {
        register();
        let client = UtcpClient::create(None, None).await.unwrap();

        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            "{}",
            json!({"tools": [{"name": "read", "description": "", "tags": []}]})
        )
        .unwrap();

        let template = CallTemplate::new(TextCallTemplate {
            name: "notes".into(),
            file_path: file.path().to_string_lossy().into_owned(),
            auth_tools: None,
        });
        let protocol = TextCommunicationProtocol::new();

        let result = protocol.register_manual(&client, &template).await.unwrap();
        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.manual.tools[0].name, "read");

        let content = protocol
            .call_tool(&client, "notes.read", &Map::new(), &template)
            .await
            .unwrap();
        assert!(content.as_str().unwrap().contains("\"tools\""));
    }

    #[test]
    fn template_round_trips() {
        register();
        let record = json!({
            "name": "notes",
            "call_template_type": "text",
            "file_path": "manual.json"
        });
        let template = CallTemplate::from_value(&record).unwrap();
        assert_eq!(template.to_value().unwrap(), record);
    }
}
