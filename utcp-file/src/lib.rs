//! File communication protocol.
//!
//! Registers manuals read from local JSON or YAML files and serves tool
//! calls by returning a file's textual content. No persistent connections
//! are held; relative paths resolve against the client's root directory.

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

pub const FILE_TEMPLATE_TYPE: &str = "file";

/// Call template pointing at a local manual or content file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCallTemplate {
    #[serde(default = "random_template_name")]
    pub name: String,
    /// Path to the file; relative paths resolve against the client's root
    /// directory.
    pub file_path: String,
    /// Authentication intended for tools generated from provider-native
    /// formats, carried for wire compatibility.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_tools: Option<Auth>,
}

impl CallTemplateKind for FileCallTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    fn call_template_type(&self) -> &str {
        FILE_TEMPLATE_TYPE
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
pub struct FileCommunicationProtocol;

impl FileCommunicationProtocol {
    pub fn new() -> Self {
        Self
    }

    fn template<'a>(&self, call_template: &'a CallTemplate) -> UtcpResult<&'a FileCallTemplate> {
        call_template.downcast_ref().ok_or_else(|| {
            UtcpError::InvalidArgument("the file protocol requires a file call template".into())
        })
    }
}

#[async_trait]
impl CommunicationProtocol for FileCommunicationProtocol {
    async fn register_manual(
        &self,
        caller: &UtcpClient,
        manual_call_template: &CallTemplate,
    ) -> UtcpResult<RegisterManualResult> {
        let template = self.template(manual_call_template)?;
        let path = resolve_path(caller, &template.file_path);
        debug!(manual = %template.name, path = %path.display(), "reading manual file");

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
                warn!(manual = %template.name, error = %err, "manual file discovery failed");
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
                    "loaded manual file"
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
        debug!(manual = manual_call_template.name(), "deregistering file manual (no-op)");
        Ok(())
    }

    /// Tool calls return the configured file's textual content.
    async fn call_tool(
        &self,
        caller: &UtcpClient,
        tool_name: &str,
        _arguments: &Map<String, Value>,
        tool_call_template: &CallTemplate,
    ) -> UtcpResult<Value> {
        let template = self.template(tool_call_template)?;
        let path = resolve_path(caller, &template.file_path);
        debug!(tool = tool_name, path = %path.display(), "reading file content");

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

/// Bind the file protocol and its call template serializer into the
/// plugin registry. Idempotent.
pub fn register() {
    REGISTER.call_once(|| {
        utcp_core::plugins::ensure_plugins_initialized();
        register_call_template(
            FILE_TEMPLATE_TYPE,
            Arc::new(CallTemplateVariantSerializer::<FileCallTemplate>::new(
                FILE_TEMPLATE_TYPE,
            )),
            false,
        );
        register_communication_protocol(
            FILE_TEMPLATE_TYPE,
            Arc::new(FileCommunicationProtocol::new()),
            false,
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn manual_json() -> Value {
        json!({
            "utcp_version": "1.0.0",
            "manual_version": "1.0.0",
            "tools": [{
                "name": "echo",
                "description": "returns the file content",
                "inputs": {"type": "object"},
                "outputs": {"type": "string"},
                "tags": ["files"]
            }]
        })
    }

    async fn client() -> UtcpClient {
        register();
        UtcpClient::create(None, None).await.unwrap()
    }

    fn file_template(name: &str, path: &Path) -> CallTemplate {
        CallTemplate::new(FileCallTemplate {
            name: name.into(),
            file_path: path.to_string_lossy().into_owned(),
            auth_tools: None,
        })
    }

    #[tokio::test]
    async fn manual_loads_and_tools_inherit_the_template() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "{}", manual_json()).unwrap();

        let client = client().await;
        let protocol = FileCommunicationProtocol::new();
        let result = protocol
            .register_manual(&client, &file_template("files", file.path()))
            .await
            .unwrap();

        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.manual.tools.len(), 1);
        assert_eq!(
            result.manual.tools[0]
                .tool_call_template
                .call_template_type(),
            FILE_TEMPLATE_TYPE
        );
    }

    #[tokio::test]
    async fn yaml_manuals_parse_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "utcp_version: 1.0.0").unwrap();
        writeln!(file, "manual_version: 1.0.0").unwrap();
        writeln!(file, "tools: []").unwrap();

        let client = client().await;
        let protocol = FileCommunicationProtocol::new();
        let result = protocol
            .register_manual(&client, &file_template("yaml_manual", file.path()))
            .await
            .unwrap();
        assert!(result.success, "errors: {:?}", result.errors);
        assert!(result.manual.tools.is_empty());
    }

    #[tokio::test]
    async fn invalid_json_reports_failure_without_raising() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "{{ not json").unwrap();

        let client = client().await;
        let protocol = FileCommunicationProtocol::new();
        let result = protocol
            .register_manual(&client, &file_template("broken", file.path()))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(!result.errors.is_empty());
    }

    #[tokio::test]
    async fn missing_file_reports_failure() {
        let client = client().await;
        let protocol = FileCommunicationProtocol::new();
        let result = protocol
            .register_manual(
                &client,
                &file_template("missing", Path::new("/nonexistent/manual.json")),
            )
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn openapi_documents_are_rejected() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "{}", json!({"openapi": "3.0.0", "paths": {}})).unwrap();

        let client = client().await;
        let protocol = FileCommunicationProtocol::new();
        let result = protocol
            .register_manual(&client, &file_template("spec", file.path()))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.errors[0].contains("OpenAPI"));
    }

    #[tokio::test]
    async fn call_tool_returns_the_file_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "hello from disk").unwrap();

        let client = client().await;
        let protocol = FileCommunicationProtocol::new();
        let value = protocol
            .call_tool(
                &client,
                "files.echo",
                &Map::new(),
                &file_template("files", file.path()),
            )
            .await
            .unwrap();
        assert_eq!(value, json!("hello from disk"));
    }

    #[tokio::test]
    async fn relative_paths_resolve_against_the_root_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("m.json"), manual_json().to_string()).unwrap();

        register();
        let client = UtcpClient::create(Some(dir.path().to_path_buf()), None)
            .await
            .unwrap();
        let template = CallTemplate::new(FileCallTemplate {
            name: "rel".into(),
            file_path: "m.json".into(),
            auth_tools: None,
        });
        let result = FileCommunicationProtocol::new()
            .register_manual(&client, &template)
            .await
            .unwrap();
        assert!(result.success, "errors: {:?}", result.errors);
    }
}
