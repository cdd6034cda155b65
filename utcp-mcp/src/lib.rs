//! Model Context Protocol communication protocol.
//!
//! A single MCP call template can describe several servers, each reached
//! over a stdio child process or streamable HTTP. Registration connects
//! every configured server, lists its tools (and, optionally, resources)
//! and keeps the live sessions, keyed by the manual name, for later
//! invocations; deregistration cancels and drops them. Tool names are
//! namespaced as `<server>.<tool>` inside the manual.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Once;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use indexmap::IndexMap;
use rmcp::handler::client::ClientHandler;
use rmcp::model::{CallToolRequestParams, CallToolResult};
use rmcp::service::{serve_client, RoleClient, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::transport::streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use utcp_core::plugins::{register_call_template, register_communication_protocol};
use utcp_core::{
    random_template_name, Auth, CallTemplate, CallTemplateKind, CallTemplateVariantSerializer,
    CommunicationProtocol, JsonSchema, OAuth2Auth, RegisterManualResult, Tool, ToolCallStream,
    UtcpClient, UtcpError, UtcpManual, UtcpResult,
};

pub const MCP_TEMPLATE_TYPE: &str = "mcp";

/// One MCP server: a stdio command or an HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Optional transport hint (`stdio` or `http`); inferred from the
    /// other fields when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl McpServerConfig {
    fn is_http(&self) -> bool {
        self.transport.as_deref() == Some("http") || (self.url.is_some() && self.command.is_none())
    }
}

/// Container mirroring the standard MCP server configuration format.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: IndexMap<String, McpServerConfig>,
}

/// Call template for MCP providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpCallTemplate {
    #[serde(default = "random_template_name")]
    pub name: String,
    #[serde(default)]
    pub config: McpConfig,
    /// OAuth2 client credentials for HTTP servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    /// Expose listed resources as zero-argument tools.
    #[serde(default)]
    pub register_resources_as_tools: bool,
}

impl CallTemplateKind for McpCallTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    fn call_template_type(&self) -> &str {
        MCP_TEMPLATE_TYPE
    }

    fn auth(&self) -> Option<&Auth> {
        self.auth.as_ref()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Clone)]
struct UtcpMcpHandler;

impl ClientHandler for UtcpMcpHandler {
    fn get_info(&self) -> rmcp::model::ClientInfo {
        serde_json::from_value(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "utcp", "version": env!("CARGO_PKG_VERSION")}
        }))
        .expect("static client info is valid")
    }
}

type McpService = RunningService<RoleClient, UtcpMcpHandler>;

/// Live state for one registered manual.
struct ManualSessions {
    services: IndexMap<String, Arc<McpService>>,
    /// Tool name (`server.name`) to resource URI for resource-backed tools.
    resource_uris: HashMap<String, String>,
}

#[derive(Default)]
pub struct McpCommunicationProtocol {
    http: reqwest::Client,
    sessions: Mutex<HashMap<String, ManualSessions>>,
    tokens: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl McpCommunicationProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    fn template<'a>(&self, call_template: &'a CallTemplate) -> UtcpResult<&'a McpCallTemplate> {
        call_template.downcast_ref().ok_or_else(|| {
            UtcpError::InvalidArgument("the mcp protocol requires an mcp call template".into())
        })
    }

    async fn bearer_token(&self, auth: &OAuth2Auth) -> Result<String> {
        let mut tokens = self.tokens.lock().await;
        if let Some((token, expires_at)) = tokens.get(&auth.client_id) {
            let fresh = expires_at.map_or(true, |expiry| Instant::now() < expiry);
            if fresh {
                return Ok(token.clone());
            }
        }

        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", auth.client_id.as_str()),
            ("client_secret", auth.client_secret.as_str()),
        ];
        if let Some(scope) = &auth.scope {
            form.push(("scope", scope.as_str()));
        }
        let response = self
            .http
            .post(&auth.token_url)
            .form(&form)
            .send()
            .await
            .with_context(|| format!("cannot reach OAuth2 token endpoint '{}'", auth.token_url))?;
        if !response.status().is_success() {
            bail!(
                "OAuth2 token request to '{}' failed with status {}",
                auth.token_url,
                response.status()
            );
        }
        let body: Value = response
            .json()
            .await
            .context("OAuth2 token endpoint returned an invalid response")?;
        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("OAuth2 token response carries no access_token"))?
            .to_string();
        let expires_at = body
            .get("expires_in")
            .and_then(Value::as_u64)
            .map(|seconds| Instant::now() + Duration::from_secs(seconds));
        tokens.insert(auth.client_id.clone(), (token.clone(), expires_at));
        Ok(token)
    }

    async fn connect_server(
        &self,
        server_name: &str,
        server: &McpServerConfig,
        auth: Option<&Auth>,
    ) -> Result<McpService> {
        if server.is_http() {
            let url = server
                .url
                .as_deref()
                .ok_or_else(|| anyhow!("http MCP server '{server_name}' declares no url"))?;
            let mut config = StreamableHttpClientTransportConfig::with_uri(url.to_string());
            if let Some(auth) = auth {
                let oauth2: &OAuth2Auth = auth.downcast_ref().ok_or_else(|| {
                    anyhow!("MCP servers only support oauth2 auth, got '{}'", auth.auth_type())
                })?;
                let token = self.bearer_token(oauth2).await?;
                config = config.auth_header(token);
            }
            let transport =
                StreamableHttpClientTransport::with_client(rmcp_reqwest::Client::new(), config);
            debug!(server = server_name, url, "connecting MCP server over http");
            serve_client(UtcpMcpHandler, transport)
                .await
                .with_context(|| format!("cannot establish MCP session with '{server_name}'"))
        } else {
            let command = server
                .command
                .as_deref()
                .ok_or_else(|| anyhow!("stdio MCP server '{server_name}' declares no command"))?;
            let mut process = tokio::process::Command::new(command);
            process.args(&server.args);
            for (key, value) in &server.env {
                process.env(key, value);
            }
            if let Some(cwd) = &server.cwd {
                process.current_dir(cwd);
            }
            let transport = TokioChildProcess::new(process)
                .with_context(|| format!("cannot spawn MCP server '{server_name}'"))?;
            debug!(server = server_name, command, "connecting MCP server over stdio");
            serve_client(UtcpMcpHandler, transport)
                .await
                .with_context(|| format!("cannot establish MCP session with '{server_name}'"))
        }
    }

    /// Connect every configured server, returning the sessions and the
    /// tools they advertise.
    async fn open_manual(
        &self,
        template: &McpCallTemplate,
        manual_call_template: &CallTemplate,
    ) -> Result<(ManualSessions, Vec<Tool>)> {
        let mut services = IndexMap::new();
        let mut resource_uris = HashMap::new();
        let mut tools = Vec::new();

        for (server_name, server) in &template.config.mcp_servers {
            let service = self
                .connect_server(server_name, server, template.auth.as_ref())
                .await?;

            let listed = service
                .peer()
                .list_all_tools()
                .await
                .with_context(|| format!("cannot list tools of MCP server '{server_name}'"))?;
            for listed_tool in listed {
                let record = serde_json::to_value(&listed_tool)
                    .context("MCP tool description does not serialize")?;
                let tool_name = record
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("MCP tool without a name"))?;
                let inputs = record
                    .get("inputSchema")
                    .cloned()
                    .map(serde_json::from_value::<JsonSchema>)
                    .transpose()
                    .unwrap_or_default()
                    .unwrap_or_default();
                tools.push(Tool {
                    name: format!("{server_name}.{tool_name}"),
                    description: record
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    inputs,
                    outputs: JsonSchema::default(),
                    tags: vec!["mcp".into(), server_name.clone()],
                    average_response_size: None,
                    tool_call_template: manual_call_template.clone(),
                });
            }

            if template.register_resources_as_tools {
                let resources = service
                    .peer()
                    .list_all_resources()
                    .await
                    .with_context(|| {
                        format!("cannot list resources of MCP server '{server_name}'")
                    })?;
                for resource in resources {
                    let record = serde_json::to_value(&resource)
                        .context("MCP resource description does not serialize")?;
                    let Some(resource_name) = record.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    let Some(uri) = record.get("uri").and_then(Value::as_str) else {
                        continue;
                    };
                    let tool_name = format!("{server_name}.{resource_name}");
                    resource_uris.insert(tool_name.clone(), uri.to_string());
                    tools.push(Tool {
                        name: tool_name,
                        description: record
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        inputs: JsonSchema::default(),
                        outputs: JsonSchema::default(),
                        tags: vec!["mcp".into(), "resource".into(), server_name.clone()],
                        average_response_size: None,
                        tool_call_template: manual_call_template.clone(),
                    });
                }
            }

            services.insert(server_name.clone(), Arc::new(service));
        }

        Ok((
            ManualSessions {
                services,
                resource_uris,
            },
            tools,
        ))
    }

    /// Sessions for a manual, reconnecting when none are held (e.g. after
    /// a deregister/register cycle or a process restart of the server).
    async fn ensure_sessions(
        &self,
        template: &McpCallTemplate,
        manual_call_template: &CallTemplate,
    ) -> UtcpResult<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&template.name) {
            return Ok(());
        }
        let (opened, _) = self
            .open_manual(template, manual_call_template)
            .await
            .map_err(UtcpError::Transport)?;
        sessions.insert(template.name.clone(), opened);
        Ok(())
    }

    async fn invoke(
        &self,
        template: &McpCallTemplate,
        tool_name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<Value> {
        let sessions = self.sessions.lock().await;
        let manual = sessions
            .get(&template.name)
            .ok_or_else(|| anyhow!("no MCP sessions held for manual '{}'", template.name))?;

        // Strip the manual prefix; the remainder is `<server>.<tool>`.
        let local_name = tool_name
            .strip_prefix(&format!("{}.", template.name))
            .unwrap_or(tool_name);

        if let Some(uri) = manual.resource_uris.get(local_name) {
            let (server_name, _) = local_name.split_once('.').unwrap_or((local_name, ""));
            let service = manual
                .services
                .get(server_name)
                .ok_or_else(|| anyhow!("unknown MCP server '{server_name}'"))?;
            let params = serde_json::from_value(json!({ "uri": uri }))
                .context("resource read parameters do not validate")?;
            let result = service
                .peer()
                .read_resource(params)
                .await
                .with_context(|| format!("cannot read MCP resource '{uri}'"))?;
            return serde_json::to_value(&result).context("resource contents do not serialize");
        }

        let (server_name, bare_tool) = local_name
            .split_once('.')
            .ok_or_else(|| anyhow!("MCP tool names use the form <server>.<tool>, got '{local_name}'"))?;
        let service = manual
            .services
            .get(server_name)
            .ok_or_else(|| anyhow!("unknown MCP server '{server_name}'"))?;

        let result = service
            .call_tool(
                CallToolRequestParams::new(bare_tool.to_string())
                    .with_arguments(arguments.clone()),
            )
            .await
            .with_context(|| format!("MCP call to '{bare_tool}' on '{server_name}' failed"))?;
        decode_call_result(server_name, bare_tool, result)
    }
}

/// Flatten an MCP tool result: structured content when present, a single
/// text block decoded from JSON where possible, the raw content list
/// otherwise. Server-reported errors become failures.
fn decode_call_result(
    server_name: &str,
    tool_name: &str,
    result: CallToolResult,
) -> Result<Value> {
    let text_summary = result
        .content
        .iter()
        .find_map(|content| content.as_text().map(|text| text.text.clone()));

    if result.is_error.unwrap_or(false) {
        let detail = result
            .structured_content
            .as_ref()
            .map(Value::to_string)
            .or_else(|| text_summary.clone())
            .unwrap_or_else(|| "unknown MCP tool error".to_string());
        bail!("MCP tool '{tool_name}' on '{server_name}' reported an error: {detail}");
    }

    if let Some(structured) = result.structured_content {
        return Ok(structured);
    }
    if result.content.len() == 1 {
        if let Some(text) = text_summary {
            return Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)));
        }
    }
    serde_json::to_value(&result.content).context("MCP content does not serialize")
}

#[async_trait]
impl CommunicationProtocol for McpCommunicationProtocol {
    async fn register_manual(
        &self,
        _caller: &UtcpClient,
        manual_call_template: &CallTemplate,
    ) -> UtcpResult<RegisterManualResult> {
        let template = self.template(manual_call_template)?;

        match self.open_manual(template, manual_call_template).await {
            Ok((opened, tools)) => {
                info!(
                    manual = %template.name,
                    servers = opened.services.len(),
                    tools = tools.len(),
                    "connected MCP manual"
                );
                self.sessions
                    .lock()
                    .await
                    .insert(template.name.clone(), opened);
                Ok(RegisterManualResult::success(
                    manual_call_template.clone(),
                    UtcpManual::new(tools),
                ))
            }
            Err(err) => {
                warn!(manual = %template.name, error = %err, "MCP registration failed");
                Ok(RegisterManualResult::failure(
                    manual_call_template.clone(),
                    vec![format!("{err:#}")],
                ))
            }
        }
    }

    /// Cancels and drops the manual's sessions. Idempotent.
    async fn deregister_manual(
        &self,
        _caller: &UtcpClient,
        manual_call_template: &CallTemplate,
    ) -> UtcpResult<()> {
        let template = self.template(manual_call_template)?;
        let Some(manual) = self.sessions.lock().await.remove(&template.name) else {
            return Ok(());
        };
        for (server_name, service) in &manual.services {
            debug!(manual = %template.name, server = %server_name, "closing MCP session");
            service.cancellation_token().cancel();
        }
        Ok(())
    }

    async fn call_tool(
        &self,
        _caller: &UtcpClient,
        tool_name: &str,
        arguments: &Map<String, Value>,
        tool_call_template: &CallTemplate,
    ) -> UtcpResult<Value> {
        let template = self.template(tool_call_template)?;
        self.ensure_sessions(template, tool_call_template).await?;
        self.invoke(template, tool_name, arguments)
            .await
            .map_err(|err| UtcpError::Transport(err.context(format!("calling '{tool_name}'"))))
    }

    /// MCP tool calls are unary; the stream yields the single result.
    async fn call_tool_streaming(
        &self,
        caller: &UtcpClient,
        tool_name: &str,
        arguments: &Map<String, Value>,
        tool_call_template: &CallTemplate,
    ) -> UtcpResult<ToolCallStream> {
        let value = self
            .call_tool(caller, tool_name, arguments, tool_call_template)
            .await?;
        Ok(futures::stream::iter([Ok(value)]).boxed())
    }
}

static REGISTER: Once = Once::new();

/// Bind the mcp protocol and its call template serializer into the plugin
/// registry. Idempotent.
pub fn register() {
    REGISTER.call_once(|| {
        utcp_core::plugins::ensure_plugins_initialized();
        register_call_template(
            MCP_TEMPLATE_TYPE,
            Arc::new(CallTemplateVariantSerializer::<McpCallTemplate>::new(
                MCP_TEMPLATE_TYPE,
            )),
            false,
        );
        register_communication_protocol(
            MCP_TEMPLATE_TYPE,
            Arc::new(McpCommunicationProtocol::new()),
            false,
        );
    });
}
