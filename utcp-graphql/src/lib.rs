//! GraphQL communication protocol.
//!
//! Discovery introspects the endpoint's schema and emits one tool per
//! query, mutation and subscription field. Invocation builds the
//! operation document with `String` variables, posts it, and returns the
//! response's `data` object; GraphQL errors surface as failures. The
//! endpoint must be HTTPS, with a loopback exception for plain HTTP.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use utcp_core::plugins::{register_call_template, register_communication_protocol};
use utcp_core::{
    random_template_name, ApiKeyAuth, ApiKeyLocation, Auth, BasicAuth, CallTemplate,
    CallTemplateKind, CallTemplateVariantSerializer, CommunicationProtocol, JsonSchema,
    OAuth2Auth, RegisterManualResult, Tool, ToolCallStream, UtcpClient, UtcpError, UtcpManual,
    UtcpResult,
};

pub const GRAPHQL_TEMPLATE_TYPE: &str = "graphql";

const INTROSPECTION_QUERY: &str = "\
query IntrospectOperations {
  __schema {
    queryType { fields { name description } }
    mutationType { fields { name description } }
    subscriptionType { fields { name description } }
  }
}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl OperationType {
    fn keyword(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }
}

/// Call template for GraphQL endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQlCallTemplate {
    #[serde(default = "random_template_name")]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub operation_type: OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_fields: Option<Vec<String>>,
    /// Request timeout in milliseconds.
    #[serde(default = "GraphQlCallTemplate::default_timeout")]
    pub timeout: u64,
}

impl GraphQlCallTemplate {
    fn default_timeout() -> u64 {
        30_000
    }
}

impl CallTemplateKind for GraphQlCallTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    fn call_template_type(&self) -> &str {
        GRAPHQL_TEMPLATE_TYPE
    }

    fn auth(&self) -> Option<&Auth> {
        self.auth.as_ref()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn enforce_https_or_localhost(url: &str) -> Result<()> {
    if url.starts_with("https://")
        || url.starts_with("http://localhost")
        || url.starts_with("http://127.0.0.1")
    {
        Ok(())
    } else {
        bail!(
            "GraphQL URL must use HTTPS or start with http://localhost or http://127.0.0.1, got: {url}"
        );
    }
}

/// Build the operation document for a field, declaring every argument as a
/// `String` variable.
fn build_operation(
    operation_type: OperationType,
    field: &str,
    operation_name: Option<&str>,
    arguments: &Map<String, Value>,
) -> String {
    let declarations = arguments
        .keys()
        .map(|name| format!("${name}: String"))
        .collect::<Vec<_>>()
        .join(", ");
    let bindings = arguments
        .keys()
        .map(|name| format!("{name}: ${name}"))
        .collect::<Vec<_>>()
        .join(", ");

    let declarations = if declarations.is_empty() {
        String::new()
    } else {
        format!("({declarations})")
    };
    let bindings = if bindings.is_empty() {
        String::new()
    } else {
        format!("({bindings})")
    };
    let name = operation_name.unwrap_or_default();

    format!(
        "{} {}{} {{ {}{} }}",
        operation_type.keyword(),
        name,
        declarations,
        field,
        bindings
    )
}

#[derive(Debug, Default)]
pub struct GraphQlCommunicationProtocol {
    client: reqwest::Client,
}

impl GraphQlCommunicationProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    fn template<'a>(
        &self,
        call_template: &'a CallTemplate,
    ) -> UtcpResult<&'a GraphQlCallTemplate> {
        call_template.downcast_ref().ok_or_else(|| {
            UtcpError::InvalidArgument(
                "the graphql protocol requires a graphql call template".into(),
            )
        })
    }

    async fn post(
        &self,
        template: &GraphQlCallTemplate,
        payload: Value,
        arguments: &Map<String, Value>,
    ) -> Result<Value> {
        enforce_https_or_localhost(&template.url)?;

        let mut request = self
            .client
            .post(&template.url)
            .timeout(Duration::from_millis(template.timeout))
            .json(&payload);

        if let Some(headers) = &template.headers {
            for (name, value) in headers {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        if let Some(header_fields) = &template.header_fields {
            for field in header_fields {
                if let Some(value) = arguments.get(field) {
                    let rendered = match value {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    request = request.header(field.as_str(), rendered);
                }
            }
        }
        if let Some(auth) = &template.auth {
            if let Some(api_key) = auth.downcast_ref::<ApiKeyAuth>() {
                if api_key.location == ApiKeyLocation::Header {
                    request = request.header(api_key.var_name.as_str(), api_key.api_key.as_str());
                }
            } else if let Some(basic) = auth.downcast_ref::<BasicAuth>() {
                request = request.basic_auth(&basic.username, Some(&basic.password));
            } else if auth.downcast_ref::<OAuth2Auth>().is_some() {
                bail!("OAuth2 for GraphQL endpoints is not supported; use an API key or basic auth");
            }
        }

        let response = request.send().await.context("GraphQL request failed")?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .context("GraphQL endpoint returned invalid JSON")?;
        if !status.is_success() {
            bail!("GraphQL endpoint answered with status {status}: {body}");
        }
        if let Some(errors) = body.get("errors").filter(|errors| !errors.is_null()) {
            bail!("GraphQL operation failed: {errors}");
        }
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }

    fn tools_from_introspection(
        &self,
        schema: &Value,
        manual_call_template: &CallTemplate,
    ) -> Vec<Tool> {
        let mut tools = Vec::new();
        for type_key in ["queryType", "mutationType", "subscriptionType"] {
            let fields = schema
                .get("__schema")
                .and_then(|s| s.get(type_key))
                .and_then(|t| t.get("fields"))
                .and_then(Value::as_array);
            let Some(fields) = fields else {
                continue;
            };
            for field in fields {
                let Some(name) = field.get("name").and_then(Value::as_str) else {
                    continue;
                };
                tools.push(Tool {
                    name: name.to_string(),
                    description: field
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    inputs: JsonSchema::default(),
                    outputs: JsonSchema::default(),
                    tags: Vec::new(),
                    average_response_size: None,
                    tool_call_template: manual_call_template.clone(),
                });
            }
        }
        tools
    }
}

#[async_trait]
impl CommunicationProtocol for GraphQlCommunicationProtocol {
    async fn register_manual(
        &self,
        _caller: &UtcpClient,
        manual_call_template: &CallTemplate,
    ) -> UtcpResult<RegisterManualResult> {
        let template = self.template(manual_call_template)?;
        debug!(manual = %template.name, url = %template.url, "introspecting GraphQL schema");

        let payload = json!({ "query": INTROSPECTION_QUERY });
        let data = match self.post(template, payload, &Map::new()).await {
            Ok(data) => data,
            Err(err) => {
                warn!(manual = %template.name, error = %err, "GraphQL introspection failed");
                return Ok(RegisterManualResult::failure(
                    manual_call_template.clone(),
                    vec![format!("{err:#}")],
                ));
            }
        };

        let tools = self.tools_from_introspection(&data, manual_call_template);
        info!(
            manual = %template.name,
            tools = tools.len(),
            "introspected GraphQL schema"
        );
        Ok(RegisterManualResult::success(
            manual_call_template.clone(),
            UtcpManual::new(tools),
        ))
    }

    async fn deregister_manual(
        &self,
        _caller: &UtcpClient,
        _manual_call_template: &CallTemplate,
    ) -> UtcpResult<()> {
        // Stateless per-operation transport.
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
        let field = tool_name.rsplit('.').next().unwrap_or(tool_name);
        let document = build_operation(
            template.operation_type,
            field,
            template.operation_name.as_deref(),
            arguments,
        );

        let mut payload = json!({
            "query": document,
            "variables": Value::Object(arguments.clone()),
        });
        if let Some(operation_name) = &template.operation_name {
            payload["operationName"] = json!(operation_name);
        }

        self.post(template, payload, arguments)
            .await
            .map_err(|err| UtcpError::Transport(err.context(format!("calling '{tool_name}'"))))
    }

    /// Subscriptions over plain HTTP resolve to a single response.
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

/// Bind the graphql protocol and its call template serializer into the
/// plugin registry. Idempotent.
pub fn register() {
    REGISTER.call_once(|| {
        utcp_core::plugins::ensure_plugins_initialized();
        register_call_template(
            GRAPHQL_TEMPLATE_TYPE,
            Arc::new(CallTemplateVariantSerializer::<GraphQlCallTemplate>::new(
                GRAPHQL_TEMPLATE_TYPE,
            )),
            false,
        );
        register_communication_protocol(
            GRAPHQL_TEMPLATE_TYPE,
            Arc::new(GraphQlCommunicationProtocol::new()),
            false,
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_declare_string_variables() {
        let mut arguments = Map::new();
        arguments.insert("city".into(), json!("Berlin"));
        arguments.insert("units".into(), json!("metric"));
        let document = build_operation(OperationType::Query, "weather", None, &arguments);
        assert_eq!(
            document,
            "query ($city: String, $units: String) { weather(city: $city, units: $units) }"
        );
    }

    #[test]
    fn operations_without_arguments_have_no_parentheses() {
        let document = build_operation(OperationType::Mutation, "reset", Some("Reset"), &Map::new());
        assert_eq!(document, "mutation Reset { reset }");
    }

    #[test]
    fn insecure_urls_are_rejected() {
        assert!(enforce_https_or_localhost("https://api.example.com/graphql").is_ok());
        assert!(enforce_https_or_localhost("http://localhost:8080/graphql").is_ok());
        assert!(enforce_https_or_localhost("http://api.example.com/graphql").is_err());
    }

    #[test]
    fn introspection_fields_become_tools() {
        register();
        let protocol = GraphQlCommunicationProtocol::new();
        let template = CallTemplate::new(GraphQlCallTemplate {
            name: "gql".into(),
            url: "https://x/graphql".into(),
            operation_type: OperationType::Query,
            operation_name: None,
            auth: None,
            headers: None,
            header_fields: None,
            timeout: 30_000,
        });
        let data = json!({
            "__schema": {
                "queryType": {"fields": [{"name": "weather", "description": "current weather"}]},
                "mutationType": {"fields": [{"name": "setCity", "description": null}]},
                "subscriptionType": null
            }
        });
        let tools = protocol.tools_from_introspection(&data, &template);
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["weather", "setCity"]);
        assert_eq!(tools[0].description, "current weather");
    }
}
