//! Request/response HTTP protocol.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use utcp_core::{
    looks_like_openapi, manual_from_discovery, random_template_name, ApiKeyAuth, ApiKeyLocation,
    Auth, BasicAuth, CallTemplate, CallTemplateKind, CommunicationProtocol, OAuth2Auth,
    RegisterManualResult, ToolCallStream, UtcpClient, UtcpError, UtcpResult,
};

use crate::oauth::OAuth2TokenCache;

pub const HTTP_TEMPLATE_TYPE: &str = "http";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HttpMethod {
    #[default]
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "PATCH")]
    Patch,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Patch => reqwest::Method::PATCH,
        }
    }
}

/// Call template for RESTful HTTP endpoints.
///
/// The URL may carry `{parameter}` path placeholders filled from tool
/// arguments. Arguments named in `header_fields` become request headers,
/// the `body_field` argument becomes the request body, and every other
/// argument is passed as a query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpCallTemplate {
    #[serde(default = "random_template_name")]
    pub name: String,
    #[serde(default)]
    pub http_method: HttpMethod,
    pub url: String,
    #[serde(default = "HttpCallTemplate::default_content_type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    /// Authentication applied to tools generated from provider-native
    /// formats, kept for wire compatibility.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_tools: Option<Auth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default = "HttpCallTemplate::default_body_field")]
    pub body_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_fields: Option<Vec<String>>,
    /// Request timeout in milliseconds.
    #[serde(default = "HttpCallTemplate::default_timeout")]
    pub timeout: u64,
}

impl HttpCallTemplate {
    fn default_content_type() -> String {
        "application/json".into()
    }

    fn default_body_field() -> Option<String> {
        Some("body".into())
    }

    fn default_timeout() -> u64 {
        30_000
    }
}

impl CallTemplateKind for HttpCallTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    fn call_template_type(&self) -> &str {
        HTTP_TEMPLATE_TYPE
    }

    fn auth(&self) -> Option<&Auth> {
        self.auth.as_ref()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Render an argument for a URL, header or query position.
pub(crate) fn argument_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Fill `{name}` path placeholders from the arguments, consuming the ones
/// that were used.
pub(crate) fn substitute_path_params(url: &str, arguments: &mut Map<String, Value>) -> String {
    let mut url = url.to_string();
    let keys: Vec<String> = arguments.keys().cloned().collect();
    for key in keys {
        let marker = format!("{{{key}}}");
        if url.contains(&marker) {
            if let Some(value) = arguments.remove(&key) {
                url = url.replace(&marker, &argument_text(&value));
            }
        }
    }
    url
}

/// Apply an authentication descriptor to a request.
pub(crate) async fn apply_auth(
    mut request: reqwest::RequestBuilder,
    client: &reqwest::Client,
    oauth: &OAuth2TokenCache,
    auth: Option<&Auth>,
) -> Result<reqwest::RequestBuilder> {
    let Some(auth) = auth else {
        return Ok(request);
    };

    if let Some(api_key) = auth.downcast_ref::<ApiKeyAuth>() {
        request = match api_key.location {
            ApiKeyLocation::Header => {
                request.header(api_key.var_name.as_str(), api_key.api_key.as_str())
            }
            ApiKeyLocation::Query => request.query(&[(&api_key.var_name, &api_key.api_key)]),
            ApiKeyLocation::Cookie => request.header(
                reqwest::header::COOKIE,
                format!("{}={}", api_key.var_name, api_key.api_key),
            ),
        };
    } else if let Some(basic) = auth.downcast_ref::<BasicAuth>() {
        request = request.basic_auth(&basic.username, Some(&basic.password));
    } else if let Some(oauth2) = auth.downcast_ref::<OAuth2Auth>() {
        let token = oauth.bearer_token(client, oauth2).await?;
        request = request.header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"));
    } else {
        return Err(anyhow!(
            "unsupported auth scheme '{}' for an HTTP-family call",
            auth.auth_type()
        ));
    }
    Ok(request)
}

/// Decode an HTTP body: JSON when it parses, the raw text otherwise.
pub(crate) fn decode_body(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

#[derive(Debug, Default)]
pub struct HttpCommunicationProtocol {
    client: reqwest::Client,
    oauth: OAuth2TokenCache,
}

impl HttpCommunicationProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    fn template<'a>(&self, call_template: &'a CallTemplate) -> UtcpResult<&'a HttpCallTemplate> {
        call_template.downcast_ref().ok_or_else(|| {
            UtcpError::InvalidArgument(
                "the http protocol requires an http call template".into(),
            )
        })
    }

    async fn build_request(
        &self,
        template: &HttpCallTemplate,
        arguments: &Map<String, Value>,
    ) -> Result<reqwest::RequestBuilder> {
        let mut arguments = arguments.clone();
        let url = substitute_path_params(&template.url, &mut arguments);

        let mut request = self
            .client
            .request(template.http_method.into(), url)
            .timeout(Duration::from_millis(template.timeout));

        if let Some(headers) = &template.headers {
            for (name, value) in headers {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        if let Some(header_fields) = &template.header_fields {
            for field in header_fields {
                if let Some(value) = arguments.remove(field) {
                    request = request.header(field.as_str(), argument_text(&value));
                }
            }
        }

        let body = template
            .body_field
            .as_ref()
            .and_then(|field| arguments.remove(field));

        let query: Vec<(String, String)> = arguments
            .iter()
            .map(|(key, value)| (key.clone(), argument_text(value)))
            .collect();
        if !query.is_empty() {
            request = request.query(&query);
        }

        request = apply_auth(request, &self.client, &self.oauth, template.auth.as_ref()).await?;

        if let Some(body) = body {
            request = if template.content_type.contains("application/json") {
                request.json(&body)
            } else {
                request
                    .header(reqwest::header::CONTENT_TYPE, &template.content_type)
                    .body(argument_text(&body))
            };
        }

        Ok(request)
    }

    async fn execute(
        &self,
        template: &HttpCallTemplate,
        arguments: &Map<String, Value>,
    ) -> Result<Value> {
        let request = self.build_request(template, arguments).await?;
        let response = request.send().await.context("HTTP request failed")?;
        let status = response.status();
        let text = response
            .text()
            .await
            .context("cannot read HTTP response body")?;
        if !status.is_success() {
            return Err(anyhow!(
                "HTTP request to '{}' failed with status {status}: {}",
                template.url,
                text.chars().take(200).collect::<String>()
            ));
        }
        Ok(decode_body(text))
    }
}

#[async_trait]
impl CommunicationProtocol for HttpCommunicationProtocol {
    async fn register_manual(
        &self,
        _caller: &UtcpClient,
        manual_call_template: &CallTemplate,
    ) -> UtcpResult<RegisterManualResult> {
        let template = self.template(manual_call_template)?;
        debug!(manual = %template.name, url = %template.url, "discovering HTTP manual");

        let discovered = match self.execute(template, &Map::new()).await {
            Ok(value) => value,
            Err(err) => {
                warn!(manual = %template.name, error = %err, "HTTP manual discovery failed");
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
                    "'{}' returned an OpenAPI specification; provide a native UTCP manual instead",
                    template.url
                )],
            ));
        }

        match manual_from_discovery(discovered, manual_call_template) {
            Ok(manual) => {
                info!(
                    manual = %template.name,
                    tools = manual.tools.len(),
                    "discovered HTTP manual"
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
        _manual_call_template: &CallTemplate,
    ) -> UtcpResult<()> {
        // Stateless transport, nothing to release.
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
        self.execute(template, arguments)
            .await
            .map_err(|err| UtcpError::Transport(err.context(format!("calling '{tool_name}'"))))
    }

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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use utcp_core::Serializer;

    #[test]
    fn template_defaults_apply() {
        crate::register();
        let template = CallTemplate::from_value(&json!({
            "name": "api",
            "call_template_type": "http",
            "url": "https://api.example.com/users/{user_id}"
        }))
        .unwrap();
        let http: &HttpCallTemplate = template.downcast_ref().unwrap();
        assert_eq!(http.http_method, HttpMethod::Get);
        assert_eq!(http.content_type, "application/json");
        assert_eq!(http.body_field.as_deref(), Some("body"));
        assert_eq!(http.timeout, 30_000);
    }

    #[test]
    fn template_round_trips_with_auth() {
        crate::register();
        let record = json!({
            "name": "secure_api",
            "call_template_type": "http",
            "http_method": "POST",
            "url": "https://api.example.com/users",
            "content_type": "application/json",
            "auth": {
                "auth_type": "api_key",
                "api_key": "Bearer ${API_KEY}",
                "var_name": "Authorization",
                "location": "header"
            },
            "body_field": "body",
            "timeout": 30000
        });
        let serializer = utcp_core::CallTemplateSerializer;
        let template = serializer.validate_value(&record).unwrap();
        assert_eq!(serializer.to_value(&template).unwrap(), record);
    }

    #[test]
    fn path_params_consume_their_arguments() {
        let mut arguments = Map::new();
        arguments.insert("user_id".into(), json!(42));
        arguments.insert("q".into(), json!("abc"));
        let url = substitute_path_params("https://x/users/{user_id}", &mut arguments);
        assert_eq!(url, "https://x/users/42");
        assert!(!arguments.contains_key("user_id"));
        assert!(arguments.contains_key("q"));
    }

    #[test]
    fn non_json_bodies_decode_as_text() {
        assert_eq!(decode_body("plain text".into()), json!("plain text"));
        assert_eq!(decode_body("{\"a\": 1}".into()), json!({"a": 1}));
    }
}
