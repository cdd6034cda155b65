//! Chunked HTTP streaming protocol.
//!
//! Streams a response body as it arrives: newline-delimited JSON bodies
//! yield one decoded value per line, any other body yields its chunks as
//! text (raw bytes surface base64-encoded). The unary call concatenates
//! the body and decodes it once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use utcp_core::{
    looks_like_openapi, manual_from_discovery, random_template_name, Auth, CallTemplate,
    CallTemplateKind, CommunicationProtocol, RegisterManualResult, ToolCallStream, UtcpClient,
    UtcpError, UtcpResult,
};

use crate::http::{apply_auth, argument_text, decode_body, substitute_path_params};
use crate::oauth::OAuth2TokenCache;

pub const STREAMABLE_HTTP_TEMPLATE_TYPE: &str = "streamable_http";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StreamMethod {
    #[default]
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
}

impl From<StreamMethod> for reqwest::Method {
    fn from(method: StreamMethod) -> Self {
        match method {
            StreamMethod::Get => reqwest::Method::GET,
            StreamMethod::Post => reqwest::Method::POST,
        }
    }
}

/// Call template for HTTP endpoints streamed with chunked transfer
/// encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamableHttpCallTemplate {
    #[serde(default = "random_template_name")]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub http_method: StreamMethod,
    #[serde(default = "StreamableHttpCallTemplate::default_content_type")]
    pub content_type: String,
    /// Read granularity hint in bytes for raw bodies.
    #[serde(default = "StreamableHttpCallTemplate::default_chunk_size")]
    pub chunk_size: usize,
    /// Request timeout in milliseconds.
    #[serde(default = "StreamableHttpCallTemplate::default_timeout")]
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_fields: Option<Vec<String>>,
}

impl StreamableHttpCallTemplate {
    fn default_content_type() -> String {
        "application/octet-stream".into()
    }

    fn default_chunk_size() -> usize {
        4096
    }

    fn default_timeout() -> u64 {
        60_000
    }
}

impl CallTemplateKind for StreamableHttpCallTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    fn call_template_type(&self) -> &str {
        STREAMABLE_HTTP_TEMPLATE_TYPE
    }

    fn auth(&self) -> Option<&Auth> {
        self.auth.as_ref()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn is_ndjson(content_type: &str) -> bool {
    content_type.contains("ndjson")
        || content_type.contains("jsonl")
        || content_type.contains("json-seq")
}

fn chunk_to_value(chunk: &[u8]) -> Value {
    match std::str::from_utf8(chunk) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => {
            use base64::Engine as _;
            Value::String(base64::engine::general_purpose::STANDARD.encode(chunk))
        }
    }
}

#[derive(Debug, Default)]
pub struct StreamableHttpCommunicationProtocol {
    client: reqwest::Client,
    oauth: Arc<OAuth2TokenCache>,
}

impl StreamableHttpCommunicationProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    fn template<'a>(
        &self,
        call_template: &'a CallTemplate,
    ) -> UtcpResult<&'a StreamableHttpCallTemplate> {
        call_template.downcast_ref().ok_or_else(|| {
            UtcpError::InvalidArgument(
                "the streamable_http protocol requires a streamable_http call template".into(),
            )
        })
    }

    async fn send(
        &self,
        template: &StreamableHttpCallTemplate,
        arguments: &Map<String, Value>,
    ) -> Result<reqwest::Response> {
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
            request = request.json(&body);
        }

        let response = request.send().await.context("streaming request failed")?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "streaming request to '{}' failed with status {}",
                template.url,
                response.status()
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl CommunicationProtocol for StreamableHttpCommunicationProtocol {
    async fn register_manual(
        &self,
        _caller: &UtcpClient,
        manual_call_template: &CallTemplate,
    ) -> UtcpResult<RegisterManualResult> {
        let template = self.template(manual_call_template)?;
        debug!(manual = %template.name, url = %template.url, "discovering streamable HTTP manual");

        let discovered = match self.send(template, &Map::new()).await {
            Ok(response) => match response.text().await {
                Ok(text) => decode_body(text),
                Err(err) => {
                    return Ok(RegisterManualResult::failure(
                        manual_call_template.clone(),
                        vec![format!("cannot read discovery response: {err}")],
                    ))
                }
            },
            Err(err) => {
                warn!(manual = %template.name, error = %err, "streamable HTTP discovery failed");
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
                    "discovered streamable HTTP manual"
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
        let response = self
            .send(template, arguments)
            .await
            .map_err(|err| UtcpError::Transport(err.context(format!("calling '{tool_name}'"))))?;
        let text = response
            .text()
            .await
            .map_err(|err| UtcpError::Transport(anyhow!(err).context("reading response body")))?;
        Ok(decode_body(text))
    }

    async fn call_tool_streaming(
        &self,
        _caller: &UtcpClient,
        tool_name: &str,
        arguments: &Map<String, Value>,
        tool_call_template: &CallTemplate,
    ) -> UtcpResult<ToolCallStream> {
        let template = self.template(tool_call_template)?;
        let response = self
            .send(template, arguments)
            .await
            .map_err(|err| UtcpError::Transport(err.context(format!("calling '{tool_name}'"))))?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| template.content_type.clone());

        if is_ndjson(&content_type) || content_type.contains("application/json") {
            let bytes = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other));
            let mut lines = FramedRead::new(StreamReader::new(bytes), LinesCodec::new());
            let stream = async_stream::stream! {
                while let Some(line) = lines.next().await {
                    match line {
                        Ok(line) => {
                            if !line.trim().is_empty() {
                                yield Ok(decode_body(line));
                            }
                        }
                        Err(err) => {
                            yield Err(UtcpError::Transport(
                                anyhow!(err).context("stream read failed"),
                            ));
                            break;
                        }
                    }
                }
            };
            Ok(stream.boxed())
        } else {
            let mut chunks = response.bytes_stream();
            let stream = async_stream::stream! {
                while let Some(chunk) = chunks.next().await {
                    match chunk {
                        Ok(chunk) => yield Ok(chunk_to_value(&chunk)),
                        Err(err) => {
                            yield Err(UtcpError::Transport(
                                anyhow!(err).context("stream read failed"),
                            ));
                            break;
                        }
                    }
                }
            };
            Ok(stream.boxed())
        }
    }
}
