//! Server-Sent Events protocol.
//!
//! Discovery fetches the manual from the template URL like the plain HTTP
//! protocol; invocation opens an event stream and yields one decoded value
//! per event. When `reconnect` is set the stream re-establishes the
//! connection after the server closes it, waiting `retry_timeout`
//! milliseconds in between. Dropping the stream closes the connection.

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

pub const SSE_TEMPLATE_TYPE: &str = "sse";

/// Call template for Server-Sent Events endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SseCallTemplate {
    #[serde(default = "random_template_name")]
    pub name: String,
    pub url: String,
    /// Only events of this type are yielded; `None` yields every event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default = "SseCallTemplate::default_reconnect")]
    pub reconnect: bool,
    /// Reconnect delay in milliseconds once the server closes the stream.
    #[serde(default = "SseCallTemplate::default_retry_timeout")]
    pub retry_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_fields: Option<Vec<String>>,
}

impl SseCallTemplate {
    fn default_reconnect() -> bool {
        true
    }

    fn default_retry_timeout() -> u64 {
        30_000
    }
}

impl CallTemplateKind for SseCallTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    fn call_template_type(&self) -> &str {
        SSE_TEMPLATE_TYPE
    }

    fn auth(&self) -> Option<&Auth> {
        self.auth.as_ref()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// One parsed SSE frame.
#[derive(Debug, Default)]
struct Event {
    name: Option<String>,
    data: Vec<String>,
}

impl Event {
    fn is_empty(&self) -> bool {
        self.name.is_none() && self.data.is_empty()
    }

    fn payload(self) -> Value {
        decode_body(self.data.join("\n"))
    }
}

/// Feed one line into the accumulating event. Returns a finished event on
/// a blank separator line.
fn parse_line(event: &mut Event, line: &str) -> Option<Event> {
    if line.is_empty() {
        if event.is_empty() {
            return None;
        }
        return Some(std::mem::take(event));
    }
    if let Some(rest) = line.strip_prefix("data:") {
        event
            .data
            .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
    } else if let Some(rest) = line.strip_prefix("event:") {
        event.name = Some(rest.trim().to_string());
    }
    // `id:` and `retry:` fields and comment lines are ignored.
    None
}

/// Whether an event passes the template's `event_type` filter. Events
/// without a name count as the default `message` type.
fn event_matches(filter: Option<&str>, name: Option<&str>) -> bool {
    match filter {
        None => true,
        Some(wanted) => wanted == name.unwrap_or("message"),
    }
}

async fn connect(
    client: &reqwest::Client,
    oauth: &OAuth2TokenCache,
    template: &SseCallTemplate,
    arguments: &Map<String, Value>,
) -> Result<reqwest::Response> {
    let mut arguments = arguments.clone();
    let url = substitute_path_params(&template.url, &mut arguments);

    let body = template
        .body_field
        .as_ref()
        .and_then(|field| arguments.remove(field));
    let method = if body.is_some() {
        reqwest::Method::POST
    } else {
        reqwest::Method::GET
    };

    let mut request = client
        .request(method, url)
        .header(reqwest::header::ACCEPT, "text/event-stream");

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
    let query: Vec<(String, String)> = arguments
        .iter()
        .map(|(key, value)| (key.clone(), argument_text(value)))
        .collect();
    if !query.is_empty() {
        request = request.query(&query);
    }
    request = apply_auth(request, client, oauth, template.auth.as_ref()).await?;
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request.send().await.context("SSE connection failed")?;
    if !response.status().is_success() {
        return Err(anyhow!(
            "SSE endpoint '{}' answered with status {}",
            template.url,
            response.status()
        ));
    }
    Ok(response)
}

#[derive(Debug, Default)]
pub struct SseCommunicationProtocol {
    client: reqwest::Client,
    oauth: Arc<OAuth2TokenCache>,
}

impl SseCommunicationProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    fn template<'a>(&self, call_template: &'a CallTemplate) -> UtcpResult<&'a SseCallTemplate> {
        call_template.downcast_ref().ok_or_else(|| {
            UtcpError::InvalidArgument("the sse protocol requires an sse call template".into())
        })
    }

    /// Build the event stream, reconnecting per the template after clean
    /// server-side closes.
    fn open_stream(
        &self,
        initial: reqwest::Response,
        template: SseCallTemplate,
        arguments: Map<String, Value>,
    ) -> ToolCallStream {
        let client = self.client.clone();
        let oauth = self.oauth.clone();

        let stream = async_stream::stream! {
            let mut response = Some(initial);
            loop {
                let current = match response.take() {
                    Some(response) => response,
                    None => match connect(&client, &oauth, &template, &arguments).await {
                        Ok(response) => response,
                        Err(err) => {
                            yield Err(UtcpError::Transport(err.context("SSE reconnect failed")));
                            break;
                        }
                    },
                };

                let bytes = current
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(std::io::Error::other));
                let mut lines = FramedRead::new(StreamReader::new(bytes), LinesCodec::new());
                let mut event = Event::default();
                let mut failed = false;

                while let Some(line) = lines.next().await {
                    let line = match line {
                        Ok(line) => line,
                        Err(err) => {
                            yield Err(UtcpError::Transport(
                                anyhow!(err).context("SSE stream failed"),
                            ));
                            failed = true;
                            break;
                        }
                    };
                    if let Some(finished) = parse_line(&mut event, &line) {
                        if event_matches(template.event_type.as_deref(), finished.name.as_deref()) {
                            yield Ok(finished.payload());
                        }
                    }
                }

                if failed || !template.reconnect {
                    break;
                }
                debug!(url = %template.url, "SSE stream closed, reconnecting");
                tokio::time::sleep(Duration::from_millis(template.retry_timeout)).await;
            }
        };
        stream.boxed()
    }
}

#[async_trait]
impl CommunicationProtocol for SseCommunicationProtocol {
    async fn register_manual(
        &self,
        _caller: &UtcpClient,
        manual_call_template: &CallTemplate,
    ) -> UtcpResult<RegisterManualResult> {
        let template = self.template(manual_call_template)?;
        debug!(manual = %template.name, url = %template.url, "discovering SSE manual");

        let fetch = async {
            let mut request = self.client.get(&template.url);
            if let Some(headers) = &template.headers {
                for (name, value) in headers {
                    request = request.header(name.as_str(), value.as_str());
                }
            }
            request =
                apply_auth(request, &self.client, &self.oauth, template.auth.as_ref()).await?;
            let response = request.send().await.context("SSE discovery failed")?;
            if !response.status().is_success() {
                return Err(anyhow!(
                    "SSE discovery at '{}' answered with status {}",
                    template.url,
                    response.status()
                ));
            }
            response
                .json::<Value>()
                .await
                .context("SSE discovery returned invalid JSON")
        };

        let discovered = match fetch.await {
            Ok(value) => value,
            Err(err) => {
                warn!(manual = %template.name, error = %err, "SSE manual discovery failed");
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
                    "discovered SSE manual"
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

    /// Unary SSE calls return the first event and close the stream.
    async fn call_tool(
        &self,
        caller: &UtcpClient,
        tool_name: &str,
        arguments: &Map<String, Value>,
        tool_call_template: &CallTemplate,
    ) -> UtcpResult<Value> {
        let mut stream = self
            .call_tool_streaming(caller, tool_name, arguments, tool_call_template)
            .await?;
        match stream.next().await {
            Some(item) => item,
            None => Err(UtcpError::Transport(anyhow!(
                "SSE endpoint closed before sending an event for '{tool_name}'"
            ))),
        }
    }

    async fn call_tool_streaming(
        &self,
        _caller: &UtcpClient,
        tool_name: &str,
        arguments: &Map<String, Value>,
        tool_call_template: &CallTemplate,
    ) -> UtcpResult<ToolCallStream> {
        let template = self.template(tool_call_template)?;
        let response = connect(&self.client, &self.oauth, template, arguments)
            .await
            .map_err(|err| UtcpError::Transport(err.context(format!("calling '{tool_name}'"))))?;
        Ok(self.open_stream(response, template.clone(), arguments.clone()))
    }
}
