//! WebSocket communication protocol.
//!
//! Connections are opened per call: discovery sends the UTCP probe and
//! awaits the manual frame, a unary call sends the rendered message and
//! awaits one response, and a streaming call yields every incoming frame
//! until the peer closes. Only `wss://` endpoints are accepted, with a
//! loopback exception for `ws://`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use utcp_core::plugins::{register_call_template, register_communication_protocol};
use utcp_core::{
    looks_like_openapi, manual_from_discovery, random_template_name, ApiKeyAuth, ApiKeyLocation,
    Auth, BasicAuth, CallTemplate, CallTemplateKind, CallTemplateVariantSerializer,
    CommunicationProtocol, RegisterManualResult, ToolCallStream, UtcpClient, UtcpError,
    UtcpResult,
};

pub const WEBSOCKET_TEMPLATE_TYPE: &str = "websocket";

const DISCOVERY_PROBE: &str = "{\"type\": \"utcp\"}";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    Json,
    Text,
    Raw,
}

/// Call template for WebSocket endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketCallTemplate {
    #[serde(default = "random_template_name")]
    pub name: String,
    #[serde(deserialize_with = "deserialize_ws_url")]
    pub url: String,
    /// Message template; a string or object whose string leaves may carry
    /// `UTCP_ARG_<name>_UTCP_ARG` markers. Without one, the arguments are
    /// sent as a JSON object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    /// WebSocket subprotocol offered during the handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default = "WebSocketCallTemplate::default_keep_alive")]
    pub keep_alive: bool,
    /// How responses decode; `None` behaves like raw.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    /// Timeout in seconds for connect and receive operations.
    #[serde(default = "WebSocketCallTemplate::default_timeout")]
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
}

impl WebSocketCallTemplate {
    fn default_keep_alive() -> bool {
        true
    }

    fn default_timeout() -> u64 {
        30
    }
}

fn is_acceptable_ws_url(url: &str) -> bool {
    url.starts_with("wss://")
        || url.starts_with("ws://localhost")
        || url.starts_with("ws://127.0.0.1")
}

fn deserialize_ws_url<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let url = String::deserialize(deserializer)?;
    if is_acceptable_ws_url(&url) {
        Ok(url)
    } else {
        Err(serde::de::Error::custom(format!(
            "WebSocket URL must use wss:// or start with ws://localhost or ws://127.0.0.1, got: {url}"
        )))
    }
}

impl CallTemplateKind for WebSocketCallTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    fn call_template_type(&self) -> &str {
        WEBSOCKET_TEMPLATE_TYPE
    }

    fn auth(&self) -> Option<&Auth> {
        self.auth.as_ref()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Replace argument markers in every string leaf of the message template.
fn fill_markers(value: &Value, arguments: &Map<String, Value>) -> Value {
    match value {
        Value::String(text) => {
            let mut filled = text.clone();
            for (name, argument) in arguments {
                let marker = format!("UTCP_ARG_{name}_UTCP_ARG");
                let rendered = match argument {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                filled = filled.replace(&marker, &rendered);
            }
            Value::String(filled)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, nested)| (key.clone(), fill_markers(nested, arguments)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| fill_markers(item, arguments))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render the outgoing frame for a call.
fn render_message(template: &WebSocketCallTemplate, arguments: &Map<String, Value>) -> String {
    match &template.message {
        Some(Value::String(text)) => match fill_markers(&Value::String(text.clone()), arguments) {
            Value::String(filled) => filled,
            other => other.to_string(),
        },
        Some(other) => fill_markers(other, arguments).to_string(),
        None => Value::Object(arguments.clone()).to_string(),
    }
}

/// Decode an incoming frame per the template's response format.
fn decode_message(template: &WebSocketCallTemplate, message: Message) -> Option<Value> {
    let text = match message {
        Message::Text(text) => text.to_string(),
        Message::Binary(bytes) => {
            use base64::Engine as _;
            return Some(Value::String(
                base64::engine::general_purpose::STANDARD.encode(&bytes),
            ));
        }
        _ => return None,
    };
    let value = match template.response_format {
        Some(ResponseFormat::Text) | Some(ResponseFormat::Raw) => Value::String(text),
        // Without an explicit format, JSON frames surface decoded.
        Some(ResponseFormat::Json) | None => {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        }
    };
    Some(value)
}

async fn connect(
    template: &WebSocketCallTemplate,
    arguments: &Map<String, Value>,
) -> Result<Socket> {
    let mut url = template.url.clone();

    // Query-placed API keys go on the URL before the handshake.
    if let Some(auth) = &template.auth {
        if let Some(api_key) = auth.downcast_ref::<ApiKeyAuth>() {
            if api_key.location == ApiKeyLocation::Query {
                let separator = if url.contains('?') { '&' } else { '?' };
                url = format!("{url}{separator}{}={}", api_key.var_name, api_key.api_key);
            }
        }
    }

    let mut request = url
        .as_str()
        .into_client_request()
        .context("invalid WebSocket URL")?;

    {
        let headers = request.headers_mut();
        if let Some(static_headers) = &template.headers {
            for (name, value) in static_headers {
                headers.insert(
                    tokio_tungstenite::tungstenite::http::HeaderName::try_from(name.as_str())
                        .context("invalid header name")?,
                    HeaderValue::from_str(value).context("invalid header value")?,
                );
            }
        }
        if let Some(header_fields) = &template.header_fields {
            for field in header_fields {
                if let Some(value) = arguments.get(field) {
                    let rendered = match value {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    headers.insert(
                        tokio_tungstenite::tungstenite::http::HeaderName::try_from(
                            field.as_str(),
                        )
                        .context("invalid header name")?,
                        HeaderValue::from_str(&rendered).context("invalid header value")?,
                    );
                }
            }
        }
        if let Some(protocol) = &template.protocol {
            headers.insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_str(protocol).context("invalid subprotocol")?,
            );
        }
        if let Some(auth) = &template.auth {
            if let Some(api_key) = auth.downcast_ref::<ApiKeyAuth>() {
                if api_key.location == ApiKeyLocation::Header {
                    headers.insert(
                        tokio_tungstenite::tungstenite::http::HeaderName::try_from(
                            api_key.var_name.as_str(),
                        )
                        .context("invalid auth header name")?,
                        HeaderValue::from_str(&api_key.api_key)
                            .context("invalid auth header value")?,
                    );
                }
            } else if let Some(basic) = auth.downcast_ref::<BasicAuth>() {
                use base64::Engine as _;
                let credentials = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", basic.username, basic.password));
                headers.insert(
                    "Authorization",
                    HeaderValue::from_str(&format!("Basic {credentials}"))
                        .context("invalid basic auth value")?,
                );
            } else {
                bail!(
                    "unsupported auth scheme '{}' for a WebSocket call",
                    auth.auth_type()
                );
            }
        }
    }

    let connecting = connect_async(request);
    let (socket, _) = tokio::time::timeout(Duration::from_secs(template.timeout), connecting)
        .await
        .map_err(|_| anyhow!("WebSocket connect to '{}' timed out", template.url))?
        .with_context(|| format!("cannot open WebSocket to '{}'", template.url))?;
    Ok(socket)
}

/// Await the next data frame, skipping pings and pongs.
async fn next_data_frame(
    socket: &mut Socket,
    template: &WebSocketCallTemplate,
) -> Result<Option<Value>> {
    let deadline = Duration::from_secs(template.timeout);
    loop {
        let frame = tokio::time::timeout(deadline, socket.next())
            .await
            .map_err(|_| anyhow!("WebSocket receive timed out after {}s", template.timeout))?;
        match frame {
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(message)) => {
                if let Some(value) = decode_message(template, message) {
                    return Ok(Some(value));
                }
            }
            Some(Err(err)) => return Err(anyhow!(err).context("WebSocket receive failed")),
        }
    }
}

#[derive(Debug, Default)]
pub struct WebSocketCommunicationProtocol;

impl WebSocketCommunicationProtocol {
    pub fn new() -> Self {
        Self
    }

    fn template<'a>(
        &self,
        call_template: &'a CallTemplate,
    ) -> UtcpResult<&'a WebSocketCallTemplate> {
        call_template.downcast_ref().ok_or_else(|| {
            UtcpError::InvalidArgument(
                "the websocket protocol requires a websocket call template".into(),
            )
        })
    }
}

#[async_trait]
impl CommunicationProtocol for WebSocketCommunicationProtocol {
    async fn register_manual(
        &self,
        _caller: &UtcpClient,
        manual_call_template: &CallTemplate,
    ) -> UtcpResult<RegisterManualResult> {
        let template = self.template(manual_call_template)?;
        debug!(manual = %template.name, url = %template.url, "discovering WebSocket manual");

        let discovery = async {
            let mut socket = connect(template, &Map::new()).await?;
            socket
                .send(Message::Text(DISCOVERY_PROBE.into()))
                .await
                .context("cannot send discovery probe")?;
            let frame = next_data_frame(&mut socket, template)
                .await?
                .ok_or_else(|| anyhow!("peer closed before answering the discovery probe"))?;
            let _ = socket.close(None).await;
            // Text-formatted templates hand back the raw frame; the manual
            // still needs decoding.
            let frame = match frame {
                Value::String(text) => serde_json::from_str(&text)
                    .context("discovery response is not a JSON manual")?,
                other => other,
            };
            Ok::<Value, anyhow::Error>(frame)
        };

        let discovered = match discovery.await {
            Ok(value) => value,
            Err(err) => {
                warn!(manual = %template.name, error = %err, "WebSocket discovery failed");
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
                    "discovered WebSocket manual"
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
        // Connections are opened per call; nothing persists.
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
        let outgoing = render_message(template, arguments);

        let exchange = async {
            let mut socket = connect(template, arguments).await?;
            socket
                .send(Message::Text(outgoing.into()))
                .await
                .context("cannot send request frame")?;
            let response = next_data_frame(&mut socket, template)
                .await?
                .ok_or_else(|| anyhow!("peer closed before responding"))?;
            let _ = socket.close(None).await;
            Ok::<Value, anyhow::Error>(response)
        };
        exchange
            .await
            .map_err(|err| UtcpError::Transport(err.context(format!("calling '{tool_name}'"))))
    }

    async fn call_tool_streaming(
        &self,
        _caller: &UtcpClient,
        tool_name: &str,
        arguments: &Map<String, Value>,
        tool_call_template: &CallTemplate,
    ) -> UtcpResult<ToolCallStream> {
        let template = self.template(tool_call_template)?.clone();
        let outgoing = render_message(&template, arguments);

        let mut socket = connect(&template, arguments)
            .await
            .map_err(|err| UtcpError::Transport(err.context(format!("calling '{tool_name}'"))))?;
        socket
            .send(Message::Text(outgoing.into()))
            .await
            .map_err(|err| {
                UtcpError::Transport(anyhow!(err).context("cannot send request frame"))
            })?;

        let stream = async_stream::stream! {
            loop {
                match socket.next().await {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(message)) => {
                        if let Some(value) = decode_message(&template, message) {
                            yield Ok(value);
                        }
                    }
                    Some(Err(err)) => {
                        yield Err(UtcpError::Transport(
                            anyhow!(err).context("WebSocket receive failed"),
                        ));
                        break;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}

static REGISTER: Once = Once::new();

/// Bind the websocket protocol and its call template serializer into the
/// plugin registry. Idempotent.
pub fn register() {
    REGISTER.call_once(|| {
        utcp_core::plugins::ensure_plugins_initialized();
        register_call_template(
            WEBSOCKET_TEMPLATE_TYPE,
            Arc::new(CallTemplateVariantSerializer::<WebSocketCallTemplate>::new(
                WEBSOCKET_TEMPLATE_TYPE,
            )),
            false,
        );
        register_communication_protocol(
            WEBSOCKET_TEMPLATE_TYPE,
            Arc::new(WebSocketCommunicationProtocol::new()),
            false,
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insecure_urls_are_rejected_at_validation() {
        register();
        let err = CallTemplate::from_value(&json!({
            "name": "ws",
            "call_template_type": "websocket",
            "url": "ws://example.com/socket"
        }))
        .unwrap_err();
        assert_eq!(err.code(), "UTCP_E001");
        assert!(err.to_string().contains("wss://"));
    }

    #[test]
    fn localhost_and_wss_urls_are_accepted() {
        assert!(is_acceptable_ws_url("wss://api.example.com/ws"));
        assert!(is_acceptable_ws_url("ws://localhost:8080/ws"));
        assert!(is_acceptable_ws_url("ws://127.0.0.1/ws"));
        assert!(!is_acceptable_ws_url("ws://10.0.0.1/ws"));
    }

    #[test]
    fn string_message_templates_fill_markers() {
        let template = WebSocketCallTemplate {
            name: "ws".into(),
            url: "wss://x/ws".into(),
            message: Some(json!("CMD:UTCP_ARG_command_UTCP_ARG;DATA:UTCP_ARG_data_UTCP_ARG")),
            protocol: None,
            keep_alive: true,
            response_format: None,
            timeout: 30,
            headers: None,
            header_fields: None,
            auth: None,
        };
        let mut arguments = Map::new();
        arguments.insert("command".into(), json!("run"));
        arguments.insert("data".into(), json!(7));
        assert_eq!(render_message(&template, &arguments), "CMD:run;DATA:7");
    }

    #[test]
    fn object_message_templates_fill_nested_strings() {
        let template = WebSocketCallTemplate {
            name: "ws".into(),
            url: "wss://x/ws".into(),
            message: Some(json!({"action": "UTCP_ARG_action_UTCP_ARG", "keep": 1})),
            protocol: None,
            keep_alive: true,
            response_format: None,
            timeout: 30,
            headers: None,
            header_fields: None,
            auth: None,
        };
        let mut arguments = Map::new();
        arguments.insert("action".into(), json!("ping"));
        let rendered: Value = serde_json::from_str(&render_message(&template, &arguments)).unwrap();
        assert_eq!(rendered, json!({"action": "ping", "keep": 1}));
    }

    #[test]
    fn without_a_message_template_arguments_are_sent_as_json() {
        let template = WebSocketCallTemplate {
            name: "ws".into(),
            url: "wss://x/ws".into(),
            message: None,
            protocol: None,
            keep_alive: true,
            response_format: None,
            timeout: 30,
            headers: None,
            header_fields: None,
            auth: None,
        };
        let mut arguments = Map::new();
        arguments.insert("a".into(), json!(1));
        let rendered: Value = serde_json::from_str(&render_message(&template, &arguments)).unwrap();
        assert_eq!(rendered, json!({"a": 1}));
    }
}
