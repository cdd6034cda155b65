//! Connectionless UDP protocol.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use utcp_core::{
    looks_like_openapi, manual_from_discovery, random_template_name, CallTemplate,
    CallTemplateKind, CommunicationProtocol, RegisterManualResult, ToolCallStream, UtcpClient,
    UtcpError, UtcpResult,
};

use crate::{decode_response, format_request, RequestDataFormat, DISCOVERY_PROBE};

pub const UDP_TEMPLATE_TYPE: &str = "udp";

const MAX_DATAGRAM: usize = 65_535;

/// Call template for UDP servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdpCallTemplate {
    #[serde(default = "random_template_name")]
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Datagrams to wait for per request; `0` sends without waiting.
    #[serde(default = "UdpCallTemplate::default_response_datagrams")]
    pub number_of_response_datagrams: usize,
    #[serde(default)]
    pub request_data_format: RequestDataFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data_template: Option<String>,
    /// Encoding for response bytes; `null` surfaces raw bytes base64-encoded.
    #[serde(default = "UdpCallTemplate::default_byte_format")]
    pub response_byte_format: Option<String>,
    /// Request timeout in milliseconds.
    #[serde(default = "UdpCallTemplate::default_timeout")]
    pub timeout: u64,
}

impl UdpCallTemplate {
    fn default_response_datagrams() -> usize {
        1
    }

    fn default_byte_format() -> Option<String> {
        Some("utf-8".into())
    }

    fn default_timeout() -> u64 {
        30_000
    }
}

impl CallTemplateKind for UdpCallTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    fn call_template_type(&self) -> &str {
        UDP_TEMPLATE_TYPE
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct UdpCommunicationProtocol;

impl UdpCommunicationProtocol {
    pub fn new() -> Self {
        Self
    }

    fn template<'a>(&self, call_template: &'a CallTemplate) -> UtcpResult<&'a UdpCallTemplate> {
        call_template.downcast_ref().ok_or_else(|| {
            UtcpError::InvalidArgument("the udp protocol requires a udp call template".into())
        })
    }

    /// Send one datagram and collect the expected number of replies,
    /// concatenated in arrival order.
    async fn exchange(&self, template: &UdpCallTemplate, request: &[u8]) -> Result<Vec<u8>> {
        let io = async {
            let socket = UdpSocket::bind("0.0.0.0:0")
                .await
                .context("cannot bind local UDP socket")?;
            socket
                .connect((template.host.as_str(), template.port))
                .await
                .with_context(|| {
                    format!("cannot reach {}:{}", template.host, template.port)
                })?;
            socket.send(request).await.context("datagram send failed")?;

            let mut response = Vec::new();
            let mut buffer = vec![0u8; MAX_DATAGRAM];
            for _ in 0..template.number_of_response_datagrams {
                let received = socket
                    .recv(&mut buffer)
                    .await
                    .context("datagram receive failed")?;
                response.extend_from_slice(&buffer[..received]);
            }
            Ok::<Vec<u8>, anyhow::Error>(response)
        };
        tokio::time::timeout(Duration::from_millis(template.timeout), io)
            .await
            .map_err(|_| {
                anyhow!(
                    "udp exchange with {}:{} timed out after {}ms",
                    template.host,
                    template.port,
                    template.timeout
                )
            })?
    }
}

#[async_trait]
impl CommunicationProtocol for UdpCommunicationProtocol {
    async fn register_manual(
        &self,
        _caller: &UtcpClient,
        manual_call_template: &CallTemplate,
    ) -> UtcpResult<RegisterManualResult> {
        let template = self.template(manual_call_template)?;
        debug!(
            manual = %template.name,
            host = %template.host,
            port = template.port,
            "discovering udp manual"
        );

        // Discovery always expects one reply datagram.
        let mut discovery = template.clone();
        discovery.number_of_response_datagrams = 1;

        let response = match self.exchange(&discovery, DISCOVERY_PROBE.as_bytes()).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(manual = %template.name, error = %err, "udp discovery failed");
                return Ok(RegisterManualResult::failure(
                    manual_call_template.clone(),
                    vec![format!("{err:#}")],
                ));
            }
        };

        let discovered: Value = match serde_json::from_slice(&response) {
            Ok(value) => value,
            Err(err) => {
                return Ok(RegisterManualResult::failure(
                    manual_call_template.clone(),
                    vec![format!("udp discovery response is not a JSON manual: {err}")],
                ));
            }
        };

        if looks_like_openapi(&discovered) {
            return Ok(RegisterManualResult::failure(
                manual_call_template.clone(),
                vec![
                    "udp discovery produced an OpenAPI specification; provide a native UTCP manual instead"
                        .into(),
                ],
            ));
        }

        match manual_from_discovery(discovered, manual_call_template) {
            Ok(manual) => {
                info!(
                    manual = %template.name,
                    tools = manual.tools.len(),
                    "discovered udp manual"
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
        let request = format_request(
            template.request_data_format,
            template.request_data_template.as_deref(),
            arguments,
        );
        let response = self
            .exchange(template, &request)
            .await
            .map_err(|err| UtcpError::Transport(err.context(format!("calling '{tool_name}'"))))?;
        if template.number_of_response_datagrams == 0 {
            return Ok(Value::Null);
        }
        Ok(decode_response(
            &response,
            template.response_byte_format.as_deref(),
        ))
    }

    /// Streams each reply datagram as its own element.
    async fn call_tool_streaming(
        &self,
        _caller: &UtcpClient,
        tool_name: &str,
        arguments: &Map<String, Value>,
        tool_call_template: &CallTemplate,
    ) -> UtcpResult<ToolCallStream> {
        let template = self.template(tool_call_template)?.clone();
        let request = format_request(
            template.request_data_format,
            template.request_data_template.as_deref(),
            arguments,
        );
        let tool_name = tool_name.to_string();

        let stream = async_stream::stream! {
            let socket = match UdpSocket::bind("0.0.0.0:0").await {
                Ok(socket) => socket,
                Err(err) => {
                    yield Err(UtcpError::Transport(
                        anyhow!(err).context("cannot bind local UDP socket"),
                    ));
                    return;
                }
            };
            if let Err(err) = socket.connect((template.host.as_str(), template.port)).await {
                yield Err(UtcpError::Transport(anyhow!(err).context(format!(
                    "cannot reach {}:{} for '{tool_name}'",
                    template.host, template.port
                ))));
                return;
            }
            if let Err(err) = socket.send(&request).await {
                yield Err(UtcpError::Transport(anyhow!(err).context("datagram send failed")));
                return;
            }

            let mut buffer = vec![0u8; MAX_DATAGRAM];
            for _ in 0..template.number_of_response_datagrams {
                let received = tokio::time::timeout(
                    Duration::from_millis(template.timeout),
                    socket.recv(&mut buffer),
                )
                .await;
                match received {
                    Ok(Ok(size)) => {
                        yield Ok(decode_response(
                            &buffer[..size],
                            template.response_byte_format.as_deref(),
                        ));
                    }
                    Ok(Err(err)) => {
                        yield Err(UtcpError::Transport(
                            anyhow!(err).context("datagram receive failed"),
                        ));
                        break;
                    }
                    Err(_) => {
                        yield Err(UtcpError::Transport(anyhow!(
                            "udp receive timed out after {}ms",
                            template.timeout
                        )));
                        break;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Echo-style server answering each datagram with `payload`.
    async fn serve_udp(payload: Vec<u8>, replies: usize) -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];
            if let Ok((_, peer)) = socket.recv_from(&mut buffer).await {
                for _ in 0..replies {
                    let _ = socket.send_to(&payload, peer).await;
                }
            }
        });
        port
    }

    fn template_for(port: u16) -> UdpCallTemplate {
        UdpCallTemplate {
            name: "udp_provider".into(),
            host: "127.0.0.1".into(),
            port,
            number_of_response_datagrams: 1,
            request_data_format: RequestDataFormat::Json,
            request_data_template: None,
            response_byte_format: Some("utf-8".into()),
            timeout: 2_000,
        }
    }

    async fn client() -> UtcpClient {
        crate::register();
        UtcpClient::create(None, None).await.unwrap()
    }

    #[tokio::test]
    async fn call_decodes_the_reply_datagram() {
        let port = serve_udp(b"{\"ok\": true}".to_vec(), 1).await;
        let client = client().await;
        let protocol = UdpCommunicationProtocol::new();

        let value = protocol
            .call_tool(
                &client,
                "u.echo",
                &Map::new(),
                &CallTemplate::new(template_for(port)),
            )
            .await
            .unwrap();
        assert_eq!(value, json!({"ok": true}));
    }

    #[tokio::test]
    async fn discovery_converts_legacy_tool_provider() {
        let manual = json!({
            "tools": [{
                "name": "udp_tool",
                "description": "Echo over UDP",
                "tool_provider": {
                    "call_template_type": "udp",
                    "name": "udp_executor",
                    "host": "127.0.0.1",
                    "port": 9
                }
            }]
        });
        let port = serve_udp(manual.to_string().into_bytes(), 1).await;
        let client = client().await;
        let protocol = UdpCommunicationProtocol::new();

        let result = protocol
            .register_manual(&client, &CallTemplate::new(template_for(port)))
            .await
            .unwrap();
        assert!(result.success, "errors: {:?}", result.errors);
        let executor: &UdpCallTemplate = result.manual.tools[0]
            .tool_call_template
            .downcast_ref()
            .unwrap();
        assert_eq!(executor.name, "udp_executor");
    }

    #[tokio::test]
    async fn streaming_yields_each_datagram() {
        let port = serve_udp(b"chunk".to_vec(), 2).await;
        let client = client().await;
        let protocol = UdpCommunicationProtocol::new();

        let mut template = template_for(port);
        template.number_of_response_datagrams = 2;
        let stream = protocol
            .call_tool_streaming(
                &client,
                "u.echo",
                &Map::new(),
                &CallTemplate::new(template),
            )
            .await
            .unwrap();
        let values: Vec<Value> = stream.map(|item| item.unwrap()).collect().await;
        assert_eq!(values, vec![json!("chunk"), json!("chunk")]);
    }

    #[tokio::test]
    async fn fire_and_forget_returns_null() {
        let port = serve_udp(Vec::new(), 0).await;
        let client = client().await;
        let protocol = UdpCommunicationProtocol::new();

        let mut template = template_for(port);
        template.number_of_response_datagrams = 0;
        let value = protocol
            .call_tool(
                &client,
                "u.notify",
                &Map::new(),
                &CallTemplate::new(template),
            )
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
    }
}
