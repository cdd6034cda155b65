//! TCP protocol with pluggable message framing.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use utcp_core::{
    looks_like_openapi, manual_from_discovery, random_template_name, CallTemplate,
    CallTemplateKind, CommunicationProtocol, RegisterManualResult, ToolCallStream, UtcpClient,
    UtcpError, UtcpResult,
};

use crate::{decode_response, format_request, RequestDataFormat, DISCOVERY_PROBE};

pub const TCP_TEMPLATE_TYPE: &str = "tcp";

/// How message boundaries are detected on the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingStrategy {
    LengthPrefix,
    Delimiter,
    FixedLength,
    #[default]
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

/// Call template for raw TCP servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpCallTemplate {
    #[serde(default = "random_template_name")]
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub request_data_format: RequestDataFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data_template: Option<String>,
    /// Encoding for response bytes; `null` surfaces raw bytes base64-encoded.
    #[serde(default = "TcpCallTemplate::default_byte_format")]
    pub response_byte_format: Option<String>,
    #[serde(default)]
    pub framing_strategy: FramingStrategy,
    /// Prefix width in bytes, one of 1, 2, 4 or 8.
    #[serde(
        default = "TcpCallTemplate::default_prefix_bytes",
        deserialize_with = "deserialize_prefix_bytes"
    )]
    pub length_prefix_bytes: u8,
    #[serde(default)]
    pub length_prefix_endian: Endianness,
    #[serde(default = "TcpCallTemplate::default_delimiter")]
    pub message_delimiter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_message_length: Option<usize>,
    /// Read cap for `stream` framing.
    #[serde(default = "TcpCallTemplate::default_max_response_size")]
    pub max_response_size: usize,
    /// Connection and read timeout in milliseconds.
    #[serde(default = "TcpCallTemplate::default_timeout")]
    pub timeout: u64,
}

impl TcpCallTemplate {
    fn default_byte_format() -> Option<String> {
        Some("utf-8".into())
    }

    fn default_prefix_bytes() -> u8 {
        4
    }

    fn default_delimiter() -> String {
        "\0".into()
    }

    fn default_max_response_size() -> usize {
        65_536
    }

    fn default_timeout() -> u64 {
        30_000
    }
}

fn deserialize_prefix_bytes<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = u8::deserialize(deserializer)?;
    if matches!(value, 1 | 2 | 4 | 8) {
        Ok(value)
    } else {
        Err(serde::de::Error::custom(
            "length_prefix_bytes must be 1, 2, 4 or 8",
        ))
    }
}

impl CallTemplateKind for TcpCallTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    fn call_template_type(&self) -> &str {
        TCP_TEMPLATE_TYPE
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Incremental frame extraction over a byte stream. Keeps whatever was
/// read past the current frame so back-to-back frames survive.
struct FrameReader<R> {
    stream: R,
    buffer: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    fn new(stream: R) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            eof: false,
        }
    }

    async fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; 8192];
        let read = self.stream.read(&mut chunk).await.context("socket read failed")?;
        if read == 0 {
            self.eof = true;
        } else {
            self.buffer.extend_from_slice(&chunk[..read]);
        }
        Ok(read)
    }

    async fn ensure(&mut self, wanted: usize) -> Result<bool> {
        while self.buffer.len() < wanted && !self.eof {
            self.fill().await?;
        }
        Ok(self.buffer.len() >= wanted)
    }

    /// Next message under the template's framing strategy; `None` at a
    /// clean end of stream.
    async fn next_frame(&mut self, template: &TcpCallTemplate) -> Result<Option<Vec<u8>>> {
        match template.framing_strategy {
            FramingStrategy::LengthPrefix => {
                let width = template.length_prefix_bytes as usize;
                if !self.ensure(width).await? {
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    bail!("truncated length prefix");
                }
                let prefix: Vec<u8> = self.buffer.drain(..width).collect();
                let length = decode_length(&prefix, template.length_prefix_endian);
                if !self.ensure(length).await? {
                    bail!("peer closed mid-message, expected {length} bytes");
                }
                Ok(Some(self.buffer.drain(..length).collect()))
            }
            FramingStrategy::Delimiter => {
                let delimiter = template.message_delimiter.as_bytes();
                if delimiter.is_empty() {
                    bail!("message_delimiter must not be empty");
                }
                loop {
                    if let Some(position) = find(&self.buffer, delimiter) {
                        let mut frame: Vec<u8> =
                            self.buffer.drain(..position + delimiter.len()).collect();
                        frame.truncate(position);
                        return Ok(Some(frame));
                    }
                    if self.eof {
                        if self.buffer.is_empty() {
                            return Ok(None);
                        }
                        // Trailing bytes without a delimiter form the last frame.
                        return Ok(Some(std::mem::take(&mut self.buffer)));
                    }
                    self.fill().await?;
                }
            }
            FramingStrategy::FixedLength => {
                let length = template
                    .fixed_message_length
                    .ok_or_else(|| anyhow!("fixed_length framing requires fixed_message_length"))?;
                if !self.ensure(length).await? {
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    bail!("peer closed mid-message, expected {length} bytes");
                }
                Ok(Some(self.buffer.drain(..length).collect()))
            }
            FramingStrategy::Stream => {
                while !self.eof && self.buffer.len() < template.max_response_size {
                    self.fill().await?;
                }
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let mut frame = std::mem::take(&mut self.buffer);
                frame.truncate(template.max_response_size);
                Ok(Some(frame))
            }
        }
    }
}

fn decode_length(prefix: &[u8], endian: Endianness) -> usize {
    let mut length: u64 = 0;
    match endian {
        Endianness::Big => {
            for byte in prefix {
                length = (length << 8) | u64::from(*byte);
            }
        }
        Endianness::Little => {
            for byte in prefix.iter().rev() {
                length = (length << 8) | u64::from(*byte);
            }
        }
    }
    length as usize
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[derive(Debug, Default)]
pub struct TcpCommunicationProtocol;

impl TcpCommunicationProtocol {
    pub fn new() -> Self {
        Self
    }

    fn template<'a>(&self, call_template: &'a CallTemplate) -> UtcpResult<&'a TcpCallTemplate> {
        call_template.downcast_ref().ok_or_else(|| {
            UtcpError::InvalidArgument("the tcp protocol requires a tcp call template".into())
        })
    }

    /// Connect, send one request, read one framed response.
    async fn exchange(&self, template: &TcpCallTemplate, request: &[u8]) -> Result<Vec<u8>> {
        let io = async {
            let mut stream = TcpStream::connect((template.host.as_str(), template.port))
                .await
                .with_context(|| {
                    format!("cannot connect to {}:{}", template.host, template.port)
                })?;
            stream.write_all(request).await.context("socket write failed")?;
            let mut reader = FrameReader::new(&mut stream);
            let frame = reader
                .next_frame(template)
                .await?
                .ok_or_else(|| anyhow!("peer closed without a response"))?;
            Ok::<Vec<u8>, anyhow::Error>(frame)
        };
        tokio::time::timeout(Duration::from_millis(template.timeout), io)
            .await
            .map_err(|_| {
                anyhow!(
                    "tcp exchange with {}:{} timed out after {}ms",
                    template.host,
                    template.port,
                    template.timeout
                )
            })?
    }
}

#[async_trait]
impl CommunicationProtocol for TcpCommunicationProtocol {
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
            "discovering tcp manual"
        );

        let response = match self.exchange(template, DISCOVERY_PROBE.as_bytes()).await {
            Ok(frame) => frame,
            Err(err) => {
                warn!(manual = %template.name, error = %err, "tcp discovery failed");
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
                    vec![format!("tcp discovery response is not a JSON manual: {err}")],
                ));
            }
        };

        if looks_like_openapi(&discovered) {
            return Ok(RegisterManualResult::failure(
                manual_call_template.clone(),
                vec![
                    "tcp discovery produced an OpenAPI specification; provide a native UTCP manual instead"
                        .into(),
                ],
            ));
        }

        match manual_from_discovery(discovered, manual_call_template) {
            Ok(manual) => {
                info!(
                    manual = %template.name,
                    tools = manual.tools.len(),
                    "discovered tcp manual"
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
        let request = format_request(
            template.request_data_format,
            template.request_data_template.as_deref(),
            arguments,
        );
        let frame = self
            .exchange(template, &request)
            .await
            .map_err(|err| UtcpError::Transport(err.context(format!("calling '{tool_name}'"))))?;
        Ok(decode_response(
            &frame,
            template.response_byte_format.as_deref(),
        ))
    }

    /// Streams one decoded value per received frame until the peer closes.
    async fn call_tool_streaming(
        &self,
        _caller: &UtcpClient,
        tool_name: &str,
        arguments: &Map<String, Value>,
        tool_call_template: &CallTemplate,
    ) -> UtcpResult<ToolCallStream> {
        let template = self.template(tool_call_template)?;
        let request = format_request(
            template.request_data_format,
            template.request_data_template.as_deref(),
            arguments,
        );

        let connect = async {
            let mut stream = TcpStream::connect((template.host.as_str(), template.port))
                .await
                .with_context(|| {
                    format!("cannot connect to {}:{}", template.host, template.port)
                })?;
            stream.write_all(&request).await.context("socket write failed")?;
            Ok::<TcpStream, anyhow::Error>(stream)
        };
        let stream = tokio::time::timeout(Duration::from_millis(template.timeout), connect)
            .await
            .map_err(|_| {
                UtcpError::Transport(anyhow!(
                    "tcp connect to {}:{} timed out",
                    template.host,
                    template.port
                ))
            })?
            .map_err(|err| UtcpError::Transport(err.context(format!("calling '{tool_name}'"))))?;

        let template = template.clone();
        let output = async_stream::stream! {
            let mut reader = FrameReader::new(stream);
            loop {
                match reader.next_frame(&template).await {
                    Ok(Some(frame)) => {
                        yield Ok(decode_response(&frame, template.response_byte_format.as_deref()));
                        if matches!(template.framing_strategy, FramingStrategy::Stream) {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(UtcpError::Transport(err.context("tcp stream failed")));
                        break;
                    }
                }
            }
        };
        Ok(output.boxed())
    }
}
