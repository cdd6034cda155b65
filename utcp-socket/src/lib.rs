//! Raw socket communication protocols: TCP with pluggable message framing
//! and connectionless UDP.
//!
//! Discovery sends the UTCP probe `{"type": "utcp"}` and parses the framed
//! reply as a manual. Requests are formatted either as a JSON object of
//! the arguments or through a text template with `UTCP_ARG_<name>_UTCP_ARG`
//! markers; responses decode per the template's byte format.

use std::sync::Arc;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use utcp_core::plugins::{register_call_template, register_communication_protocol};
use utcp_core::CallTemplateVariantSerializer;

pub mod tcp;
pub mod udp;

pub use tcp::{FramingStrategy, TcpCallTemplate, TcpCommunicationProtocol, TCP_TEMPLATE_TYPE};
pub use udp::{UdpCallTemplate, UdpCommunicationProtocol, UDP_TEMPLATE_TYPE};

/// Probe a UTCP-aware socket server answers with its manual.
pub(crate) const DISCOVERY_PROBE: &str = "{\"type\": \"utcp\"}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestDataFormat {
    #[default]
    Json,
    Text,
}

/// Render the request payload for a socket call.
pub(crate) fn format_request(
    format: RequestDataFormat,
    template: Option<&str>,
    arguments: &Map<String, Value>,
) -> Vec<u8> {
    match format {
        RequestDataFormat::Json => Value::Object(arguments.clone()).to_string().into_bytes(),
        RequestDataFormat::Text => {
            let mut text = template.unwrap_or_default().to_string();
            for (name, value) in arguments {
                let marker = format!("UTCP_ARG_{name}_UTCP_ARG");
                let rendered = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                text = text.replace(&marker, &rendered);
            }
            text.into_bytes()
        }
    }
}

/// Decode response bytes: text when a byte format is configured (treated
/// as UTF-8), base64 otherwise; textual payloads that parse as JSON are
/// returned decoded.
pub(crate) fn decode_response(bytes: &[u8], byte_format: Option<&str>) -> Value {
    match byte_format {
        Some(_) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        }
        None => {
            use base64::Engine as _;
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
    }
}

static REGISTER: Once = Once::new();

/// Bind the tcp and udp protocols and their call template serializers
/// into the plugin registry. Idempotent.
pub fn register() {
    REGISTER.call_once(|| {
        utcp_core::plugins::ensure_plugins_initialized();

        register_call_template(
            TCP_TEMPLATE_TYPE,
            Arc::new(CallTemplateVariantSerializer::<TcpCallTemplate>::new(
                TCP_TEMPLATE_TYPE,
            )),
            false,
        );
        register_communication_protocol(
            TCP_TEMPLATE_TYPE,
            Arc::new(TcpCommunicationProtocol::new()),
            false,
        );

        register_call_template(
            UDP_TEMPLATE_TYPE,
            Arc::new(CallTemplateVariantSerializer::<UdpCallTemplate>::new(
                UDP_TEMPLATE_TYPE,
            )),
            false,
        );
        register_communication_protocol(
            UDP_TEMPLATE_TYPE,
            Arc::new(UdpCommunicationProtocol::new()),
            false,
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_requests_carry_the_arguments() {
        let mut arguments = Map::new();
        arguments.insert("text".into(), json!("hi"));
        let rendered = format_request(RequestDataFormat::Json, None, &arguments);
        let parsed: Value = serde_json::from_slice(&rendered).unwrap();
        assert_eq!(parsed, json!({"text": "hi"}));
    }

    #[test]
    fn text_requests_fill_the_template() {
        let mut arguments = Map::new();
        arguments.insert("command".into(), json!("status"));
        arguments.insert("count".into(), json!(2));
        let rendered = format_request(
            RequestDataFormat::Text,
            Some("CMD:UTCP_ARG_command_UTCP_ARG;N:UTCP_ARG_count_UTCP_ARG"),
            &arguments,
        );
        assert_eq!(rendered, b"CMD:status;N:2");
    }

    #[test]
    fn responses_decode_to_json_text_or_base64() {
        assert_eq!(
            decode_response(b"{\"ok\": true}", Some("utf-8")),
            json!({"ok": true})
        );
        assert_eq!(decode_response(b"plain", Some("utf-8")), json!("plain"));
        assert_eq!(decode_response(&[0xff, 0x00], None), json!("/wA="));
    }
}
