//! Client runtime for the Universal Tool Calling Protocol (UTCP).
//!
//! This facade crate re-exports the protocol-agnostic core and wires in
//! every bundled communication protocol. A typical client:
//!
//! ```no_run
//! use serde_json::json;
//!
//! # async fn run() -> utcp::UtcpResult<()> {
//! utcp::register_default_plugins();
//! let client = utcp::UtcpClient::create(
//!     None,
//!     Some(json!({
//!         "manual_call_templates": [{
//!             "name": "library",
//!             "call_template_type": "file",
//!             "file_path": "manual.json"
//!         }]
//!     }).into()),
//! )
//! .await?;
//!
//! let result = client
//!     .call_tool("library.echo", serde_json::Map::new())
//!     .await?;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```
//!
//! Crates can also be used individually: each `utcp-*` protocol crate
//! exposes its own idempotent `register()`, so a deployment that only
//! speaks HTTP can depend on `utcp-core` + `utcp-http` alone.

pub use utcp_core::*;

pub use utcp_cli::{CliCallTemplate, CommandStep, CLI_TEMPLATE_TYPE};
pub use utcp_file::{FileCallTemplate, FILE_TEMPLATE_TYPE};
pub use utcp_graphql::{GraphQlCallTemplate, GRAPHQL_TEMPLATE_TYPE};
pub use utcp_http::{
    HttpCallTemplate, HttpMethod, SseCallTemplate, StreamableHttpCallTemplate,
    HTTP_TEMPLATE_TYPE, SSE_TEMPLATE_TYPE, STREAMABLE_HTTP_TEMPLATE_TYPE,
};
pub use utcp_mcp::{McpCallTemplate, McpConfig, McpServerConfig, MCP_TEMPLATE_TYPE};
pub use utcp_socket::{
    FramingStrategy, TcpCallTemplate, UdpCallTemplate, TCP_TEMPLATE_TYPE, UDP_TEMPLATE_TYPE,
};
pub use utcp_text::{TextCallTemplate, TEXT_TEMPLATE_TYPE};
pub use utcp_websocket::{WebSocketCallTemplate, WEBSOCKET_TEMPLATE_TYPE};

use once_cell::sync::OnceCell;

static DEFAULT_PLUGINS: OnceCell<()> = OnceCell::new();

/// Register the core built-ins and every bundled communication protocol.
///
/// Idempotent; call it once before deserializing call templates or
/// creating a client. Individual protocol crates can be registered
/// instead when only a subset is wanted.
pub fn register_default_plugins() {
    DEFAULT_PLUGINS.get_or_init(|| {
        utcp_core::plugins::ensure_plugins_initialized();
        utcp_http::register();
        utcp_file::register();
        utcp_text::register();
        utcp_cli::register();
        utcp_socket::register();
        utcp_websocket::register();
        utcp_graphql::register();
        utcp_mcp::register();
    });
}
