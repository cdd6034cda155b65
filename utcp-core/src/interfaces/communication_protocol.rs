//! The transport contract every protocol adapter implements.
//!
//! The runtime calls into a transport without knowing its wire protocol.
//! Transports receive a back-reference to the calling client so they can
//! read configuration such as the root directory without globals.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::{Map, Value};

use crate::client::UtcpClient;
use crate::data::call_template::CallTemplate;
use crate::data::manual::RegisterManualResult;
use crate::error::UtcpResult;

/// Lazy, single-consumer sequence of streamed tool results. Dropping the
/// stream cancels the underlying transport work and releases its resources.
pub type ToolCallStream = Pin<Box<dyn Stream<Item = UtcpResult<Value>> + Send>>;

#[async_trait]
pub trait CommunicationProtocol: Send + Sync {
    /// Discover the manual behind `manual_call_template`. Ordinary
    /// discovery errors are reported as `success = false` results; this
    /// only fails for errors the caller must see (e.g. misconfiguration).
    async fn register_manual(
        &self,
        caller: &UtcpClient,
        manual_call_template: &CallTemplate,
    ) -> UtcpResult<RegisterManualResult>;

    /// Release any persistent resources held for the manual. A no-op for
    /// stateless transports; must be idempotent.
    async fn deregister_manual(
        &self,
        caller: &UtcpClient,
        manual_call_template: &CallTemplate,
    ) -> UtcpResult<()>;

    /// Execute a single invocation and return the decoded response.
    async fn call_tool(
        &self,
        caller: &UtcpClient,
        tool_name: &str,
        arguments: &Map<String, Value>,
        tool_call_template: &CallTemplate,
    ) -> UtcpResult<Value>;

    /// Execute an invocation whose response arrives as a finite or infinite
    /// sequence of values. The caller may abandon the stream to cancel.
    async fn call_tool_streaming(
        &self,
        caller: &UtcpClient,
        tool_name: &str,
        arguments: &Map<String, Value>,
        tool_call_template: &CallTemplate,
    ) -> UtcpResult<ToolCallStream>;
}
