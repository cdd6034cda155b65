//! Protocol-agnostic core of the UTCP client runtime.
//!
//! The core knows nothing about wire protocols. It owns the data model
//! (tools, manuals, call templates, authentication descriptors), the
//! tag-dispatched serializer framework, the process-wide plugin registry,
//! the variable substitution engine, the concurrent tool repository and the
//! client runtime that ties them together. Transports plug in behind the
//! [`CommunicationProtocol`] contract and are shipped as separate crates.

pub mod client;
pub mod data;
pub mod error;
pub mod implementations;
pub mod interfaces;
pub mod plugins;
pub mod sync;

pub use client::{ClientConfigSource, UtcpClient};
pub use data::auth::{ApiKeyAuth, ApiKeyLocation, Auth, AuthScheme, AuthSerializer, BasicAuth, OAuth2Auth};
pub use data::call_template::{
    random_template_name, CallTemplate, CallTemplateKind, CallTemplateSerializer,
    CallTemplateVariantSerializer,
};
pub use data::client_config::{
    ToolPostProcessor, ToolRepository, ToolSearchStrategy, UtcpClientConfig,
    UtcpClientConfigSerializer,
};
pub use data::manual::{
    looks_like_openapi, manual_from_discovery, RegisterManualResult, UtcpManual,
};
pub use data::tool::{JsonSchema, Tool};
pub use data::variable_loader::{DotEnvVariableLoader, VariableLoader, VariableSource};
pub use error::{UtcpError, UtcpResult};
pub use implementations::post_processors::{FilterDictPostProcessor, LimitStringsPostProcessor};
pub use implementations::{
    DefaultVariableSubstitutor, InMemToolRepository, TagAndDescriptionWordMatchStrategy,
};
pub use interfaces::communication_protocol::{CommunicationProtocol, ToolCallStream};
pub use interfaces::post_processor::PostProcessor;
pub use interfaces::serializer::{JsonSerializer, Serializer};
pub use interfaces::tool_repository::ConcurrentToolRepository;
pub use interfaces::tool_search::ToolSearch;
pub use interfaces::variable_substitutor::VariableSubstitutor;

/// UTCP protocol version advertised in manuals that do not declare one.
pub const UTCP_VERSION: &str = env!("CARGO_PKG_VERSION");
