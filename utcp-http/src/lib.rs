//! HTTP-family communication protocols for the UTCP client runtime:
//! plain request/response HTTP, Server-Sent Events and chunked
//! streamable HTTP, plus the OAuth2 client-credentials token cache they
//! share.

use std::sync::Arc;
use std::sync::Once;

use utcp_core::plugins::{register_call_template, register_communication_protocol};
use utcp_core::CallTemplateVariantSerializer;

pub mod http;
pub mod oauth;
pub mod sse;
pub mod streamable_http;

pub use http::{HttpCallTemplate, HttpCommunicationProtocol, HttpMethod, HTTP_TEMPLATE_TYPE};
pub use oauth::OAuth2TokenCache;
pub use sse::{SseCallTemplate, SseCommunicationProtocol, SSE_TEMPLATE_TYPE};
pub use streamable_http::{
    StreamableHttpCallTemplate, StreamableHttpCommunicationProtocol,
    STREAMABLE_HTTP_TEMPLATE_TYPE,
};

static REGISTER: Once = Once::new();

/// Bind the three HTTP-family protocols and their call template
/// serializers into the plugin registry. Idempotent.
pub fn register() {
    REGISTER.call_once(|| {
        utcp_core::plugins::ensure_plugins_initialized();

        register_call_template(
            HTTP_TEMPLATE_TYPE,
            Arc::new(CallTemplateVariantSerializer::<HttpCallTemplate>::new(
                HTTP_TEMPLATE_TYPE,
            )),
            false,
        );
        register_communication_protocol(
            HTTP_TEMPLATE_TYPE,
            Arc::new(HttpCommunicationProtocol::new()),
            false,
        );

        register_call_template(
            SSE_TEMPLATE_TYPE,
            Arc::new(CallTemplateVariantSerializer::<SseCallTemplate>::new(
                SSE_TEMPLATE_TYPE,
            )),
            false,
        );
        register_communication_protocol(
            SSE_TEMPLATE_TYPE,
            Arc::new(SseCommunicationProtocol::new()),
            false,
        );

        register_call_template(
            STREAMABLE_HTTP_TEMPLATE_TYPE,
            Arc::new(
                CallTemplateVariantSerializer::<StreamableHttpCallTemplate>::new(
                    STREAMABLE_HTTP_TEMPLATE_TYPE,
                ),
            ),
            false,
        );
        register_communication_protocol(
            STREAMABLE_HTTP_TEMPLATE_TYPE,
            Arc::new(StreamableHttpCommunicationProtocol::new()),
            false,
        );
    });
}
