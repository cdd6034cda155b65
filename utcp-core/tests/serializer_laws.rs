//! Round-trip and idempotence laws for the serializer framework, checked
//! through the public registry the way an external plugin would use it.

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use utcp_core::plugins::{self, register_call_template};
use utcp_core::{
    Auth, CallTemplate, CallTemplateKind, CallTemplateSerializer, CallTemplateVariantSerializer,
    JsonSerializer, Serializer, Tool, ToolPostProcessor, ToolRepository, ToolSearchStrategy,
    UtcpManual, VariableLoader,
};

const PROBE_TYPE: &str = "law_probe";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ProbeTemplate {
    name: String,
    endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth: Option<Auth>,
}

impl CallTemplateKind for ProbeTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    fn call_template_type(&self) -> &str {
        PROBE_TYPE
    }

    fn auth(&self) -> Option<&Auth> {
        self.auth.as_ref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn install_probe() {
    plugins::ensure_plugins_initialized();
    register_call_template(
        PROBE_TYPE,
        Arc::new(CallTemplateVariantSerializer::<ProbeTemplate>::new(
            PROBE_TYPE,
        )),
        false,
    );
}

/// `validate_value(to_value(o)) == o` and `to_value ∘ validate_value`
/// is the identity on records produced by `to_value`.
fn assert_round_trip<T: PartialEq + std::fmt::Debug>(
    serializer: &dyn Serializer<T>,
    record: Value,
) {
    let object = serializer.validate_value(&record).unwrap();
    let dumped = serializer.to_value(&object).unwrap();
    assert_eq!(dumped, record, "record identity broken");
    assert_eq!(
        serializer.validate_value(&dumped).unwrap(),
        object,
        "object identity broken"
    );
}

#[test]
fn auth_records_round_trip() {
    install_probe();
    for record in [
        json!({"auth_type": "api_key", "api_key": "k", "var_name": "X-Api-Key", "location": "query"}),
        json!({"auth_type": "basic", "username": "u", "password": "p"}),
        json!({
            "auth_type": "oauth2",
            "token_url": "https://auth/token",
            "client_id": "id",
            "client_secret": "secret"
        }),
    ] {
        let auth = Auth::from_value(&record).unwrap();
        assert_eq!(auth.to_value().unwrap(), record);
        assert_eq!(Auth::from_value(&auth.to_value().unwrap()).unwrap(), auth);
    }
}

#[test]
fn call_template_records_round_trip_through_the_registry() {
    install_probe();
    let record = json!({
        "name": "probe",
        "call_template_type": PROBE_TYPE,
        "endpoint": "tcp://somewhere",
        "auth": {"auth_type": "basic", "username": "u", "password": "p"}
    });
    let serializer = CallTemplateSerializer;
    assert_round_trip(&serializer, record);
}

#[test]
fn copy_is_derived_from_the_round_trip() {
    install_probe();
    let template = CallTemplate::new(ProbeTemplate {
        name: "probe".into(),
        endpoint: "tcp://somewhere".into(),
        auth: None,
    });
    let copy = CallTemplateSerializer.copy(&template).unwrap();
    assert_eq!(copy, template);
    let original: &ProbeTemplate = template.downcast_ref().unwrap();
    let copied: &ProbeTemplate = copy.downcast_ref().unwrap();
    assert_eq!(original, copied);
}

#[test]
fn tools_and_manuals_round_trip() {
    install_probe();
    let record = json!({
        "utcp_version": "1.0.0",
        "manual_version": "2.1.0",
        "tools": [{
            "name": "probe.run",
            "description": "runs the probe",
            "inputs": {"type": "object", "properties": {"arg": {"type": "string"}}},
            "outputs": {"type": "string"},
            "tags": ["probe"],
            "average_response_size": 128,
            "tool_call_template": {
                "name": "probe",
                "call_template_type": PROBE_TYPE,
                "endpoint": "tcp://somewhere"
            }
        }]
    });
    let serializer = JsonSerializer::<UtcpManual>::new("UtcpManual");
    assert_round_trip(&serializer, record);
}

#[test]
fn variable_loader_records_round_trip() {
    install_probe();
    let record = json!({"variable_loader_type": "dotenv", "env_file_path": "/etc/app/.env"});
    let loader = VariableLoader::from_value(&record).unwrap();
    assert_eq!(loader.to_value().unwrap(), record);
}

#[test]
fn repository_and_strategy_records_round_trip() {
    install_probe();
    let repository =
        ToolRepository::from_value(&json!({"tool_repository_type": "in_memory"})).unwrap();
    assert_eq!(
        repository.to_value().unwrap(),
        json!({"tool_repository_type": "in_memory"})
    );

    let record = json!({
        "tool_search_strategy_type": "tag_and_description_word_match",
        "description_weight": 2.0,
        "tag_weight": 5.0
    });
    let strategy = ToolSearchStrategy::from_value(&record).unwrap();
    assert_eq!(strategy.to_value().unwrap(), record);
}

#[test]
fn post_processor_records_round_trip() {
    install_probe();
    for record in [
        json!({"tool_post_processor_type": "limit_strings", "limit": 64}),
        json!({
            "tool_post_processor_type": "filter_dict",
            "only_include_keys": ["id", "name"],
            "exclude_manuals": ["noisy"]
        }),
    ] {
        let processor = ToolPostProcessor::from_value(&record).unwrap();
        assert_eq!(processor.to_value().unwrap(), record);
    }
}

#[test]
fn tools_embed_registered_templates() {
    install_probe();
    let tool: Tool = serde_json::from_value(json!({
        "name": "probe.run",
        "tool_call_template": {
            "name": "probe",
            "call_template_type": PROBE_TYPE,
            "endpoint": "tcp://x"
        }
    }))
    .unwrap();
    assert_eq!(tool.tool_call_template.call_template_type(), PROBE_TYPE);
    let probe: &ProbeTemplate = tool.tool_call_template.downcast_ref().unwrap();
    assert_eq!(probe.endpoint, "tcp://x");
}

#[test]
fn unknown_tags_fail_everywhere() {
    install_probe();
    assert!(Auth::from_value(&json!({"auth_type": "spnego"})).is_err());
    assert!(CallTemplate::from_value(&json!({"call_template_type": "avian"})).is_err());
    assert!(VariableLoader::from_value(&json!({"variable_loader_type": "consul"})).is_err());
    assert!(ToolRepository::from_value(&json!({"tool_repository_type": "postgres"})).is_err());
    assert!(
        ToolSearchStrategy::from_value(&json!({"tool_search_strategy_type": "embeddings"}))
            .is_err()
    );
    assert!(
        ToolPostProcessor::from_value(&json!({"tool_post_processor_type": "redact"})).is_err()
    );
}
