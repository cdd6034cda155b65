//! The UTCP client runtime.
//!
//! Orchestrates manual registration, tool name resolution, variable
//! substitution, transport dispatch, streaming and post-processing. The
//! client performs no wire I/O itself; every protocol interaction goes
//! through the [`CommunicationProtocol`] bound to the call template's type
//! in the plugin registry.

use std::path::{Path, PathBuf};

use futures::future::join_all;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::data::call_template::CallTemplate;
use crate::data::client_config::{client_config_serializer, UtcpClientConfig};
use crate::data::manual::{RegisterManualResult, UtcpManual};
use crate::data::tool::Tool;
use crate::error::{UtcpError, UtcpResult};
use crate::implementations::default_variable_substitutor::DefaultVariableSubstitutor;
use crate::interfaces::serializer::Serializer;
use crate::interfaces::variable_substitutor::VariableSubstitutor;
use crate::plugins;

/// Accepted inputs for [`UtcpClient::create`]: a path to a JSON
/// configuration file, a raw configuration record, or a ready instance.
pub enum ClientConfigSource {
    Path(PathBuf),
    Record(Value),
    Config(UtcpClientConfig),
}

impl From<&str> for ClientConfigSource {
    fn from(path: &str) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

impl From<PathBuf> for ClientConfigSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<Value> for ClientConfigSource {
    fn from(record: Value) -> Self {
        Self::Record(record)
    }
}

impl From<UtcpClientConfig> for ClientConfigSource {
    fn from(config: UtcpClientConfig) -> Self {
        Self::Config(config)
    }
}

/// Replace every non-identifier character with `_`.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug)]
pub struct UtcpClient {
    config: UtcpClientConfig,
    root_dir: PathBuf,
    substitutor: Box<dyn VariableSubstitutor>,
}

impl UtcpClient {
    /// Create a client, resolve the configuration's own variables, and
    /// register all initial manual templates in parallel.
    pub async fn create(
        root_dir: Option<PathBuf>,
        config: Option<ClientConfigSource>,
    ) -> UtcpResult<Self> {
        plugins::ensure_plugins_initialized();

        let config = match config {
            None => UtcpClientConfig::default(),
            Some(ClientConfigSource::Config(config)) => config,
            Some(ClientConfigSource::Record(record)) => {
                client_config_serializer().validate_value(&record)?
            }
            Some(ClientConfigSource::Path(path)) => {
                let content = tokio::fs::read_to_string(&path).await.map_err(|err| {
                    UtcpError::Configuration(format!(
                        "cannot read config file '{}': {err}",
                        path.display()
                    ))
                })?;
                let record: Value = serde_json::from_str(&content).map_err(|err| {
                    UtcpError::Configuration(format!(
                        "invalid config file '{}': {err}",
                        path.display()
                    ))
                })?;
                client_config_serializer().validate_value(&record)?
            }
        };

        let root_dir = match root_dir {
            Some(dir) => dir,
            None => std::env::current_dir().map_err(|err| {
                UtcpError::Configuration(format!("cannot determine working directory: {err}"))
            })?,
        };

        let mut client = Self {
            config,
            root_dir,
            substitutor: Box::new(DefaultVariableSubstitutor),
        };

        // The variables table may reference other variables (one pass, no
        // fixed point); resolution sees a config without the table itself.
        if !client.config.variables.is_empty() {
            let mut config_without_vars = client.config.clone();
            config_without_vars.variables.clear();
            let table = serde_json::to_value(&client.config.variables)
                .map_err(|err| UtcpError::validation("UtcpClientConfig", err))?;
            let substituted = client
                .substitutor
                .substitute(&table, &config_without_vars, None)
                .await?;
            client.config.variables = serde_json::from_value(substituted)
                .map_err(|err| UtcpError::validation("UtcpClientConfig", err))?;
        }

        let initial_templates = client.config.manual_call_templates.clone();
        if !initial_templates.is_empty() {
            client.register_manuals(initial_templates).await?;
        }

        Ok(client)
    }

    pub fn config(&self) -> &UtcpClientConfig {
        &self.config
    }

    /// Root directory transports resolve relative paths against.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Register one manual and its tools.
    ///
    /// The template name is normalized to identifier characters, duplicate
    /// manual names are rejected, and variables inside the template resolve
    /// in the manual's namespace. Tool names returned by the transport are
    /// prefixed with `<manual>.` before the manual is stored atomically.
    pub async fn register_manual(
        &self,
        manual_call_template: CallTemplate,
    ) -> UtcpResult<RegisterManualResult> {
        let manual_name = sanitize_name(manual_call_template.name());
        if self
            .config
            .tool_repository
            .get_manual(&manual_name)
            .await?
            .is_some()
        {
            return Err(UtcpError::DuplicateManual(manual_name));
        }

        let manual_call_template = self
            .substitute_call_template(&manual_call_template.with_name(&manual_name)?, &manual_name)
            .await?;
        let protocol = plugins::communication_protocol(manual_call_template.call_template_type())?;

        let mut result = protocol.register_manual(self, &manual_call_template).await?;

        if result.success {
            let prefix = format!("{manual_name}.");
            for tool in &mut result.manual.tools {
                if !tool.name.starts_with(&prefix) {
                    tool.name = format!("{prefix}{}", tool.name);
                }
            }
            self.config
                .tool_repository
                .save_manual(result.manual_call_template.clone(), result.manual.clone())
                .await?;
            info!(
                manual = %manual_name,
                tools = result.manual.tools.len(),
                "registered manual"
            );
        } else {
            error!(manual = %manual_name, errors = ?result.errors, "manual registration failed");
        }

        Ok(result)
    }

    /// Register several manuals concurrently. A failed registration does
    /// not affect the others: ordinary failures surface as unsuccessful
    /// results, while an unresolved variable aborts with its error after
    /// the batch settles.
    pub async fn register_manuals(
        &self,
        manual_call_templates: Vec<CallTemplate>,
    ) -> UtcpResult<Vec<RegisterManualResult>> {
        let registrations = manual_call_templates.into_iter().map(|template| async move {
            match self.register_manual(template.clone()).await {
                Ok(result) => Ok(result),
                Err(err @ UtcpError::VariableNotFound { .. }) => Err(err),
                Err(err) => {
                    error!(manual = template.name(), error = %err, "manual registration failed");
                    Ok(RegisterManualResult {
                        manual_call_template: template,
                        manual: UtcpManual {
                            utcp_version: "1.0.0".into(),
                            manual_version: "0.0.0".into(),
                            tools: Vec::new(),
                        },
                        success: false,
                        errors: vec![err.to_string()],
                    })
                }
            }
        });
        join_all(registrations).await.into_iter().collect()
    }

    /// Deregister a manual, releasing any transport resources best-effort,
    /// and remove it from the repository. Idempotent; returns `false` when
    /// no such manual exists.
    pub async fn deregister_manual(&self, manual_name: &str) -> UtcpResult<bool> {
        let Some(template) = self
            .config
            .tool_repository
            .get_manual_template(manual_name)
            .await?
        else {
            return Ok(false);
        };

        match plugins::communication_protocol(template.call_template_type()) {
            Ok(protocol) => {
                if let Err(err) = protocol.deregister_manual(self, &template).await {
                    warn!(manual = %manual_name, error = %err, "transport deregistration failed");
                }
            }
            Err(err) => {
                warn!(manual = %manual_name, error = %err, "no transport to deregister with");
            }
        }

        self.config.tool_repository.remove_manual(manual_name).await
    }

    /// Execute one tool call and run the result through the configured
    /// post-processors in order.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        tool_args: Map<String, Value>,
    ) -> UtcpResult<Value> {
        let (tool, template, protocol) = self.prepare_call(tool_name).await?;
        debug!(tool = %tool_name, protocol = template.call_template_type(), "calling tool");

        let mut result = protocol
            .call_tool(self, tool_name, &tool_args, &template)
            .await?;
        for processor in &self.config.post_processing {
            result = processor.post_process(self, &tool, &template, result);
        }
        Ok(result)
    }

    /// Execute a streaming tool call. Each yielded element passes through
    /// the post-processor chain; dropping the stream cancels upstream.
    pub async fn call_tool_streaming(
        &self,
        tool_name: &str,
        tool_args: Map<String, Value>,
    ) -> UtcpResult<BoxStream<'_, UtcpResult<Value>>> {
        let (tool, template, protocol) = self.prepare_call(tool_name).await?;
        debug!(tool = %tool_name, protocol = template.call_template_type(), "calling tool (streaming)");

        let mut upstream = protocol
            .call_tool_streaming(self, tool_name, &tool_args, &template)
            .await?;

        let stream = async_stream::stream! {
            while let Some(item) = upstream.next().await {
                match item {
                    Ok(mut value) => {
                        for processor in &self.config.post_processing {
                            value = processor.post_process(self, &tool, &template, value);
                        }
                        yield Ok(value);
                    }
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }

    /// Rank registered tools against a query.
    pub async fn search_tools(
        &self,
        query: &str,
        limit: i64,
        any_of_tags_required: Option<&[String]>,
    ) -> UtcpResult<Vec<Tool>> {
        self.config
            .tool_search_strategy
            .search_tools(
                &self.config.tool_repository,
                query,
                limit,
                any_of_tags_required,
            )
            .await
    }

    /// Variables a manual template needs. When the template itself
    /// references none, discovery runs and the variables referenced by
    /// each discovered tool's template are reported instead.
    pub async fn get_required_variables_for_manual_and_tools(
        &self,
        manual_call_template: &CallTemplate,
    ) -> UtcpResult<Vec<String>> {
        let manual_name = sanitize_name(manual_call_template.name());
        let template = manual_call_template.with_name(&manual_name)?;

        let mut variables = self
            .substitutor
            .find_required_variables(&template.to_value()?, Some(&manual_name))?;
        if !variables.is_empty() {
            return Ok(variables);
        }

        let protocol = plugins::communication_protocol(template.call_template_type())?;
        let result = protocol.register_manual(self, &template).await?;
        for tool in &result.manual.tools {
            variables.extend(self.substitutor.find_required_variables(
                &tool.tool_call_template.to_value()?,
                Some(&manual_name),
            )?);
        }
        variables.dedup();
        Ok(variables)
    }

    /// Variables referenced by a registered tool's call template, in its
    /// manual's namespace.
    pub async fn get_required_variables_for_registered_tool(
        &self,
        tool_name: &str,
    ) -> UtcpResult<Vec<String>> {
        let manual_name = manual_prefix(tool_name);
        let tool = self
            .config
            .tool_repository
            .get_tool(tool_name)
            .await?
            .ok_or_else(|| UtcpError::UnknownTool(tool_name.to_string()))?;
        self.substitutor
            .find_required_variables(&tool.tool_call_template.to_value()?, Some(manual_name))
    }

    async fn prepare_call(
        &self,
        tool_name: &str,
    ) -> UtcpResult<(
        Tool,
        CallTemplate,
        std::sync::Arc<dyn crate::interfaces::communication_protocol::CommunicationProtocol>,
    )> {
        let manual_name = manual_prefix(tool_name);
        let tool = self
            .config
            .tool_repository
            .get_tool(tool_name)
            .await?
            .ok_or_else(|| UtcpError::UnknownTool(tool_name.to_string()))?;
        let template = self
            .substitute_call_template(&tool.tool_call_template, manual_name)
            .await?;
        let protocol = plugins::communication_protocol(template.call_template_type())?;
        Ok((tool, template, protocol))
    }

    async fn substitute_call_template(
        &self,
        call_template: &CallTemplate,
        namespace: &str,
    ) -> UtcpResult<CallTemplate> {
        let record = call_template.to_value()?;
        let substituted = self
            .substitutor
            .substitute(&record, &self.config, Some(namespace))
            .await?;
        CallTemplate::from_value(&substituted)
    }
}

/// The manual owning a tool is the prefix before the first `.`.
fn manual_prefix(tool_name: &str) -> &str {
    tool_name.split('.').next().unwrap_or(tool_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::auth::Auth;
    use crate::data::call_template::{CallTemplateKind, CallTemplateVariantSerializer};
    use crate::interfaces::communication_protocol::{CommunicationProtocol, ToolCallStream};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::any::Any;
    use std::sync::Arc;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct LoopbackTemplate {
        name: String,
        call_template_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<Auth>,
    }

    impl CallTemplateKind for LoopbackTemplate {
        fn name(&self) -> &str {
            &self.name
        }

        fn call_template_type(&self) -> &str {
            &self.call_template_type
        }

        fn auth(&self) -> Option<&Auth> {
            self.auth.as_ref()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// In-process protocol: discovery returns a fixed tool list, calls echo
    /// a canned value, streaming yields canned chunks.
    #[derive(Debug)]
    struct LoopbackProtocol {
        tool_names: Vec<&'static str>,
        call_result: Value,
        stream_items: Vec<Value>,
    }

    #[async_trait]
    impl CommunicationProtocol for LoopbackProtocol {
        async fn register_manual(
            &self,
            _caller: &UtcpClient,
            manual_call_template: &CallTemplate,
        ) -> UtcpResult<RegisterManualResult> {
            let tools = self
                .tool_names
                .iter()
                .map(|name| Tool {
                    name: name.to_string(),
                    description: String::new(),
                    inputs: Default::default(),
                    outputs: Default::default(),
                    tags: Vec::new(),
                    average_response_size: None,
                    tool_call_template: manual_call_template.clone(),
                })
                .collect();
            Ok(RegisterManualResult::success(
                manual_call_template.clone(),
                UtcpManual::new(tools),
            ))
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
            _tool_name: &str,
            arguments: &Map<String, Value>,
            tool_call_template: &CallTemplate,
        ) -> UtcpResult<Value> {
            let template: &LoopbackTemplate = tool_call_template
                .downcast_ref()
                .ok_or_else(|| UtcpError::InvalidArgument("wrong template kind".into()))?;
            Ok(json!({
                "result": self.call_result,
                "args": Value::Object(arguments.clone()),
                "url": template.url,
            }))
        }

        async fn call_tool_streaming(
            &self,
            _caller: &UtcpClient,
            _tool_name: &str,
            _arguments: &Map<String, Value>,
            _tool_call_template: &CallTemplate,
        ) -> UtcpResult<ToolCallStream> {
            let items = self.stream_items.clone();
            Ok(futures::stream::iter(items.into_iter().map(Ok)).boxed())
        }
    }

    /// Each test registers its own protocol tag so concurrently running
    /// tests never observe each other's canned data.
    fn install_loopback(
        tag: &'static str,
        tool_names: Vec<&'static str>,
        call_result: Value,
        stream: Vec<Value>,
    ) {
        plugins::ensure_plugins_initialized();
        plugins::register_call_template(
            tag,
            Arc::new(CallTemplateVariantSerializer::<LoopbackTemplate>::new(tag)),
            false,
        );
        plugins::register_communication_protocol(
            tag,
            Arc::new(LoopbackProtocol {
                tool_names,
                call_result,
                stream_items: stream,
            }),
            false,
        );
    }

    fn template(tag: &str, name: &str, url: Option<&str>) -> CallTemplate {
        CallTemplate::new(LoopbackTemplate {
            name: name.into(),
            call_template_type: tag.into(),
            url: url.map(String::from),
            auth: None,
        })
    }

    async fn client() -> UtcpClient {
        UtcpClient::create(None, None).await.unwrap()
    }

    #[tokio::test]
    async fn returned_tool_names_are_prefixed_with_the_manual_name() {
        const TAG: &str = "loopback_prefix";
        install_loopback(TAG, vec!["ping"], json!("pong"), vec![]);
        let client = client().await;

        let result = client
            .register_manual(template(TAG, "net", None))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.manual.tools[0].name, "net.ping");

        let names: Vec<String> = client
            .config()
            .tool_repository
            .get_tools()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["net.ping".to_string()]);

        assert!(client.call_tool("net.ping", Map::new()).await.is_ok());
        let err = client.call_tool("ping", Map::new()).await.unwrap_err();
        assert_eq!(err.code(), "UTCP_E005");
    }

    #[tokio::test]
    async fn duplicate_manual_is_rejected() {
        const TAG: &str = "loopback_dup";
        install_loopback(TAG, vec!["t"], json!(null), vec![]);
        let client = client().await;

        client.register_manual(template(TAG, "dup", None)).await.unwrap();
        let err = client
            .register_manual(template(TAG, "dup", None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UTCP_E004");
    }

    #[tokio::test]
    async fn manual_names_are_sanitized_to_identifiers() {
        const TAG: &str = "loopback_sanitize";
        install_loopback(TAG, vec!["t"], json!(null), vec![]);
        let client = client().await;

        let result = client
            .register_manual(template(TAG, "my-api v2", None))
            .await
            .unwrap();
        assert_eq!(result.manual_call_template.name(), "my_api_v2");
        assert_eq!(result.manual.tools[0].name, "my_api_v2.t");
    }

    #[tokio::test]
    async fn template_variables_resolve_in_the_manual_namespace() {
        const TAG: &str = "loopback_ns";
        install_loopback(TAG, vec!["echo"], json!(null), vec![]);

        let mut config = UtcpClientConfig::default();
        config
            .variables
            .insert("m__one_KEY".into(), "secret".into());
        let client = UtcpClient::create(None, Some(config.into())).await.unwrap();

        let result = client
            .register_manual(template(TAG, "m_one", Some("https://x/${KEY}")))
            .await
            .unwrap();
        let stored: &LoopbackTemplate = result.manual_call_template.downcast_ref().unwrap();
        assert_eq!(stored.url.as_deref(), Some("https://x/secret"));
    }

    #[tokio::test]
    async fn creation_fails_when_an_initial_template_misses_a_variable() {
        const TAG: &str = "loopback_missing";
        install_loopback(TAG, vec!["echo"], json!(null), vec![]);

        let mut config = UtcpClientConfig::default();
        config.manual_call_templates = vec![template(TAG, "m_one", Some("https://x/${KEY}"))];
        let err = UtcpClient::create(None, Some(config.into()))
            .await
            .unwrap_err();
        match err {
            UtcpError::VariableNotFound { name } => assert_eq!(name, "m__one_KEY"),
            other => panic!("expected variable-not-found, got {other}"),
        }
    }

    #[tokio::test]
    async fn batch_registration_isolates_failures() {
        const TAG: &str = "loopback_batch";
        install_loopback(TAG, vec!["t"], json!(null), vec![]);
        let client = client().await;

        // A duplicate in the middle fails its own registration only.
        client.register_manual(template(TAG, "taken", None)).await.unwrap();
        let results = client
            .register_manuals(vec![
                template(TAG, "batch_a", None),
                template(TAG, "taken", None),
                template(TAG, "batch_b", None),
            ])
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert!(results[1].errors[0].contains("UTCP_E004"));
        assert!(results[2].success);
        assert!(client.config().tool_repository.get_manual("batch_a").await.unwrap().is_some());
        assert!(client.config().tool_repository.get_manual("batch_b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn batch_registration_propagates_missing_variables_after_settling() {
        const TAG: &str = "loopback_batch_var";
        install_loopback(TAG, vec!["t"], json!(null), vec![]);
        let client = client().await;

        let err = client
            .register_manuals(vec![
                template(TAG, "ok_one", None),
                template(TAG, "broken", Some("https://x/${ABSENT}")),
                template(TAG, "ok_two", None),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UTCP_E003");
        // The batch settles before the error propagates; healthy manuals land.
        assert!(client.config().tool_repository.get_manual("ok_one").await.unwrap().is_some());
        assert!(client.config().tool_repository.get_manual("ok_two").await.unwrap().is_some());
        assert!(client.config().tool_repository.get_manual("broken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deregister_manual_is_idempotent() {
        const TAG: &str = "loopback_dereg";
        install_loopback(TAG, vec!["t"], json!(null), vec![]);
        let client = client().await;

        client.register_manual(template(TAG, "gone", None)).await.unwrap();
        assert!(client.deregister_manual("gone").await.unwrap());
        assert!(!client.deregister_manual("gone").await.unwrap());
        assert!(client.config().tool_repository.get_tool("gone.t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn streaming_elements_are_post_processed_in_order() {
        const TAG: &str = "loopback_stream";
        install_loopback(
            TAG,
            vec!["chunks"],
            json!(null),
            vec![json!("aaaaaaaaaa"), json!("bbbbbbbbbb")],
        );

        let config_record = json!({
            "post_processing": [
                {"tool_post_processor_type": "limit_strings", "limit": 3}
            ]
        });
        let client = UtcpClient::create(None, Some(config_record.into())).await.unwrap();
        client.register_manual(template(TAG, "s", None)).await.unwrap();

        let stream = client
            .call_tool_streaming("s.chunks", Map::new())
            .await
            .unwrap();
        let items: Vec<Value> = stream.map(|item| item.unwrap()).collect().await;
        assert_eq!(items, vec![json!("aaa"), json!("bbb")]);
    }

    #[tokio::test]
    async fn required_variables_for_registered_tool_use_the_manual_namespace() {
        const TAG: &str = "loopback_req_tool";
        install_loopback(TAG, vec!["echo"], json!(null), vec![]);

        let mut config = UtcpClientConfig::default();
        config.variables.insert("vars_TOKEN".into(), "t".into());
        let client = UtcpClient::create(None, Some(config.into())).await.unwrap();
        client
            .register_manual(template(TAG, "vars", Some("https://x/$TOKEN")))
            .await
            .unwrap();

        // The stored template was substituted, so no variables remain.
        let required = client
            .get_required_variables_for_registered_tool("vars.echo")
            .await
            .unwrap();
        assert!(required.is_empty());
    }

    #[tokio::test]
    async fn required_variables_for_manual_report_unresolved_names() {
        const TAG: &str = "loopback_req_manual";
        install_loopback(TAG, vec!["echo"], json!(null), vec![]);
        let client = client().await;

        let required = client
            .get_required_variables_for_manual_and_tools(&template(
                TAG,
                "probe",
                Some("https://x/${KEY}"),
            ))
            .await
            .unwrap();
        assert_eq!(required, vec!["probe_KEY"]);
    }
}
