//! Command-line pipeline communication protocol.
//!
//! A CLI call template lists command steps executed inside one `bash`
//! invocation, so shell state such as `cd` persists from step to step.
//! Each step's output is captured into `CMD_<i>_OUTPUT` for later steps to
//! reference; the final result concatenates the outputs of the steps that
//! opted into it (by default only the last one). Discovery runs the
//! pipeline with no arguments and parses the final output as a manual.
//!
//! Commands come from the template, which the caller must trust: argument
//! markers are replaced textually before the shell sees the script.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Once;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use utcp_core::plugins::{register_call_template, register_communication_protocol};
use utcp_core::{
    looks_like_openapi, manual_from_discovery, random_template_name, CallTemplate,
    CallTemplateKind, CallTemplateVariantSerializer, CommunicationProtocol, RegisterManualResult,
    ToolCallStream, UtcpClient, UtcpError, UtcpResult,
};

pub const CLI_TEMPLATE_TYPE: &str = "cli";

/// One command in a CLI pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStep {
    /// Command line with `UTCP_ARG_<name>_UTCP_END` argument markers;
    /// earlier outputs are available as `$CMD_<i>_OUTPUT`.
    pub command: String,
    /// Whether this step's output joins the final result. Defaults to
    /// `false` for every step except the last.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_to_final_output: Option<bool>,
}

/// Call template for command-line tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliCallTemplate {
    #[serde(default = "random_template_name")]
    pub name: String,
    pub commands: Vec<CommandStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_vars: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl CallTemplateKind for CliCallTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    fn call_template_type(&self) -> &str {
        CLI_TEMPLATE_TYPE
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Replace `UTCP_ARG_<name>_UTCP_END` markers with argument values.
fn fill_arguments(command: &str, arguments: &Map<String, Value>) -> String {
    let mut filled = command.to_string();
    for (name, value) in arguments {
        let marker = format!("UTCP_ARG_{name}_UTCP_END");
        let text = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        filled = filled.replace(&marker, &text);
    }
    filled
}

/// Build the shell script: each step runs in the current shell (so state
/// persists) with its output redirected to a scratch file, then re-read
/// into the `CMD_<i>_OUTPUT` variable.
fn build_script(
    steps: &[CommandStep],
    arguments: &Map<String, Value>,
    scratch_dir: &Path,
) -> String {
    let mut script = String::new();
    for (index, step) in steps.iter().enumerate() {
        let command = fill_arguments(&step.command, arguments);
        let out_file = scratch_dir.join(format!("{index}.out"));
        script.push_str(&format!(
            "{{ {command}\n}} > '{}' 2>&1\nCMD_{index}_OUTPUT=\"$(cat '{}')\"\n",
            out_file.display(),
            out_file.display()
        ));
    }
    script
}

fn appended_indices(steps: &[CommandStep]) -> Vec<usize> {
    let chosen: Vec<usize> = steps
        .iter()
        .enumerate()
        .filter(|(index, step)| {
            step.append_to_final_output
                .unwrap_or(*index == steps.len() - 1)
        })
        .map(|(index, _)| index)
        .collect();
    chosen
}

#[derive(Debug, Default)]
pub struct CliCommunicationProtocol;

impl CliCommunicationProtocol {
    pub fn new() -> Self {
        Self
    }

    fn template<'a>(&self, call_template: &'a CallTemplate) -> UtcpResult<&'a CliCallTemplate> {
        call_template.downcast_ref().ok_or_else(|| {
            UtcpError::InvalidArgument("the cli protocol requires a cli call template".into())
        })
    }

    async fn run_pipeline(
        &self,
        template: &CliCallTemplate,
        arguments: &Map<String, Value>,
    ) -> Result<String> {
        if template.commands.is_empty() {
            bail!("cli call template '{}' has no commands", template.name);
        }

        let scratch = tempfile::tempdir().context("cannot create scratch directory")?;
        let script = build_script(&template.commands, arguments, scratch.path());
        debug!(template = %template.name, steps = template.commands.len(), "running cli pipeline");

        let mut command = tokio::process::Command::new("bash");
        command.arg("-c").arg(&script).kill_on_drop(true);
        if let Some(env_vars) = &template.env_vars {
            command.envs(env_vars);
        }
        if let Some(working_dir) = &template.working_dir {
            command.current_dir(working_dir);
        }

        let output = command
            .output()
            .await
            .context("cannot spawn shell for cli pipeline")?;
        if !output.status.success() {
            warn!(
                template = %template.name,
                status = ?output.status.code(),
                "cli pipeline exited non-zero"
            );
        }

        let mut parts = Vec::new();
        for index in appended_indices(&template.commands) {
            let out_file = scratch.path().join(format!("{index}.out"));
            let text = tokio::fs::read_to_string(&out_file)
                .await
                .with_context(|| format!("step {index} produced no output file"))?;
            parts.push(text.trim_end_matches('\n').to_string());
        }
        Ok(parts.join("\n"))
    }
}

#[async_trait]
impl CommunicationProtocol for CliCommunicationProtocol {
    async fn register_manual(
        &self,
        _caller: &UtcpClient,
        manual_call_template: &CallTemplate,
    ) -> UtcpResult<RegisterManualResult> {
        let template = self.template(manual_call_template)?;

        let output = match self.run_pipeline(template, &Map::new()).await {
            Ok(output) => output,
            Err(err) => {
                warn!(manual = %template.name, error = %err, "cli manual discovery failed");
                return Ok(RegisterManualResult::failure(
                    manual_call_template.clone(),
                    vec![format!("{err:#}")],
                ));
            }
        };

        let discovered: Value = match serde_json::from_str(&output) {
            Ok(value) => value,
            Err(err) => {
                return Ok(RegisterManualResult::failure(
                    manual_call_template.clone(),
                    vec![format!("cli discovery output is not a JSON manual: {err}")],
                ));
            }
        };

        if looks_like_openapi(&discovered) {
            return Ok(RegisterManualResult::failure(
                manual_call_template.clone(),
                vec![
                    "cli discovery produced an OpenAPI specification; provide a native UTCP manual instead"
                        .into(),
                ],
            ));
        }

        match manual_from_discovery(discovered, manual_call_template) {
            Ok(manual) => {
                info!(
                    manual = %template.name,
                    tools = manual.tools.len(),
                    "discovered cli manual"
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
        // Pipelines are spawned per call; nothing stays behind.
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
        let output = self
            .run_pipeline(template, arguments)
            .await
            .map_err(|err| UtcpError::Transport(err.context(format!("calling '{tool_name}'"))))?;
        Ok(serde_json::from_str(&output).unwrap_or(Value::String(output)))
    }

    async fn call_tool_streaming(
        &self,
        caller: &UtcpClient,
        tool_name: &str,
        arguments: &Map<String, Value>,
        tool_call_template: &CallTemplate,
    ) -> UtcpResult<ToolCallStream> {
        let value = self
            .call_tool(caller, tool_name, arguments, tool_call_template)
            .await?;
        Ok(futures::stream::iter([Ok(value)]).boxed())
    }
}

static REGISTER: Once = Once::new();

/// Bind the cli protocol and its call template serializer into the plugin
/// registry. Idempotent.
pub fn register() {
    REGISTER.call_once(|| {
        utcp_core::plugins::ensure_plugins_initialized();
        register_call_template(
            CLI_TEMPLATE_TYPE,
            Arc::new(CallTemplateVariantSerializer::<CliCallTemplate>::new(
                CLI_TEMPLATE_TYPE,
            )),
            false,
        );
        register_communication_protocol(
            CLI_TEMPLATE_TYPE,
            Arc::new(CliCommunicationProtocol::new()),
            false,
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(command: &str) -> CommandStep {
        CommandStep {
            command: command.into(),
            append_to_final_output: None,
        }
    }

    fn template(name: &str, commands: Vec<CommandStep>) -> CliCallTemplate {
        CliCallTemplate {
            name: name.into(),
            commands,
            env_vars: None,
            working_dir: None,
        }
    }

    #[test]
    fn argument_markers_are_replaced() {
        let mut arguments = Map::new();
        arguments.insert("target".into(), json!("src"));
        arguments.insert("count".into(), json!(3));
        assert_eq!(
            fill_arguments("ls UTCP_ARG_target_UTCP_END -n UTCP_ARG_count_UTCP_END", &arguments),
            "ls src -n 3"
        );
    }

    #[test]
    fn only_the_last_step_appends_by_default() {
        let steps = vec![step("a"), step("b"), step("c")];
        assert_eq!(appended_indices(&steps), vec![2]);

        let mut steps = vec![step("a"), step("b"), step("c")];
        steps[0].append_to_final_output = Some(true);
        steps[2].append_to_final_output = Some(false);
        assert_eq!(appended_indices(&steps), vec![0]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipeline_runs_and_later_steps_see_earlier_output() {
        register();
        let client = UtcpClient::create(None, None).await.unwrap();
        let protocol = CliCommunicationProtocol::new();

        let template = CallTemplate::new(template(
            "shell",
            vec![
                step("printf first"),
                step("printf \"seen:$CMD_0_OUTPUT\""),
            ],
        ));
        let value = protocol
            .call_tool(&client, "shell.run", &Map::new(), &template)
            .await
            .unwrap();
        assert_eq!(value, json!("seen:first"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_state_persists_between_steps() {
        register();
        let client = UtcpClient::create(None, None).await.unwrap();
        let protocol = CliCommunicationProtocol::new();

        let dir = tempfile::tempdir().unwrap();
        let template = CallTemplate::new(template(
            "statetest",
            vec![
                step(&format!("cd '{}'", dir.path().display())),
                step("pwd"),
            ],
        ));
        let value = protocol
            .call_tool(&client, "statetest.run", &Map::new(), &template)
            .await
            .unwrap();
        let reported = value.as_str().unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(reported).canonicalize().unwrap(),
            expected
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn discovery_parses_the_final_output_as_a_manual() {
        register();
        let client = UtcpClient::create(None, None).await.unwrap();
        let protocol = CliCommunicationProtocol::new();

        let manual = json!({"tools": [{"name": "version", "description": "", "tags": []}]});
        let template_value = CallTemplate::new(template(
            "clitools",
            vec![step(&format!("printf '%s' '{manual}'"))],
        ));
        let result = protocol
            .register_manual(&client, &template_value)
            .await
            .unwrap();
        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.manual.tools[0].name, "version");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn env_vars_reach_the_pipeline() {
        register();
        let client = UtcpClient::create(None, None).await.unwrap();
        let protocol = CliCommunicationProtocol::new();

        let mut cli = template("envtest", vec![step("printf \"$GREETING\"")]);
        cli.env_vars = Some(HashMap::from([("GREETING".to_string(), "hi".to_string())]));
        let value = protocol
            .call_tool(&client, "envtest.run", &Map::new(), &CallTemplate::new(cli))
            .await
            .unwrap();
        assert_eq!(value, json!("hi"));
    }

    #[test]
    fn template_round_trips() {
        register();
        let record = json!({
            "name": "multi",
            "call_template_type": "cli",
            "commands": [
                {"command": "git status", "append_to_final_output": true},
                {"command": "git log -1"}
            ]
        });
        let template = CallTemplate::from_value(&record).unwrap();
        assert_eq!(template.to_value().unwrap(), record);
    }
}
