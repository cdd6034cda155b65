//! Default variable substitution engine.
//!
//! Placeholders use `${NAME}` or `$NAME` with names drawn from
//! `[A-Za-z0-9_]+`. A `$ref` followed by a non-identifier character (or the
//! end of the string) is reserved so JSON-Schema references pass through
//! untouched, while variables such as `$refresh_token` still substitute.
//! References found in a manual's records resolve inside the manual's
//! namespace: the name expands to `<namespace with "_" doubled>_<NAME>`,
//! which keeps equal variable names of different manuals apart.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::data::client_config::UtcpClientConfig;
use crate::error::{UtcpError, UtcpResult};
use crate::interfaces::variable_substitutor::VariableSubstitutor;

static VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}|\$([A-Za-z0-9_]+)").expect("valid pattern"));

/// `$ref` at a word boundary; the regex crate has no look-ahead, so the
/// boundary is matched explicitly.
static REF_GUARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$ref($|[^A-Za-z0-9_])").expect("valid pattern"));

#[derive(Debug, Default)]
pub struct DefaultVariableSubstitutor;

fn validate_namespace(namespace: Option<&str>) -> UtcpResult<()> {
    if let Some(namespace) = namespace {
        let valid = !namespace.is_empty()
            && namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(UtcpError::InvalidArgument(format!(
                "variable namespace '{namespace}' contains invalid characters; only alphanumeric characters and underscores are allowed"
            )));
        }
    }
    Ok(())
}

fn qualified_name(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(namespace) => format!("{}_{}", namespace.replace('_', "__"), name),
        None => name.to_string(),
    }
}

impl DefaultVariableSubstitutor {
    async fn resolve(
        &self,
        name: &str,
        config: &UtcpClientConfig,
        namespace: Option<&str>,
    ) -> UtcpResult<String> {
        let key = qualified_name(namespace, name);
        if let Some(value) = config.variables.get(&key) {
            return Ok(value.clone());
        }
        if let Some(loaders) = &config.load_variables_from {
            for loader in loaders {
                if let Some(value) = loader.get(&key).await? {
                    if !value.is_empty() {
                        return Ok(value);
                    }
                }
            }
        }
        if let Ok(value) = std::env::var(&key) {
            if !value.is_empty() {
                return Ok(value);
            }
        }
        Err(UtcpError::variable_not_found(key))
    }

    async fn substitute_string(
        &self,
        text: &str,
        config: &UtcpClientConfig,
        namespace: Option<&str>,
    ) -> UtcpResult<String> {
        if REF_GUARD.is_match(text) {
            return Ok(text.to_string());
        }
        let mut output = String::with_capacity(text.len());
        let mut last = 0;
        for captures in VAR_PATTERN.captures_iter(text) {
            let whole = captures.get(0).expect("match always has a whole capture");
            let name = captures
                .get(1)
                .or_else(|| captures.get(2))
                .map(|group| group.as_str())
                .unwrap_or_default();
            output.push_str(&text[last..whole.start()]);
            output.push_str(&self.resolve(name, config, namespace).await?);
            last = whole.end();
        }
        output.push_str(&text[last..]);
        Ok(output)
    }

    fn substitute_value<'a>(
        &'a self,
        value: &'a Value,
        config: &'a UtcpClientConfig,
        namespace: Option<&'a str>,
    ) -> BoxFuture<'a, UtcpResult<Value>> {
        Box::pin(async move {
            match value {
                Value::String(text) => Ok(Value::String(
                    self.substitute_string(text, config, namespace).await?,
                )),
                Value::Object(map) => {
                    let mut output = Map::with_capacity(map.len());
                    for (key, nested) in map {
                        output.insert(
                            key.clone(),
                            self.substitute_value(nested, config, namespace).await?,
                        );
                    }
                    Ok(Value::Object(output))
                }
                Value::Array(items) => {
                    let mut output = Vec::with_capacity(items.len());
                    for item in items {
                        output.push(self.substitute_value(item, config, namespace).await?);
                    }
                    Ok(Value::Array(output))
                }
                other => Ok(other.clone()),
            }
        })
    }

    fn collect_required(
        value: &Value,
        namespace: Option<&str>,
        seen: &mut HashSet<String>,
        output: &mut Vec<String>,
    ) {
        match value {
            Value::String(text) => {
                if REF_GUARD.is_match(text) {
                    return;
                }
                for captures in VAR_PATTERN.captures_iter(text) {
                    let name = captures
                        .get(1)
                        .or_else(|| captures.get(2))
                        .map(|group| group.as_str())
                        .unwrap_or_default();
                    let qualified = qualified_name(namespace, name);
                    if seen.insert(qualified.clone()) {
                        output.push(qualified);
                    }
                }
            }
            Value::Object(map) => {
                for nested in map.values() {
                    Self::collect_required(nested, namespace, seen, output);
                }
            }
            Value::Array(items) => {
                for item in items {
                    Self::collect_required(item, namespace, seen, output);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl VariableSubstitutor for DefaultVariableSubstitutor {
    async fn substitute(
        &self,
        value: &Value,
        config: &UtcpClientConfig,
        namespace: Option<&str>,
    ) -> UtcpResult<Value> {
        validate_namespace(namespace)?;
        self.substitute_value(value, config, namespace).await
    }

    fn find_required_variables(
        &self,
        value: &Value,
        namespace: Option<&str>,
    ) -> UtcpResult<Vec<String>> {
        validate_namespace(namespace)?;
        let mut seen = HashSet::new();
        let mut output = Vec::new();
        Self::collect_required(value, namespace, &mut seen, &mut output);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_with(pairs: &[(&str, &str)]) -> UtcpClientConfig {
        let mut config = UtcpClientConfig::default();
        for (key, value) in pairs {
            config.variables.insert(key.to_string(), value.to_string());
        }
        config
    }

    #[tokio::test]
    async fn both_placeholder_syntaxes_substitute() {
        let substitutor = DefaultVariableSubstitutor;
        let config = config_with(&[("HOST", "example.com"), ("PORT", "8080")]);
        let result = substitutor
            .substitute(&json!("https://${HOST}:$PORT/api"), &config, None)
            .await
            .unwrap();
        assert_eq!(result, json!("https://example.com:8080/api"));
    }

    #[tokio::test]
    async fn namespaced_lookup_doubles_underscores() {
        let substitutor = DefaultVariableSubstitutor;
        let config = config_with(&[("m__one_KEY", "secret")]);
        let result = substitutor
            .substitute(&json!("https://x/${KEY}"), &config, Some("m_one"))
            .await
            .unwrap();
        assert_eq!(result, json!("https://x/secret"));
    }

    #[tokio::test]
    async fn missing_variable_reports_its_qualified_name() {
        let substitutor = DefaultVariableSubstitutor;
        let config = UtcpClientConfig::default();
        let err = substitutor
            .substitute(&json!("${KEY}"), &config, Some("m_one"))
            .await
            .unwrap_err();
        match err {
            UtcpError::VariableNotFound { name } => assert_eq!(name, "m__one_KEY"),
            other => panic!("expected variable-not-found, got {other}"),
        }
    }

    #[tokio::test]
    async fn ref_at_word_boundary_is_reserved() {
        let substitutor = DefaultVariableSubstitutor;
        let config = config_with(&[("refresh_token", "tok"), ("ref", "nope")]);

        assert_eq!(
            substitutor
                .substitute(&json!("$refresh_token"), &config, None)
                .await
                .unwrap(),
            json!("tok")
        );
        // A schema fragment with `$ref` keeps the whole string intact.
        assert_eq!(
            substitutor
                .substitute(&json!("{\"$ref\": \"#/defs/x\"}"), &config, None)
                .await
                .unwrap(),
            json!("{\"$ref\": \"#/defs/x\"}")
        );
        assert_eq!(
            substitutor.substitute(&json!("$ref"), &config, None).await.unwrap(),
            json!("$ref")
        );
    }

    #[tokio::test]
    async fn empty_string_value_substitutes() {
        let substitutor = DefaultVariableSubstitutor;
        let config = config_with(&[("EMPTY", "")]);
        assert_eq!(
            substitutor
                .substitute(&json!("x${EMPTY}y"), &config, None)
                .await
                .unwrap(),
            json!("xy")
        );
    }

    #[tokio::test]
    async fn substitution_descends_structures_and_skips_non_strings() {
        let substitutor = DefaultVariableSubstitutor;
        let config = config_with(&[("HOST", "h")]);
        let input = json!({
            "url": "https://${HOST}/api",
            "port": 8080,
            "flags": [true, "$HOST", null]
        });
        let result = substitutor.substitute(&input, &config, None).await.unwrap();
        assert_eq!(
            result,
            json!({"url": "https://h/api", "port": 8080, "flags": [true, "h", null]})
        );
    }

    #[tokio::test]
    async fn invalid_namespace_is_rejected_before_lookup() {
        let substitutor = DefaultVariableSubstitutor;
        let config = UtcpClientConfig::default();
        let err = substitutor
            .substitute(&json!("$X"), &config, Some("bad-name"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UTCP_E007");
    }

    #[test]
    fn find_required_variables_qualifies_and_deduplicates() {
        let substitutor = DefaultVariableSubstitutor;
        let input = json!({
            "url": "https://${HOST}/api?key=$API_KEY",
            "retry": "$API_KEY",
            "schema": "see $ref here",
        });
        let mut found = substitutor
            .find_required_variables(&input, Some("web_api"))
            .unwrap();
        found.sort();
        assert_eq!(found, vec!["web__api_API_KEY", "web__api_HOST"]);
    }

    #[test]
    fn find_required_variables_without_namespace() {
        let substitutor = DefaultVariableSubstitutor;
        let found = substitutor
            .find_required_variables(&json!("$A and ${B}"), None)
            .unwrap();
        assert_eq!(found, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn loader_values_resolve_after_the_variables_table() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "FROM_FILE=loaded").unwrap();

        let mut config = UtcpClientConfig::default();
        config.load_variables_from = Some(vec![crate::data::variable_loader::VariableLoader::new(
            crate::data::variable_loader::DotEnvVariableLoader {
                env_file_path: file.path().to_string_lossy().into_owned(),
            },
        )]);

        let substitutor = DefaultVariableSubstitutor;
        assert_eq!(
            substitutor
                .substitute(&json!("${FROM_FILE}"), &config, None)
                .await
                .unwrap(),
            json!("loaded")
        );
    }
}
