//! Contract for the variable substitution engine.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::data::client_config::UtcpClientConfig;
use crate::error::UtcpResult;

#[async_trait]
pub trait VariableSubstitutor: fmt::Debug + Send + Sync {
    /// Recursively substitute `${VAR}` / `$VAR` references in every string
    /// of `value`, resolving names through the configuration's variable
    /// table, its loaders and finally the process environment. References
    /// found inside a manual's records are namespaced by `namespace`.
    async fn substitute(
        &self,
        value: &Value,
        config: &UtcpClientConfig,
        namespace: Option<&str>,
    ) -> UtcpResult<Value>;

    /// Traverse `value` and return the deduplicated fully-qualified names
    /// of every variable it references.
    fn find_required_variables(
        &self,
        value: &Value,
        namespace: Option<&str>,
    ) -> UtcpResult<Vec<String>>;
}
