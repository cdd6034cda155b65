//! Default in-memory tool repository.

use std::any::Any;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::data::call_template::CallTemplate;
use crate::data::manual::UtcpManual;
use crate::data::tool::Tool;
use crate::error::{UtcpError, UtcpResult};
use crate::interfaces::serializer::Serializer;
use crate::interfaces::tool_repository::{
    ConcurrentToolRepository, ToolRepository, DEFAULT_REPOSITORY,
};
use crate::sync::TurnstileRwLock;

#[derive(Debug, Default)]
struct RepositoryState {
    /// Flat global index, insertion-ordered so enumeration is stable.
    tools_by_name: IndexMap<String, Tool>,
    manuals_by_name: IndexMap<String, UtcpManual>,
    templates_by_name: IndexMap<String, CallTemplate>,
}

/// In-memory store guarded by a writer-preferring reader-writer lock:
/// concurrent readers observe a consistent snapshot, writers are exclusive,
/// and a waiting writer blocks new readers through the turnstile. The inner
/// mutex only provides memory safety; the outer lock carries the
/// read/write discipline.
#[derive(Debug, Default)]
pub struct InMemToolRepository {
    lock: TurnstileRwLock,
    state: Mutex<RepositoryState>,
}

impl InMemToolRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConcurrentToolRepository for InMemToolRepository {
    fn repository_type(&self) -> &str {
        DEFAULT_REPOSITORY
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn save_manual(
        &self,
        manual_call_template: CallTemplate,
        manual: UtcpManual,
    ) -> UtcpResult<()> {
        let _guard = self.lock.write().await;
        let mut state = self.state.lock();
        let manual_name = manual_call_template.name().to_string();

        if let Some(previous) = state.manuals_by_name.get(&manual_name) {
            let stale: Vec<String> = previous.tools.iter().map(|t| t.name.clone()).collect();
            for name in stale {
                state.tools_by_name.shift_remove(&name);
            }
        }

        for tool in &manual.tools {
            state.tools_by_name.insert(tool.name.clone(), tool.clone());
        }
        state.manuals_by_name.insert(manual_name.clone(), manual);
        state
            .templates_by_name
            .insert(manual_name, manual_call_template);
        Ok(())
    }

    async fn remove_manual(&self, manual_name: &str) -> UtcpResult<bool> {
        let _guard = self.lock.write().await;
        let mut state = self.state.lock();
        let Some(manual) = state.manuals_by_name.shift_remove(manual_name) else {
            return Ok(false);
        };
        for tool in &manual.tools {
            state.tools_by_name.shift_remove(&tool.name);
        }
        state.templates_by_name.shift_remove(manual_name);
        Ok(true)
    }

    async fn remove_tool(&self, tool_name: &str) -> UtcpResult<bool> {
        let _guard = self.lock.write().await;
        let mut state = self.state.lock();
        if state.tools_by_name.shift_remove(tool_name).is_none() {
            return Ok(false);
        }
        for manual in state.manuals_by_name.values_mut() {
            manual.tools.retain(|tool| tool.name != tool_name);
        }
        Ok(true)
    }

    async fn get_tool(&self, tool_name: &str) -> UtcpResult<Option<Tool>> {
        let _guard = self.lock.read().await;
        Ok(self.state.lock().tools_by_name.get(tool_name).cloned())
    }

    async fn get_tools(&self) -> UtcpResult<Vec<Tool>> {
        let _guard = self.lock.read().await;
        Ok(self.state.lock().tools_by_name.values().cloned().collect())
    }

    async fn get_tools_by_manual(&self, manual_name: &str) -> UtcpResult<Option<Vec<Tool>>> {
        let _guard = self.lock.read().await;
        Ok(self
            .state
            .lock()
            .manuals_by_name
            .get(manual_name)
            .map(|manual| manual.tools.clone()))
    }

    async fn get_manual(&self, manual_name: &str) -> UtcpResult<Option<UtcpManual>> {
        let _guard = self.lock.read().await;
        Ok(self.state.lock().manuals_by_name.get(manual_name).cloned())
    }

    async fn get_manuals(&self) -> UtcpResult<Vec<UtcpManual>> {
        let _guard = self.lock.read().await;
        Ok(self.state.lock().manuals_by_name.values().cloned().collect())
    }

    async fn get_manual_template(
        &self,
        manual_name: &str,
    ) -> UtcpResult<Option<CallTemplate>> {
        let _guard = self.lock.read().await;
        Ok(self
            .state
            .lock()
            .templates_by_name
            .get(manual_name)
            .cloned())
    }

    async fn get_manual_templates(&self) -> UtcpResult<Vec<CallTemplate>> {
        let _guard = self.lock.read().await;
        Ok(self
            .state
            .lock()
            .templates_by_name
            .values()
            .cloned()
            .collect())
    }
}

/// Config serializer: the in-memory repository carries no settings beyond
/// its tag, and validation constructs a fresh empty store.
pub struct InMemToolRepositoryConfigSerializer;

impl Serializer<ToolRepository> for InMemToolRepositoryConfigSerializer {
    fn to_value(&self, obj: &ToolRepository) -> UtcpResult<Value> {
        if obj.downcast_ref::<InMemToolRepository>().is_none() {
            return Err(UtcpError::validation(
                "InMemToolRepository",
                "repository does not match its registered type",
            ));
        }
        Ok(json!({ "tool_repository_type": DEFAULT_REPOSITORY }))
    }

    fn validate_value(&self, value: &Value) -> UtcpResult<ToolRepository> {
        if !value.is_object() {
            return Err(UtcpError::validation(
                "InMemToolRepository",
                "expected an object",
            ));
        }
        Ok(ToolRepository::new(InMemToolRepository::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::call_template::CallTemplateKind;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ProbeTemplate {
        name: String,
    }

    impl CallTemplateKind for ProbeTemplate {
        fn name(&self) -> &str {
            &self.name
        }

        fn call_template_type(&self) -> &str {
            "repo_probe"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn template(name: &str) -> CallTemplate {
        CallTemplate::new(ProbeTemplate { name: name.into() })
    }

    fn tool(name: &str) -> Tool {
        Tool {
            name: name.into(),
            description: String::new(),
            inputs: Default::default(),
            outputs: Default::default(),
            tags: Vec::new(),
            average_response_size: None,
            tool_call_template: template("executor"),
        }
    }

    fn manual(tools: Vec<Tool>) -> UtcpManual {
        UtcpManual::new(tools)
    }

    #[tokio::test]
    async fn save_then_read_back() {
        let repo = InMemToolRepository::new();
        repo.save_manual(template("m1"), manual(vec![tool("m1.echo")]))
            .await
            .unwrap();

        assert!(repo.get_tool("m1.echo").await.unwrap().is_some());
        assert_eq!(repo.get_tools().await.unwrap().len(), 1);
        assert_eq!(
            repo.get_tools_by_manual("m1").await.unwrap().unwrap().len(),
            1
        );
        assert!(repo.get_manual("m1").await.unwrap().is_some());
        assert!(repo.get_manual_template("m1").await.unwrap().is_some());
        assert!(repo.get_tools_by_manual("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resaving_replaces_the_previous_tool_set() {
        let repo = InMemToolRepository::new();
        repo.save_manual(template("m1"), manual(vec![tool("m1.old_a"), tool("m1.old_b")]))
            .await
            .unwrap();
        repo.save_manual(template("m1"), manual(vec![tool("m1.new")]))
            .await
            .unwrap();

        let names: Vec<String> = repo
            .get_tools()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["m1.new".to_string()]);
        assert!(repo.get_tool("m1.old_a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_manual_drops_its_tools() {
        let repo = InMemToolRepository::new();
        repo.save_manual(template("m1"), manual(vec![tool("m1.echo")]))
            .await
            .unwrap();
        repo.save_manual(template("m2"), manual(vec![tool("m2.ping")]))
            .await
            .unwrap();

        assert!(repo.remove_manual("m1").await.unwrap());
        assert!(!repo.remove_manual("m1").await.unwrap());
        assert!(repo.get_tool("m1.echo").await.unwrap().is_none());
        assert!(repo.get_tool("m2.ping").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn remove_tool_detaches_it_from_its_manual() {
        let repo = InMemToolRepository::new();
        repo.save_manual(template("m1"), manual(vec![tool("m1.a"), tool("m1.b")]))
            .await
            .unwrap();

        assert!(repo.remove_tool("m1.a").await.unwrap());
        assert!(!repo.remove_tool("m1.a").await.unwrap());
        let remaining = repo.get_tools_by_manual("m1").await.unwrap().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "m1.b");
    }

    #[tokio::test]
    async fn reads_return_defensive_copies() {
        let repo = InMemToolRepository::new();
        repo.save_manual(template("m1"), manual(vec![tool("m1.echo")]))
            .await
            .unwrap();

        let mut copy = repo.get_tools().await.unwrap();
        copy.clear();
        assert_eq!(repo.get_tools().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_readers_never_observe_a_partial_tool_set() {
        let repo = Arc::new(InMemToolRepository::new());
        repo.save_manual(template("m1"), manual(vec![tool("m1.a"), tool("m1.b")]))
            .await
            .unwrap();

        let writer = {
            let repo = repo.clone();
            tokio::spawn(async move {
                for round in 0..50u32 {
                    let tools = if round % 2 == 0 {
                        vec![tool("m1.a"), tool("m1.b")]
                    } else {
                        vec![tool("m1.c"), tool("m1.d"), tool("m1.e")]
                    };
                    repo.save_manual(template("m1"), manual(tools)).await.unwrap();
                }
            })
        };

        let reader = {
            let repo = repo.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let count = repo
                        .get_tools_by_manual("m1")
                        .await
                        .unwrap()
                        .map(|tools| tools.len())
                        .unwrap_or(0);
                    assert!(count == 2 || count == 3, "partial tool set observed");
                }
            })
        };

        writer.await.unwrap();
        reader.await.unwrap();
    }
}
