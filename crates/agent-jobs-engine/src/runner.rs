//! Agent runner: registry of loaded agents and the `TaskEngine` implementation.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use agent_jobs_core::{
    AgentEvent, AgentId, AgentState, AgentStatus, EngineError, EventBus, TaskContext, TaskEngine,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{
    AgentDefinition, BackendConfig,
    backend::{AgentBackend, BackendRequest, CommandBackend, EchoBackend, OutputSink},
    definition::resolve_config_path,
};

/// Runs of one agent still in progress. Shared with each run's guard.
#[derive(Default)]
struct ActiveRuns(AtomicU32);

/// Marks one run as active until dropped, so an aborted run is not counted.
struct ActiveGuard(Arc<ActiveRuns>);

impl ActiveGuard {
    fn enter(runs: &Arc<ActiveRuns>) -> Self {
        runs.0.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(runs))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Loaded agent and its counters.
struct AgentEntry {
    definition: AgentDefinition,
    active: Arc<ActiveRuns>,
    executions: u64,
    last_result: Option<Value>,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl AgentEntry {
    fn new(definition: AgentDefinition) -> Self {
        Self {
            definition,
            active: Arc::default(),
            executions: 0,
            last_result: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    fn snapshot(&self) -> AgentState {
        AgentState {
            id: self.definition.id.clone(),
            name: self.definition.display_name().to_string(),
            description: self.definition.description.clone(),
            backend: self.definition.backend.type_name().to_string(),
            status: if self.active.0.load(Ordering::SeqCst) > 0 {
                AgentStatus::Running
            } else {
                AgentStatus::Idle
            },
            executions: self.executions,
            last_result: self.last_result.clone(),
            last_error: self.last_error.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// In-process task engine.
///
/// Agents are loaded from YAML definitions under `agents_dir` and run through
/// the backend their definition names. Every run publishes its output and
/// exactly one terminal event on the shared [`EventBus`].
pub struct AgentRunner {
    agents_dir: PathBuf,
    agents: RwLock<HashMap<AgentId, AgentEntry>>,
    plugins: HashMap<String, Arc<dyn AgentBackend>>,
    bus: Arc<EventBus>,
}

impl AgentRunner {
    /// Create a runner that resolves config paths against `agents_dir`.
    #[must_use]
    pub fn new(agents_dir: impl Into<PathBuf>) -> Self {
        Self {
            agents_dir: agents_dir.into(),
            agents: RwLock::new(HashMap::new()),
            plugins: HashMap::new(),
            bus: Arc::new(EventBus::new()),
        }
    }

    /// Register a plugin backend, selected by `backend: {type: plugin, name}`.
    #[must_use]
    pub fn with_backend(mut self, name: impl Into<String>, backend: Arc<dyn AgentBackend>) -> Self {
        self.plugins.insert(name.into(), backend);
        self
    }

    /// Use an existing event bus instead of a private one.
    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Register an already-parsed definition, replacing any agent with the same id.
    ///
    /// Counters of a replaced agent are kept.
    pub async fn register(&self, definition: AgentDefinition) -> AgentId {
        let id = definition.id.clone();
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(&id) {
            entry.definition = definition;
            entry.updated_at = Utc::now();
            tracing::info!(agent_id = %id, "reloaded agent definition");
        } else {
            agents.insert(id.clone(), AgentEntry::new(definition));
            tracing::info!(agent_id = %id, "registered agent");
        }
        id
    }

    fn backend_for(&self, definition: &AgentDefinition) -> Result<Arc<dyn AgentBackend>, EngineError> {
        match &definition.backend {
            BackendConfig::Echo { .. } => Ok(Arc::new(EchoBackend)),
            BackendConfig::Command { .. } => Ok(Arc::new(CommandBackend)),
            BackendConfig::Plugin { name } => self.plugins.get(name).cloned().ok_or_else(|| {
                EngineError::Definition(format!("no backend registered under {name:?}"))
            }),
        }
    }

    async fn finish(&self, agent_id: &str, outcome: &Result<Value, EngineError>) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.executions += 1;
            entry.updated_at = Utc::now();
            match outcome {
                Ok(result) => {
                    entry.last_result = Some(result.clone());
                    entry.last_error = None;
                }
                Err(e) => entry.last_error = Some(e.to_string()),
            }
        }
    }
}

#[async_trait]
impl TaskEngine for AgentRunner {
    fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    async fn create_agent_from_config(&self, config_path: &str) -> Result<AgentId, EngineError> {
        let path = resolve_config_path(&self.agents_dir, config_path)?;
        let definition = AgentDefinition::load(&path).await?;
        self.backend_for(&definition)?;
        Ok(self.register(definition).await)
    }

    async fn has_agent(&self, agent_id: &str) -> bool {
        self.agents.read().await.contains_key(agent_id)
    }

    async fn execute_task(
        &self,
        agent_id: &str,
        task: &str,
        context: TaskContext,
    ) -> Result<Value, EngineError> {
        let (definition, _active) = {
            let agents = self.agents.read().await;
            let entry = agents
                .get(agent_id)
                .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))?;
            (entry.definition.clone(), ActiveGuard::enter(&entry.active))
        };

        tracing::info!(agent_id, backend = definition.backend.type_name(), "executing task");

        let outcome = match self.backend_for(&definition) {
            Ok(backend) => {
                let sink = OutputSink::new(agent_id, Arc::clone(&self.bus));
                let request = BackendRequest {
                    definition: &definition,
                    task,
                    context: &context,
                };
                backend.run(request, &sink).await
            }
            Err(e) => Err(e),
        };

        self.finish(agent_id, &outcome).await;

        let event = match &outcome {
            Ok(result) => AgentEvent::completed(agent_id, result.clone()),
            Err(e) => {
                tracing::warn!(agent_id, error = %e, "task failed");
                AgentEvent::failed(agent_id, e.to_string())
            }
        };
        let listeners = self.bus.publish(&event);
        tracing::debug!(agent_id, listeners, kind = ?event.kind(), "published terminal event");

        outcome
    }

    async fn agent_state(&self, agent_id: &str) -> Result<Option<AgentState>, EngineError> {
        Ok(self.agents.read().await.get(agent_id).map(AgentEntry::snapshot))
    }

    async fn all_agent_states(&self) -> Result<Vec<AgentState>, EngineError> {
        let mut states: Vec<AgentState> = self
            .agents
            .read()
            .await
            .values()
            .map(AgentEntry::snapshot)
            .collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(states)
    }

    async fn reset_agent(&self, agent_id: &str) -> Result<(), EngineError> {
        let mut agents = self.agents.write().await;
        let entry = agents
            .get_mut(agent_id)
            .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))?;
        entry.executions = 0;
        entry.last_result = None;
        entry.last_error = None;
        entry.updated_at = Utc::now();
        tracing::info!(agent_id, "agent reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use agent_jobs_core::{AgentEventPayload, EventKind};
    use serde_json::json;

    use super::*;

    struct FailingBackend;

    #[async_trait]
    impl AgentBackend for FailingBackend {
        async fn run(
            &self,
            _request: BackendRequest<'_>,
            output: &OutputSink,
        ) -> Result<Value, EngineError> {
            output.emit("partial");
            Err(EngineError::TaskFailed("model unavailable".into()))
        }
    }

    fn write_agent(dir: &tempfile::TempDir, file: &str, yaml: &str) {
        let path = dir.path().join(file);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, yaml).unwrap();
    }

    #[tokio::test]
    async fn test_create_and_execute_echo_agent() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(&dir, "agents/echo.yaml", "id: echo\nbackend:\n  type: echo\n");
        let runner = AgentRunner::new(dir.path());

        let id = runner.create_agent_from_config("agents/echo.yaml").await.unwrap();
        assert_eq!(id, "echo");
        assert!(runner.has_agent("echo").await);

        let mut events = runner.events().subscribe_all(&EventKind::ALL);
        let result = runner
            .execute_task("echo", "hello", TaskContext::new())
            .await
            .unwrap();
        assert_eq!(result, json!("hello"));

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv())
            .map(|e| e.kind())
            .collect();
        assert_eq!(kinds, vec![EventKind::Stream, EventKind::Completed]);

        let state = runner.agent_state("echo").await.unwrap().unwrap();
        assert_eq!(state.executions, 1);
        assert_eq!(state.status, AgentStatus::Idle);
        assert_eq!(state.last_result, Some(json!("hello")));
    }

    #[tokio::test]
    async fn test_failure_publishes_failed_event() {
        let runner = AgentRunner::new(".").with_backend("broken", Arc::new(FailingBackend));
        runner
            .register(
                AgentDefinition::from_yaml("id: b\nbackend:\n  type: plugin\n  name: broken\n")
                    .unwrap(),
            )
            .await;

        let mut events = runner.events().subscribe_all(&[EventKind::Failed]);
        let err = runner
            .execute_task("b", "x", TaskContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TaskFailed(_)));

        let event = events.try_recv().unwrap();
        assert_eq!(event.agent_id, "b");
        assert!(matches!(event.payload, AgentEventPayload::Failed { ref error } if error.contains("model unavailable")));

        let state = runner.agent_state("b").await.unwrap().unwrap();
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn test_unknown_agent_rejects_without_events() {
        let runner = AgentRunner::new(".");
        let mut events = runner.events().subscribe_all(&EventKind::ALL);
        let err = runner
            .execute_task("nobody", "x", TaskContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AgentNotFound(_)));
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let runner = AgentRunner::new(dir.path());
        let err = runner
            .create_agent_from_config("agents/missing.yaml")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Definition(_)));
    }

    #[tokio::test]
    async fn test_unregistered_plugin_is_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(&dir, "p.yaml", "id: p\nbackend:\n  type: plugin\n  name: nope\n");
        let runner = AgentRunner::new(dir.path());
        assert!(runner.create_agent_from_config("p.yaml").await.is_err());
        assert!(!runner.has_agent("p").await);
    }

    /// Never answers.
    struct StuckBackend;

    #[async_trait]
    impl AgentBackend for StuckBackend {
        async fn run(
            &self,
            _request: BackendRequest<'_>,
            _output: &OutputSink,
        ) -> Result<Value, EngineError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_aborted_run_is_not_left_running() {
        let runner = Arc::new(AgentRunner::new(".").with_backend("stuck", Arc::new(StuckBackend)));
        runner
            .register(
                AgentDefinition::from_yaml("id: s\nbackend:\n  type: plugin\n  name: stuck\n")
                    .unwrap(),
            )
            .await;

        let task = tokio::spawn({
            let runner = Arc::clone(&runner);
            async move { runner.execute_task("s", "x", TaskContext::new()).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let state = runner.agent_state("s").await.unwrap().unwrap();
        assert_eq!(state.status, AgentStatus::Running);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        let state = runner.agent_state("s").await.unwrap().unwrap();
        assert_eq!(state.status, AgentStatus::Idle);
        assert_eq!(state.executions, 0);
    }

    #[tokio::test]
    async fn test_reset_clears_counters() {
        let runner = AgentRunner::new(".");
        runner
            .register(AgentDefinition::from_yaml("id: e\nbackend:\n  type: echo\n").unwrap())
            .await;
        runner.execute_task("e", "hi", TaskContext::new()).await.unwrap();

        runner.reset_agent("e").await.unwrap();
        let state = runner.agent_state("e").await.unwrap().unwrap();
        assert_eq!(state.executions, 0);
        assert!(state.last_result.is_none());

        assert!(matches!(
            runner.reset_agent("ghost").await,
            Err(EngineError::AgentNotFound(_))
        ));
    }
}
