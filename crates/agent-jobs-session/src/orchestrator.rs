//! Execution orchestrator for submit-and-poll jobs.
//!
//! `submit` allocates a record and returns at once; a detached task drives
//! the execution through
//!
//! ```text
//! pending -> running(initializing) -> running(agent_created, 0.2) -> completed(1.0) | failed
//! ```
//!
//! and is the only writer of that record.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use agent_jobs_core::{
    ExecutionId, ExecutionMetadata, ExecutionStore, StatusUpdate, StoreError, TaskContext,
    TaskEngine,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;

/// Record kind and id namespace for agent executions.
pub const AGENT_KIND: &str = "agent";

/// Default record time-to-live.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Orchestrator error.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("{0}")]
    Validation(String),
}

/// Per-request options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteOptions {
    /// Record time-to-live in seconds.
    #[serde(default)]
    pub ttl: Option<u64>,
}

/// A submit-and-poll request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub config_path: String,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub context: Option<TaskContext>,
    #[serde(default)]
    pub options: Option<ExecuteOptions>,
}

impl ExecuteRequest {
    /// Request for `task` against the agent defined at `config_path`.
    pub fn new(config_path: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            config_path: config_path.into(),
            task: Some(task.into()),
            input: None,
            context: None,
            options: None,
        }
    }

    fn validate(&self, default_ttl: Duration) -> Result<Duration, OrchestratorError> {
        if self.config_path.trim().is_empty() {
            return Err(OrchestratorError::Validation("configPath is required".into()));
        }
        match self.options.as_ref().and_then(|o| o.ttl) {
            Some(0) => Err(OrchestratorError::Validation(
                "options.ttl must be greater than zero".into(),
            )),
            Some(secs) => Ok(Duration::from_secs(secs)),
            None => Ok(default_ttl),
        }
    }

    fn metadata(&self) -> ExecutionMetadata {
        ExecutionMetadata {
            config_path: self.config_path.clone(),
            task: self.task.clone(),
            input: self.input.clone(),
        }
    }
}

/// Drives submitted executions and owns writes to their records.
pub struct ExecutionOrchestrator<S, E>
where
    S: ExecutionStore + 'static,
    E: TaskEngine + 'static,
{
    store: Arc<S>,
    engine: Arc<E>,
    default_ttl: Duration,
    in_flight: Arc<Mutex<HashMap<ExecutionId, JoinHandle<()>>>>,
}

impl<S, E> ExecutionOrchestrator<S, E>
where
    S: ExecutionStore + 'static,
    E: TaskEngine + 'static,
{
    /// Create a new orchestrator.
    #[must_use]
    pub fn new(store: Arc<S>, engine: Arc<E>) -> Self {
        Self {
            store,
            engine,
            default_ttl: DEFAULT_TTL,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Time-to-live for records whose request sets none.
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Create an execution record and start driving it in the background.
    ///
    /// Returns as soon as the record exists; never waits for the task.
    ///
    /// # Errors
    /// Returns error if the request is invalid or the record cannot be created.
    pub async fn submit(&self, request: ExecuteRequest) -> Result<ExecutionId, OrchestratorError> {
        let ttl = request.validate(self.default_ttl)?;
        let id = self
            .store
            .create(AGENT_KIND, request.metadata(), ttl)
            .await?;

        tracing::info!(execution_id = %id, config_path = %request.config_path, "execution submitted");

        // Hold the map lock across the spawn so the drive's own removal
        // cannot run before its handle is inserted.
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(drive(
            id.clone(),
            request,
            Arc::clone(&self.store),
            Arc::clone(&self.engine),
            Arc::clone(&self.in_flight),
        ));
        in_flight.insert(id.clone(), handle);
        drop(in_flight);

        Ok(id)
    }

    /// Number of executions still being driven.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Wait up to `grace` for in-flight executions, then abort the rest and
    /// record them as failed.
    ///
    /// Returns how many executions were interrupted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        while self.in_flight() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let remaining: Vec<(ExecutionId, JoinHandle<()>)> = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        let interrupted = remaining.len();
        for (id, handle) in remaining {
            handle.abort();
            let _ = handle.await;
            match self
                .store
                .update_status(&id, StatusUpdate::failed("execution interrupted by shutdown"))
                .await
            {
                Ok(()) => tracing::warn!(execution_id = %id, "execution interrupted by shutdown"),
                // Finished between the drain and the abort.
                Err(StoreError::AlreadyTerminal(_)) => {}
                Err(e) => tracing::error!(execution_id = %id, "Failed to record interruption: {e}"),
            }
        }
        interrupted
    }
}

async fn drive<S, E>(
    id: ExecutionId,
    request: ExecuteRequest,
    store: Arc<S>,
    engine: Arc<E>,
    in_flight: Arc<Mutex<HashMap<ExecutionId, JoinHandle<()>>>>,
) where
    S: ExecutionStore,
    E: TaskEngine,
{
    match run_execution(&id, &request, store.as_ref(), engine.as_ref()).await {
        Ok(()) => {
            tracing::info!(execution_id = %id, "execution completed");
            if let Err(e) = store.increment_completed_counter().await {
                tracing::error!(execution_id = %id, "Failed to bump completed counter: {e}");
            }
        }
        Err(message) => {
            tracing::error!(execution_id = %id, "Agent execution failed: {message}");
            if let Err(e) = store
                .update_status(&id, StatusUpdate::failed(message))
                .await
            {
                tracing::error!(execution_id = %id, "Failed to record execution failure: {e}");
            }
        }
    }

    in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
}

/// Run one execution up to and including its `completed` write.
///
/// Every error comes back as a message for the `failed` write.
async fn run_execution<S, E>(
    id: &str,
    request: &ExecuteRequest,
    store: &S,
    engine: &E,
) -> Result<(), String>
where
    S: ExecutionStore,
    E: TaskEngine,
{
    store
        .update_status(id, StatusUpdate::running("initializing", 0.0))
        .await
        .map_err(|e| e.to_string())?;

    let agent_id = engine
        .create_agent_from_config(&request.config_path)
        .await
        .map_err(|e| e.to_string())?;

    store
        .update_status(id, StatusUpdate::running("agent_created", 0.2))
        .await
        .map_err(|e| e.to_string())?;

    let task = request.metadata().task_text();
    let context = request.context.clone().unwrap_or_default();
    let result = engine
        .execute_task(&agent_id, &task, context)
        .await
        .map_err(|e| e.to_string())?;

    store
        .update_status(id, StatusUpdate::completed(result))
        .await
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use agent_jobs_core::{
        AgentState, EngineError, EventBus, ExecutionRecord, ExecutionStatus,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::storage::MemoryStore;

    /// Engine whose task waits for a gate before answering.
    struct GatedEngine {
        bus: Arc<EventBus>,
        gate: Arc<Notify>,
        outcome: Result<Value, String>,
        fail_create: bool,
    }

    impl GatedEngine {
        fn new(outcome: Result<Value, String>) -> Self {
            Self {
                bus: Arc::new(EventBus::new()),
                gate: Arc::new(Notify::new()),
                outcome,
                fail_create: false,
            }
        }
    }

    #[async_trait]
    impl TaskEngine for GatedEngine {
        fn events(&self) -> Arc<EventBus> {
            Arc::clone(&self.bus)
        }

        async fn create_agent_from_config(&self, config_path: &str) -> Result<String, EngineError> {
            if self.fail_create {
                return Err(EngineError::Definition(format!("cannot read {config_path}")));
            }
            Ok("gated".into())
        }

        async fn has_agent(&self, _agent_id: &str) -> bool {
            true
        }

        async fn execute_task(
            &self,
            _agent_id: &str,
            _task: &str,
            _context: TaskContext,
        ) -> Result<Value, EngineError> {
            self.gate.notified().await;
            self.outcome.clone().map_err(EngineError::TaskFailed)
        }

        async fn agent_state(&self, _agent_id: &str) -> Result<Option<AgentState>, EngineError> {
            Ok(None)
        }

        async fn all_agent_states(&self) -> Result<Vec<AgentState>, EngineError> {
            Ok(Vec::new())
        }

        async fn reset_agent(&self, _agent_id: &str) -> Result<(), EngineError> {
            Ok(())
        }
    }

    async fn wait_terminal(store: &MemoryStore, id: &str) -> ExecutionRecord {
        for _ in 0..200 {
            let rec = store.get(id).await.unwrap().unwrap();
            if rec.status.is_terminal() {
                return rec;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {id} never finished");
    }

    #[tokio::test]
    async fn test_submit_returns_before_completion() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(GatedEngine::new(Ok(json!("done"))));
        let orch = ExecutionOrchestrator::new(Arc::clone(&store), Arc::clone(&engine));

        let id = orch
            .submit(ExecuteRequest::new("agents/echo.yaml", "hello"))
            .await
            .unwrap();
        assert!(id.starts_with("agent_"));

        // Let the drive reach the engine call.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let rec = store.get(&id).await.unwrap().unwrap();
        assert_eq!(rec.status, ExecutionStatus::Running);
        assert_eq!(rec.stage.as_deref(), Some("agent_created"));
        assert_eq!(rec.progress, Some(0.2));
        assert_eq!(orch.in_flight(), 1);

        engine.gate.notify_one();
        let rec = wait_terminal(&store, &id).await;
        assert_eq!(rec.status, ExecutionStatus::Completed);
        assert_eq!(rec.result, Some(json!("done")));
        assert_eq!(rec.progress, Some(1.0));
        assert!(rec.error.is_none());

        // The counter is bumped after the terminal write.
        while orch.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.completed_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ttl_from_request_or_default() {
        let store = Arc::new(MemoryStore::new());
        let orch = ExecutionOrchestrator::new(
            Arc::clone(&store),
            Arc::new(GatedEngine::new(Ok(json!(null)))),
        )
        .with_default_ttl(Duration::from_secs(120));

        let id = orch.submit(ExecuteRequest::new("a.yaml", "x")).await.unwrap();
        let rec = store.get(&id).await.unwrap().unwrap();
        assert_eq!((rec.expires_at - rec.created_at).num_seconds(), 120);

        let mut request = ExecuteRequest::new("a.yaml", "x");
        request.options = Some(ExecuteOptions { ttl: Some(5) });
        let id = orch.submit(request).await.unwrap();
        let rec = store.get(&id).await.unwrap().unwrap();
        assert_eq!((rec.expires_at - rec.created_at).num_seconds(), 5);
    }

    #[tokio::test]
    async fn test_engine_failure_becomes_failed_record() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(GatedEngine::new(Err("model unavailable".into())));
        let orch = ExecutionOrchestrator::new(Arc::clone(&store), Arc::clone(&engine));

        let id = orch
            .submit(ExecuteRequest::new("agents/echo.yaml", "hello"))
            .await
            .unwrap();
        engine.gate.notify_one();

        let rec = wait_terminal(&store, &id).await;
        assert_eq!(rec.status, ExecutionStatus::Failed);
        assert!(rec.error.as_deref().unwrap().contains("model unavailable"));
        assert!(rec.result.is_none());
        assert_eq!(store.completed_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_definition_failure_becomes_failed_record() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = GatedEngine::new(Ok(json!(null)));
        engine.fail_create = true;
        let orch = ExecutionOrchestrator::new(Arc::clone(&store), Arc::new(engine));

        let id = orch
            .submit(ExecuteRequest::new("agents/missing.yaml", "hello"))
            .await
            .unwrap();

        let rec = wait_terminal(&store, &id).await;
        assert_eq!(rec.status, ExecutionStatus::Failed);
        assert_eq!(rec.stage.as_deref(), Some("failed"));
        assert_eq!(rec.progress, Some(0.0));
    }

    #[tokio::test]
    async fn test_validation() {
        let store = Arc::new(MemoryStore::new());
        let orch = ExecutionOrchestrator::new(
            Arc::clone(&store),
            Arc::new(GatedEngine::new(Ok(json!(null)))),
        );

        let err = orch.submit(ExecuteRequest::new("  ", "x")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));

        let mut request = ExecuteRequest::new("a.yaml", "x");
        request.options = Some(ExecuteOptions { ttl: Some(0) });
        assert!(orch.submit(request).await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_fails_stuck_executions() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(GatedEngine::new(Ok(json!(null))));
        let orch = ExecutionOrchestrator::new(Arc::clone(&store), engine);

        let id = orch
            .submit(ExecuteRequest::new("a.yaml", "never answered"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(orch.shutdown(Duration::from_millis(50)).await, 1);
        assert_eq!(orch.in_flight(), 0);

        let rec = store.get(&id).await.unwrap().unwrap();
        assert_eq!(rec.status, ExecutionStatus::Failed);
        assert_eq!(rec.error.as_deref(), Some("execution interrupted by shutdown"));
        assert!(store.list_active_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_echo_agent_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("agents")).unwrap();
        std::fs::write(
            dir.path().join("agents/echo.yaml"),
            "id: echo\nbackend:\n  type: echo\n",
        )
        .unwrap();

        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(agent_jobs_engine::AgentRunner::new(dir.path()));
        let orch = ExecutionOrchestrator::new(Arc::clone(&store), engine);

        let id = orch
            .submit(ExecuteRequest::new("agents/echo.yaml", "hello"))
            .await
            .unwrap();
        let rec = wait_terminal(&store, &id).await;
        assert_eq!(rec.status, ExecutionStatus::Completed);
        assert_eq!(store.get_result(&id).await.unwrap().unwrap().result, json!("hello"));
    }
}
