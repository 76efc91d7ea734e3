//! Core traits for record storage and task execution.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    EventBus, TaskContext,
    record::{ExecutionId, ExecutionMetadata, ExecutionRecord, ExecutionResult, ExecutionStatus, StatusUpdate},
};

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Execution not found: {0}")]
    NotFound(ExecutionId),
    #[error("Execution already finished: {0}")]
    AlreadyTerminal(ExecutionId),
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for execution record storage backends.
///
/// Records are independent keys; implementations only need per-record
/// consistency.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Allocate a new `pending` record and return its id.
    async fn create(
        &self,
        kind: &str,
        metadata: ExecutionMetadata,
        ttl: Duration,
    ) -> Result<ExecutionId, StoreError>;

    /// Apply a partial status update.
    async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<(), StoreError>;

    /// Get a record by id. Expired records are absent.
    async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError>;

    /// Get the stored result of a completed execution.
    async fn get_result(&self, id: &str) -> Result<Option<ExecutionResult>, StoreError> {
        Ok(self.get(id).await?.and_then(|r| r.completed_result()))
    }

    /// Ids of all executions still pending or running.
    async fn list_active_ids(&self) -> Result<Vec<ExecutionId>, StoreError>;

    /// Bump the global completed-executions counter.
    async fn increment_completed_counter(&self) -> Result<u64, StoreError>;

    /// Current value of the completed-executions counter.
    async fn completed_count(&self) -> Result<u64, StoreError>;
}

/// Agent identifier.
pub type AgentId = String;

/// Whether an agent is currently executing a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
}

/// Introspection snapshot of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub id: AgentId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Backend type from the agent definition.
    pub backend: String,
    pub status: AgentStatus,
    /// Tasks executed since creation or last reset.
    pub executions: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),
    #[error("Invalid agent definition: {0}")]
    Definition(String),
    #[error("Task failed: {0}")]
    TaskFailed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Engine error: {0}")]
    Internal(String),
}

/// Trait for the engine that performs agent work.
///
/// Implementations publish `stream`, `completed` and `failed` events on
/// [`TaskEngine::events`] while a task runs.
#[async_trait]
pub trait TaskEngine: Send + Sync {
    /// Process-wide event source shared by all relays.
    fn events(&self) -> Arc<EventBus>;

    /// Load (or reload) an agent from a definition file, returning its id.
    async fn create_agent_from_config(&self, config_path: &str) -> Result<AgentId, EngineError>;

    /// Whether an agent with this id is registered.
    async fn has_agent(&self, agent_id: &str) -> bool;

    /// Run one task to completion.
    async fn execute_task(
        &self,
        agent_id: &str,
        task: &str,
        context: TaskContext,
    ) -> Result<Value, EngineError>;

    async fn agent_state(&self, agent_id: &str) -> Result<Option<AgentState>, EngineError>;

    async fn all_agent_states(&self) -> Result<Vec<AgentState>, EngineError>;

    /// Clear an agent's accumulated state.
    async fn reset_agent(&self, agent_id: &str) -> Result<(), EngineError>;
}
