//! Agent backends: the code that actually performs a task.

mod command;
mod echo;

use std::sync::Arc;

use agent_jobs_core::{AgentEvent, EngineError, EventBus, TaskContext};
use async_trait::async_trait;
use serde_json::Value;

use crate::AgentDefinition;

pub use command::CommandBackend;
pub use echo::EchoBackend;

/// Inputs for one backend run.
#[derive(Debug, Clone, Copy)]
pub struct BackendRequest<'a> {
    pub definition: &'a AgentDefinition,
    pub task: &'a str,
    pub context: &'a TaskContext,
}

/// Publishes incremental output for one agent.
#[derive(Clone)]
pub struct OutputSink {
    agent_id: String,
    bus: Arc<EventBus>,
}

impl OutputSink {
    #[must_use]
    pub fn new(agent_id: impl Into<String>, bus: Arc<EventBus>) -> Self {
        Self {
            agent_id: agent_id.into(),
            bus,
        }
    }

    /// Emit an output chunk. Returns the number of listeners reached.
    pub fn emit(&self, content: impl Into<String>) -> usize {
        self.bus
            .publish(&AgentEvent::stream(self.agent_id.clone(), content))
    }

    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

/// Trait for agent backends.
///
/// Implement this to plug a custom agent into the runner. Backends stream
/// through the sink and return the final result; the runner publishes the
/// terminal event.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn run(&self, request: BackendRequest<'_>, output: &OutputSink)
    -> Result<Value, EngineError>;
}
