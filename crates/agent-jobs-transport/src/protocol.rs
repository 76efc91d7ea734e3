//! Relay frames and HTTP request/response bodies.

use agent_jobs_core::{ExecutionId, TaskContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of the end-of-stream frame.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Frame written to a streaming client.
///
/// Every frame except [`RelayFrame::Done`] is sent as a JSON object tagged
/// by `type`; `Done` is the literal sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Relay attached.
    Connected {
        #[serde(rename = "agentId")]
        agent_id: String,
        timestamp: DateTime<Utc>,
    },
    /// Incremental output plus everything received so far.
    Stream {
        content: String,
        accumulated: String,
        timestamp: DateTime<Utc>,
    },
    /// Final result.
    Completed {
        result: Value,
        timestamp: DateTime<Utc>,
    },
    /// Execution failed or was rejected.
    Error {
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// End of stream.
    #[serde(skip)]
    Done,
}

impl RelayFrame {
    #[must_use]
    pub fn connected(agent_id: impl Into<String>) -> Self {
        Self::Connected {
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn stream(content: impl Into<String>, accumulated: impl Into<String>) -> Self {
        Self::Stream {
            content: content.into(),
            accumulated: accumulated.into(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn completed(result: Value) -> Self {
        Self::Completed {
            result,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    /// Frame payload as written after `data: `.
    ///
    /// # Errors
    /// Returns error if the frame cannot be serialized.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Done => Ok(DONE_SENTINEL.to_string()),
            frame => serde_json::to_string(frame),
        }
    }

    /// Server-sent event for this frame.
    #[cfg(feature = "http")]
    #[must_use]
    pub fn to_sse_event(&self) -> axum::response::sse::Event {
        use axum::response::sse::Event;

        match self.encode() {
            Ok(data) => Event::default().data(data),
            Err(e) => {
                tracing::error!("Failed to serialize frame: {e}");
                Event::default().comment("unserializable frame")
            }
        }
    }
}

/// Response of `POST /execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStarted {
    pub execution_id: ExecutionId,
    pub status: String,
}

impl ExecutionStarted {
    #[must_use]
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            status: "started".to_string(),
        }
    }
}

/// Response of `GET /active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveExecutions {
    pub executions: Vec<ExecutionId>,
}

/// Body of `POST /` (load an agent definition).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgentRequest {
    #[serde(default)]
    pub config_path: String,
}

/// Response of `POST /`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCreated {
    pub message: String,
    pub agent_id: String,
}

/// Body of `POST /{agent_id}/execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecuteRequest {
    pub task: String,
    #[serde(default)]
    pub context: Option<TaskContext>,
    #[serde(default)]
    pub stream: bool,
}

/// Non-streaming response of `POST /{agent_id}/execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub result: Value,
}

/// Plain confirmation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Response of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub completed_executions: u64,
    pub active_executions: usize,
}
