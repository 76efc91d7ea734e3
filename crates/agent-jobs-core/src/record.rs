//! Execution records and status transitions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::traits::StoreError;

/// Execution identifier, `"{kind}_{uuid}"`.
pub type ExecutionId = String;

/// Build a fresh execution id within the `kind` namespace.
#[must_use]
pub fn new_execution_id(kind: &str) -> ExecutionId {
    format!("{kind}_{}", Uuid::new_v4())
}

/// Execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Record allocated, work not started.
    Pending,
    /// Work in progress.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
}

impl ExecutionStatus {
    /// Whether no further writes are accepted.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Statuses only move forward; `running -> running` is allowed for stage updates.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Description of the request that created an execution. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    /// Agent definition to load, relative to the agents directory.
    pub config_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    /// Free-form input, used when no task text is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

impl ExecutionMetadata {
    /// The text handed to the agent: `task`, else `input`, else empty.
    #[must_use]
    pub fn task_text(&self) -> String {
        if let Some(task) = self.task.as_deref().filter(|t| !t.is_empty()) {
            return task.to_string();
        }
        match &self.input {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}

/// Persisted execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub kind: String,
    pub metadata: ExecutionMetadata,
    pub status: ExecutionStatus,
    /// Last reported progress in `[0.0, 1.0]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Create a `pending` record expiring `ttl` after `now`.
    #[must_use]
    pub fn new(
        id: ExecutionId,
        kind: impl Into<String>,
        metadata: ExecutionMetadata,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            id,
            kind: kind.into(),
            metadata,
            status: ExecutionStatus::Pending,
            progress: None,
            stage: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Apply a partial status update.
    ///
    /// # Errors
    /// Rejects writes to terminal records, backwards transitions, and
    /// result/error payloads that do not match the target status.
    pub fn apply(&mut self, update: StatusUpdate, now: DateTime<Utc>) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            return Err(StoreError::AlreadyTerminal(self.id.clone()));
        }
        if !self.status.can_advance_to(update.status) {
            return Err(StoreError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: update.status,
            });
        }
        if update.result.is_some() && update.status != ExecutionStatus::Completed {
            return Err(StoreError::InvalidUpdate(format!(
                "result is only accepted with status completed, got {}",
                update.status
            )));
        }
        if update.error.is_some() && update.status != ExecutionStatus::Failed {
            return Err(StoreError::InvalidUpdate(format!(
                "error is only accepted with status failed, got {}",
                update.status
            )));
        }
        if let Some(progress) = update.progress {
            if !progress.is_finite() {
                return Err(StoreError::InvalidUpdate(format!("progress {progress} is not finite")));
            }
            self.progress = Some(progress.clamp(0.0, 1.0));
        }

        self.status = update.status;
        if update.stage.is_some() {
            self.stage = update.stage;
        }
        if update.result.is_some() {
            self.result = update.result;
        }
        if update.error.is_some() {
            self.error = update.error;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Stored result view, present only for completed records.
    #[must_use]
    pub fn completed_result(&self) -> Option<ExecutionResult> {
        if self.status != ExecutionStatus::Completed {
            return None;
        }
        Some(ExecutionResult {
            execution_id: self.id.clone(),
            result: self.result.clone().unwrap_or(Value::Null),
            completed_at: self.updated_at,
        })
    }
}

/// Partial update of an execution record.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: ExecutionStatus,
    pub progress: Option<f64>,
    pub stage: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl StatusUpdate {
    /// Bare status change.
    #[must_use]
    pub const fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            progress: None,
            stage: None,
            result: None,
            error: None,
        }
    }

    #[must_use]
    pub fn running(stage: impl Into<String>, progress: f64) -> Self {
        Self::new(ExecutionStatus::Running)
            .with_stage(stage)
            .with_progress(progress)
    }

    #[must_use]
    pub fn completed(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::new(ExecutionStatus::Completed)
                .with_stage("completed")
                .with_progress(1.0)
        }
    }

    /// Failure leaves progress at its last reported value.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(ExecutionStatus::Failed).with_stage("failed")
        }
    }

    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    #[must_use]
    pub const fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Result of a completed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub result: Value,
    pub completed_at: DateTime<Utc>,
}
