use std::time::Duration;

use agent_jobs_core::EngineError;
use async_trait::async_trait;
use serde_json::Value;

use super::{AgentBackend, BackendRequest, OutputSink};
use crate::BackendConfig;

/// Streams the task back one word at a time.
#[derive(Debug, Default, Clone)]
pub struct EchoBackend;

#[async_trait]
impl AgentBackend for EchoBackend {
    async fn run(
        &self,
        request: BackendRequest<'_>,
        output: &OutputSink,
    ) -> Result<Value, EngineError> {
        let (delay_ms, prefix) = match &request.definition.backend {
            BackendConfig::Echo { delay_ms, prefix } => (*delay_ms, prefix.as_deref()),
            other => {
                return Err(EngineError::Internal(format!(
                    "echo backend cannot run a {} definition",
                    other.type_name()
                )));
            }
        };

        let mut first = true;
        if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
            output.emit(prefix);
            first = false;
        }
        for chunk in request.task.split_inclusive(' ') {
            if !first && delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            output.emit(chunk);
            first = false;
        }

        Ok(Value::String(format!(
            "{}{}",
            prefix.unwrap_or_default(),
            request.task
        )))
    }
}
