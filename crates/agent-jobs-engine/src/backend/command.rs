use std::{process::Stdio, time::Duration};

use agent_jobs_core::EngineError;
use async_trait::async_trait;
use command_group::AsyncCommandGroup;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::Command,
};

use super::{AgentBackend, BackendRequest, OutputSink};
use crate::{BackendConfig, CommandBuilder};

/// Maximum stderr kept for error messages.
const STDERR_TAIL_BYTES: usize = 2048;

/// Runs the agent as a child process group.
///
/// The task is written to stdin and the context is exported as JSON in
/// `AGENT_CONTEXT`. Each stdout line becomes one stream chunk; the full
/// stdout is the result.
#[derive(Debug, Default, Clone)]
pub struct CommandBackend;

#[async_trait]
impl AgentBackend for CommandBackend {
    async fn run(
        &self,
        request: BackendRequest<'_>,
        output: &OutputSink,
    ) -> Result<Value, EngineError> {
        let BackendConfig::Command {
            command,
            args,
            timeout_secs,
        } = &request.definition.backend
        else {
            return Err(EngineError::Internal(format!(
                "command backend cannot run a {} definition",
                request.definition.backend.type_name()
            )));
        };

        let (program, args) = CommandBuilder::new(command.clone())
            .params(args.iter().cloned())
            .build()
            .map_err(|e| EngineError::Definition(e.to_string()))?
            .into_resolved()
            .await
            .map_err(|e| EngineError::Definition(e.to_string()))?;

        let context = serde_json::to_string(request.context)
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .env("AGENT_ID", output.agent_id())
            .env("AGENT_CONTEXT", context)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.group_spawn()?;
        tracing::debug!(agent_id = output.agent_id(), program = %program.display(), "spawned agent process");

        let stdin = child.inner().stdin.take();
        let stdout = child
            .inner()
            .stdout
            .take()
            .ok_or_else(|| EngineError::Internal("child stdout not captured".into()))?;
        let stderr = child.inner().stderr.take();

        if let Some(mut stdin) = stdin {
            let task = request.task.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(task.as_bytes()).await {
                    tracing::warn!("Failed to write task to agent stdin: {e}");
                }
            });
        }

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            buf
        });

        let run = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut collected = String::new();
            while let Some(line) = lines.next_line().await? {
                let chunk = format!("{line}\n");
                output.emit(chunk.as_str());
                collected.push_str(&chunk);
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, collected))
        };

        let outcome = match timeout_secs {
            Some(secs) => {
                let timed = tokio::time::timeout(Duration::from_secs(*secs), run).await;
                if let Ok(outcome) = timed {
                    outcome
                } else {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    stderr_task.abort();
                    return Err(EngineError::TaskFailed(format!(
                        "agent process timed out after {secs}s"
                    )));
                }
            }
            None => run.await,
        };
        let (status, collected) = outcome?;
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(Value::String(collected))
        } else {
            let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
            let tail = String::from_utf8_lossy(&stderr[start..]);
            Err(EngineError::TaskFailed(format!(
                "agent process exited with {status}: {}",
                tail.trim()
            )))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;

    use agent_jobs_core::{EventBus, EventKind, TaskContext};

    use super::*;
    use crate::AgentDefinition;

    async fn run(yaml: &str, task: &str) -> (Result<Value, EngineError>, usize) {
        let bus = Arc::new(EventBus::new());
        let mut events = bus.subscribe_all(&[EventKind::Stream]);
        let def = AgentDefinition::from_yaml(yaml).unwrap();
        let ctx = TaskContext::new();
        let result = CommandBackend
            .run(
                BackendRequest {
                    definition: &def,
                    task,
                    context: &ctx,
                },
                &OutputSink::new(def.id.clone(), Arc::clone(&bus)),
            )
            .await;
        let chunks = std::iter::from_fn(|| events.try_recv()).count();
        (result, chunks)
    }

    #[tokio::test]
    async fn test_stdout_lines_are_streamed() {
        let (result, chunks) = run(
            "id: upper\nbackend:\n  type: command\n  command: tr a-z A-Z\n",
            "one\ntwo\n",
        )
        .await;
        assert_eq!(result.unwrap(), Value::from("ONE\nTWO\n"));
        assert_eq!(chunks, 2);
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let (result, _) = run(
            "id: bad\nbackend:\n  type: command\n  command: sh\n  args: ['-c', 'echo nope >&2; exit 3']\n",
            "",
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, EngineError::TaskFailed(ref msg) if msg.contains("nope")));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let (result, _) = run(
            "id: slow\nbackend:\n  type: command\n  command: sleep 5\n  timeout_secs: 1\n",
            "",
        )
        .await;
        assert!(matches!(result, Err(EngineError::TaskFailed(ref msg)) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_missing_executable_is_a_definition_error() {
        let (result, _) = run(
            "id: ghost\nbackend:\n  type: command\n  command: definitely-not-a-real-binary-42\n",
            "",
        )
        .await;
        assert!(matches!(result, Err(EngineError::Definition(_))));
    }
}
