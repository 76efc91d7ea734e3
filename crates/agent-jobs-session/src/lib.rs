//! Execution orchestration and record storage for agent jobs.
//!
//! Provides:
//! - `ExecutionOrchestrator` - Submit executions and drive them to a terminal state
//! - Storage implementations (memory)

pub mod orchestrator;
pub mod storage;

pub use orchestrator::{
    AGENT_KIND, DEFAULT_TTL, ExecuteOptions, ExecuteRequest, ExecutionOrchestrator,
    OrchestratorError,
};
