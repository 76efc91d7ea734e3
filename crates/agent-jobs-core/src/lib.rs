//! Core abstractions for agent execution jobs.
//!
//! This crate provides the fundamental building blocks:
//! - `ExecutionRecord` - Pollable record of one execution
//! - `EventBus` - Publish/subscribe bus for agent lifecycle events
//! - `TaskContext` - Free-form context handed to an agent task
//! - Store and engine traits

pub mod context;
pub mod events;
pub mod record;
pub mod traits;

pub use context::TaskContext;
pub use events::{AgentEvent, AgentEventPayload, EventBus, EventKind, SubscriptionId, SubscriptionSet};
pub use record::{
    ExecutionId, ExecutionMetadata, ExecutionRecord, ExecutionResult, ExecutionStatus, StatusUpdate,
    new_execution_id,
};
pub use traits::{AgentId, AgentState, AgentStatus, EngineError, ExecutionStore, StoreError, TaskEngine};
