//! In-process task execution engine.
//!
//! Provides:
//! - `AgentRunner` - Registry of loaded agents, implements `TaskEngine`
//! - `AgentDefinition` - YAML agent definitions
//! - Backends (`echo`, `command`, and app-registered plugins)
//! - Command building utilities

pub mod backend;
pub mod command;
pub mod definition;
pub mod runner;

pub use backend::{AgentBackend, BackendRequest, OutputSink};
pub use command::{CommandBuilder, CommandParts};
pub use definition::{AgentDefinition, BackendConfig};
pub use runner::AgentRunner;
