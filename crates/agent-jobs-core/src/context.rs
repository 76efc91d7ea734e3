//! Task context passed through to agent executions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form context for a single agent task.
///
/// Serialized as a plain JSON object so request bodies can carry it verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskContext {
    values: HashMap<String, Value>,
}

impl TaskContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context from existing values.
    #[must_use]
    pub fn with_values(values: HashMap<String, Value>) -> Self {
        Self { values }
    }

    /// Get a context value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Set a context value.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_a_plain_object() {
        let mut ctx = TaskContext::new();
        ctx.set("user", Value::from("ada"));

        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json, serde_json::json!({ "user": "ada" }));

        let parsed: TaskContext = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(parsed.is_empty());
    }
}
