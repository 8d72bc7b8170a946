//! Long-term memory collaborator boundary.
//!
//! The engine reads datastore-typed parameters from memory and persists
//! memory-bound output variables back, keyed by project, session, agent,
//! variable key and scope. Storage itself is the host's concern.

use async_trait::async_trait;
use serde_json::Value;

use crate::definition::MemoryScope;

/// Fully-qualified address of a stored value list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryKey {
    pub project_id: Option<String>,
    pub session_id: Option<String>,
    pub agent_id: String,
    pub key: String,
    pub scope: MemoryScope,
}

/// External memory store. A key addresses a list of JSON values;
/// `write` either appends or, with `reset`, replaces the whole list.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn read(&self, key: &MemoryKey) -> anyhow::Result<Vec<Value>>;
    async fn write(&self, key: &MemoryKey, value: Value, reset: bool) -> anyhow::Result<()>;
}
