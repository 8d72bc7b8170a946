//! Task identifiers and the execution call tree.
//!
//! Every strategy invocation runs as an ephemeral task. Task ids are
//! monotonic within a generator (a run-unique UUID prefix plus an atomic
//! counter) and globally unique across generators. The parent/child
//! relation forms the call tree: every non-root task has exactly one
//! parent, created strictly before any of its children.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier correlating one strategy invocation's events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic task id source for one call tree.
#[derive(Debug, Clone)]
pub struct TaskIdGenerator {
    run: Arc<str>,
    counter: Arc<AtomicU64>,
}

impl TaskIdGenerator {
    pub fn new() -> Self {
        Self {
            run: Uuid::new_v4().simple().to_string().into(),
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Next id; strictly increasing within this generator.
    pub fn next_id(&self) -> TaskId {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        TaskId(format!("{}-{:08}", self.run, seq))
    }
}

impl Default for TaskIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Ephemeral state of one strategy invocation. Created when the lifecycle
/// begins, dropped when it returns or throws; never persisted.
#[derive(Debug, Clone)]
pub struct ExecutionTask {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    pub agent_id: String,
    /// Distance from the call-tree root; checked against the context's
    /// depth limit before a child may start.
    pub depth: u32,
}

impl ExecutionTask {
    pub fn root(id: TaskId, agent_id: impl Into<String>) -> Self {
        Self {
            id,
            parent: None,
            agent_id: agent_id.into(),
            depth: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_within_a_generator() {
        let ids = TaskIdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        let c = ids.next_id();
        assert!(a.as_str() < b.as_str());
        assert!(b.as_str() < c.as_str());
    }

    #[test]
    fn ids_are_unique_across_generators() {
        let a = TaskIdGenerator::new().next_id();
        let b = TaskIdGenerator::new().next_id();
        assert_ne!(a, b);
    }

    #[test]
    fn clones_share_the_counter() {
        let ids = TaskIdGenerator::new();
        let clone = ids.clone();
        let a = ids.next_id();
        let b = clone.next_id();
        assert_ne!(a, b);
        assert!(a.as_str() < b.as_str());
    }
}
