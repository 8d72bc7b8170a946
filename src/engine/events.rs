//! Execution events and the event sink boundary.
//!
//! The engine streams progress continuously while a call tree runs:
//! raw inputs, lifecycle phases, output chunks, usage accounting and
//! sandbox log lines. Events are ordered per task id and consumed by an
//! external sink (the host's UI or transport layer); the engine never
//! persists them, and a full or closed sink never aborts execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::task::TaskId;
use crate::llm::TokenUsage;

/// Lifecycle phase carried by EXECUTE events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutePhase {
    Running,
    End,
}

/// One progress event of a running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ExecutionEvent {
    /// Raw caller-supplied inputs, emitted before resolution.
    Input {
        task_id: TaskId,
        agent_id: String,
        inputs: Value,
    },
    /// Lifecycle phase transition.
    Execute {
        task_id: TaskId,
        agent_id: String,
        phase: ExecutePhase,
    },
    /// A partial or complete output delta, in generation order.
    Chunk {
        task_id: TaskId,
        agent_id: String,
        delta: Value,
    },
    /// Token usage reported by a model backend.
    Usage {
        task_id: TaskId,
        agent_id: String,
        usage: TokenUsage,
    },
    /// A log line from sandboxed agent code.
    Log {
        task_id: TaskId,
        agent_id: String,
        message: String,
    },
}

impl ExecutionEvent {
    /// The task this event belongs to.
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Input { task_id, .. }
            | Self::Execute { task_id, .. }
            | Self::Chunk { task_id, .. }
            | Self::Usage { task_id, .. }
            | Self::Log { task_id, .. } => task_id,
        }
    }
}

/// External consumer of execution events.
///
/// Implementations must preserve per-task ordering; the engine calls
/// `emit` synchronously in generation order.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ExecutionEvent);
}

/// Sink that forwards events into an unbounded channel. A closed
/// receiver drops events silently rather than failing the task.
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }
}

/// Sink that discards everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ExecutionEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::task::TaskIdGenerator;

    #[test]
    fn channel_sink_preserves_order() {
        let ids = TaskIdGenerator::new();
        let task_id = ids.next_id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ChannelSink::new(tx);

        for phase in [ExecutePhase::Running, ExecutePhase::End] {
            sink.emit(ExecutionEvent::Execute {
                task_id: task_id.clone(),
                agent_id: "a".into(),
                phase,
            });
        }

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(matches!(
            first,
            ExecutionEvent::Execute { phase: ExecutePhase::Running, .. }
        ));
        assert!(matches!(
            second,
            ExecutionEvent::Execute { phase: ExecutePhase::End, .. }
        ));
    }

    #[test]
    fn closed_receiver_does_not_panic() {
        let ids = TaskIdGenerator::new();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = ChannelSink::new(tx);
        sink.emit(ExecutionEvent::Log {
            task_id: ids.next_id(),
            agent_id: "a".into(),
            message: "dropped".into(),
        });
    }
}
