//! Execution strategies - one per agent kind.
//!
//! A strategy implements the kind-specific work inside the executor
//! base's lifecycle: it receives the resolved inputs and returns the raw
//! output value, which the lifecycle then validates, caches and emits.

mod call_agent;
mod external;
mod http_api;
mod image;
mod llm;
mod logic;
mod protocol;
mod router;

pub use call_agent::{CallAgentStrategy, ParallelCallStrategy};
pub use external::ExternalPlatformStrategy;
pub use http_api::HttpApiStrategy;
pub use image::{ImageCompositorStrategy, ImageStrategy};
pub use llm::LlmStrategy;
pub use logic::FunctionStrategy;
pub use protocol::ProtocolClientStrategy;
pub use router::RouterStrategy;

use async_trait::async_trait;
use serde_json::Value;

use crate::definition::{AgentDefinition, MessageTemplate};
use crate::engine::context::ExecutionContext;
use crate::engine::error::EngineError;
use crate::engine::task::ExecutionTask;
use crate::llm::ChatMessage;
use crate::template;
use crate::JsonMap;

/// Kind-specific execution logic invoked by the executor base.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Produce the agent's raw output value from its resolved inputs.
    async fn process(
        &self,
        ctx: &ExecutionContext,
        definition: &AgentDefinition,
        task: &ExecutionTask,
        inputs: &JsonMap,
    ) -> Result<Value, EngineError>;
}

/// The dispatcher matched a different kind than the strategy handles.
/// Unreachable through [`Dispatcher`](crate::engine::dispatcher::Dispatcher);
/// kept as a defensive config error for direct strategy use.
fn kind_mismatch(definition: &AgentDefinition, expected: &str) -> EngineError {
    EngineError::Config(format!(
        "agent '{}' has kind '{}', expected '{}'",
        definition.id,
        definition.kind.name(),
        expected
    ))
}

/// Render role-tagged message templates against the resolved inputs.
/// Comment lines (starting with `//`) are stripped before rendering.
fn render_messages(
    templates: &[MessageTemplate],
    variables: &JsonMap,
) -> Result<Vec<ChatMessage>, EngineError> {
    templates
        .iter()
        .map(|message| {
            let stripped: String = message
                .template
                .lines()
                .filter(|line| !line.trim_start().starts_with("//"))
                .collect::<Vec<_>>()
                .join("\n");
            let rendered = template::render_str(&stripped, variables)?;
            Ok(ChatMessage::new(message.role, rendered))
        })
        .collect()
}
