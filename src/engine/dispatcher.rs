//! Strategy dispatch and identity inheritance.
//!
//! The dispatcher is the engine's single public operation: it selects
//! the strategy for an agent's kind (an exhaustive match over the closed
//! sum - adding a kind is a compile-time-checked change), inherits
//! identity down the call tree, enforces the recursion depth guard, and
//! special-cases the loop-exit directive as a graceful result.

use async_recursion::async_recursion;

use super::context::ExecutionContext;
use super::error::EngineError;
use super::executor::run_lifecycle;
use super::task::{ExecutionTask, TaskId};
use crate::definition::{AgentDefinition, AgentKind, Identity};
use crate::strategies::{
    CallAgentStrategy, ExternalPlatformStrategy, FunctionStrategy, HttpApiStrategy,
    ImageCompositorStrategy, ImageStrategy, LlmStrategy, ParallelCallStrategy,
    ProtocolClientStrategy, RouterStrategy, Strategy,
};
use crate::JsonMap;

/// Where an invocation hangs in the call tree.
#[derive(Debug, Clone)]
pub struct ParentLink {
    pub task_id: TaskId,
    /// The invoking definition's identity, inherited by the child.
    pub identity: Option<Identity>,
    pub depth: u32,
}

impl ParentLink {
    /// Link a child under `task`, inheriting `definition`'s identity.
    pub fn of(task: &ExecutionTask, definition: &AgentDefinition) -> Self {
        Self {
            task_id: task.id.clone(),
            identity: definition.identity.clone(),
            depth: task.depth,
        }
    }
}

/// Per-invocation options for [`Dispatcher::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Raw caller-supplied inputs.
    pub inputs: JsonMap,
    /// Variable scope visible to input templates (sibling outputs plus
    /// caller inputs).
    pub variables: JsonMap,
    /// Present for every non-root invocation.
    pub parent: Option<ParentLink>,
}

/// Executes agent definitions against one execution context.
pub struct Dispatcher {
    ctx: ExecutionContext,
}

impl Dispatcher {
    pub fn new(ctx: ExecutionContext) -> Self {
        Self { ctx }
    }

    /// Execute an agent and return its validated outputs. Events stream
    /// to the context's sink while the call tree runs.
    #[async_recursion]
    pub async fn execute(
        &self,
        definition: &AgentDefinition,
        options: ExecuteOptions,
    ) -> Result<JsonMap, EngineError> {
        let mut definition = definition.clone();
        if let Some(parent) = &options.parent {
            if parent.depth + 1 > self.ctx.max_depth {
                return Err(EngineError::DepthExceeded(self.ctx.max_depth));
            }
            // A sub-agent referenced without a fully-qualified identity
            // resolves relative to its invoking project.
            if let Some(parent_identity) = &parent.identity {
                definition
                    .identity
                    .get_or_insert_with(Identity::default)
                    .inherit_from(parent_identity);
            }
        }

        tracing::debug!(
            agent = %definition.id,
            kind = definition.kind.name(),
            "dispatching agent"
        );
        let strategy = strategy_for(&definition.kind);
        match run_lifecycle(&self.ctx, &definition, strategy.as_ref(), options).await {
            // The exit directive unwinds a router's tool loop; at the
            // router boundary it is a graceful result, not a failure.
            // From any other kind it keeps propagating toward one.
            Err(EngineError::ExitDirective(value))
                if matches!(definition.kind, AgentKind::Router { .. }) =>
            {
                Ok(value.as_object().cloned().unwrap_or_default())
            }
            other => other,
        }
    }
}

/// Pure function of the agent kind; the sum type is closed, so this
/// match is exhaustive by construction.
fn strategy_for(kind: &AgentKind) -> Box<dyn Strategy> {
    match kind {
        AgentKind::LlmPrompt { .. } => Box::new(LlmStrategy),
        AgentKind::Router { .. } => Box::new(RouterStrategy),
        AgentKind::Function { .. } => Box::new(FunctionStrategy),
        AgentKind::HttpApi { .. } => Box::new(HttpApiStrategy),
        AgentKind::Image { .. } => Box::new(ImageStrategy),
        AgentKind::CallAgent { .. } => Box::new(CallAgentStrategy),
        AgentKind::ParallelCall { .. } => Box::new(ParallelCallStrategy),
        AgentKind::ExternalPlatform { .. } => Box::new(ExternalPlatformStrategy),
        AgentKind::ProtocolClient { .. } => Box::new(ProtocolClientStrategy),
        AgentKind::ImageCompositor { .. } => Box::new(ImageCompositorStrategy),
    }
}
