//! Protocol-client strategy.
//!
//! Lazily establishes (and caches, per target platform, for the
//! lifetime of the execution context) a protocol client connection,
//! then performs one of: invoke a tool, fetch a prompt (rendered through
//! a single model call with no streaming to the caller), or read a
//! resource.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{kind_mismatch, Strategy};
use crate::definition::{AgentDefinition, AgentKind, ProtocolAction, TEXT_OUTPUT};
use crate::engine::context::ExecutionContext;
use crate::engine::error::EngineError;
use crate::engine::task::ExecutionTask;
use crate::llm::ChatRequest;
use crate::template;
use crate::JsonMap;

pub struct ProtocolClientStrategy;

#[async_trait]
impl Strategy for ProtocolClientStrategy {
    async fn process(
        &self,
        ctx: &ExecutionContext,
        definition: &AgentDefinition,
        _task: &ExecutionTask,
        inputs: &JsonMap,
    ) -> Result<Value, EngineError> {
        let AgentKind::ProtocolClient { platform_id, action } = &definition.kind else {
            return Err(kind_mismatch(definition, "protocol-client"));
        };

        let client = ctx
            .protocols
            .client(platform_id)
            .await
            .map_err(|e| EngineError::upstream(None, e.to_string()))?;

        match action {
            ProtocolAction::Tool { name } => client
                .invoke_tool(name, Value::Object(inputs.clone()))
                .await
                .map_err(|e| EngineError::upstream(None, e.to_string())),

            ProtocolAction::Prompt { name } => {
                let messages = client
                    .fetch_prompt(name, Value::Object(inputs.clone()))
                    .await
                    .map_err(|e| EngineError::upstream(None, e.to_string()))?;
                let model = definition.model.as_ref().ok_or_else(|| {
                    EngineError::Config(format!(
                        "protocol-client agent '{}' fetches a prompt but has no model",
                        definition.id
                    ))
                })?;
                let mut request = ChatRequest::new(model.name.clone(), messages);
                request.options = definition.chat_options();
                let response = ctx
                    .llm
                    .chat(request)
                    .await
                    .map_err(|e| EngineError::upstream(None, e.to_string()))?;
                Ok(json!({ TEXT_OUTPUT: response.content.unwrap_or_default() }))
            }

            ProtocolAction::Resource { uri } => {
                let rendered = template::render_str(uri, inputs)?;
                client
                    .read_resource(&rendered)
                    .await
                    .map_err(|e| EngineError::upstream(None, e.to_string()))
            }
        }
    }
}
