//! External-platform strategy.
//!
//! Discovers the target platform's operation catalogue, matches the
//! configured operation id, forwards the resolved parameters and returns
//! the raw response.

use async_trait::async_trait;
use serde_json::Value;

use super::{kind_mismatch, Strategy};
use crate::definition::{AgentDefinition, AgentKind};
use crate::engine::context::ExecutionContext;
use crate::engine::error::EngineError;
use crate::engine::task::ExecutionTask;
use crate::JsonMap;

pub struct ExternalPlatformStrategy;

#[async_trait]
impl Strategy for ExternalPlatformStrategy {
    async fn process(
        &self,
        ctx: &ExecutionContext,
        definition: &AgentDefinition,
        _task: &ExecutionTask,
        inputs: &JsonMap,
    ) -> Result<Value, EngineError> {
        let AgentKind::ExternalPlatform { platform_id, operation_id } = &definition.kind else {
            return Err(kind_mismatch(definition, "external-platform"));
        };

        let operations = ctx
            .platforms
            .operations(platform_id)
            .await
            .map_err(|e| EngineError::upstream(None, e.to_string()))?;
        let operation = operations
            .iter()
            .find(|op| &op.id == operation_id)
            .ok_or_else(|| EngineError::UnknownOperation {
                platform: platform_id.clone(),
                operation: operation_id.clone(),
            })?;

        tracing::debug!(
            agent = %definition.id,
            platform = %platform_id,
            operation = %operation.id,
            "invoking external platform operation"
        );
        ctx.platforms
            .invoke(platform_id, &operation.id, Value::Object(inputs.clone()))
            .await
            .map_err(|e| EngineError::upstream(None, e.to_string()))
    }
}
