//! Call-agent and parallel-call strategies.
//!
//! Call-agent runs a fixed ordered list of sub-agents sequentially,
//! threading each result into the variable scope available to
//! subsequent sub-agents under the step's function name, then assembles
//! the output object from the declared output bindings (including
//! nested-property extraction). Parallel-call fans the sub-agents out
//! concurrently - no ordering dependency, no concurrency cap - and
//! returns their raw results in declaration order.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{kind_mismatch, Strategy};
use crate::definition::{AgentDefinition, AgentKind, OutputBinding, SubCall, RESULTS_OUTPUT};
use crate::engine::context::ExecutionContext;
use crate::engine::error::EngineError;
use crate::engine::inputs::run_child;
use crate::engine::task::ExecutionTask;
use crate::template;
use crate::JsonMap;

pub struct CallAgentStrategy;

/// Render a step's configured inputs over the current scope.
fn step_inputs(call: &SubCall, scope: &JsonMap) -> Result<JsonMap, EngineError> {
    match template::render_leaves(&Value::Object(call.inputs.clone()), scope)? {
        Value::Object(map) => Ok(map),
        _ => Ok(JsonMap::new()),
    }
}

/// Walk a nested property path into a value.
fn pick_path<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}

#[async_trait]
impl Strategy for CallAgentStrategy {
    async fn process(
        &self,
        ctx: &ExecutionContext,
        definition: &AgentDefinition,
        task: &ExecutionTask,
        inputs: &JsonMap,
    ) -> Result<Value, EngineError> {
        let AgentKind::CallAgent { calls } = &definition.kind else {
            return Err(kind_mismatch(definition, "call-agent"));
        };
        if calls.is_empty() {
            return Err(EngineError::Config(format!(
                "call-agent '{}' has no sub-agents configured",
                definition.id
            )));
        }

        let mut scope = inputs.clone();
        let mut results = JsonMap::new();
        for call in calls {
            let step = step_inputs(call, &scope)?;
            let result = run_child(ctx, definition, task, &call.agent, step).await?;
            let value = Value::Object(result);
            scope.insert(call.name.clone(), value.clone());
            results.insert(call.name.clone(), value);
        }

        // Without declared bindings the composition's raw results are
        // the output, keyed by function name.
        if definition.outputs.is_empty() {
            return Ok(Value::Object(results));
        }

        let mut outputs = JsonMap::new();
        for output in &definition.outputs {
            let Some(OutputBinding::AgentOutput { call, path }) = &output.from else {
                continue;
            };
            let Some(result) = results.get(call) else {
                return Err(EngineError::Config(format!(
                    "output '{}' of agent '{}' references unknown sub-agent '{}'",
                    output.name, definition.id, call
                )));
            };
            if let Some(picked) = pick_path(result, path) {
                outputs.insert(output.name.clone(), picked.clone());
            }
        }
        Ok(Value::Object(outputs))
    }
}

pub struct ParallelCallStrategy;

#[async_trait]
impl Strategy for ParallelCallStrategy {
    async fn process(
        &self,
        ctx: &ExecutionContext,
        definition: &AgentDefinition,
        task: &ExecutionTask,
        inputs: &JsonMap,
    ) -> Result<Value, EngineError> {
        let AgentKind::ParallelCall { calls } = &definition.kind else {
            return Err(kind_mismatch(definition, "parallel-call"));
        };
        if calls.is_empty() {
            return Err(EngineError::Config(format!(
                "parallel-call '{}' has no sub-agents configured",
                definition.id
            )));
        }

        let mut pending = Vec::with_capacity(calls.len());
        for call in calls {
            let step = step_inputs(call, inputs)?;
            pending.push(async move {
                run_child(ctx, definition, task, &call.agent, step)
                    .await
                    .map(Value::Object)
            });
        }
        let results = futures::future::try_join_all(pending).await?;
        Ok(json!({ RESULTS_OUTPUT: results }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_path_walks_nested_objects() {
        let value = json!({"a": {"b": {"c": 42}}});
        assert_eq!(
            pick_path(&value, &["a".into(), "b".into(), "c".into()]),
            Some(&json!(42))
        );
        assert_eq!(pick_path(&value, &["a".into(), "missing".into()]), None);
        assert_eq!(pick_path(&value, &[]), Some(&value));
    }

    #[test]
    fn step_inputs_render_against_the_scope() {
        let call = SubCall {
            name: "b".into(),
            agent: crate::definition::AgentSelection::by_id("b"),
            inputs: json!({"text": "{{a}}", "fixed": 1})
                .as_object()
                .unwrap()
                .clone(),
        };
        let scope: JsonMap = [("a".to_string(), json!({"value": "hello"}))]
            .into_iter()
            .collect();
        let rendered = step_inputs(&call, &scope).unwrap();
        assert_eq!(rendered.get("text"), Some(&json!({"value": "hello"})));
        assert_eq!(rendered.get("fixed"), Some(&json!(1)));
    }
}
