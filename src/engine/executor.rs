//! Executor base - the common lifecycle wrapped around every strategy.
//!
//! All agent kinds share one template method: emit the raw inputs,
//! resolve them (possibly spawning child tasks), surface any outputs the
//! inputs already satisfy, check the cache, delegate to the
//! kind-specific strategy, validate, write back, persist memory-bound
//! outputs, and emit the final chunk pair. Any failure in resolution,
//! the cache path or the strategy propagates to the caller - ordinarily
//! the parent task's strategy - which decides whether to retry.

use serde_json::Value;

use super::cache::{self, CacheEntry};
use super::context::ExecutionContext;
use super::dispatcher::ExecuteOptions;
use super::error::EngineError;
use super::events::{ExecutePhase, ExecutionEvent};
use super::inputs::resolve_inputs;
use super::schema::{self, SchemaMode};
use super::task::ExecutionTask;
use crate::definition::{AgentDefinition, OutputBinding, TEXT_OUTPUT};
use crate::memory::MemoryKey;
use crate::strategies::Strategy;
use crate::JsonMap;

pub(crate) async fn run_lifecycle(
    ctx: &ExecutionContext,
    definition: &AgentDefinition,
    strategy: &dyn Strategy,
    options: ExecuteOptions,
) -> Result<JsonMap, EngineError> {
    let task = ExecutionTask {
        id: ctx.ids.next_id(),
        parent: options.parent.as_ref().map(|p| p.task_id.clone()),
        agent_id: definition.id.clone(),
        depth: options.parent.as_ref().map(|p| p.depth + 1).unwrap_or(0),
    };

    ctx.events.emit(ExecutionEvent::Input {
        task_id: task.id.clone(),
        agent_id: definition.id.clone(),
        inputs: Value::Object(options.inputs.clone()),
    });

    let resolved = resolve_inputs(ctx, definition, &task, &options.inputs, &options.variables).await?;

    // Outputs already satisfied by input bindings surface before the
    // strategy runs.
    let early = outputs_from_inputs(definition, &resolved);
    if !early.is_empty() {
        ctx.events.emit(ExecutionEvent::Chunk {
            task_id: task.id.clone(),
            agent_id: definition.id.clone(),
            delta: Value::Object(early.clone()),
        });
    }

    ctx.events.emit(ExecutionEvent::Execute {
        task_id: task.id.clone(),
        agent_id: definition.id.clone(),
        phase: ExecutePhase::Running,
    });

    let project = definition.project_id().map(str::to_string);
    let cache_enabled = definition.cache_enabled() && project.is_some();
    let cache_key = cache_enabled.then(|| cache::cache_key(definition, &resolved));

    let mut outputs: Option<JsonMap> = None;
    if let (Some(project), Some(key)) = (project.as_deref(), cache_key.as_deref()) {
        outputs = cached_outputs(ctx, definition, &task, project, key).await;
    }

    let outputs = match outputs {
        Some(outputs) => outputs,
        None => {
            let raw = strategy.process(ctx, definition, &task, &resolved).await?;
            let mut merged = early;
            match raw {
                Value::Object(map) => merged.extend(map),
                other => {
                    merged.insert("result".to_string(), other);
                }
            }
            schema::validate_outputs(definition, &Value::Object(merged.clone()), SchemaMode::Full)?;

            if let (Some(project), Some(key)) = (project.as_deref(), cache_key.as_deref()) {
                // Hidden inputs stay out of the persisted snapshot.
                let entry = CacheEntry {
                    inputs: Value::Object(cache::visible_inputs(definition, &resolved)),
                    outputs: Value::Object(merged.clone()),
                };
                if let Err(e) = ctx.cache.set(project, key, entry).await {
                    tracing::warn!(agent = %definition.id, error = %e, "cache write failed");
                }
            }
            merged
        }
    };

    if let Err(e) = post_process(ctx, definition, &outputs).await {
        ctx.events.emit(ExecutionEvent::Execute {
            task_id: task.id.clone(),
            agent_id: definition.id.clone(),
            phase: ExecutePhase::End,
        });
        return Err(e);
    }

    ctx.events.emit(ExecutionEvent::Chunk {
        task_id: task.id.clone(),
        agent_id: definition.id.clone(),
        delta: Value::Object(outputs.clone()),
    });
    if let Some(parent) = &task.parent {
        // A parent observing only its own task id still sees nested
        // results, as text.
        let serialized = serde_json::to_string(&Value::Object(outputs.clone()))
            .map_err(|e| EngineError::Other(e.into()))?;
        ctx.events.emit(ExecutionEvent::Chunk {
            task_id: parent.clone(),
            agent_id: definition.id.clone(),
            delta: Value::String(serialized),
        });
    }
    ctx.events.emit(ExecutionEvent::Execute {
        task_id: task.id.clone(),
        agent_id: definition.id.clone(),
        phase: ExecutePhase::End,
    });

    Ok(outputs)
}

/// Look up and re-validate a cache entry. Read failures and stale
/// entries degrade to a miss; a hit re-emits the cached text chunk so
/// hits are indistinguishable from live runs.
async fn cached_outputs(
    ctx: &ExecutionContext,
    definition: &AgentDefinition,
    task: &ExecutionTask,
    project: &str,
    key: &str,
) -> Option<JsonMap> {
    let entry = match ctx.cache.get(project, key).await {
        Ok(entry) => entry?,
        Err(e) => {
            tracing::warn!(agent = %definition.id, error = %e, "cache read failed");
            return None;
        }
    };
    if schema::validate_outputs(definition, &entry.outputs, SchemaMode::Full).is_err() {
        tracing::debug!(agent = %definition.id, "cache entry stale against current schema");
        return None;
    }
    let outputs = entry.outputs.as_object()?.clone();
    if let Some(Value::String(text)) = outputs.get(TEXT_OUTPUT) {
        ctx.events.emit(ExecutionEvent::Chunk {
            task_id: task.id.clone(),
            agent_id: definition.id.clone(),
            delta: serde_json::json!({ TEXT_OUTPUT: text }),
        });
    }
    tracing::debug!(agent = %definition.id, "cache hit");
    Some(outputs)
}

/// Declared outputs directly satisfied by input bindings, filtered to
/// those already complete under the partial schema.
fn outputs_from_inputs(definition: &AgentDefinition, resolved: &JsonMap) -> JsonMap {
    let mut candidate = JsonMap::new();
    for output in &definition.outputs {
        if let Some(OutputBinding::Input { key }) = &output.from {
            if let Some(value) = resolved.get(key) {
                candidate.insert(output.name.clone(), value.clone());
            }
        }
    }
    schema::complete_outputs(&definition.outputs, &candidate)
}

/// Persist every memory-bound output variable, honoring the per-variable
/// reset flag.
async fn post_process(
    ctx: &ExecutionContext,
    definition: &AgentDefinition,
    outputs: &JsonMap,
) -> Result<(), EngineError> {
    for output in &definition.outputs {
        let Some(binding) = &output.memory else {
            continue;
        };
        let Some(value) = outputs.get(&output.name) else {
            continue;
        };
        let key = MemoryKey {
            project_id: definition.project_id().map(str::to_string),
            session_id: ctx.session.session_id.clone(),
            agent_id: definition.id.clone(),
            key: binding.key.clone(),
            scope: binding.scope,
        };
        ctx.memory
            .write(&key, value.clone(), binding.reset)
            .await
            .map_err(EngineError::Other)?;
    }
    Ok(())
}
