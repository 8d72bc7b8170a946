//! Router/decision strategy - the tool-calling loop.
//!
//! The agent's configured routes become callable tools: each route's
//! target (another agent, or a platform operation) contributes a
//! function-style schema derived from the parameters its static
//! configuration leaves unbound. The strategy then loops: call the
//! model with the running conversation and the tool schemas, execute
//! any requested tools as concurrent child tasks, append the assistant
//! tool-call message and each tool's result message, and repeat until
//! the model stops requesting tools or an exit route runs.
//!
//! When the agent declares both a live text output and structured
//! outputs, two loop variants run concurrently: the streamed text pass,
//! and a JSON-constrained pass that starts from an immutable snapshot of
//! the conversation taken after the text pass's first model round - the
//! passes never share a mutable message list.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

use super::llm::plumbing_messages;
use super::{kind_mismatch, render_messages, Strategy};
use crate::definition::{
    AgentDefinition, AgentKind, OutputVariable, Parameter, ParamType, Route, RouteTarget,
    TEXT_OUTPUT,
};
use crate::engine::context::ExecutionContext;
use crate::engine::error::EngineError;
use crate::engine::events::{EventSink, ExecutionEvent};
use crate::engine::inputs::run_child;
use crate::engine::schema::{self, SchemaMode};
use crate::engine::task::{ExecutionTask, TaskId};
use crate::llm::{ChatMessage, ChatRequest, StreamChunk, ToolCall, ToolDefinition};
use crate::platform::PlatformOperation;
use crate::retry::retry;
use crate::JsonMap;

pub struct RouterStrategy;

/// A route with its resolved tool definition.
struct BoundRoute {
    tool: ToolDefinition,
    route: Route,
}

fn tool_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").expect("tool name pattern is a valid regex")
    })
}

#[async_trait]
impl Strategy for RouterStrategy {
    async fn process(
        &self,
        ctx: &ExecutionContext,
        definition: &AgentDefinition,
        task: &ExecutionTask,
        inputs: &JsonMap,
    ) -> Result<Value, EngineError> {
        let AgentKind::Router { messages, routes } = &definition.kind else {
            return Err(kind_mismatch(definition, "router"));
        };
        if routes.is_empty() {
            return Err(EngineError::Config(format!(
                "router agent '{}' has no routes",
                definition.id
            )));
        }
        let model = definition.model.as_ref().ok_or_else(|| {
            EngineError::Config(format!("router agent '{}' has no model", definition.id))
        })?;

        let mut base = render_messages(messages, inputs)?;
        if let Some(plumbed) = plumbing_messages(definition, inputs)? {
            base.extend(plumbed);
        }
        if base.is_empty() {
            return Err(EngineError::Config(format!(
                "router agent '{}' has no prompt",
                definition.id
            )));
        }

        let tools = build_tools(ctx, definition, &model.name, routes).await?;
        let structured: Vec<OutputVariable> = definition.structured_outputs().cloned().collect();
        let wants_text = definition.wants_text_output();

        retry(ctx.retry_budget, EngineError::is_validation, |attempt| {
            let base = base.clone();
            let structured = structured.clone();
            let tools = &tools;
            let model = &model.name;
            async move {
                let forward = attempt == 0;
                let mut outputs = JsonMap::new();

                if structured.is_empty() {
                    let text =
                        run_text_pass(ctx, definition, task, model, tools, base, forward, None)
                            .await?;
                    outputs.insert(TEXT_OUTPUT.to_string(), json!(text));
                } else if !wants_text {
                    let map =
                        run_json_pass(ctx, definition, task, model, tools, &structured, base)
                            .await?;
                    outputs.extend(map);
                } else {
                    let fallback = base.clone();
                    let (snapshot_tx, snapshot_rx) = oneshot::channel();
                    let text_fut = run_text_pass(
                        ctx,
                        definition,
                        task,
                        model,
                        tools,
                        base,
                        forward,
                        Some(snapshot_tx),
                    );
                    let json_fut = async {
                        // Start only after the text pass's first round, so
                        // both passes proceed against a consistent prefix.
                        let snapshot = snapshot_rx.await.unwrap_or(fallback);
                        run_json_pass(ctx, definition, task, model, tools, &structured, snapshot)
                            .await
                    };
                    let (text, map) = futures::future::try_join(text_fut, json_fut).await?;
                    outputs.insert(TEXT_OUTPUT.to_string(), json!(text));
                    outputs.extend(map);
                }

                let value = Value::Object(outputs);
                schema::validate_outputs(definition, &value, SchemaMode::Full)?;
                Ok(value)
            }
        })
        .await
    }
}

/// Streamed loop variant: forwards text deltas (first attempt only) and
/// returns the accumulated live text.
#[allow(clippy::too_many_arguments)]
async fn run_text_pass(
    ctx: &ExecutionContext,
    definition: &AgentDefinition,
    task: &ExecutionTask,
    model: &str,
    tools: &[BoundRoute],
    base: Vec<ChatMessage>,
    forward: bool,
    mut snapshot_tx: Option<oneshot::Sender<Vec<ChatMessage>>>,
) -> Result<String, EngineError> {
    let schemas: Vec<ToolDefinition> = tools.iter().map(|b| b.tool.clone()).collect();
    let mut messages = base;
    let mut live = String::new();

    for round in 0..ctx.max_tool_rounds {
        let mut request = ChatRequest::new(model, messages.clone());
        request.tools = Some(schemas.clone());
        request.tool_choice = Some(json!("auto"));
        request.options = definition.chat_options();

        let mut stream = ctx
            .llm
            .chat_stream(request)
            .await
            .map_err(|e| EngineError::upstream(None, e.to_string()))?;
        let mut saw_delta = false;
        let mut done = None;
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|e| EngineError::upstream(None, e.to_string()))? {
                StreamChunk::Delta(delta) => {
                    saw_delta = true;
                    live.push_str(&delta);
                    if forward {
                        ctx.events.emit(ExecutionEvent::Chunk {
                            task_id: task.id.clone(),
                            agent_id: definition.id.clone(),
                            delta: json!({ TEXT_OUTPUT: delta }),
                        });
                    }
                }
                StreamChunk::Usage(usage) => {
                    ctx.events.emit(ExecutionEvent::Usage {
                        task_id: task.id.clone(),
                        agent_id: definition.id.clone(),
                        usage,
                    });
                }
                StreamChunk::Done(response) => done = Some(response),
            }
        }
        let response = done.ok_or_else(|| {
            EngineError::upstream(None, "model stream ended without a terminal chunk")
        })?;

        let calls = response.tool_calls.clone().unwrap_or_default();
        if calls.is_empty() {
            // Final round: non-streaming backends deliver the text here.
            if !saw_delta {
                if let Some(content) = &response.content {
                    live.push_str(content);
                    if forward && !content.is_empty() {
                        ctx.events.emit(ExecutionEvent::Chunk {
                            task_id: task.id.clone(),
                            agent_id: definition.id.clone(),
                            delta: json!({ TEXT_OUTPUT: content }),
                        });
                    }
                }
            }
            if let Some(tx) = snapshot_tx.take() {
                let _ = tx.send(messages.clone());
            }
            return Ok(live);
        }

        let exit = run_tool_round(
            ctx,
            definition,
            task,
            tools,
            &mut messages,
            response.content,
            calls,
            forward,
        )
        .await?;
        if let Some(tx) = snapshot_tx.take() {
            let _ = tx.send(messages.clone());
        }
        if exit.is_some() {
            return Ok(live);
        }
        tracing::debug!(agent = %definition.id, round, "tool round complete");
    }

    tracing::warn!(
        agent = %definition.id,
        rounds = ctx.max_tool_rounds,
        "tool loop hit the round cap"
    );
    Ok(live)
}

/// Constrained loop variant: final model response must be the output
/// JSON object; nothing streams to the caller.
async fn run_json_pass(
    ctx: &ExecutionContext,
    definition: &AgentDefinition,
    task: &ExecutionTask,
    model: &str,
    tools: &[BoundRoute],
    structured: &[OutputVariable],
    base: Vec<ChatMessage>,
) -> Result<JsonMap, EngineError> {
    let schemas: Vec<ToolDefinition> = tools.iter().map(|b| b.tool.clone()).collect();
    let format = json!({
        "type": "json_schema",
        "json_schema": {
            "name": "outputs",
            "schema": schema::output_schema(structured, SchemaMode::Full),
        },
    });
    let mut messages = base;

    for _round in 0..ctx.max_tool_rounds {
        let mut request = ChatRequest::new(model, messages.clone());
        request.tools = Some(schemas.clone());
        request.tool_choice = Some(json!("auto"));
        request.response_format = Some(format.clone());
        request.options = definition.chat_options();

        let response = ctx
            .llm
            .chat(request)
            .await
            .map_err(|e| EngineError::upstream(None, e.to_string()))?;

        let calls = response.tool_calls.clone().unwrap_or_default();
        if !calls.is_empty() {
            let exit = run_tool_round(
                ctx,
                definition,
                task,
                tools,
                &mut messages,
                response.content,
                calls,
                false,
            )
            .await?;
            if let Some(result) = exit {
                // The exit route's result stands in for the constrained
                // response.
                if let Value::Object(map) = result {
                    return Ok(map);
                }
                break;
            }
            continue;
        }

        let content = response.content.unwrap_or_default();
        let parsed: Value =
            serde_json::from_str(content.trim()).map_err(|e| EngineError::Validation {
                agent: definition.id.clone(),
                detail: format!("constrained response is not valid JSON: {}", e),
            })?;
        return parsed
            .as_object()
            .cloned()
            .ok_or_else(|| EngineError::Validation {
                agent: definition.id.clone(),
                detail: "constrained response is not a JSON object".into(),
            });
    }

    Err(EngineError::Validation {
        agent: definition.id.clone(),
        detail: "tool loop ended without a constrained response".into(),
    })
}

/// Execute one batch of requested tool calls concurrently and append
/// the assistant and tool-result messages. Returns the exit route's
/// result when one ran, ending the loop.
#[allow(clippy::too_many_arguments)]
async fn run_tool_round(
    ctx: &ExecutionContext,
    definition: &AgentDefinition,
    task: &ExecutionTask,
    tools: &[BoundRoute],
    messages: &mut Vec<ChatMessage>,
    content: Option<String>,
    calls: Vec<ToolCall>,
    forward_text: bool,
) -> Result<Option<Value>, EngineError> {
    messages.push(ChatMessage::assistant_tool_calls(content, calls.clone()));

    let pending = calls.iter().map(|call| {
        let bound = tools
            .iter()
            .find(|b| b.tool.function.name == call.function.name);
        async move {
            match bound {
                Some(bound) => {
                    let mirror = forward_text && bound.route.final_text;
                    execute_route(ctx, definition, task, bound, call, mirror)
                        .await
                        .map(|value| (value, bound.route.exit))
                }
                // A hallucinated tool name goes back to the model as an
                // error result rather than failing the branch.
                None => Ok((
                    json!({ "error": format!("unknown tool '{}'", call.function.name) }),
                    false,
                )),
            }
        }
    });
    let results = join_all(pending).await;

    let mut exit = None;
    for (call, result) in calls.iter().zip(results) {
        let (value, route_exit) = result?;
        let serialized =
            serde_json::to_string(&value).map_err(|e| EngineError::Other(e.into()))?;
        messages.push(ChatMessage::tool_result(call.id.clone(), serialized));
        if route_exit && exit.is_none() {
            exit = Some(value);
        }
    }
    Ok(exit)
}

/// Run one requested tool as a child task (or platform invocation).
async fn execute_route(
    ctx: &ExecutionContext,
    definition: &AgentDefinition,
    task: &ExecutionTask,
    bound: &BoundRoute,
    call: &ToolCall,
    mirror: bool,
) -> Result<Value, EngineError> {
    let args: JsonMap = serde_json::from_str(&call.function.arguments).unwrap_or_default();
    let mut inputs = bound.route.bound.clone();
    inputs.extend(args);

    match &bound.route.target {
        RouteTarget::Agent { agent } => {
            // Only the designated final text producer streams into the
            // router's own channel.
            let child_ctx = if mirror {
                ctx.with_event_sink(Arc::new(MirrorSink {
                    inner: Arc::clone(&ctx.events),
                    parent_task: task.id.clone(),
                    parent_agent: definition.id.clone(),
                }))
            } else {
                ctx.clone()
            };
            run_child(&child_ctx, definition, task, agent, inputs)
                .await
                .map(Value::Object)
        }
        RouteTarget::Platform { platform_id, operation_id } => ctx
            .platforms
            .invoke(platform_id, operation_id, Value::Object(inputs))
            .await
            .map_err(|e| EngineError::upstream(None, e.to_string())),
    }
}

/// Build the tool definitions for all routes.
async fn build_tools(
    ctx: &ExecutionContext,
    definition: &AgentDefinition,
    model: &str,
    routes: &[Route],
) -> Result<Vec<BoundRoute>, EngineError> {
    let mut tools = Vec::with_capacity(routes.len());
    for route in routes {
        let name = conforming_tool_name(ctx, definition, model, route).await?;
        let (description, parameters) = match &route.target {
            RouteTarget::Agent { agent } => {
                let qualified = agent.qualified(definition.identity.as_ref());
                let target = ctx.resolve_required(&qualified).await?;
                let description = route
                    .description
                    .clone()
                    .or_else(|| target.description.clone())
                    .unwrap_or_default();
                (description, schema_from_parameters(&target.parameters, &route.bound))
            }
            RouteTarget::Platform { platform_id, operation_id } => {
                let operations = ctx
                    .platforms
                    .operations(platform_id)
                    .await
                    .map_err(|e| EngineError::upstream(None, e.to_string()))?;
                let operation = operations
                    .into_iter()
                    .find(|op| &op.id == operation_id)
                    .ok_or_else(|| EngineError::UnknownOperation {
                        platform: platform_id.clone(),
                        operation: operation_id.clone(),
                    })?;
                let description = route
                    .description
                    .clone()
                    .or_else(|| operation.description.clone())
                    .unwrap_or_default();
                (description, schema_from_operation(&operation, &route.bound))
            }
        };
        tools.push(BoundRoute {
            tool: ToolDefinition::function(name, description, parameters),
            route: route.clone(),
        });
    }
    Ok(tools)
}

/// A conforming tool identifier for a route: the route name when it
/// already matches, otherwise a one-shot model translation cached by a
/// hash of agent and route. Failed translations are not cached, so the
/// next use retries.
async fn conforming_tool_name(
    ctx: &ExecutionContext,
    definition: &AgentDefinition,
    model: &str,
    route: &Route,
) -> Result<String, EngineError> {
    if tool_name_pattern().is_match(&route.name) {
        return Ok(route.name.clone());
    }

    let mut hasher = Sha256::new();
    hasher.update(definition.id.as_bytes());
    hasher.update(route.name.as_bytes());
    let key = hex::encode(hasher.finalize());
    if let Some(cached) = ctx.tool_names().get(&key) {
        return Ok(cached);
    }

    let request = ChatRequest::new(
        model,
        vec![
            ChatMessage::system(
                "Translate the given display name into an identifier matching \
                 ^[a-zA-Z0-9_-]{1,64}$. Reply with the identifier only.",
            ),
            ChatMessage::user(route.name.clone()),
        ],
    );
    let response = ctx
        .llm
        .chat(request)
        .await
        .map_err(|e| EngineError::upstream(None, e.to_string()))?;
    let candidate = response.content.unwrap_or_default().trim().to_string();
    if tool_name_pattern().is_match(&candidate) {
        ctx.tool_names().insert(key, candidate.clone());
        Ok(candidate)
    } else {
        Err(EngineError::Validation {
            agent: definition.id.clone(),
            detail: format!(
                "tool name translation for '{}' produced non-conforming '{}'",
                route.name, candidate
            ),
        })
    }
}

fn literal_param_schema(param: &Parameter) -> Option<Value> {
    let schema = match param.param_type {
        ParamType::String => json!({"type": "string"}),
        ParamType::Number => json!({"type": "number"}),
        ParamType::Boolean => json!({"type": "boolean"}),
        ParamType::Object => json!({"type": "object"}),
        ParamType::Array => json!({"type": "array"}),
        // Source and plumbing parameters resolve inside the engine and
        // never surface in the tool schema.
        _ => return None,
    };
    Some(schema)
}

/// Function-parameter schema for a target agent: its declared literal
/// parameters minus those bound by the route's static configuration.
fn schema_from_parameters(parameters: &[Parameter], bound: &JsonMap) -> Value {
    let mut properties = JsonMap::new();
    let mut required = Vec::new();
    for param in parameters {
        if param.hidden || bound.contains_key(&param.key) {
            continue;
        }
        let Some(schema) = literal_param_schema(param) else {
            continue;
        };
        properties.insert(param.key.clone(), schema);
        if param.required {
            required.push(Value::String(param.key.clone()));
        }
    }
    json!({"type": "object", "properties": properties, "required": required})
}

/// Function-parameter schema for a platform operation.
fn schema_from_operation(operation: &PlatformOperation, bound: &JsonMap) -> Value {
    let mut properties = JsonMap::new();
    let mut required = Vec::new();
    for param in &operation.parameters {
        if bound.contains_key(&param.name) {
            continue;
        }
        properties.insert(param.name.clone(), param.schema.clone());
        if param.required {
            required.push(Value::String(param.name.clone()));
        }
    }
    json!({"type": "object", "properties": properties, "required": required})
}

/// Sink wrapper that re-emits a nested agent's pure text deltas on the
/// router's own task id.
struct MirrorSink {
    inner: Arc<dyn EventSink>,
    parent_task: TaskId,
    parent_agent: String,
}

impl EventSink for MirrorSink {
    fn emit(&self, event: ExecutionEvent) {
        if let ExecutionEvent::Chunk { delta, .. } = &event {
            let is_pure_text = delta
                .as_object()
                .map(|o| o.len() == 1 && o.contains_key(TEXT_OUTPUT))
                .unwrap_or(false);
            if is_pure_text {
                if let Some(text) = delta.get(TEXT_OUTPUT).and_then(Value::as_str) {
                    self.inner.emit(ExecutionEvent::Chunk {
                        task_id: self.parent_task.clone(),
                        agent_id: self.parent_agent.clone(),
                        delta: json!({ TEXT_OUTPUT: text }),
                    });
                }
            }
        }
        self.inner.emit(event);
    }
}
