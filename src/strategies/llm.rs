//! LLM prompt strategy.
//!
//! Renders the agent's role-tagged message templates and streams one
//! model call. When structured outputs are declared, a machine-readable
//! section is appended to the system prompt instructing the model to
//! emit a fenced JSON block conforming to the derived schema; the fenced
//! region is extracted incrementally from the token stream (text before
//! the fence is live output, the fence body parses as JSON once the
//! stream completes). The whole call runs under the retry budget -
//! validation failures re-run the full stream, and only the first
//! attempt forwards live deltas so retries never emit contradictory
//! partial text.

use serde_json::{json, Value};

use async_trait::async_trait;

use super::{kind_mismatch, render_messages, Strategy};
use crate::definition::{AgentDefinition, AgentKind, OutputVariable, ParamType, TEXT_OUTPUT};
use crate::engine::context::ExecutionContext;
use crate::engine::error::EngineError;
use crate::engine::events::ExecutionEvent;
use crate::engine::inputs::run_child;
use crate::engine::schema::{self, SchemaMode};
use crate::engine::task::ExecutionTask;
use crate::llm::{ChatMessage, ChatRequest, Role, StreamChunk, ToolDefinition};
use crate::retry::retry;
use crate::JsonMap;
use futures::StreamExt;

pub struct LlmStrategy;

#[async_trait]
impl Strategy for LlmStrategy {
    async fn process(
        &self,
        ctx: &ExecutionContext,
        definition: &AgentDefinition,
        task: &ExecutionTask,
        inputs: &JsonMap,
    ) -> Result<Value, EngineError> {
        let AgentKind::LlmPrompt { messages } = &definition.kind else {
            return Err(kind_mismatch(definition, "llm-prompt"));
        };

        let mut prepared = render_messages(messages, inputs)?;
        if let Some(plumbed) = plumbing_messages(definition, inputs)? {
            prepared.extend(plumbed);
        }
        if prepared.is_empty() {
            return Err(EngineError::Config(format!(
                "llm agent '{}' has no prompt",
                definition.id
            )));
        }

        let structured: Vec<OutputVariable> = definition.structured_outputs().cloned().collect();
        let wants_text = definition.wants_text_output();
        if !structured.is_empty() {
            attach_metadata_section(&mut prepared, &structured, wants_text);
        }

        let tools = plumbing_tools(definition, inputs)?;
        let tool_choice = plumbing_tool_choice(definition, inputs);
        let model = definition.model.as_ref().map(|m| m.name.clone());
        if definition.executor.is_none() && model.is_none() {
            return Err(EngineError::Config(format!(
                "llm agent '{}' has no model and no executor override",
                definition.id
            )));
        }

        retry(ctx.retry_budget, EngineError::is_validation, |attempt| {
            let prepared = prepared.clone();
            let tools = tools.clone();
            let tool_choice = tool_choice.clone();
            let model = model.clone();
            let structured = structured.clone();
            async move {
                let forward = attempt == 0;
                let (live, fenced) = match &definition.executor {
                    Some(executor) => {
                        let content = delegate_to_executor(
                            ctx, definition, task, executor, prepared, tools, tool_choice,
                        )
                        .await?;
                        let mut extractor = FenceExtractor::new();
                        let visible = extractor.push(&content);
                        if forward && !visible.is_empty() {
                            emit_text_delta(ctx, definition, task, &visible);
                        }
                        extractor.finish()
                    }
                    None => {
                        let Some(model) = model.clone() else {
                            return Err(EngineError::Config(format!(
                                "llm agent '{}' has no model",
                                definition.id
                            )));
                        };
                        let mut request = ChatRequest::new(model, prepared);
                        request.tools = tools;
                        request.tool_choice = tool_choice;
                        request.options = definition.chat_options();
                        stream_model_call(ctx, definition, task, request, forward).await?
                    }
                };

                let mut outputs = JsonMap::new();
                if !structured.is_empty() {
                    let fenced = fenced.ok_or_else(|| EngineError::Validation {
                        agent: definition.id.clone(),
                        detail: "model did not emit the fenced metadata block".into(),
                    })?;
                    let parsed: Value =
                        serde_json::from_str(fenced.trim()).map_err(|e| EngineError::Validation {
                            agent: definition.id.clone(),
                            detail: format!("metadata block is not valid JSON: {}", e),
                        })?;
                    let object = parsed.as_object().ok_or_else(|| EngineError::Validation {
                        agent: definition.id.clone(),
                        detail: "metadata block is not a JSON object".into(),
                    })?;
                    outputs.extend(object.clone());
                }
                if wants_text {
                    outputs.insert(TEXT_OUTPUT.to_string(), json!(live));
                }

                let value = Value::Object(outputs);
                schema::validate_outputs(definition, &value, SchemaMode::Full)?;
                Ok(value)
            }
        })
        .await
    }
}

/// Consume one streamed model call, forwarding visible deltas when
/// `forward` is set.
async fn stream_model_call(
    ctx: &ExecutionContext,
    definition: &AgentDefinition,
    task: &ExecutionTask,
    request: ChatRequest,
    forward: bool,
) -> Result<(String, Option<String>), EngineError> {
    let mut stream = ctx
        .llm
        .chat_stream(request)
        .await
        .map_err(|e| EngineError::upstream(None, e.to_string()))?;

    let mut extractor = FenceExtractor::new();
    let mut saw_delta = false;
    let mut done = None;
    while let Some(chunk) = stream.next().await {
        match chunk.map_err(|e| EngineError::upstream(None, e.to_string()))? {
            StreamChunk::Delta(delta) => {
                saw_delta = true;
                let visible = extractor.push(&delta);
                if forward && !visible.is_empty() {
                    emit_text_delta(ctx, definition, task, &visible);
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
    let response =
        done.ok_or_else(|| EngineError::upstream(None, "model stream ended without a terminal chunk"))?;

    // Non-streaming backends deliver all content in the terminal chunk.
    if !saw_delta {
        if let Some(content) = &response.content {
            let visible = extractor.push(content);
            if forward && !visible.is_empty() {
                emit_text_delta(ctx, definition, task, &visible);
            }
        }
    }
    Ok(extractor.finish())
}

/// Delegate the model call to another agent's LLM-plumbing inputs
/// instead of the model backend.
async fn delegate_to_executor(
    ctx: &ExecutionContext,
    definition: &AgentDefinition,
    task: &ExecutionTask,
    executor: &crate::definition::AgentSelection,
    messages: Vec<ChatMessage>,
    tools: Option<Vec<ToolDefinition>>,
    tool_choice: Option<Value>,
) -> Result<String, EngineError> {
    let mut child_inputs = JsonMap::new();
    child_inputs.insert(
        "messages".into(),
        serde_json::to_value(&messages).map_err(|e| EngineError::Other(e.into()))?,
    );
    if let Some(tools) = tools {
        child_inputs.insert(
            "tools".into(),
            serde_json::to_value(&tools).map_err(|e| EngineError::Other(e.into()))?,
        );
    }
    if let Some(choice) = tool_choice {
        child_inputs.insert("tool_choice".into(), choice);
    }
    let result = run_child(ctx, definition, task, executor, child_inputs).await?;
    Ok(match result.get(TEXT_OUTPUT) {
        Some(Value::String(text)) => text.clone(),
        _ => serde_json::to_string(&Value::Object(result))
            .map_err(|e| EngineError::Other(e.into()))?,
    })
}

fn emit_text_delta(
    ctx: &ExecutionContext,
    definition: &AgentDefinition,
    task: &ExecutionTask,
    text: &str,
) {
    ctx.events.emit(ExecutionEvent::Chunk {
        task_id: task.id.clone(),
        agent_id: definition.id.clone(),
        delta: json!({ TEXT_OUTPUT: text }),
    });
}

/// Append the structured-output instruction to the system prompt,
/// creating one when the template list has no system message.
fn attach_metadata_section(
    messages: &mut Vec<ChatMessage>,
    structured: &[OutputVariable],
    wants_text: bool,
) {
    let schema = schema::output_schema(structured, SchemaMode::Full);
    let preamble = if wants_text {
        "You may write free text first. Finish your reply with a fenced ```json code block."
    } else {
        "Respond with only a fenced ```json code block."
    };
    let section = format!(
        "## Structured output\n{}\nThe JSON object inside the block must conform to this schema:\n{}",
        preamble,
        serde_json::to_string_pretty(&schema).unwrap_or_default()
    );
    match messages.iter_mut().find(|m| m.role == Role::System) {
        Some(system) => {
            let existing = system.content.take().unwrap_or_default();
            system.content = Some(format!("{}\n\n{}", existing, section));
        }
        None => messages.insert(0, ChatMessage::system(section)),
    }
}

pub(crate) fn plumbing_messages(
    definition: &AgentDefinition,
    inputs: &JsonMap,
) -> Result<Option<Vec<ChatMessage>>, EngineError> {
    for param in &definition.parameters {
        if matches!(param.param_type, ParamType::LlmInputMessages) {
            if let Some(value) = inputs.get(&param.key) {
                return serde_json::from_value(value.clone())
                    .map(Some)
                    .map_err(|e| EngineError::Config(format!("invalid llm messages input: {}", e)));
            }
        }
    }
    Ok(None)
}

fn plumbing_tools(
    definition: &AgentDefinition,
    inputs: &JsonMap,
) -> Result<Option<Vec<ToolDefinition>>, EngineError> {
    for param in &definition.parameters {
        if matches!(param.param_type, ParamType::LlmInputTools) {
            if let Some(value) = inputs.get(&param.key) {
                return serde_json::from_value(value.clone())
                    .map(Some)
                    .map_err(|e| EngineError::Config(format!("invalid llm tools input: {}", e)));
            }
        }
    }
    Ok(None)
}

fn plumbing_tool_choice(definition: &AgentDefinition, inputs: &JsonMap) -> Option<Value> {
    definition.parameters.iter().find_map(|param| {
        matches!(param.param_type, ParamType::LlmInputToolChoice)
            .then(|| inputs.get(&param.key).cloned())
            .flatten()
    })
}

/// Incremental extractor splitting a token stream into live text and the
/// body of the first fenced code block.
#[derive(Debug, PartialEq, Eq)]
enum FenceState {
    /// Before any fence: text is live output.
    Live,
    /// Inside the fence opener, waiting for the end of the header line.
    Header,
    /// Inside the fence body.
    Fenced,
    /// After the closing fence: everything else is ignored.
    Done,
}

pub(crate) struct FenceExtractor {
    state: FenceState,
    buffer: String,
    live: String,
    fenced: String,
}

fn trailing_backticks(text: &str) -> usize {
    text.bytes().rev().take_while(|b| *b == b'`').count()
}

impl FenceExtractor {
    pub(crate) fn new() -> Self {
        Self {
            state: FenceState::Live,
            buffer: String::new(),
            live: String::new(),
            fenced: String::new(),
        }
    }

    /// Feed a delta; returns the newly visible live text, if any.
    pub(crate) fn push(&mut self, delta: &str) -> String {
        let mut visible = String::new();
        self.buffer.push_str(delta);
        loop {
            match self.state {
                FenceState::Live => {
                    if let Some(idx) = self.buffer.find("```") {
                        let head = self.buffer[..idx].to_string();
                        visible.push_str(&head);
                        self.live.push_str(&head);
                        self.buffer.drain(..idx + 3);
                        self.state = FenceState::Header;
                    } else {
                        // Hold back a possible partial fence marker.
                        let keep = trailing_backticks(&self.buffer).min(2);
                        let cut = self.buffer.len() - keep;
                        let head: String = self.buffer.drain(..cut).collect();
                        visible.push_str(&head);
                        self.live.push_str(&head);
                        break;
                    }
                }
                FenceState::Header => {
                    if let Some(idx) = self.buffer.find('\n') {
                        self.buffer.drain(..=idx);
                        self.state = FenceState::Fenced;
                    } else {
                        break;
                    }
                }
                FenceState::Fenced => {
                    if let Some(idx) = self.buffer.find("```") {
                        self.fenced.push_str(&self.buffer[..idx]);
                        self.buffer.clear();
                        self.state = FenceState::Done;
                    } else {
                        let keep = trailing_backticks(&self.buffer).min(2);
                        let cut = self.buffer.len() - keep;
                        let head: String = self.buffer.drain(..cut).collect();
                        self.fenced.push_str(&head);
                        break;
                    }
                }
                FenceState::Done => {
                    self.buffer.clear();
                    break;
                }
            }
        }
        visible
    }

    /// Flush and return `(live text, fenced body)`. An unterminated
    /// fence body is accepted as-is; a fence opener with no body yields
    /// no block.
    pub(crate) fn finish(mut self) -> (String, Option<String>) {
        match self.state {
            FenceState::Live => self.live.push_str(&self.buffer),
            FenceState::Fenced => self.fenced.push_str(&self.buffer),
            FenceState::Header | FenceState::Done => {}
        }
        let fenced = match self.state {
            FenceState::Fenced | FenceState::Done => Some(self.fenced),
            _ => None,
        };
        (self.live, fenced)
    }
}
