//! Multi-source input resolution.
//!
//! Every declared parameter resolves in declaration order. Literal
//! string inputs render as templates over the variable scope (caller
//! inputs plus sibling values accumulated so far); `source` parameters
//! resolve by invoking a collaborator - the secret store, a sub-agent
//! run as a child task, long-term memory, the platform-provided
//! retrieval/history agents, or a discovered external operation.

use serde_json::{json, Value};

use super::context::ExecutionContext;
use super::dispatcher::{ExecuteOptions, ParentLink};
use super::error::EngineError;
use super::task::ExecutionTask;
use crate::definition::{
    reserved, AgentDefinition, AgentKind, AgentSelection, MemoryScope, ParamType, Parameter,
};
use crate::llm::plumbing;
use crate::memory::MemoryKey;
use crate::template;
use crate::JsonMap;

/// Resolve all declared parameters of `definition`.
pub async fn resolve_inputs(
    ctx: &ExecutionContext,
    definition: &AgentDefinition,
    task: &ExecutionTask,
    caller_inputs: &JsonMap,
    variables: &JsonMap,
) -> Result<JsonMap, EngineError> {
    let mut scope = variables.clone();
    for (key, value) in caller_inputs {
        scope.insert(key.clone(), value.clone());
    }

    let mut resolved = JsonMap::new();
    for param in &definition.parameters {
        let raw = caller_inputs.get(&param.key).or(param.default.as_ref());
        let value = resolve_parameter(ctx, definition, task, param, raw, &scope).await?;
        match value {
            Some(value) => {
                scope.insert(param.key.clone(), value.clone());
                resolved.insert(param.key.clone(), value);
            }
            None if param.required => {
                return Err(EngineError::Config(format!(
                    "required parameter '{}' of agent '{}' has no value",
                    param.key, definition.id
                )));
            }
            None => {}
        }
    }
    Ok(resolved)
}

async fn resolve_parameter(
    ctx: &ExecutionContext,
    definition: &AgentDefinition,
    task: &ExecutionTask,
    param: &Parameter,
    raw: Option<&Value>,
    scope: &JsonMap,
) -> Result<Option<Value>, EngineError> {
    match &param.param_type {
        ParamType::String => match raw {
            Some(Value::String(text)) => Ok(Some(template::render_value(text, scope)?)),
            Some(other) => Ok(Some(other.clone())),
            None => Ok(None),
        },
        ParamType::Object | ParamType::Array => match raw {
            Some(value) => Ok(Some(template::render_leaves(value, scope)?)),
            None => Ok(None),
        },
        ParamType::Number => Ok(coerce_number(rendered(raw, scope)?.as_ref(), param.default.as_ref())),
        ParamType::Boolean => Ok(coerce_bool(rendered(raw, scope)?.as_ref(), param.default.as_ref())),

        ParamType::Secret => match raw {
            // A literal override short-circuits the store.
            Some(value) => Ok(Some(value.clone())),
            None => {
                let stored = ctx
                    .secrets
                    .resolve(definition.project_id(), &definition.id, &param.key)
                    .await
                    .map_err(EngineError::Other)?;
                match stored {
                    Some(secret) => Ok(Some(Value::String(secret))),
                    None => Err(EngineError::MissingSecret {
                        agent: definition.id.clone(),
                        key: param.key.clone(),
                    }),
                }
            }
        },

        ParamType::SubAgentTool { agent } => {
            let inputs = object_or_empty(raw);
            let result = run_child(ctx, definition, task, agent, inputs).await?;
            Ok(Some(Value::Object(result)))
        }

        ParamType::DatastoreVariable { key, scope: memory_scope, collapse } => {
            let memory_key = memory_key(ctx, definition, key, *memory_scope);
            let values = ctx
                .memory
                .read(&memory_key)
                .await
                .map_err(EngineError::Other)?;
            if *collapse {
                Ok(values.into_iter().last())
            } else {
                Ok(Some(Value::Array(values)))
            }
        }

        ParamType::KnowledgeBase { base_id, limit } => {
            let query = match raw {
                Some(Value::String(text)) => template::render_str(text, scope)?,
                Some(other) => other.to_string(),
                None => String::new(),
            };
            let mut inputs = JsonMap::new();
            inputs.insert("base".into(), json!(base_id));
            inputs.insert("query".into(), json!(query));
            if let Some(limit) = limit {
                inputs.insert("limit".into(), json!(limit));
            }
            let selection = AgentSelection::by_id(reserved::KNOWLEDGE_QUERY_AGENT);
            let hits = run_child(ctx, definition, task, &selection, inputs).await?;
            let serialized = serde_json::to_string(&Value::Object(hits))
                .map_err(|e| EngineError::Other(e.into()))?;
            Ok(Some(Value::String(serialized)))
        }

        ParamType::ConversationHistory { limit } => {
            let mut inputs = JsonMap::new();
            if let Some(session) = &ctx.session.session_id {
                inputs.insert("session_id".into(), json!(session));
            }
            if let Some(limit) = limit {
                inputs.insert("limit".into(), json!(limit));
            }
            let selection = AgentSelection::by_id(reserved::CONVERSATION_HISTORY_AGENT);
            let result = run_child(ctx, definition, task, &selection, inputs).await?;
            let mut value = Value::Object(result);
            annotate_history_authors(ctx, definition, &mut value).await;
            Ok(Some(value))
        }

        ParamType::ExternalPlatformApi { platform_id, operation_id } => {
            let synthetic = AgentDefinition {
                id: format!("{}::{}", platform_id, operation_id),
                name: operation_id.clone(),
                description: None,
                identity: definition.identity.clone(),
                model: None,
                parameters: vec![],
                outputs: vec![],
                cache: None,
                executor: None,
                kind: AgentKind::ExternalPlatform {
                    platform_id: platform_id.clone(),
                    operation_id: operation_id.clone(),
                },
            };
            let inputs = object_or_empty(raw);
            let result = ctx
                .dispatcher()
                .execute(
                    &synthetic,
                    ExecuteOptions {
                        inputs,
                        variables: JsonMap::new(),
                        parent: Some(ParentLink::of(task, definition)),
                    },
                )
                .await?;
            Ok(Some(Value::Object(result)))
        }

        ParamType::LlmInputMessages => match raw {
            Some(value) => {
                let messages = plumbing::parse_messages(value)?;
                Ok(Some(
                    serde_json::to_value(messages).map_err(|e| EngineError::Other(e.into()))?,
                ))
            }
            None => Ok(None),
        },
        ParamType::LlmInputTools => match raw {
            Some(value) => {
                let tools = plumbing::parse_tools(value)?;
                Ok(Some(
                    serde_json::to_value(tools).map_err(|e| EngineError::Other(e.into()))?,
                ))
            }
            None => Ok(None),
        },
        ParamType::LlmInputToolChoice => match raw {
            Some(value) => Ok(Some(plumbing::parse_tool_choice(value)?)),
            None => Ok(None),
        },
    }
}

/// Run another agent as a child task of `task`, qualified against the
/// invoking definition's identity.
pub(crate) async fn run_child(
    ctx: &ExecutionContext,
    definition: &AgentDefinition,
    task: &ExecutionTask,
    selection: &AgentSelection,
    inputs: JsonMap,
) -> Result<JsonMap, EngineError> {
    let qualified = selection.qualified(definition.identity.as_ref());
    let child = ctx.resolve_required(&qualified).await?;
    ctx.dispatcher()
        .execute(
            &child,
            ExecuteOptions {
                inputs,
                variables: JsonMap::new(),
                parent: Some(ParentLink::of(task, definition)),
            },
        )
        .await
}

/// Resolve each history message's originating agent id to a display
/// name. Best-effort: a message whose author cannot be resolved keeps
/// its id and loses nothing else.
async fn annotate_history_authors(
    ctx: &ExecutionContext,
    definition: &AgentDefinition,
    value: &mut Value,
) {
    let messages = match value.get_mut("messages").and_then(Value::as_array_mut) {
        Some(messages) => messages,
        None => return,
    };
    for message in messages {
        let Some(agent_id) = message.get("agent_id").and_then(Value::as_str) else {
            continue;
        };
        let selection = AgentSelection::by_id(agent_id).qualified(definition.identity.as_ref());
        match ctx.resolve_optional(&selection).await {
            Ok(Some(author)) => {
                if let Some(object) = message.as_object_mut() {
                    object.insert("agent_name".into(), json!(author.name));
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(agent_id, error = %e, "could not resolve history author");
            }
        }
    }
}

fn memory_key(
    ctx: &ExecutionContext,
    definition: &AgentDefinition,
    key: &str,
    scope: MemoryScope,
) -> MemoryKey {
    MemoryKey {
        project_id: definition.project_id().map(str::to_string),
        session_id: ctx.session.session_id.clone(),
        agent_id: definition.id.clone(),
        key: key.to_string(),
        scope,
    }
}

fn object_or_empty(raw: Option<&Value>) -> JsonMap {
    match raw {
        Some(Value::Object(map)) => map.clone(),
        _ => JsonMap::new(),
    }
}

/// Render a raw string value before scalar coercion so `"{{n}}"`-style
/// inputs coerce from their bound value.
fn rendered(raw: Option<&Value>, scope: &JsonMap) -> Result<Option<Value>, EngineError> {
    match raw {
        Some(Value::String(text)) => Ok(Some(template::render_value(text, scope)?)),
        Some(other) => Ok(Some(other.clone())),
        None => Ok(None),
    }
}

fn to_number(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) => Some(value.clone()),
        Value::String(text) => {
            let trimmed = text.trim();
            if let Ok(integer) = trimmed.parse::<i64>() {
                return Some(json!(integer));
            }
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
        }
        _ => None,
    }
}

fn coerce_number(raw: Option<&Value>, default: Option<&Value>) -> Option<Value> {
    raw.and_then(to_number).or_else(|| default.and_then(to_number))
}

fn to_bool(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(_) => Some(value.clone()),
        Value::String(text) => match text.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => Some(json!(true)),
            "0" | "false" | "no" | "n" | "off" => Some(json!(false)),
            _ => None,
        },
        Value::Number(n) => Some(json!(n.as_f64().map(|f| f != 0.0).unwrap_or(false))),
        _ => None,
    }
}

fn coerce_bool(raw: Option<&Value>, default: Option<&Value>) -> Option<Value> {
    raw.and_then(to_bool).or_else(|| default.and_then(to_bool))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_coerce_from_strings_with_default_fallback() {
        assert_eq!(coerce_number(Some(&json!("42")), None), Some(json!(42)));
        assert_eq!(coerce_number(Some(&json!("2.5")), None), Some(json!(2.5)));
        assert_eq!(
            coerce_number(Some(&json!("not a number")), Some(&json!(7))),
            Some(json!(7))
        );
        assert_eq!(coerce_number(None, Some(&json!(3))), Some(json!(3)));
        assert_eq!(coerce_number(None, None), None);
    }

    #[test]
    fn booleans_recognise_common_spellings() {
        assert_eq!(coerce_bool(Some(&json!("yes")), None), Some(json!(true)));
        assert_eq!(coerce_bool(Some(&json!("off")), None), Some(json!(false)));
        assert_eq!(coerce_bool(Some(&json!(true)), None), Some(json!(true)));
        assert_eq!(
            coerce_bool(Some(&json!("maybe")), Some(&json!(false))),
            Some(json!(false))
        );
        assert_eq!(coerce_bool(Some(&json!(0)), None), Some(json!(false)));
    }

    #[test]
    fn object_or_empty_tolerates_scalars() {
        assert!(object_or_empty(Some(&json!("text"))).is_empty());
        assert_eq!(
            object_or_empty(Some(&json!({"a": 1}))).get("a"),
            Some(&json!(1))
        );
    }
}
