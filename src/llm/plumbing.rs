//! Validation for the LLM-plumbing parameter types.
//!
//! Parameters typed `llm-input-messages`, `llm-input-tools` and
//! `llm-input-tool-choice` accept either a structured value or a
//! JSON-encoded string, and are checked against a fixed shape before
//! being forwarded verbatim to an LLM-class strategy. A scalar messages
//! value is auto-wrapped as a single user message.

use serde_json::Value;

use super::{ChatMessage, Role, ToolDefinition};
use crate::engine::error::EngineError;

/// Decode a value that may arrive JSON-encoded as a string.
///
/// Returns the parsed value when the string holds JSON, otherwise the
/// original value unchanged.
fn decode(value: &Value) -> Value {
    if let Value::String(text) = value {
        if let Ok(parsed) = serde_json::from_str::<Value>(text) {
            return parsed;
        }
    }
    value.clone()
}

/// Parse a messages input into a validated message list.
///
/// Accepts an array of `{role, content}` objects, one such object, a
/// JSON-encoded string of either, or a scalar (wrapped as a single user
/// message).
pub fn parse_messages(value: &Value) -> Result<Vec<ChatMessage>, EngineError> {
    let decoded = decode(value);
    match decoded {
        Value::Array(items) => items.iter().map(parse_one_message).collect(),
        Value::Object(_) => Ok(vec![parse_one_message(&decoded)?]),
        Value::String(text) => Ok(vec![ChatMessage::user(text)]),
        Value::Number(n) => Ok(vec![ChatMessage::user(n.to_string())]),
        Value::Bool(b) => Ok(vec![ChatMessage::user(b.to_string())]),
        Value::Null => Ok(Vec::new()),
    }
}

fn parse_one_message(value: &Value) -> Result<ChatMessage, EngineError> {
    let object = value
        .as_object()
        .ok_or_else(|| EngineError::Config(format!("message is not an object: {}", value)))?;
    let role = match object.get("role").and_then(Value::as_str) {
        Some("system") => Role::System,
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        Some("tool") => Role::Tool,
        Some(other) => {
            return Err(EngineError::Config(format!("unknown message role '{}'", other)))
        }
        None => return Err(EngineError::Config("message is missing a role".into())),
    };
    let content = match object.get("content") {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    };
    let tool_calls = match object.get("tool_calls") {
        Some(calls) => Some(
            serde_json::from_value(calls.clone())
                .map_err(|e| EngineError::Config(format!("invalid tool_calls: {}", e)))?,
        ),
        None => None,
    };
    let tool_call_id = object
        .get("tool_call_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(ChatMessage {
        role,
        content,
        tool_calls,
        tool_call_id,
    })
}

/// Parse a tools input into validated tool definitions.
pub fn parse_tools(value: &Value) -> Result<Vec<ToolDefinition>, EngineError> {
    let decoded = decode(value);
    let items = decoded
        .as_array()
        .ok_or_else(|| EngineError::Config("tools input must be an array".into()))?;
    items
        .iter()
        .map(|item| {
            let tool: ToolDefinition = serde_json::from_value(item.clone())
                .map_err(|e| EngineError::Config(format!("invalid tool definition: {}", e)))?;
            if tool.function.name.is_empty() {
                return Err(EngineError::Config("tool definition has an empty name".into()));
            }
            Ok(tool)
        })
        .collect()
}

/// Parse a tool-choice input.
///
/// Accepts the provider keywords `auto` / `none` / `required`, or a
/// function selector object `{type: "function", function: {name}}`.
pub fn parse_tool_choice(value: &Value) -> Result<Value, EngineError> {
    let decoded = decode(value);
    match &decoded {
        Value::String(keyword) if matches!(keyword.as_str(), "auto" | "none" | "required") => {
            Ok(decoded)
        }
        Value::Object(object) => {
            let named = object
                .get("function")
                .and_then(Value::as_object)
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str);
            if object.get("type").and_then(Value::as_str) == Some("function") && named.is_some() {
                Ok(decoded)
            } else {
                Err(EngineError::Config(format!(
                    "invalid tool choice object: {}",
                    decoded
                )))
            }
        }
        other => Err(EngineError::Config(format!("invalid tool choice: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_wraps_as_user_message() {
        let messages = parse_messages(&json!("what is the weather")).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content.as_deref(), Some("what is the weather"));
    }

    #[test]
    fn structured_array_passes_through() {
        let messages = parse_messages(&json!([
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hi"}
        ]))
        .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
    }

    #[test]
    fn json_encoded_string_is_decoded() {
        let encoded = json!("[{\"role\":\"user\",\"content\":\"hi\"}]");
        let messages = parse_messages(&encoded).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.as_deref(), Some("hi"));
    }

    #[test]
    fn unknown_role_is_rejected() {
        let err = parse_messages(&json!([{"role": "wizard", "content": "hi"}])).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn tools_require_an_array_with_names() {
        let tools = parse_tools(&json!([
            {"type": "function", "function": {"name": "f", "description": "", "parameters": {}}}
        ]))
        .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function.name, "f");

        assert!(parse_tools(&json!({"not": "an array"})).is_err());
    }

    #[test]
    fn tool_choice_keywords_and_selectors() {
        assert_eq!(parse_tool_choice(&json!("auto")).unwrap(), json!("auto"));
        let selector = json!({"type": "function", "function": {"name": "pick_route"}});
        assert_eq!(parse_tool_choice(&selector).unwrap(), selector);
        assert!(parse_tool_choice(&json!("whenever")).is_err());
        assert!(parse_tool_choice(&json!({"type": "function"})).is_err());
    }
}
