//! Template rendering for variable substitution.
//!
//! Agent definitions carry `{{variable}}` placeholders in prompts, URLs and
//! configured input values. Rendering is fail-safe: referencing a variable
//! that is not bound is an error rather than a silent empty substitution.
//!
//! A template that consists of exactly one placeholder is *type-preserving*:
//! `"{{count}}"` with `count` bound to `3` renders to the number `3`, not the
//! string `"3"`. Any surrounding literal text forces string rendering.

use std::fmt;

use serde_json::Value;

use crate::JsonMap;

/// Error type for template rendering failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// A variable was referenced but not provided.
    UndefinedVariable { name: String, position: usize },
    /// A `{{` was found without a closing `}}`.
    UnmatchedBrace { position: usize },
    /// An empty placeholder (`{{}}`) was found.
    EmptyVariableName { position: usize },
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateError::UndefinedVariable { name, position } => {
                write!(f, "undefined variable '{}' at position {}", name, position)
            }
            TemplateError::UnmatchedBrace { position } => {
                write!(f, "unmatched '{{{{' at position {}", position)
            }
            TemplateError::EmptyVariableName { position } => {
                write!(f, "empty placeholder at position {}", position)
            }
        }
    }
}

impl std::error::Error for TemplateError {}

/// A parsed template segment.
enum Segment {
    Literal(String),
    Variable { name: String, position: usize },
}

/// Parse a template into literal and variable segments.
fn parse(template: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let bytes = template.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            let start = i;
            let rest = &template[i + 2..];
            match rest.find("}}") {
                Some(end) => {
                    let name = rest[..end].trim();
                    if name.is_empty() {
                        return Err(TemplateError::EmptyVariableName { position: start });
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Variable {
                        name: name.to_string(),
                        position: start,
                    });
                    i += 2 + end + 2;
                }
                None => return Err(TemplateError::UnmatchedBrace { position: start }),
            }
        } else {
            // Safe: we advance byte-wise but only ever split at ASCII braces.
            let ch = template[i..].chars().next().unwrap_or('\u{0}');
            literal.push(ch);
            i += ch.len_utf8();
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Render a bound value into its string form for interpolation.
///
/// Strings interpolate verbatim; everything else uses compact JSON.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render a template to a string, substituting `{{variable}}` placeholders.
pub fn render_str(template: &str, variables: &JsonMap) -> Result<String, TemplateError> {
    let segments = parse(template)?;
    let mut result = String::with_capacity(template.len());
    for segment in segments {
        match segment {
            Segment::Literal(text) => result.push_str(&text),
            Segment::Variable { name, position } => match variables.get(&name) {
                Some(value) => result.push_str(&value_to_string(value)),
                None => return Err(TemplateError::UndefinedVariable { name, position }),
            },
        }
    }
    Ok(result)
}

/// Render a template, preserving the bound value's type when the template is
/// exactly one placeholder.
pub fn render_value(template: &str, variables: &JsonMap) -> Result<Value, TemplateError> {
    let segments = parse(template)?;
    if let [Segment::Variable { name, position }] = segments.as_slice() {
        return match variables.get(name) {
            Some(value) => Ok(value.clone()),
            None => Err(TemplateError::UndefinedVariable {
                name: name.clone(),
                position: *position,
            }),
        };
    }

    let mut result = String::with_capacity(template.len());
    for segment in segments {
        match segment {
            Segment::Literal(text) => result.push_str(&text),
            Segment::Variable { name, position } => match variables.get(&name) {
                Some(value) => result.push_str(&value_to_string(value)),
                None => return Err(TemplateError::UndefinedVariable { name, position }),
            },
        }
    }
    Ok(Value::String(result))
}

/// Recursively render every string leaf of a JSON value.
///
/// Object keys are left untouched; only values are rendered. A string leaf
/// that is exactly one placeholder keeps the bound value's type.
pub fn render_leaves(value: &Value, variables: &JsonMap) -> Result<Value, TemplateError> {
    match value {
        Value::String(template) => render_value(template, variables),
        Value::Array(items) => {
            let mut rendered = Vec::with_capacity(items.len());
            for item in items {
                rendered.push(render_leaves(item, variables)?);
            }
            Ok(Value::Array(rendered))
        }
        Value::Object(map) => {
            let mut rendered = JsonMap::new();
            for (key, item) in map {
                rendered.insert(key.clone(), render_leaves(item, variables)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}
