//! Output schema derivation and validation.
//!
//! An agent's declared output variables become a JSON Schema document.
//! Full mode lists every required, non-hidden-irrelevant output in
//! `required`; partial mode drops the requirements and checks only the
//! types of whatever is present, which lets the engine surface outputs
//! that input bindings already satisfy before the strategy runs.

use serde_json::{json, Value};

use super::error::EngineError;
use crate::definition::{AgentDefinition, OutputShape, OutputVariable};
use crate::JsonMap;

/// Validation mode for a derived schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaMode {
    /// All required outputs must be present.
    Full,
    /// Presence is optional; only shapes of present outputs are checked.
    Partial,
}

/// JSON Schema for one output shape.
fn shape_schema(shape: &OutputShape) -> Value {
    match shape {
        OutputShape::String => json!({"type": "string"}),
        OutputShape::Number => json!({"type": "number"}),
        OutputShape::Boolean => json!({"type": "boolean"}),
        OutputShape::Any => json!({}),
        OutputShape::Array { items } => json!({
            "type": "array",
            "items": shape_schema(items),
        }),
        OutputShape::Object { fields } => {
            let mut properties = JsonMap::new();
            let mut required = Vec::new();
            for field in fields {
                properties.insert(field.name.clone(), shape_schema(&field.shape));
                if field.required {
                    required.push(Value::String(field.name.clone()));
                }
            }
            json!({
                "type": "object",
                "properties": properties,
                "required": required,
            })
        }
    }
}

/// Build the JSON Schema document for an agent's declared outputs.
pub fn output_schema(outputs: &[OutputVariable], mode: SchemaMode) -> Value {
    let mut properties = JsonMap::new();
    let mut required = Vec::new();
    for output in outputs {
        properties.insert(output.name.clone(), shape_schema(&output.shape));
        if output.required && mode == SchemaMode::Full {
            required.push(Value::String(output.name.clone()));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": true,
    })
}

/// Validate a candidate output object against an agent's declared outputs.
pub fn validate_outputs(
    definition: &AgentDefinition,
    candidate: &Value,
    mode: SchemaMode,
) -> Result<(), EngineError> {
    let schema = output_schema(&definition.outputs, mode);
    let validator = jsonschema::validator_for(&schema).map_err(|e| {
        EngineError::Config(format!(
            "invalid output schema for agent '{}': {}",
            definition.id, e
        ))
    })?;
    let failures: Vec<String> = validator
        .iter_errors(candidate)
        .map(|error| format!("{} at {}", error, error.instance_path))
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation {
            agent: definition.id.clone(),
            detail: failures.join("; "),
        })
    }
}

/// The subset of declared outputs that `candidate` already satisfies
/// completely (present and individually valid). Used for early partial
/// emission before the strategy runs.
pub fn complete_outputs(outputs: &[OutputVariable], candidate: &JsonMap) -> JsonMap {
    let mut complete = JsonMap::new();
    for output in outputs {
        let Some(value) = candidate.get(&output.name) else {
            continue;
        };
        let schema = shape_schema(&output.shape);
        match jsonschema::validator_for(&schema) {
            Ok(validator) if validator.is_valid(value) => {
                complete.insert(output.name.clone(), value.clone());
            }
            _ => {}
        }
    }
    complete
}
