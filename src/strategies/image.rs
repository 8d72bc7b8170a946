//! Image generation and compositing strategies.
//!
//! The generator renders the prompt template, maps any image-valued
//! parameters the prompt actually references onto stable `image-N`
//! placeholders, and calls the image backend. The compositor renders a
//! templated preview URL with no network call at execution time.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{kind_mismatch, Strategy};
use crate::definition::{AgentDefinition, AgentKind};
use crate::engine::context::ExecutionContext;
use crate::engine::error::EngineError;
use crate::engine::task::ExecutionTask;
use crate::llm::ImageRequest;
use crate::template;
use crate::JsonMap;

pub struct ImageStrategy;

/// Whether a resolved value can serve as a reference image.
fn is_image_value(value: &Value) -> bool {
    matches!(value, Value::String(text)
        if text.starts_with("http://") || text.starts_with("https://") || text.starts_with("data:"))
}

#[async_trait]
impl Strategy for ImageStrategy {
    async fn process(
        &self,
        ctx: &ExecutionContext,
        definition: &AgentDefinition,
        _task: &ExecutionTask,
        inputs: &JsonMap,
    ) -> Result<Value, EngineError> {
        let AgentKind::Image { prompt } = &definition.kind else {
            return Err(kind_mismatch(definition, "image"));
        };
        if prompt.trim().is_empty() {
            return Err(EngineError::Config(format!(
                "image agent '{}' has no prompt",
                definition.id
            )));
        }

        // Image-valued parameters the prompt references render as stable
        // placeholders; the backend receives the placeholder -> url map.
        let mut images = BTreeMap::new();
        let mut scope = inputs.clone();
        let mut remaining = inputs.clone();
        for param in &definition.parameters {
            let referenced = prompt.contains(&format!("{{{{{}}}}}", param.key))
                || prompt.contains(&format!("{{{{ {} }}}}", param.key));
            if !referenced {
                continue;
            }
            if let Some(value) = inputs.get(&param.key) {
                if is_image_value(value) {
                    let placeholder = format!("image-{}", images.len() + 1);
                    images.insert(placeholder.clone(), value.as_str().unwrap_or_default().to_string());
                    scope.insert(param.key.clone(), json!(placeholder));
                    remaining.remove(&param.key);
                }
            }
        }

        let rendered = template::render_str(prompt, &scope)?;
        let request = ImageRequest {
            model: definition.model.as_ref().map(|m| m.name.clone()),
            prompt: rendered,
            images,
            params: remaining,
        };
        let urls = ctx
            .image
            .generate(request)
            .await
            .map_err(|e| EngineError::upstream(None, e.to_string()))?;
        Ok(json!({ "images": urls }))
    }
}

pub struct ImageCompositorStrategy;

#[async_trait]
impl Strategy for ImageCompositorStrategy {
    async fn process(
        &self,
        _ctx: &ExecutionContext,
        definition: &AgentDefinition,
        _task: &ExecutionTask,
        inputs: &JsonMap,
    ) -> Result<Value, EngineError> {
        let AgentKind::ImageCompositor { template_url, fields } = &definition.kind else {
            return Err(kind_mismatch(definition, "image-compositor"));
        };

        let mut scope = inputs.clone();
        for (name, field_template) in fields {
            scope.insert(name.clone(), template::render_value(field_template, inputs)?);
        }
        let url = template::render_str(template_url, &scope)?;
        Ok(json!({ "url": url }))
    }
}
