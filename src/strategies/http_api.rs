//! HTTP API strategy.
//!
//! Issues a single HTTP request from the agent's templated URL and
//! headers. GET sends the resolved parameters as query pairs; every
//! other method sends them as a JSON body. Transport and status
//! failures are enriched with the response status and body before being
//! rethrown.

use async_trait::async_trait;
use serde_json::Value;

use super::{kind_mismatch, Strategy};
use crate::definition::{AgentDefinition, AgentKind, HttpMethod};
use crate::engine::context::ExecutionContext;
use crate::engine::error::EngineError;
use crate::engine::task::ExecutionTask;
use crate::template;
use crate::JsonMap;

pub struct HttpApiStrategy;

/// Query-pair form of a resolved input value.
fn query_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Strategy for HttpApiStrategy {
    async fn process(
        &self,
        ctx: &ExecutionContext,
        definition: &AgentDefinition,
        _task: &ExecutionTask,
        inputs: &JsonMap,
    ) -> Result<Value, EngineError> {
        let AgentKind::HttpApi { url, method, headers } = &definition.kind else {
            return Err(kind_mismatch(definition, "http-api"));
        };
        if url.trim().is_empty() {
            return Err(EngineError::Config(format!(
                "http-api agent '{}' has no url",
                definition.id
            )));
        }

        let rendered = template::render_str(url, inputs)?;
        let mut request_url = url::Url::parse(&rendered)
            .map_err(|e| EngineError::Config(format!("invalid url '{}': {}", rendered, e)))?;

        let reqwest_method = match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        if *method == HttpMethod::Get {
            let mut pairs = request_url.query_pairs_mut();
            for (key, value) in inputs {
                pairs.append_pair(key, &query_value(value));
            }
        }

        let mut request = ctx.http.request(reqwest_method, request_url);
        for (name, value) in headers {
            request = request.header(name, template::render_str(value, inputs)?);
        }
        if *method != HttpMethod::Get {
            request = request.json(&Value::Object(inputs.clone()));
        }

        tracing::debug!(agent = %definition.id, method = method.as_str(), "http-api request");
        let response = request
            .send()
            .await
            .map_err(|e| EngineError::upstream(e.status().map(|s| s.as_u16()), e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::upstream(Some(status.as_u16()), e.to_string()))?;
        if !status.is_success() {
            return Err(EngineError::upstream(Some(status.as_u16()), body));
        }

        let parsed = serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body));
        Ok(parsed)
    }
}
