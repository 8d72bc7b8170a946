//! Content-addressed execution cache.
//!
//! Cache keys hash the *visible* resolved inputs only - hidden parameters
//! (secrets, internal plumbing) are excluded so they neither fragment the
//! cache nor leak into key material. Entries store the resolved input
//! snapshot next to the validated output snapshot; a hit is only trusted
//! after re-validation against the agent's current output schema, since
//! the schema may have evolved since the entry was written.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::definition::AgentDefinition;
use crate::JsonMap;

/// A cached execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Resolved input snapshot the entry was produced from.
    pub inputs: Value,
    /// Validated output snapshot.
    pub outputs: Value,
}

/// External cache store, keyed by project identity plus a key string.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, project_id: &str, key: &str) -> anyhow::Result<Option<CacheEntry>>;
    async fn set(&self, project_id: &str, key: &str, entry: CacheEntry) -> anyhow::Result<()>;
}

/// Recursively sort object keys so hashing is insertion-order independent.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            serde_json::to_value(sorted).unwrap_or(Value::Null)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// The subset of resolved inputs that participates in the cache key:
/// everything not declared hidden.
pub fn visible_inputs(definition: &AgentDefinition, resolved: &JsonMap) -> JsonMap {
    resolved
        .iter()
        .filter(|(key, _)| {
            definition
                .parameters
                .iter()
                .find(|p| &&p.key == key)
                .map(|p| !p.hidden)
                .unwrap_or(true)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Derive the cache key for an agent and its resolved inputs.
pub fn cache_key(definition: &AgentDefinition, resolved: &JsonMap) -> String {
    let visible = visible_inputs(definition, resolved);
    let project_ref = definition
        .identity
        .as_ref()
        .and_then(|i| i.project_ref.as_deref())
        .unwrap_or_default();
    let payload = serde_json::json!({
        "agent": definition.id,
        "ref": project_ref,
        "inputs": canonicalize(&Value::Object(visible)),
    });
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
