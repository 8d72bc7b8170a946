//! External-platform discovery and invocation boundary.
//!
//! An external platform exposes a catalogue of operations the engine can
//! enumerate and invoke. Router routes and external-platform agents both
//! resolve their targets through this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One parameter of a discovered platform operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationParameter {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema fragment for the parameter's value.
    pub schema: Value,
    #[serde(default)]
    pub required: bool,
}

/// A discovered operation of an external platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformOperation {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<OperationParameter>,
}

/// External platform catalogue: enumerate and invoke operations.
#[async_trait]
pub trait PlatformCatalog: Send + Sync {
    async fn operations(&self, platform_id: &str) -> anyhow::Result<Vec<PlatformOperation>>;
    async fn invoke(
        &self,
        platform_id: &str,
        operation_id: &str,
        args: Value,
    ) -> anyhow::Result<Value>;
}
