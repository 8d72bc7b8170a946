//! Protocol-client runtime registry.
//!
//! Protocol-client agents talk to external tool/prompt/resource servers.
//! Connections are established lazily and cached per target platform for
//! the lifetime of one execution context - never in process-wide state -
//! so concurrent call trees and test runs cannot interfere. First access
//! from parallel branches is idempotent: the registry lock is held across
//! connection, so exactly one connect happens per platform.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::llm::ChatMessage;

/// An established client connection to one protocol platform.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Invoke a named tool with JSON arguments.
    async fn invoke_tool(&self, name: &str, args: Value) -> anyhow::Result<Value>;

    /// Fetch a named prompt as a message list.
    async fn fetch_prompt(&self, name: &str, args: Value) -> anyhow::Result<Vec<ChatMessage>>;

    /// Read a resource by URI.
    async fn read_resource(&self, uri: &str) -> anyhow::Result<Value>;
}

/// Establishes protocol connections on demand.
#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    async fn connect(&self, platform_id: &str) -> anyhow::Result<Arc<dyn ProtocolClient>>;
}

/// Context-scoped cache of protocol clients, keyed by platform id.
#[derive(Clone)]
pub struct ProtocolRegistry {
    connector: Arc<dyn ProtocolConnector>,
    clients: Arc<Mutex<HashMap<String, Arc<dyn ProtocolClient>>>>,
}

impl ProtocolRegistry {
    pub fn new(connector: Arc<dyn ProtocolConnector>) -> Self {
        Self {
            connector,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get the cached client for a platform, connecting on first access.
    pub async fn client(&self, platform_id: &str) -> anyhow::Result<Arc<dyn ProtocolClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(platform_id) {
            return Ok(Arc::clone(client));
        }
        tracing::debug!(platform_id, "establishing protocol client connection");
        let client = self.connector.connect(platform_id).await?;
        clients.insert(platform_id.to_string(), Arc::clone(&client));
        Ok(client)
    }
}
