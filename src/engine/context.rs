//! Execution context - shared state across one call tree.
//!
//! The context is an immutable-by-convention bag of collaborator handles
//! plus per-tree budgets and identity. `copy` produces a shallow clone;
//! `with_event_sink` is the overriding copy used to scope a different
//! sink to a nested call (e.g. mirroring only the designated final text
//! producer's stream to a parent's channel).
//!
//! The two runtime caches the engine needs - protocol clients and
//! translated tool names - live here rather than in process-wide state,
//! so concurrent call trees and test runs never interfere.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::cache::CacheStore;
use super::dispatcher::Dispatcher;
use super::error::EngineError;
use super::events::EventSink;
use super::task::TaskIdGenerator;
use crate::definition::{AgentDefinition, AgentSelection};
use crate::llm::{ImageClient, LlmClient};
use crate::memory::MemoryStore;
use crate::platform::PlatformCatalog;
use crate::protocol::{ProtocolConnector, ProtocolRegistry};
use crate::retry::DEFAULT_RETRY_BUDGET;
use crate::secrets::SecretStore;

/// Resolves agent references to definitions.
#[async_trait]
pub trait AgentResolver: Send + Sync {
    /// Resolve a (possibly qualified) reference. `None` means the agent
    /// does not exist at that identity.
    async fn resolve(&self, selection: &AgentSelection)
        -> anyhow::Result<Option<AgentDefinition>>;
}

/// Caller identity for one call tree.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

/// Context-scoped cache of translated tool names, keyed by a hash of the
/// originating agent and route.
#[derive(Clone, Default)]
pub struct ToolNameCache {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl ToolNameCache {
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().ok()?.get(key).cloned()
    }

    pub fn insert(&self, key: String, name: String) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(key, name);
        }
    }
}

/// The collaborator handles an execution context is built from.
pub struct Collaborators {
    pub agents: Arc<dyn AgentResolver>,
    pub llm: Arc<dyn LlmClient>,
    pub image: Arc<dyn ImageClient>,
    pub events: Arc<dyn EventSink>,
    pub memory: Arc<dyn MemoryStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub cache: Arc<dyn CacheStore>,
    pub platforms: Arc<dyn PlatformCatalog>,
    pub protocols: Arc<dyn ProtocolConnector>,
}

/// Shared state for one call tree.
#[derive(Clone)]
pub struct ExecutionContext {
    pub agents: Arc<dyn AgentResolver>,
    pub llm: Arc<dyn LlmClient>,
    pub image: Arc<dyn ImageClient>,
    pub events: Arc<dyn EventSink>,
    pub memory: Arc<dyn MemoryStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub cache: Arc<dyn CacheStore>,
    pub platforms: Arc<dyn PlatformCatalog>,
    pub protocols: ProtocolRegistry,
    pub session: SessionInfo,
    /// Shared HTTP client for API agents.
    pub http: reqwest::Client,
    /// Attempt budget for the LLM-class strategies.
    pub retry_budget: u32,
    /// Iteration cap for the router's tool loop.
    pub max_tool_rounds: u32,
    /// Call-tree depth limit; exceeding it is fatal.
    pub max_depth: u32,
    pub ids: TaskIdGenerator,
    tool_names: ToolNameCache,
}

impl ExecutionContext {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            agents: collaborators.agents,
            llm: collaborators.llm,
            image: collaborators.image,
            events: collaborators.events,
            memory: collaborators.memory,
            secrets: collaborators.secrets,
            cache: collaborators.cache,
            platforms: collaborators.platforms,
            protocols: ProtocolRegistry::new(collaborators.protocols),
            session: SessionInfo::default(),
            http: reqwest::Client::new(),
            retry_budget: DEFAULT_RETRY_BUDGET,
            max_tool_rounds: 16,
            max_depth: 32,
            ids: TaskIdGenerator::new(),
            tool_names: ToolNameCache::default(),
        }
    }

    pub fn with_session(mut self, session: SessionInfo) -> Self {
        self.session = session;
        self
    }

    /// Shallow-overridden copy scoping a different event sink.
    pub fn with_event_sink(&self, events: Arc<dyn EventSink>) -> Self {
        let mut copy = self.clone();
        copy.events = events;
        copy
    }

    /// A dispatcher bound to this context.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.clone())
    }

    pub fn tool_names(&self) -> &ToolNameCache {
        &self.tool_names
    }

    /// Resolve a reference, failing when the agent does not exist.
    pub async fn resolve_required(
        &self,
        selection: &AgentSelection,
    ) -> Result<AgentDefinition, EngineError> {
        match self.agents.resolve(selection).await {
            Ok(Some(definition)) => Ok(definition),
            Ok(None) => Err(EngineError::UnknownAgent(selection.agent_id.clone())),
            Err(e) => Err(EngineError::Other(e)),
        }
    }

    /// Resolve a reference, tolerating absence.
    pub async fn resolve_optional(
        &self,
        selection: &AgentSelection,
    ) -> Result<Option<AgentDefinition>, EngineError> {
        self.agents.resolve(selection).await.map_err(EngineError::Other)
    }
}
