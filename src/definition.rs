//! Declarative agent model.
//!
//! An agent definition is data: a common envelope (identity, parameters,
//! output variables, cache policy, model info) plus a closed tagged union
//! of kinds, one per execution strategy. Definitions are authored by the
//! platform and resolved through the [`AgentResolver`](crate::engine::context::AgentResolver)
//! collaborator; the engine never persists them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::{ChatOptions, Role};
use crate::JsonMap;

/// Reserved output variable name for an agent's live text output.
pub const TEXT_OUTPUT: &str = "$text";

/// Reserved output key carrying a parallel-call's raw result list.
pub const RESULTS_OUTPUT: &str = "results";

/// Well-known, host-resolved agent ids for platform-provided helpers.
pub mod reserved {
    /// Retrieval agent backing knowledge-base source parameters.
    pub const KNOWLEDGE_QUERY_AGENT: &str = "knowledge-query";
    /// History agent backing conversation-history source parameters.
    pub const CONVERSATION_HISTORY_AGENT: &str = "conversation-history";
}

fn default_true() -> bool {
    true
}

/// Where a definition logically belongs: which platform, project and ref
/// it resolves same-project references against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_ref: Option<String>,
    #[serde(default)]
    pub working_copy: bool,
}

impl Identity {
    /// Fill unset fields from a parent identity; the working-copy flag is
    /// OR-ed. Already-qualified fields are left unmodified.
    pub fn inherit_from(&mut self, parent: &Identity) {
        if self.platform_id.is_none() {
            self.platform_id = parent.platform_id.clone();
        }
        if self.project_id.is_none() {
            self.project_id = parent.project_id.clone();
        }
        if self.project_ref.is_none() {
            self.project_ref = parent.project_ref.clone();
        }
        self.working_copy = self.working_copy || parent.working_copy;
    }
}

/// A reference to another agent, optionally fully qualified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSelection {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_ref: Option<String>,
    #[serde(default)]
    pub working_copy: bool,
}

impl AgentSelection {
    /// Reference an agent by id alone; identity resolves by inheritance.
    pub fn by_id(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Self::default()
        }
    }

    /// Qualify unset identity fields from the invoking definition's
    /// identity, so same-project references resolve relative to their
    /// invoking project rather than a global default.
    pub fn qualified(&self, identity: Option<&Identity>) -> AgentSelection {
        let mut selection = self.clone();
        if let Some(identity) = identity {
            if selection.platform_id.is_none() {
                selection.platform_id = identity.platform_id.clone();
            }
            if selection.project_id.is_none() {
                selection.project_id = identity.project_id.clone();
            }
            if selection.project_ref.is_none() {
                selection.project_ref = identity.project_ref.clone();
            }
            selection.working_copy = selection.working_copy || identity.working_copy;
        }
        selection
    }
}

/// Model name plus sampling parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(flatten)]
    pub options: ChatOptions,
}

/// Scope of a persisted-memory binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryScope {
    Global,
    Session,
    Agent,
}

/// Binds an output variable to a persisted-memory key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBinding {
    pub key: String,
    pub scope: MemoryScope,
    /// Replace the stored values instead of appending.
    #[serde(default)]
    pub reset: bool,
}

/// Declared input parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub key: String,
    #[serde(flatten)]
    pub param_type: ParamType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Excluded from the caller-visible surface (and from cache keys),
    /// but still resolved.
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub required: bool,
}

impl Parameter {
    /// Plain literal parameter of the given type.
    pub fn new(key: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            key: key.into(),
            param_type,
            default: None,
            hidden: false,
            required: false,
        }
    }
}

/// Declared value type of a parameter. The `source` types resolve by
/// invoking a collaborator rather than by literal value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    /// Resolved from the secret store; errors if missing and no literal
    /// override was supplied.
    Secret,
    /// Resolved by running another agent as a child task.
    SubAgentTool { agent: AgentSelection },
    /// Resolved from long-term memory.
    DatastoreVariable {
        key: String,
        scope: MemoryScope,
        /// Collapse the stored list to its last value.
        #[serde(default)]
        collapse: bool,
    },
    /// Resolved by querying a platform-provided retrieval agent.
    KnowledgeBase {
        base_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
    /// Resolved by fetching conversation history through a
    /// platform-provided history agent.
    ConversationHistory {
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
    /// Resolved by invoking a discovered external-platform operation.
    ExternalPlatformApi {
        platform_id: String,
        operation_id: String,
    },
    /// LLM plumbing: a message list forwarded verbatim.
    LlmInputMessages,
    /// LLM plumbing: tool definitions forwarded verbatim.
    LlmInputTools,
    /// LLM plumbing: a tool-choice value forwarded verbatim.
    LlmInputToolChoice,
}

/// Structural shape of an output variable, nested recursively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum OutputShape {
    String,
    Number,
    Boolean,
    Object { fields: Vec<OutputField> },
    Array { items: Box<OutputShape> },
    /// Unconstrained; validates any value.
    Any,
}

/// A named field of an object-shaped output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputField {
    pub name: String,
    #[serde(flatten)]
    pub shape: OutputShape,
    #[serde(default = "default_true")]
    pub required: bool,
}

/// Where an output variable's value comes from when it is not produced
/// by the strategy itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "kebab-case")]
pub enum OutputBinding {
    /// Copied from a resolved input parameter.
    Input { key: String },
    /// Picked out of a composed sub-agent's result by function name and
    /// nested property path.
    AgentOutput { call: String, path: Vec<String> },
}

/// Declared output variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputVariable {
    pub name: String,
    #[serde(flatten)]
    pub shape: OutputShape,
    #[serde(flatten)]
    pub from: Option<OutputBinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryBinding>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default = "default_true")]
    pub required: bool,
}

impl OutputVariable {
    pub fn new(name: impl Into<String>, shape: OutputShape) -> Self {
        Self {
            name: name.into(),
            shape,
            from: None,
            memory: None,
            hidden: false,
            required: true,
        }
    }
}

/// Content-addressed caching policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default)]
    pub enabled: bool,
}

/// One role-tagged message template of an LLM-class agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub role: Role,
    pub template: String,
}

impl MessageTemplate {
    pub fn new(role: Role, template: impl Into<String>) -> Self {
        Self {
            role,
            template: template.into(),
        }
    }
}

/// Target of a router route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "kebab-case")]
pub enum RouteTarget {
    Agent { agent: AgentSelection },
    Platform {
        platform_id: String,
        operation_id: String,
    },
}

/// A callable route of a router agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub target: RouteTarget,
    /// Inputs bound statically by the route configuration; these do not
    /// appear in the tool schema offered to the model.
    #[serde(default)]
    pub bound: JsonMap,
    /// This route is the designated primary text source; its live text
    /// stream is mirrored to the router's own channel.
    #[serde(default)]
    pub final_text: bool,
    /// Executing this route stops the tool loop.
    #[serde(default)]
    pub exit: bool,
}

/// One step of a call-agent (or parallel-call) composition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubCall {
    /// Function name the step's result is keyed by in the variable scope.
    pub name: String,
    pub agent: AgentSelection,
    /// Configured inputs; string leaves are templates over the scope.
    #[serde(default)]
    pub inputs: JsonMap,
}

/// HTTP method for API agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// Action performed by a protocol-client agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ProtocolAction {
    /// Invoke a named tool with the resolved inputs.
    Tool { name: String },
    /// Fetch a named prompt and render it through a single model call.
    Prompt { name: String },
    /// Read a resource by URI.
    Resource { uri: String },
}

/// Kind-specific configuration - a closed sum with one variant per
/// execution strategy. Adding a kind is a compile-time-checked change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AgentKind {
    LlmPrompt { messages: Vec<MessageTemplate> },
    Router {
        #[serde(default)]
        messages: Vec<MessageTemplate>,
        routes: Vec<Route>,
    },
    Function { code: String },
    HttpApi {
        url: String,
        method: HttpMethod,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Image { prompt: String },
    CallAgent { calls: Vec<SubCall> },
    ParallelCall { calls: Vec<SubCall> },
    ExternalPlatform {
        platform_id: String,
        operation_id: String,
    },
    ProtocolClient {
        platform_id: String,
        action: ProtocolAction,
    },
    ImageCompositor {
        template_url: String,
        #[serde(default)]
        fields: BTreeMap<String, String>,
    },
}

impl AgentKind {
    /// Stable kind name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LlmPrompt { .. } => "llm-prompt",
            Self::Router { .. } => "router",
            Self::Function { .. } => "function",
            Self::HttpApi { .. } => "http-api",
            Self::Image { .. } => "image",
            Self::CallAgent { .. } => "call-agent",
            Self::ParallelCall { .. } => "parallel-call",
            Self::ExternalPlatform { .. } => "external-platform",
            Self::ProtocolClient { .. } => "protocol-client",
            Self::ImageCompositor { .. } => "image-compositor",
        }
    }
}

/// A declarative agent: common envelope + kind-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelInfo>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub outputs: Vec<OutputVariable>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CachePolicy>,
    /// Delegate model calls to another agent (e.g. a custom gateway).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<AgentSelection>,
    #[serde(flatten)]
    pub kind: AgentKind,
}

impl AgentDefinition {
    pub fn cache_enabled(&self) -> bool {
        self.cache.as_ref().map(|c| c.enabled).unwrap_or(false)
    }

    pub fn project_id(&self) -> Option<&str> {
        self.identity.as_ref()?.project_id.as_deref()
    }

    /// Whether the agent produces a live text output: either it declares
    /// `$text` explicitly, or it declares no outputs at all (the implicit
    /// text-only shape of LLM-class agents).
    pub fn wants_text_output(&self) -> bool {
        self.outputs.is_empty() || self.outputs.iter().any(|o| o.name == TEXT_OUTPUT)
    }

    /// Declared outputs other than the live text output.
    pub fn structured_outputs(&self) -> impl Iterator<Item = &OutputVariable> {
        self.outputs.iter().filter(|o| o.name != TEXT_OUTPUT)
    }

    /// Sampling options from the model info block, defaulted when absent.
    pub fn chat_options(&self) -> ChatOptions {
        self.model
            .as_ref()
            .map(|m| m.options.clone())
            .unwrap_or_default()
    }
}
