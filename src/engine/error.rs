//! Engine error taxonomy.
//!
//! Errors fall into four families: configuration errors (fatal, never
//! retried), validation errors (retried only inside the LLM-class
//! strategies), upstream errors (enriched with diagnostic context and
//! rethrown), and the loop-exit directive (control flow, not a failure).

use serde_json::Value;

use crate::template::TemplateError;

/// Errors produced by the execution engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The agent definition is missing or misusing a required field.
    #[error("configuration error: {0}")]
    Config(String),

    /// A strategy's output failed its declared schema.
    #[error("output validation failed for agent '{agent}': {detail}")]
    Validation { agent: String, detail: String },

    /// An external collaborator (model, HTTP endpoint, protocol server)
    /// failed. `status` carries the HTTP status when one was available.
    #[error("upstream error: {message}")]
    Upstream { status: Option<u16>, message: String },

    /// A secret-typed parameter had no stored value and no literal override.
    #[error("secret '{key}' is not available for agent '{agent}'")]
    MissingSecret { agent: String, key: String },

    /// An agent reference could not be resolved.
    #[error("agent '{0}' not found")]
    UnknownAgent(String),

    /// A platform operation id did not appear in the discovered catalogue.
    #[error("operation '{operation}' not found on platform '{platform}'")]
    UnknownOperation { platform: String, operation: String },

    /// The call tree grew past the configured depth limit.
    #[error("call tree exceeded depth limit {0}")]
    DepthExceeded(u32),

    /// Template rendering failed.
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// A tool signalled "stop now". The dispatcher treats this as a
    /// graceful result carrying the outputs accumulated so far.
    #[error("tool loop exit directive")]
    ExitDirective(Value),

    /// Anything else from a collaborator boundary.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Build an upstream error, folding the status into the message when
    /// one is available.
    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = match status {
            Some(code) => format!("HTTP {}: {}", code, message),
            None => message,
        };
        Self::Upstream { status, message }
    }

    /// Validation errors are the only family the LLM-class retry loop
    /// re-attempts; everything else is fatal to its branch.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}
